//! # Client Synthesis
//!
//! Turns a resolved contract into a [`ClientType`]: the immutable, shareable description of
//! a client for that contract and a [`Strategy`]. A client type owns an
//! [`OperationRegistry`] so operations are looked up by name or signature without scanning
//! descriptors on every call.
//!
//! How the client type is obtained is pluggable through [`ClientBuilder`]:
//!
//! * [`DynamicClientBuilder`] dispatches straight over the resolved descriptors.
//! * [`CompiledClientBuilder`] regenerates proto source for the contract, compiles it
//!   in-process and loads the result.
//! * [`ModuleClientBuilder`] loads client types from a previously materialized [`ClientModule`].
pub mod codegen;
pub mod module;
mod registry;

pub use codegen::{GenerateOptions, GeneratedSource, GenerationWarning};
pub use module::ClientModule;
pub use registry::{OperationEntry, OperationRegistry};

use crate::{catalog::ContractDescription, interception::SchemaSet, proxy::Strategy};
use once_cell::sync::OnceCell;
use prost_reflect::DescriptorError;
use std::{fmt, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("Code generation failed: {}", join(.warnings))]
    CodeGeneration { warnings: Vec<GenerationWarning> },
    #[error("Failed to compile generated source: {diagnostics}")]
    Compiler { diagnostics: String },
    #[error("Invalid client module: '{0}'")]
    Module(#[from] DescriptorError),
    #[error("Contract '{name}' not found in namespace '{namespace}'")]
    UnknownContract { name: String, namespace: String },
    #[error("No client type implements contract '{contract}'")]
    ProxyTypeNotFound { contract: String },
}

fn join(warnings: &[GenerationWarning]) -> String {
    warnings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A synthesized client for one contract and one strategy.
pub struct ClientType {
    contract: ContractDescription,
    strategy: Strategy,
    registry: OperationRegistry,
    schema: OnceCell<Arc<SchemaSet>>,
}

impl fmt::Debug for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientType")
            .field("contract", self.contract.id())
            .field("strategy", &self.strategy)
            .field("operations", &self.registry.entries().len())
            .finish()
    }
}

impl ClientType {
    pub(crate) fn new(
        contract: ContractDescription,
        strategy: Strategy,
    ) -> Result<Self, SynthesisError> {
        let registry = OperationRegistry::build(&contract, contract.service())?;
        Ok(Self {
            contract,
            strategy,
            registry,
            schema: OnceCell::new(),
        })
    }

    pub fn contract(&self) -> &ContractDescription {
        &self.contract
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Message schemas of every operation, computed on first use.
    pub fn schema(&self) -> Arc<SchemaSet> {
        self.schema
            .get_or_init(|| Arc::new(SchemaSet::from_operations(self.registry.entries())))
            .clone()
    }
}

/// Produces client types for contracts.
pub trait ClientBuilder: Send + Sync {
    fn build(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
    ) -> Result<ClientType, SynthesisError>;
}

/// Builds client types directly over the resolved descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicClientBuilder;

impl ClientBuilder for DynamicClientBuilder {
    fn build(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
    ) -> Result<ClientType, SynthesisError> {
        ClientType::new(contract.clone(), strategy)
    }
}

/// Generates proto source for the contract, compiles it and loads the client type from
/// the compiled module.
#[derive(Debug, Clone, Default)]
pub struct CompiledClientBuilder {
    options: GenerateOptions,
}

impl CompiledClientBuilder {
    pub fn new(options: GenerateOptions) -> Self {
        Self { options }
    }
}

impl ClientBuilder for CompiledClientBuilder {
    fn build(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
    ) -> Result<ClientType, SynthesisError> {
        let source = codegen::generate(std::slice::from_ref(contract), &self.options)?;
        let module = module::compile(&source)?;
        module.proxy_type(contract, strategy)
    }
}

/// Loads client types from a precompiled module.
#[derive(Debug, Clone)]
pub struct ModuleClientBuilder {
    module: ClientModule,
}

impl ModuleClientBuilder {
    pub fn new(module: ClientModule) -> Self {
        Self { module }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SynthesisError> {
        ClientModule::from_bytes(bytes).map(Self::new)
    }

    pub fn module(&self) -> &ClientModule {
        &self.module
    }
}

impl ClientBuilder for ModuleClientBuilder {
    fn build(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
    ) -> Result<ClientType, SynthesisError> {
        self.module.proxy_type(contract, strategy)
    }
}
