//! Compiled client modules.
//!
//! A [`ClientModule`] is a set of descriptors loaded either from generated source compiled
//! in-process with `protox`, or from the bytes of a previously materialized module (an
//! encoded `FileDescriptorSet`).
use super::{ClientType, SynthesisError, codegen::GeneratedSource};
use crate::{
    catalog::{ContractDescription, ContractId},
    proxy::Strategy,
};
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorSet;
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use std::collections::{BTreeMap, BTreeSet};

/// Serves generated source text to the compiler.
struct SourceResolver {
    files: BTreeMap<String, String>,
}

impl FileResolver for SourceResolver {
    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        match self.files.get(name) {
            Some(source) => File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}

/// Compiles generated source into a loadable module.
///
/// Each call uses its own compiler, dropped as soon as the descriptors are extracted.
pub fn compile(source: &GeneratedSource) -> Result<ClientModule, SynthesisError> {
    let mut resolver = ChainFileResolver::new();
    resolver.add(SourceResolver {
        files: source.files().clone(),
    });
    resolver.add(GoogleFileResolver::new());

    let mut compiler = protox::Compiler::with_file_resolver(resolver);
    compiler.include_imports(true);

    if let Err(err) = compiler.open_files(source.roots()) {
        let diagnostics = diagnostic_chain(&err);
        tracing::error!(%diagnostics, "failed to compile generated client source");
        return Err(SynthesisError::Compiler { diagnostics });
    }

    let pool = compiler.descriptor_pool();
    drop(compiler);

    tracing::debug!(
        files = source.files().len(),
        services = pool.services().count(),
        "compiled client module"
    );
    Ok(ClientModule { pool })
}

fn diagnostic_chain(err: &protox::Error) -> String {
    let mut diagnostics = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        diagnostics.push_str(": ");
        diagnostics.push_str(&cause.to_string());
        source = cause.source();
    }
    diagnostics
}

/// A loaded set of client descriptors.
#[derive(Debug, Clone)]
pub struct ClientModule {
    pool: DescriptorPool,
}

impl ClientModule {
    /// Loads a materialized module.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SynthesisError> {
        let pool = DescriptorPool::decode(bytes).inspect_err(|err| {
            tracing::error!(error = %err, "failed to load client module");
        })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: DescriptorPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Materializes the module as an encoded `FileDescriptorSet`.
    pub fn encode(&self) -> Vec<u8> {
        FileDescriptorSet {
            file: self.pool.file_descriptor_protos().cloned().collect(),
        }
        .encode_to_vec()
    }

    /// The identities of every contract declared in the module.
    pub fn contracts(&self) -> Vec<ContractId> {
        self.pool.services().map(|s| ContractId::of(&s)).collect()
    }

    /// The namespaces contracts are declared in.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.pool
            .services()
            .map(|s| s.package_name().to_string())
            .collect()
    }

    /// Finds the contract with exactly this identity.
    pub fn contract_type(&self, id: &ContractId) -> Result<ContractDescription, SynthesisError> {
        self.pool
            .services()
            .find(|s| s.name() == id.name && s.package_name() == id.namespace)
            .map(|s| ContractDescription::from_service(&s))
            .ok_or_else(|| {
                tracing::error!(contract = %id, "contract not found in client module");
                SynthesisError::UnknownContract {
                    name: id.name.clone(),
                    namespace: id.namespace.clone(),
                }
            })
    }

    /// Builds the client type implementing `contract` from this module's descriptors.
    ///
    /// The module must declare a service with the same identity that implements every
    /// operation of `contract` with the same shape.
    pub fn proxy_type(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
    ) -> Result<ClientType, SynthesisError> {
        let id = contract.id();
        let Some(service) = self
            .pool
            .services()
            .find(|s| s.name() == id.name && s.package_name() == id.namespace)
        else {
            tracing::error!(contract = %id, "client module does not declare the contract");
            return Err(SynthesisError::ProxyTypeNotFound {
                contract: contract.full_name(),
            });
        };

        ClientType::new(contract.rebind(service), strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::codegen::{GenerateOptions, generate};

    fn echo_contract() -> ContractDescription {
        let pool = DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        ContractDescription::from_service(&pool.get_service_by_name("echo.EchoService").unwrap())
    }

    #[test]
    fn generated_source_compiles_back_to_the_same_contract() {
        let contract = echo_contract();
        let source =
            generate(std::slice::from_ref(&contract), &GenerateOptions::default()).unwrap();
        let module = compile(&source).unwrap();

        assert_eq!(module.contracts(), vec![contract.id().clone()]);
        assert!(module.namespaces().contains("echo"));

        let reloaded = ClientModule::from_bytes(&module.encode()).unwrap();
        let client = reloaded.proxy_type(&contract, Strategy::default()).unwrap();
        assert_eq!(client.registry().entries().len(), contract.operations().len());
    }

    #[test]
    fn unknown_contracts_are_reported() {
        let module = ClientModule::from_bytes(echo_service::FILE_DESCRIPTOR_SET).unwrap();

        let err = module
            .contract_type(&ContractId::new("EchoService", "other"))
            .unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::UnknownContract { name, namespace }
                if name == "EchoService" && namespace == "other"
        ));
    }

    #[test]
    fn compiler_errors_carry_diagnostics() {
        let contract = echo_contract();
        let mut source = generate(&[contract], &GenerateOptions::default()).unwrap();
        source
            .files
            .insert("echo.proto".to_string(), "syntax = \"proto3\"; message {".to_string());

        let err = compile(&source).unwrap_err();
        assert!(matches!(err, SynthesisError::Compiler { diagnostics } if !diagnostics.is_empty()));
    }
}
