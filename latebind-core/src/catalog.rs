//! # Contract Catalog
//!
//! Normalizes raw metadata fragments into contracts, bindings and endpoints.
//!
//! Resolution never performs I/O: fragments are fetched beforehand by a
//! [`MetadataSource`](crate::metadata::MetadataSource). Problems that do not prevent a
//! usable catalog are collected as warnings; everything else aborts resolution with a
//! [`ResolutionError`].
mod model;

pub use model::*;

use crate::{
    binding::{BindingDescriptor, BindingRegistry},
    metadata::{FetchError, MetadataFragment, MetadataSource},
};
use prost::Message;
use prost_reflect::{DescriptorError, DescriptorPool};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Failed to decode metadata fragment: '{0}'")]
    Decode(#[from] prost::DecodeError),
    #[error("Failed to import metadata: '{0}'")]
    Import(#[from] DescriptorError),
    #[error("Metadata contains two different definitions of file '{0}'")]
    ConflictingFile(String),
    #[error("No endpoint found for contract '{name}'{}", namespace_suffix(.namespace))]
    EndpointNotFound {
        name: String,
        namespace: Option<String>,
    },
    #[error("Contract '{name}'{} not found", namespace_suffix(.namespace))]
    UnknownContract {
        name: String,
        namespace: Option<String>,
    },
}

fn namespace_suffix(namespace: &Option<String>) -> String {
    match namespace {
        Some(ns) => format!(" in namespace '{ns}'"),
        None => String::new(),
    }
}

/// Errors of the fetch-then-resolve shortcut [`ContractCatalog::discover`].
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to fetch metadata: '{0}'")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Where the metadata was discovered, and how its contracts are reached by default.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub address: String,
    pub binding: BindingDescriptor,
    pub registry: Arc<BindingRegistry>,
}

impl Discovery {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            binding: BindingDescriptor::default(),
            registry: Arc::new(BindingRegistry::default()),
        }
    }

    pub fn with_binding(mut self, binding: BindingDescriptor) -> Self {
        self.binding = binding.normalized();
        self
    }

    pub fn with_registry(mut self, registry: Arc<BindingRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

/// The normalized view of a remote interface.
#[derive(Debug, Clone)]
pub struct ContractCatalog {
    pool: DescriptorPool,
    contracts: Vec<ContractDescription>,
    bindings: Vec<BindingDescriptor>,
    endpoints: Vec<EndpointDescription>,
    warnings: Vec<String>,
}

impl ContractCatalog {
    /// Fetches metadata from `source` and resolves it.
    pub async fn discover<M: MetadataSource>(
        source: &M,
        discovery: &Discovery,
    ) -> Result<Self, DiscoveryError> {
        let fragments = source.fetch(&discovery.address).await?;
        Ok(Self::resolve(fragments, discovery)?)
    }

    /// Resolves already fetched metadata fragments.
    ///
    /// Every contract gets an endpoint at the discovery address using the discovery
    /// binding. Endpoint fragments add further endpoints.
    pub fn resolve(
        fragments: Vec<MetadataFragment>,
        discovery: &Discovery,
    ) -> Result<Self, ResolutionError> {
        let mut warnings = Vec::new();
        let mut files: HashMap<String, FileDescriptorProto> = HashMap::new();
        let mut endpoint_fragments = Vec::new();

        for fragment in fragments {
            let decoded = match fragment {
                MetadataFragment::FileDescriptor(bytes) => {
                    vec![FileDescriptorProto::decode(bytes.as_slice()).inspect_err(|err| {
                        tracing::error!(error = %err, "undecodable file descriptor fragment");
                    })?]
                }
                MetadataFragment::FileDescriptorSet(bytes) => {
                    FileDescriptorSet::decode(bytes.as_slice())
                        .inspect_err(|err| {
                            tracing::error!(
                                error = %err,
                                "undecodable file descriptor set fragment"
                            );
                        })?
                        .file
                }
                MetadataFragment::Endpoint {
                    contract,
                    address,
                    binding,
                } => {
                    endpoint_fragments.push((contract, address, binding));
                    continue;
                }
            };

            for file in decoded {
                let name = file.name().to_string();
                match files.get(&name) {
                    Some(existing) if *existing == file => {
                        warnings.push(format!("Duplicate metadata fragment for file '{name}'"));
                    }
                    Some(_) => {
                        tracing::error!(file = %name, "conflicting definitions in metadata");
                        return Err(ResolutionError::ConflictingFile(name));
                    }
                    None => {
                        files.insert(name, file);
                    }
                }
            }
        }

        let pool = DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
            file: files.into_values().collect(),
        })
        .inspect_err(|err| tracing::error!(error = %err, "failed to import metadata"))?;

        let mut contracts: Vec<ContractDescription> = pool
            .services()
            .map(|service| ContractDescription::from_service(&service))
            .collect();
        contracts.sort_by(|a, b| a.id().cmp(b.id()));

        for contract in contracts.iter().filter(|c| c.operations().is_empty()) {
            warnings.push(format!("Contract '{}' declares no operations", contract.id()));
        }

        let mut endpoints: Vec<EndpointDescription> = contracts
            .iter()
            .map(|contract| {
                EndpointDescription::new(
                    contract.clone(),
                    discovery.binding.clone(),
                    discovery.address.clone(),
                )
            })
            .collect();

        for (contract_name, address, binding_name) in endpoint_fragments {
            let Some(contract) = contracts
                .iter()
                .find(|c| c.full_name().eq_ignore_ascii_case(&contract_name))
            else {
                warnings.push(format!(
                    "Endpoint '{address}' refers to unknown contract '{contract_name}'"
                ));
                continue;
            };

            match discovery.registry.resolve(&binding_name) {
                Ok(binding) => {
                    endpoints.push(
                        EndpointDescription::new(contract.clone(), binding, address)
                            .with_configuration_name(binding_name),
                    );
                }
                Err(err) => warnings.push(format!("Endpoint '{address}' skipped: {err}")),
            }
        }

        let mut bindings: Vec<BindingDescriptor> = Vec::new();
        for endpoint in &endpoints {
            if !bindings.contains(endpoint.binding()) {
                bindings.push(endpoint.binding().clone());
            }
        }

        for warning in &warnings {
            tracing::warn!(%warning, "metadata import warning");
        }
        tracing::debug!(
            contracts = contracts.len(),
            endpoints = endpoints.len(),
            "resolved contract catalog"
        );

        Ok(Self {
            pool,
            contracts,
            bindings,
            endpoints,
            warnings,
        })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn contracts(&self) -> &[ContractDescription] {
        &self.contracts
    }

    pub fn bindings(&self) -> &[BindingDescriptor] {
        &self.bindings
    }

    pub fn endpoints(&self) -> &[EndpointDescription] {
        &self.endpoints
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Finds the first endpoint whose contract matches `name` (case-insensitive).
    ///
    /// The namespace is only compared when given; omitting it deliberately accepts the
    /// first contract with that name.
    pub fn find_endpoint(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<&EndpointDescription, ResolutionError> {
        self.endpoints
            .iter()
            .find(|endpoint| matches_contract(endpoint.contract().id(), name, namespace))
            .ok_or_else(|| ResolutionError::EndpointNotFound {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            })
    }

    /// Finds a contract with the same matching rules as [`ContractCatalog::find_endpoint`].
    pub fn find_contract(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<&ContractDescription, ResolutionError> {
        self.contracts
            .iter()
            .find(|contract| matches_contract(contract.id(), name, namespace))
            .ok_or_else(|| ResolutionError::UnknownContract {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
            })
    }
}

fn matches_contract(id: &ContractId, name: &str, namespace: Option<&str>) -> bool {
    id.name.eq_ignore_ascii_case(name)
        && namespace.is_none_or(|ns| id.namespace.eq_ignore_ascii_case(ns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto,
        field_descriptor_proto::{Label, Type},
    };

    fn message(name: &str) -> DescriptorProto {
        DescriptorProto {
            name: Some(name.to_string()),
            field: vec![FieldDescriptorProto {
                name: Some("text".to_string()),
                number: Some(1),
                label: Some(Label::Optional as i32),
                r#type: Some(Type::String as i32),
                json_name: Some("text".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn file(package: &str, service: &str) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(format!("{package}/{}.proto", service.to_lowercase())),
            package: Some(package.to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![message("Ping")],
            service: vec![ServiceDescriptorProto {
                name: Some(service.to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("Send".to_string()),
                    input_type: Some(format!(".{package}.Ping")),
                    output_type: Some(format!(".{package}.Ping")),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn fragment(file: &FileDescriptorProto) -> MetadataFragment {
        MetadataFragment::FileDescriptor(file.encode_to_vec())
    }

    fn discovery() -> Discovery {
        Discovery::new("http://localhost:50051")
    }

    #[test]
    fn resolves_contracts_and_default_endpoints() {
        let catalog = ContractCatalog::resolve(
            vec![fragment(&file("alpha", "Pinger")), fragment(&file("beta", "Pinger"))],
            &discovery(),
        )
        .unwrap();

        assert_eq!(catalog.contracts().len(), 2);
        assert_eq!(catalog.endpoints().len(), 2);
        assert_eq!(catalog.bindings().len(), 1);
        assert!(catalog.warnings().is_empty());

        let op = &catalog.contracts()[0].operations()[0];
        assert_eq!(op.action(), &Action::Exact("/alpha.Pinger/Send".to_string()));
        assert_eq!(op.parameter_types(), ["alpha.Ping".to_string()]);
        assert!(!op.is_one_way());
    }

    #[test]
    fn find_endpoint_is_case_insensitive_and_namespace_optional() {
        let catalog = ContractCatalog::resolve(
            vec![fragment(&file("alpha", "Pinger")), fragment(&file("beta", "Pinger"))],
            &discovery(),
        )
        .unwrap();

        let first = catalog.find_endpoint("PINGER", None).unwrap();
        assert_eq!(first.contract().id().namespace, "alpha");

        let beta = catalog.find_endpoint("pinger", Some("BETA")).unwrap();
        assert_eq!(beta.contract().id().namespace, "beta");

        let err = catalog.find_endpoint("pinger", Some("gamma")).unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::EndpointNotFound { name, namespace: Some(ns) }
                if name == "pinger" && ns == "gamma"
        ));
    }

    #[test]
    fn duplicate_fragments_warn_and_conflicts_fail() {
        let original = file("alpha", "Pinger");
        let catalog =
            ContractCatalog::resolve(vec![fragment(&original), fragment(&original)], &discovery())
                .unwrap();
        assert_eq!(catalog.warnings().len(), 1);

        let mut conflicting = original.clone();
        conflicting.message_type.push(message("Pong"));
        let fragments = vec![fragment(&original), fragment(&conflicting)];
        let err = ContractCatalog::resolve(fragments, &discovery()).unwrap_err();
        assert!(matches!(err, ResolutionError::ConflictingFile(_)));
    }

    #[test]
    fn missing_dependency_is_fatal() {
        let mut broken = file("alpha", "Pinger");
        broken.service[0].method[0].input_type = Some(".other.Missing".to_string());

        let err = ContractCatalog::resolve(vec![fragment(&broken)], &discovery()).unwrap_err();
        assert!(matches!(err, ResolutionError::Import(_)));
    }

    #[test]
    fn endpoint_fragments_add_endpoints_or_warn() {
        let catalog = ContractCatalog::resolve(
            vec![
                fragment(&file("alpha", "Pinger")),
                MetadataFragment::Endpoint {
                    contract: "alpha.pinger".to_string(),
                    address: "http://replica:50051".to_string(),
                    binding: "grpc".to_string(),
                },
                MetadataFragment::Endpoint {
                    contract: "alpha.Ghost".to_string(),
                    address: "http://ghost:50051".to_string(),
                    binding: "grpc".to_string(),
                },
                MetadataFragment::Endpoint {
                    contract: "alpha.Pinger".to_string(),
                    address: "http://other:50051".to_string(),
                    binding: "smoke-signals".to_string(),
                },
            ],
            &discovery(),
        )
        .unwrap();

        assert_eq!(catalog.endpoints().len(), 2);
        assert_eq!(catalog.endpoints()[1].address(), "http://replica:50051");
        assert_eq!(catalog.endpoints()[1].configuration_name(), Some("grpc"));
        assert_eq!(catalog.warnings().len(), 2);
    }

    #[test]
    fn wildcard_actions_normalize_to_empty() {
        let catalog =
            ContractCatalog::resolve(vec![fragment(&file("alpha", "Pinger"))], &discovery())
                .unwrap();
        let contract = catalog.contracts()[0].clone().with_wildcard_action("Send");
        let op = contract.operation("Send").unwrap();

        assert!(op.action().is_wildcard());
        assert!(op.action().matches("/anything/At-All"));
        assert_eq!(op.concrete_action(), "");
    }
}
