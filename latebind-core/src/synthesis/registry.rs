use super::SynthesisError;
use crate::catalog::{ContractDescription, OperationDescription};
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use std::collections::HashMap;

/// An operation bound to the method that carries it on the wire.
#[derive(Debug, Clone)]
pub struct OperationEntry {
    description: OperationDescription,
    method: MethodDescriptor,
}

impl OperationEntry {
    pub fn description(&self) -> &OperationDescription {
        &self.description
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Number of arguments the operation takes.
    pub fn arity(&self) -> usize {
        self.description.parameter_types().len()
    }
}

/// Lookup table from operation names and signatures to callable entries.
///
/// Built once per client type so calls never scan the service descriptor.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    entries: Vec<OperationEntry>,
    by_name: HashMap<String, Vec<usize>>,
    by_signature: HashMap<(String, Vec<String>), usize>,
}

impl OperationRegistry {
    /// Binds every operation of `contract` to a method of `service` with the same shape.
    pub fn build(
        contract: &ContractDescription,
        service: &ServiceDescriptor,
    ) -> Result<Self, SynthesisError> {
        let mut registry = Self::default();

        for op in contract.operations() {
            let Some(method) = service.methods().find(|m| op.is_implemented_by(m)) else {
                tracing::error!(
                    contract = %contract.id(),
                    operation = op.name(),
                    service = service.full_name(),
                    "no method implements the operation"
                );
                return Err(SynthesisError::ProxyTypeNotFound {
                    contract: contract.full_name(),
                });
            };

            let index = registry.entries.len();
            registry
                .by_name
                .entry(op.name().to_string())
                .or_default()
                .push(index);
            registry
                .by_signature
                .entry((op.name().to_string(), op.parameter_types().to_vec()))
                .or_insert(index);
            registry.entries.push(OperationEntry {
                description: op.clone(),
                method,
            });
        }

        Ok(registry)
    }

    pub fn entries(&self) -> &[OperationEntry] {
        &self.entries
    }

    /// The first operation registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<&OperationEntry> {
        self.by_name
            .get(name)
            .and_then(|indexes| indexes.first())
            .map(|&i| &self.entries[i])
    }

    /// The operation registered under `name` whose parameter types are exactly `parameter_types`.
    pub fn lookup_signature(
        &self,
        name: &str,
        parameter_types: &[&str],
    ) -> Option<&OperationEntry> {
        let key = (
            name.to_string(),
            parameter_types.iter().map(|t| t.to_string()).collect(),
        );
        self.by_signature.get(&key).map(|&i| &self.entries[i])
    }

    /// The entry registered for an already resolved operation.
    pub fn lookup_operation(&self, operation: &OperationDescription) -> Option<&OperationEntry> {
        self.by_name
            .get(operation.name())?
            .iter()
            .map(|&i| &self.entries[i])
            .find(|entry| entry.description == *operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;
    use prost_types::{FileDescriptorProto, MethodDescriptorProto, ServiceDescriptorProto};

    fn echo_contract() -> ContractDescription {
        let pool = DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        let service = pool.get_service_by_name("echo.EchoService").unwrap();
        ContractDescription::from_service(&service)
    }

    #[test]
    fn lookups_by_name_signature_and_descriptor() {
        let contract = echo_contract();
        let registry = OperationRegistry::build(&contract, contract.service()).unwrap();

        let unary = registry.lookup("UnaryEcho").unwrap();
        assert_eq!(unary.arity(), 1);
        assert_eq!(unary.method().name(), "UnaryEcho");

        assert!(
            registry
                .lookup_signature("UnaryEcho", &["echo.EchoRequest"])
                .is_some()
        );
        assert!(
            registry
                .lookup_signature("UnaryEcho", &["echo.EchoResponse"])
                .is_none()
        );
        assert!(registry.lookup("Missing").is_none());

        let notify = contract.operation("Notify").unwrap();
        assert!(notify.is_one_way());
        assert_eq!(
            registry.lookup_operation(notify).unwrap().method().name(),
            "Notify"
        );
    }

    #[test]
    fn missing_method_fails_the_build() {
        let contract = echo_contract();
        let mut pool = DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        pool.add_file_descriptor_proto(FileDescriptorProto {
            name: Some("echo/partial.proto".to_string()),
            package: Some("echo".to_string()),
            dependency: vec!["echo.proto".to_string()],
            syntax: Some("proto3".to_string()),
            service: vec![ServiceDescriptorProto {
                name: Some("PartialEcho".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("UnaryEcho".to_string()),
                    input_type: Some(".echo.EchoRequest".to_string()),
                    output_type: Some(".echo.EchoResponse".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();
        let partial = pool.get_service_by_name("echo.PartialEcho").unwrap();

        let err = OperationRegistry::build(&contract, &partial).unwrap_err();
        assert!(matches!(
            err,
            SynthesisError::ProxyTypeNotFound { contract } if contract == "echo.EchoService"
        ));
    }
}
