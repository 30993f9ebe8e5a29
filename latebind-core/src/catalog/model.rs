use crate::binding::BindingDescriptor;
use prost::Message;
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use std::{collections::BTreeMap, fmt};

/// Full name of the message that marks a unary operation as one-way.
pub const EMPTY_MESSAGE: &str = "google.protobuf.Empty";

/// The textual form of a wildcard action.
pub const WILDCARD_ACTION: &str = "*";

/// Identity of a contract: the service simple name plus its protobuf package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractId {
    pub name: String,
    pub namespace: String,
}

impl ContractId {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn of(service: &ServiceDescriptor) -> Self {
        Self::new(service.name(), service.package_name())
    }

    /// Returns the fully qualified name (e.g. `my.package.MyService`).
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// The wire action of an operation.
///
/// Operations resolved from descriptors always carry their HTTP/2 path. A contract can
/// mark an operation as a catch-all, in which case it matches any action and has no
/// concrete path of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Exact(String),
    Wildcard,
}

impl Action {
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Action::Wildcard)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Exact(path) => path,
            Action::Wildcard => WILDCARD_ACTION,
        }
    }

    /// Whether an incoming action string is routed to this action.
    pub fn matches(&self, action: &str) -> bool {
        match self {
            Action::Exact(path) => path == action,
            Action::Wildcard => true,
        }
    }
}

/// A single operation of a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescription {
    name: String,
    parameter_types: Vec<String>,
    return_type: String,
    one_way: bool,
    client_streaming: bool,
    server_streaming: bool,
    action: Action,
}

impl OperationDescription {
    pub fn from_method(method: &MethodDescriptor) -> Self {
        let client_streaming = method.is_client_streaming();
        let server_streaming = method.is_server_streaming();
        let return_type = method.output().full_name().to_string();
        let one_way = !client_streaming && !server_streaming && return_type == EMPTY_MESSAGE;

        Self {
            name: method.name().to_string(),
            parameter_types: vec![method.input().full_name().to_string()],
            return_type,
            one_way,
            client_streaming,
            server_streaming,
            action: Action::Exact(format!(
                "/{}/{}",
                method.parent_service().full_name(),
                method.name()
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    pub fn return_type(&self) -> &str {
        &self.return_type
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }

    pub fn is_client_streaming(&self) -> bool {
        self.client_streaming
    }

    pub fn is_server_streaming(&self) -> bool {
        self.server_streaming
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// The action used for routing and validation bookkeeping.
    ///
    /// Wildcards normalize to the empty string, which never matches a real path.
    pub fn concrete_action(&self) -> &str {
        match &self.action {
            Action::Exact(path) => path,
            Action::Wildcard => "",
        }
    }

    /// Whether `method` has the same shape as this operation.
    pub fn is_implemented_by(&self, method: &MethodDescriptor) -> bool {
        method.name() == self.name
            && self.parameter_types.len() == 1
            && method.input().full_name() == self.parameter_types[0]
            && method.output().full_name() == self.return_type
            && method.is_client_streaming() == self.client_streaming
            && method.is_server_streaming() == self.server_streaming
    }
}

/// A named set of operations exposed by a remote service.
#[derive(Debug, Clone)]
pub struct ContractDescription {
    id: ContractId,
    operations: Vec<OperationDescription>,
    service: ServiceDescriptor,
}

impl ContractDescription {
    pub fn from_service(service: &ServiceDescriptor) -> Self {
        Self {
            id: ContractId::of(service),
            operations: service
                .methods()
                .map(|m| OperationDescription::from_method(&m))
                .collect(),
            service: service.clone(),
        }
    }

    /// Marks an operation as a catch-all that matches any action.
    pub fn with_wildcard_action(mut self, operation: &str) -> Self {
        for op in self.operations.iter_mut().filter(|op| op.name == operation) {
            op.action = Action::Wildcard;
        }
        self
    }

    pub fn id(&self) -> &ContractId {
        &self.id
    }

    pub fn full_name(&self) -> String {
        self.id.full_name()
    }

    pub fn operations(&self) -> &[OperationDescription] {
        &self.operations
    }

    pub fn operation(&self, name: &str) -> Option<&OperationDescription> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    /// The same contract (operations and actions included) backed by another service descriptor.
    pub(crate) fn rebind(&self, service: ServiceDescriptor) -> Self {
        Self {
            id: self.id.clone(),
            operations: self.operations.clone(),
            service,
        }
    }

    /// A stable hash of the schema backing this contract.
    ///
    /// Two contracts with the same identity resolved from different servers may still
    /// differ in shape, so caches key on this value as well as on the identity. The hash
    /// covers the service's file and every file it imports, directly or not.
    pub fn schema_fingerprint(&self) -> u64 {
        let mut files = BTreeMap::new();
        let mut pending = vec![self.service.parent_file()];
        while let Some(file) = pending.pop() {
            if files.contains_key(file.name()) {
                continue;
            }
            pending.extend(file.dependencies());
            files.insert(
                file.name().to_string(),
                file.file_descriptor_proto().encode_to_vec(),
            );
        }

        let mut bytes = Vec::new();
        for (name, proto) in &files {
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(proto);
        }
        for op in &self.operations {
            bytes.extend_from_slice(op.action.as_str().as_bytes());
        }

        xxhash_rust::xxh3::xxh3_64(&bytes)
    }
}

/// A reachable service instance: a contract spoken over a binding at an address.
#[derive(Debug, Clone)]
pub struct EndpointDescription {
    contract: ContractDescription,
    binding: BindingDescriptor,
    address: String,
    configuration_name: Option<String>,
}

/// Identity of an endpoint for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub contract: ContractId,
    pub binding_type: String,
    pub address: String,
    pub configuration_name: Option<String>,
}

impl EndpointDescription {
    pub fn new(
        contract: ContractDescription,
        binding: BindingDescriptor,
        address: impl Into<String>,
    ) -> Self {
        Self {
            contract,
            binding,
            address: address.into(),
            configuration_name: None,
        }
    }

    pub fn with_configuration_name(mut self, name: impl Into<String>) -> Self {
        self.configuration_name = Some(name.into());
        self
    }

    pub fn contract(&self) -> &ContractDescription {
        &self.contract
    }

    pub fn binding(&self) -> &BindingDescriptor {
        &self.binding
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn configuration_name(&self) -> Option<&str> {
        self.configuration_name.as_deref()
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            contract: self.contract.id.clone(),
            binding_type: self.binding.type_name.clone(),
            address: self.address.to_lowercase(),
            configuration_name: self.configuration_name.clone(),
        }
    }

    /// Human readable identity used in events and logs (e.g. `echo.EchoService@http://host:50051`).
    pub fn identity(&self) -> String {
        format!("{}@{}", self.contract.id, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        MethodDescriptorProto, ServiceDescriptorProto,
        field_descriptor_proto::{Label, Type},
    };

    fn field(name: &str, number: i32, kind: Type, type_name: Option<&str>) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            number: Some(number),
            label: Some(Label::Optional as i32),
            r#type: Some(kind as i32),
            type_name: type_name.map(str::to_string),
            ..Default::default()
        }
    }

    /// An `api.Echo` contract whose request embeds `shared.Payload` from another file.
    fn contract_importing(payload_fields: &[&str]) -> ContractDescription {
        let shared = FileDescriptorProto {
            name: Some("shared/types.proto".to_string()),
            package: Some("shared".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Payload".to_string()),
                field: payload_fields
                    .iter()
                    .zip(1..)
                    .map(|(name, number)| field(name, number, Type::String, None))
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let api = FileDescriptorProto {
            name: Some("api/echo.proto".to_string()),
            package: Some("api".to_string()),
            syntax: Some("proto3".to_string()),
            dependency: vec!["shared/types.proto".to_string()],
            message_type: vec![DescriptorProto {
                name: Some("Envelope".to_string()),
                field: vec![field("payload", 1, Type::Message, Some(".shared.Payload"))],
                ..Default::default()
            }],
            service: vec![ServiceDescriptorProto {
                name: Some("Echo".to_string()),
                method: vec![MethodDescriptorProto {
                    name: Some("Send".to_string()),
                    input_type: Some(".api.Envelope".to_string()),
                    output_type: Some(".api.Envelope".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pool = DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
            file: vec![shared, api],
        })
        .unwrap();
        ContractDescription::from_service(&pool.get_service_by_name("api.Echo").unwrap())
    }

    #[test]
    fn fingerprints_cover_imported_messages() {
        let narrow = contract_importing(&["text"]);
        let wide = contract_importing(&["text", "extra"]);

        assert_eq!(narrow.id(), wide.id());
        assert_ne!(narrow.schema_fingerprint(), wide.schema_fingerprint());
        assert_eq!(
            narrow.schema_fingerprint(),
            contract_importing(&["text"]).schema_fingerprint()
        );
    }
}
