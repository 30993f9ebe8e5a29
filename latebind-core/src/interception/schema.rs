use crate::{
    catalog::{Action, EMPTY_MESSAGE},
    synthesis::OperationEntry,
};
use prost_reflect::{
    DeserializeOptions, DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor,
};
use std::collections::HashMap;

/// Message schemas of one action.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub one_way: bool,
}

impl SchemaEntry {
    fn of(method: &MethodDescriptor) -> Self {
        let client_streaming = method.is_client_streaming();
        let server_streaming = method.is_server_streaming();
        Self {
            input: method.input(),
            output: method.output(),
            client_streaming,
            server_streaming,
            one_way: !client_streaming
                && !server_streaming
                && method.output().full_name() == EMPTY_MESSAGE,
        }
    }

    pub fn is_unary(&self) -> bool {
        !self.client_streaming && !self.server_streaming
    }
}

/// Per-action schemas used to classify and validate exchanged messages.
///
/// Wildcard actions have no concrete path and are left out.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    entries: HashMap<String, SchemaEntry>,
}

impl SchemaSet {
    pub fn from_operations(operations: &[OperationEntry]) -> Self {
        let entries = operations
            .iter()
            .filter_map(|op| match op.description().action() {
                Action::Exact(path) => Some((path.clone(), SchemaEntry::of(op.method()))),
                Action::Wildcard => None,
            })
            .collect();
        Self { entries }
    }

    /// Schemas of every method of every service in `pool`.
    pub fn from_pool(pool: &DescriptorPool) -> Self {
        let entries = pool
            .services()
            .flat_map(|service| service.methods().collect::<Vec<_>>())
            .map(|method| {
                let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
                (path, SchemaEntry::of(&method))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, action: &str) -> Option<&SchemaEntry> {
        self.entries.get(action)
    }

    pub fn is_one_way(&self, action: &str) -> bool {
        self.entries.get(action).is_some_and(|entry| entry.one_way)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks a request payload against the input schema of `action`.
    ///
    /// Streamed requests are checked element by element. Unknown actions are not checked.
    pub fn validate_request(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<(), String> {
        match self.entries.get(action) {
            Some(entry) => validate(&entry.input, entry.client_streaming, payload),
            None => Ok(()),
        }
    }

    /// Checks a reply payload against the output schema of `action`.
    pub fn validate_reply(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<(), String> {
        match self.entries.get(action) {
            Some(entry) => validate(&entry.output, entry.server_streaming, payload),
            None => Ok(()),
        }
    }
}

fn validate(
    desc: &MessageDescriptor,
    streaming: bool,
    payload: &serde_json::Value,
) -> Result<(), String> {
    match (streaming, payload) {
        (true, serde_json::Value::Array(items)) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| {
                validate_message(desc, item).map_err(|e| format!("item {i}: {e}"))
            }),
        (true, _) => Err(format!("expected a JSON array of '{}'", desc.full_name())),
        (false, item) => validate_message(desc, item),
    }
}

fn validate_message(desc: &MessageDescriptor, payload: &serde_json::Value) -> Result<(), String> {
    let options = DeserializeOptions::new().deny_unknown_fields(true);
    DynamicMessage::deserialize_with_options(desc.clone(), payload, &options)
        .map(drop)
        .map_err(|e| format!("payload does not match '{}': {e}", desc.full_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_schema() -> SchemaSet {
        SchemaSet::from_pool(&DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap())
    }

    #[test]
    fn classifies_one_way_actions() {
        let schema = echo_schema();
        assert!(schema.is_one_way("/echo.EchoService/Notify"));
        assert!(!schema.is_one_way("/echo.EchoService/UnaryEcho"));
        assert!(!schema.is_one_way(""));
    }

    #[test]
    fn validates_single_and_streamed_payloads() {
        let schema = echo_schema();

        assert!(
            schema
                .validate_request("/echo.EchoService/UnaryEcho", &json!({ "message": "hi" }))
                .is_ok()
        );
        assert!(
            schema
                .validate_request("/echo.EchoService/UnaryEcho", &json!({ "nope": 1 }))
                .is_err()
        );
        assert!(
            schema
                .validate_request(
                    "/echo.EchoService/ClientStreamingEcho",
                    &json!([{ "message": "a" }, { "message": "b" }])
                )
                .is_ok()
        );
        let err = schema
            .validate_request(
                "/echo.EchoService/ClientStreamingEcho",
                &json!([{ "message": "a" }, { "bad": true }]),
            )
            .unwrap_err();
        assert!(err.starts_with("item 1"));

        assert!(schema.validate_request("/unknown/Action", &json!(42)).is_ok());
    }
}
