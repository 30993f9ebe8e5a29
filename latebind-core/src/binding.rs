//! # Bindings
//!
//! A binding describes *how* an endpoint is reached: which transport family is used and
//! which timeouts and message size limits apply to it.
//!
//! * [`BindingDescriptor`] is the concrete configuration handed to a [`Connector`].
//! * [`BindingRegistry`] maps binding type names and named configurations to descriptors
//!   with preset settings. It can be loaded from JSON.
//! * [`Connector`] builds the transport service for an address and a binding.
//!   [`TonicConnector`] dials a real `tonic` channel, [`ServiceConnector`] hands out an
//!   in-process service (handy for embedding and testing).
//!
//! Timeouts are never allowed to be zero or unbounded: [`BindingSettings::normalized`]
//! replaces such values with the defaults.
use http::Uri;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, time::Duration};
use tonic::transport::{Channel, Endpoint};

/// The binding type understood by [`TonicConnector`].
pub const DEFAULT_BINDING_TYPE: &str = "grpc";

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("Binding '{0}' is neither a registered binding type nor a named configuration")]
    UnknownBinding(String),
    #[error("Named binding '{name}' refers to unknown binding type '{type_name}'")]
    UnknownType { name: String, type_name: String },
    #[error("Invalid binding configuration: '{0}'")]
    Config(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Failed to connect to '{address}': {source}")]
    Transport {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("Timed out after {timeout:?} while connecting to '{address}'")]
    Timeout { address: String, timeout: Duration },
    #[error("Connection to '{address}' refused: {reason}")]
    Refused { address: String, reason: String },
    #[error("Failed to disconnect from '{address}': {reason}")]
    Disconnect { address: String, reason: String },
}

/// Timeouts and size limits of a binding. Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingSettings {
    #[serde(with = "millis")]
    pub open_timeout: Duration,
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    #[serde(with = "millis")]
    pub send_timeout: Duration,
    #[serde(with = "millis")]
    pub receive_timeout: Duration,
    pub max_decoding_message_size: Option<usize>,
    pub max_encoding_message_size: Option<usize>,
}

impl Default for BindingSettings {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            max_decoding_message_size: None,
            max_encoding_message_size: None,
        }
    }
}

impl BindingSettings {
    /// Replaces zero or unbounded timeouts with the defaults.
    pub fn normalized(mut self) -> Self {
        self.open_timeout = sane(self.open_timeout, DEFAULT_OPEN_TIMEOUT);
        self.close_timeout = sane(self.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        self.send_timeout = sane(self.send_timeout, DEFAULT_SEND_TIMEOUT);
        self.receive_timeout = sane(self.receive_timeout, DEFAULT_RECEIVE_TIMEOUT);
        self
    }
}

fn sane(value: Duration, default: Duration) -> Duration {
    if value.is_zero() || value > MAX_TIMEOUT {
        default
    } else {
        value
    }
}

/// A concrete transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingDescriptor {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(flatten)]
    pub settings: BindingSettings,
}

impl BindingDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            settings: BindingSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: BindingSettings) -> Self {
        self.settings = settings.normalized();
        self
    }

    pub fn normalized(mut self) -> Self {
        self.settings = self.settings.normalized();
        self
    }
}

impl Default for BindingDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_BINDING_TYPE)
    }
}

/// Registry of binding types and named binding configurations.
///
/// Lookups are case-insensitive. Named configurations take precedence over types
/// when [`BindingRegistry::resolve`] is given a name that is both.
///
/// ```json
/// {
///   "types": { "grpc": { "open_timeout": 5000 } },
///   "named": { "slow-backend": { "type": "grpc", "receive_timeout": 120000 } }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingRegistry {
    #[serde(default)]
    types: HashMap<String, BindingSettings>,
    #[serde(default)]
    named: HashMap<String, BindingDescriptor>,
}

impl Default for BindingRegistry {
    fn default() -> Self {
        let mut types = HashMap::new();
        types.insert(DEFAULT_BINDING_TYPE.to_string(), BindingSettings::default());
        Self {
            types,
            named: HashMap::new(),
        }
    }
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a registry from its JSON representation.
    ///
    /// The default `grpc` type is always present, even when the document omits it.
    pub fn from_json(json: &str) -> Result<Self, BindingError> {
        let raw: BindingRegistry = serde_json::from_str(json)?;
        let mut registry = Self::default();

        for (name, settings) in raw.types {
            registry.register_type(name, settings);
        }
        for (name, binding) in raw.named {
            registry.register_named(name, binding.type_name, binding.settings)?;
        }

        Ok(registry)
    }

    pub fn register_type(&mut self, type_name: impl AsRef<str>, settings: BindingSettings) {
        self.types
            .insert(type_name.as_ref().to_lowercase(), settings.normalized());
    }

    pub fn register_named(
        &mut self,
        name: impl AsRef<str>,
        type_name: impl AsRef<str>,
        settings: BindingSettings,
    ) -> Result<(), BindingError> {
        let type_name = type_name.as_ref().to_lowercase();
        if !self.types.contains_key(&type_name) {
            return Err(BindingError::UnknownType {
                name: name.as_ref().to_string(),
                type_name,
            });
        }

        self.named.insert(
            name.as_ref().to_lowercase(),
            BindingDescriptor::new(type_name).with_settings(settings),
        );
        Ok(())
    }

    pub fn is_type(&self, type_name: &str) -> bool {
        self.types.contains_key(&type_name.to_lowercase())
    }

    /// Resolves a binding type to a descriptor carrying the type's preset settings.
    pub fn resolve_type(&self, type_name: &str) -> Result<BindingDescriptor, BindingError> {
        let key = type_name.to_lowercase();
        self.types
            .get(&key)
            .map(|settings| BindingDescriptor::new(key.clone()).with_settings(settings.clone()))
            .ok_or_else(|| BindingError::UnknownBinding(type_name.to_string()))
    }

    pub fn resolve_named(&self, name: &str) -> Result<BindingDescriptor, BindingError> {
        self.named
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| BindingError::UnknownBinding(name.to_string()))
    }

    /// Resolves a named configuration first, then a binding type.
    pub fn resolve(&self, name_or_type: &str) -> Result<BindingDescriptor, BindingError> {
        self.resolve_named(name_or_type)
            .or_else(|_| self.resolve_type(name_or_type))
    }
}

/// Builds the transport service used to reach an address over a binding.
pub trait Connector: Send + Sync + 'static {
    type Service: Clone + Send + Sync + 'static;

    /// Whether this connector can speak the given binding.
    fn supports(&self, binding: &BindingDescriptor) -> bool;

    fn connect(
        &self,
        address: &Uri,
        binding: &BindingDescriptor,
    ) -> impl Future<Output = Result<Self::Service, ConnectError>> + Send;

    /// Gracefully releases a service. Dropping it is enough for most transports.
    fn disconnect(
        &self,
        service: Self::Service,
    ) -> impl Future<Output = Result<(), ConnectError>> + Send {
        async move {
            drop(service);
            Ok(())
        }
    }
}

/// Dials a `tonic` [`Channel`] honouring the binding's open and receive timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TonicConnector;

impl Connector for TonicConnector {
    type Service = Channel;

    fn supports(&self, binding: &BindingDescriptor) -> bool {
        binding.type_name.eq_ignore_ascii_case(DEFAULT_BINDING_TYPE)
    }

    fn connect(
        &self,
        address: &Uri,
        binding: &BindingDescriptor,
    ) -> impl Future<Output = Result<Channel, ConnectError>> + Send {
        let uri = address.clone();
        let settings = binding.settings.clone().normalized();

        async move {
            tracing::debug!(address = %uri, "dialing channel");
            Endpoint::from(uri.clone())
                .connect_timeout(settings.open_timeout)
                .timeout(settings.receive_timeout)
                .connect()
                .await
                .map_err(|source| ConnectError::Transport {
                    address: uri.to_string(),
                    source,
                })
        }
    }
}

/// Hands out clones of an in-process service, whatever the address.
#[derive(Debug, Clone)]
pub struct ServiceConnector<S> {
    service: S,
}

impl<S> ServiceConnector<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> Connector for ServiceConnector<S>
where
    S: Clone + Send + Sync + 'static,
{
    type Service = S;

    fn supports(&self, _binding: &BindingDescriptor) -> bool {
        true
    }

    fn connect(
        &self,
        _address: &Uri,
        _binding: &BindingDescriptor,
    ) -> impl Future<Output = Result<S, ConnectError>> + Send {
        let service = self.service.clone();
        async move { Ok(service) }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_replaces_disabled_timeouts() {
        let settings = BindingSettings {
            open_timeout: Duration::ZERO,
            receive_timeout: Duration::MAX,
            ..Default::default()
        }
        .normalized();

        assert_eq!(settings.open_timeout, DEFAULT_OPEN_TIMEOUT);
        assert_eq!(settings.receive_timeout, DEFAULT_RECEIVE_TIMEOUT);
        assert_eq!(settings.send_timeout, DEFAULT_SEND_TIMEOUT);
    }

    #[test]
    fn registry_loads_json_case_insensitively() {
        let registry = BindingRegistry::from_json(
            r#"{
                "types": { "GRPC": { "open_timeout": 5000 } },
                "named": { "Slow-Backend": { "type": "grpc", "receive_timeout": 120000 } }
            }"#,
        )
        .unwrap();

        let typed = registry.resolve("grpc").unwrap();
        assert_eq!(typed.settings.open_timeout, Duration::from_secs(5));

        let named = registry.resolve("slow-backend").unwrap();
        assert_eq!(named.type_name, "grpc");
        assert_eq!(named.settings.receive_timeout, Duration::from_secs(120));
        // Unspecified fields fall back to the defaults.
        assert_eq!(named.settings.open_timeout, DEFAULT_OPEN_TIMEOUT);
    }

    #[test]
    fn named_binding_requires_known_type() {
        let err = BindingRegistry::from_json(r#"{ "named": { "x": { "type": "quic" } } }"#)
            .unwrap_err();
        assert!(matches!(err, BindingError::UnknownType { .. }));
    }

    #[test]
    fn unknown_binding_is_reported() {
        let registry = BindingRegistry::new();
        assert!(matches!(
            registry.resolve("carrier-pigeon"),
            Err(BindingError::UnknownBinding(name)) if name == "carrier-pigeon"
        ));
    }
}
