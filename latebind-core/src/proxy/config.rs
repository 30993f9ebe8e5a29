use crate::{binding::BindingSettings, catalog::OperationDescription, grpc::codec::PayloadBehavior};
use std::{fmt, sync::Arc};

/// Credentials attached to every request of a client instance, as gRPC metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    pub headers: Vec<(String, String)>,
}

impl ClientCredentials {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        self.headers.retain(|(existing, _)| *existing != key);
        self.headers.push((key, value.into()));
    }

    pub fn bearer(&mut self, token: impl AsRef<str>) {
        self.insert("authorization", format!("Bearer {}", token.as_ref()));
    }
}

pub type CredentialsCallback = Arc<dyn Fn(&mut ClientCredentials) + Send + Sync>;
pub type BindingCallback = Arc<dyn Fn(&mut BindingSettings) + Send + Sync>;
pub type ResolverCallback = Arc<dyn Fn(&OperationDescription, &mut PayloadBehavior) + Send + Sync>;

/// A configuration callback plus the version it was last replaced at.
pub(crate) struct ConfigSlot<F: ?Sized> {
    callback: Option<Arc<F>>,
    version: u64,
}

impl<F: ?Sized> Default for ConfigSlot<F> {
    fn default() -> Self {
        Self {
            callback: None,
            version: 0,
        }
    }
}

impl<F: ?Sized> ConfigSlot<F> {
    pub(crate) fn replace(&mut self, callback: Arc<F>) {
        self.callback = Some(callback);
        self.version += 1;
    }

    pub(crate) fn callback(&self) -> Option<&Arc<F>> {
        self.callback.as_ref()
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    /// Whether the slot changed since `applied` (`None` means never applied).
    pub(crate) fn is_dirty(&self, applied: Option<u64>) -> bool {
        applied != Some(self.version)
    }
}

/// Caller-supplied configuration callbacks of a proxy.
#[derive(Default)]
pub(crate) struct ProxyConfig {
    pub(crate) credentials: ConfigSlot<dyn Fn(&mut ClientCredentials) + Send + Sync>,
    pub(crate) binding: ConfigSlot<dyn Fn(&mut BindingSettings) + Send + Sync>,
    pub(crate) resolver:
        ConfigSlot<dyn Fn(&OperationDescription, &mut PayloadBehavior) + Send + Sync>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("credentials", &self.credentials.version)
            .field("binding", &self.binding.version)
            .field("resolver", &self.resolver.version)
            .finish()
    }
}
