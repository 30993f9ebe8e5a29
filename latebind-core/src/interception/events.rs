use parking_lot::RwLock;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use uuid::Uuid;

/// The step of a message exchange an event was raised at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SendingRequest,
    ReceivingReply,
    ReceivingRequest,
    SendingReply,
    ErrorOccurred,
}

/// Transport context of an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    pub authority: Option<String>,
    /// Names of the metadata entries carrying credentials. Values are never recorded.
    pub credential_keys: Vec<String>,
}

const CREDENTIAL_HEADERS: [&str; 4] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "x-api-key",
];

impl EventContext {
    pub fn new(authority: Option<String>) -> Self {
        Self {
            authority,
            credential_keys: Vec::new(),
        }
    }

    /// Builds a context from request headers and the request authority.
    pub fn from_headers(authority: Option<&str>, headers: &http::HeaderMap) -> Self {
        let mut credential_keys: Vec<String> = headers
            .keys()
            .map(|key| key.as_str())
            .filter(|key| is_credential_key(key))
            .map(str::to_string)
            .collect();
        credential_keys.sort();
        credential_keys.dedup();

        Self {
            authority: authority.map(str::to_string),
            credential_keys,
        }
    }
}

pub(crate) fn is_credential_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    CREDENTIAL_HEADERS.contains(&key.as_str()) || key.contains("token")
}

/// A single observation of the interception pipeline.
#[derive(Debug, Clone)]
pub struct InterceptionEvent {
    pub kind: EventKind,
    pub correlation_id: Uuid,
    pub one_way: bool,
    pub action: String,
    pub payload: Option<serde_json::Value>,
    pub validation_error: Option<String>,
    pub error: Option<String>,
    /// Identity of the endpoint the exchange belongs to.
    pub endpoint: Arc<str>,
    pub context: EventContext,
}

pub type Observer = Arc<dyn Fn(&InterceptionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of event observers.
///
/// Publishing copies the observer list before invoking anyone, so observers may
/// subscribe or unsubscribe from inside a callback without affecting the event in flight.
#[derive(Default)]
pub struct EventHub {
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&InterceptionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn publish(&self, event: &InterceptionEvent) {
        let snapshot: Vec<Observer> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        tracing::trace!(
            kind = ?event.kind,
            id = %event.correlation_id,
            action = %event.action,
            "publishing event"
        );

        for observer in snapshot {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}
