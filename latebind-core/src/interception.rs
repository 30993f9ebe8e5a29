//! # Message Interception
//!
//! Observes every message exchanged by a proxy (client side) or by a hosted service
//! (host side, see [`host`]) and reports it to an [`EventHub`].
//!
//! Each exchange is tagged with a fresh correlation id when its request is sent (or
//! received), and the same id is carried by the matching reply event. Operations whose
//! reply is `google.protobuf.Empty` are one-way: the caller never waits for their reply,
//! so the reply event is published right after the request event.
//!
//! Payload validation against the message schemas is advisory: failures are published as
//! [`EventKind::ErrorOccurred`] and never block the exchange.
pub mod host;
mod events;
mod schema;

pub use events::{EventContext, EventHub, EventKind, InterceptionEvent, Observer, SubscriptionId};
pub use schema::{SchemaEntry, SchemaSet};

pub(crate) use events::is_credential_key;

use crate::catalog::OperationDescription;
use std::{sync::Arc, time::Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// Check payloads against the message schemas.
    pub validate_payloads: bool,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            validate_payloads: true,
        }
    }
}

/// Correlates the request and reply steps of one client-side exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub id: Uuid,
    pub one_way: bool,
    pub started_at: Instant,
    pub action: String,
}

/// Client-side inspector attached to a proxy's client instance.
#[derive(Debug, Clone)]
pub struct ClientInspector {
    endpoint: Arc<str>,
    schema: Arc<SchemaSet>,
    events: Arc<EventHub>,
    config: InspectorConfig,
}

impl ClientInspector {
    pub fn new(
        endpoint: impl Into<Arc<str>>,
        schema: Arc<SchemaSet>,
        events: Arc<EventHub>,
        config: InspectorConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            schema,
            events,
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Records an outgoing request and returns the record its reply must be matched with.
    pub fn before_send_request(
        &self,
        operation: &OperationDescription,
        payload: &serde_json::Value,
        context: &EventContext,
    ) -> CorrelationRecord {
        let action = operation.concrete_action().to_string();
        let record = CorrelationRecord {
            id: Uuid::new_v4(),
            one_way: self.schema.is_one_way(&action),
            started_at: Instant::now(),
            action,
        };

        let validation_error = if self.config.validate_payloads {
            self.schema
                .validate_request(&record.action, payload)
                .err()
        } else {
            None
        };

        if let Some(error) = &validation_error {
            self.publish(
                EventKind::ErrorOccurred,
                &record,
                Some(payload.clone()),
                Some(error.clone()),
                None,
                context,
            );
        }

        self.publish(
            EventKind::SendingRequest,
            &record,
            Some(payload.clone()),
            validation_error,
            None,
            context,
        );

        if record.one_way {
            self.publish(EventKind::ReceivingReply, &record, None, None, None, context);
        }

        record
    }

    /// Records the reply of the exchange started by `record`.
    ///
    /// One-way exchanges were already completed by [`ClientInspector::before_send_request`].
    pub fn after_receive_reply(
        &self,
        record: CorrelationRecord,
        reply: &serde_json::Value,
        context: &EventContext,
    ) {
        if record.one_way {
            return;
        }

        let validation_error = if self.config.validate_payloads {
            self.schema.validate_reply(&record.action, reply).err()
        } else {
            None
        };

        if let Some(error) = &validation_error {
            self.publish(
                EventKind::ErrorOccurred,
                &record,
                Some(reply.clone()),
                Some(error.clone()),
                None,
                context,
            );
        }

        tracing::trace!(
            id = %record.id,
            action = %record.action,
            elapsed = ?record.started_at.elapsed(),
            "reply received"
        );

        self.publish(
            EventKind::ReceivingReply,
            &record,
            Some(reply.clone()),
            validation_error,
            None,
            context,
        );
    }

    /// Reports a fault of the exchange started by `record`.
    pub fn report_error(
        &self,
        record: &CorrelationRecord,
        error: impl ToString,
        context: &EventContext,
    ) {
        self.publish(
            EventKind::ErrorOccurred,
            record,
            None,
            None,
            Some(error.to_string()),
            context,
        );
    }

    fn publish(
        &self,
        kind: EventKind,
        record: &CorrelationRecord,
        payload: Option<serde_json::Value>,
        validation_error: Option<String>,
        error: Option<String>,
        context: &EventContext,
    ) {
        self.events.publish(&InterceptionEvent {
            kind,
            correlation_id: record.id,
            one_way: record.one_way,
            action: record.action.clone(),
            payload,
            validation_error,
            error,
            endpoint: self.endpoint.clone(),
            context: context.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ContractDescription;
    use parking_lot::Mutex;
    use prost_reflect::DescriptorPool;
    use serde_json::json;

    type Events = Arc<Mutex<Vec<InterceptionEvent>>>;

    fn setup(config: InspectorConfig) -> (ContractDescription, ClientInspector, Events) {
        let pool = DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        let service = pool.get_service_by_name("echo.EchoService").unwrap();
        let contract = ContractDescription::from_service(&service);

        let events = Arc::new(EventHub::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe(move |event| sink.lock().push(event.clone()));

        let inspector = ClientInspector::new(
            "echo.EchoService@http://localhost",
            Arc::new(SchemaSet::from_pool(&pool)),
            events,
            config,
        );
        (contract, inspector, seen)
    }

    #[test]
    fn one_way_requests_complete_immediately() {
        let (contract, inspector, seen) = setup(InspectorConfig::default());
        let notify = contract.operation("Notify").unwrap();

        let record = inspector.before_send_request(
            notify,
            &json!({ "message": "ping" }),
            &EventContext::default(),
        );
        assert!(record.one_way);

        let events = seen.lock();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::SendingRequest, EventKind::ReceivingReply]);
        assert!(events.iter().all(|e| e.correlation_id == record.id && e.one_way));
    }

    #[test]
    fn invalid_payloads_are_reported_but_sent() {
        let (contract, inspector, seen) = setup(InspectorConfig::default());
        let unary = contract.operation("UnaryEcho").unwrap();

        let record =
            inspector.before_send_request(unary, &json!({ "bogus": 1 }), &EventContext::default());
        inspector.after_receive_reply(
            record.clone(),
            &json!({ "message": "ok" }),
            &EventContext::default(),
        );

        let events = seen.lock();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ErrorOccurred,
                EventKind::SendingRequest,
                EventKind::ReceivingReply
            ]
        );
        assert!(events[1].validation_error.is_some());
        assert!(events[2].validation_error.is_none());
        assert!(events.iter().all(|e| e.correlation_id == record.id));
    }

    #[test]
    fn validation_can_be_disabled() {
        let (contract, inspector, seen) = setup(InspectorConfig {
            validate_payloads: false,
        });
        let unary = contract.operation("UnaryEcho").unwrap();

        inspector.before_send_request(unary, &json!({ "bogus": 1 }), &EventContext::default());

        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SendingRequest);
    }

    #[test]
    fn wildcard_operations_are_never_one_way() {
        let (contract, inspector, _) = setup(InspectorConfig::default());
        let wildcard = contract.with_wildcard_action("Notify");

        let record = inspector.before_send_request(
            wildcard.operation("Notify").unwrap(),
            &json!({}),
            &EventContext::default(),
        );
        assert_eq!(record.action, "");
        assert!(!record.one_way);
    }
}
