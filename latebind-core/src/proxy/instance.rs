use super::{
    ProxyError, Reply,
    config::{ClientCredentials, ProxyConfig},
};
use crate::{
    BoxError,
    binding::BindingSettings,
    catalog::EndpointDescription,
    grpc::{
        client::{CallOptions, DynamicCallError, DynamicResponse, GrpcClient},
        codec::PayloadBehavior,
    },
    interception::{ClientInspector, EventContext},
    synthesis::{ClientType, OperationEntry},
};
use http_body::Body as HttpBody;
use std::collections::HashMap;
use tonic::client::GrpcService;

#[derive(Debug, Default, Clone, Copy)]
struct Applied {
    credentials: Option<u64>,
    binding: Option<u64>,
    resolver: Option<u64>,
}

/// The live client owned by a proxy.
pub(crate) struct ClientInstance<S> {
    client: GrpcClient<S>,
    inspector: Option<ClientInspector>,
    credentials: ClientCredentials,
    settings: BindingSettings,
    behaviors: HashMap<String, PayloadBehavior>,
    context: EventContext,
    applied: Applied,
}

impl<S> ClientInstance<S> {
    pub(crate) fn settings(&self) -> &BindingSettings {
        &self.settings
    }

    pub(crate) fn behavior(&self, operation: &str) -> Option<&PayloadBehavior> {
        self.behaviors.get(operation)
    }

    pub(crate) fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }
}

impl<S> ClientInstance<S>
where
    S: GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub(crate) fn new(service: S, settings: BindingSettings, authority: Option<String>) -> Self {
        Self {
            client: GrpcClient::new(service),
            inspector: None,
            credentials: ClientCredentials::default(),
            settings,
            behaviors: HashMap::new(),
            context: EventContext::new(authority),
            applied: Applied::default(),
        }
    }

    pub(crate) fn service(&self) -> &S {
        self.client.service()
    }

    /// Applies configuration callbacks that changed since they were last applied.
    ///
    /// A fresh instance has applied nothing yet, so every slot is applied and the
    /// inspector gets attached.
    pub(crate) fn initialize(
        &mut self,
        config: &ProxyConfig,
        endpoint: &EndpointDescription,
        client_type: &ClientType,
        inspector: impl FnOnce() -> ClientInspector,
    ) {
        if config.credentials.is_dirty(self.applied.credentials) {
            let mut credentials = ClientCredentials::default();
            if let Some(callback) = config.credentials.callback() {
                callback(&mut credentials);
            }
            self.context.credential_keys = credentials
                .headers
                .iter()
                .map(|(key, _)| key.clone())
                .filter(|key| crate::interception::is_credential_key(key))
                .collect();
            self.credentials = credentials;
            self.applied.credentials = Some(config.credentials.version());
        }

        if config.binding.is_dirty(self.applied.binding) {
            let mut settings = endpoint.binding().settings.clone();
            if let Some(callback) = config.binding.callback() {
                callback(&mut settings);
            }
            self.settings = settings.normalized();
            self.applied.binding = Some(config.binding.version());
        }

        if self.inspector.is_none() {
            self.inspector = Some(inspector());
        }

        if config.resolver.is_dirty(self.applied.resolver) {
            for entry in client_type.registry().entries() {
                let behavior = self
                    .behaviors
                    .entry(entry.description().name().to_string())
                    .or_default();
                behavior.ignore_unknown_fields = true;
                behavior.max_message_size = None;
                if let Some(callback) = config.resolver.callback() {
                    callback(entry.description(), behavior);
                }
            }
            self.applied.resolver = Some(config.resolver.version());
        }
    }

    fn call_options(&self, operation: &str, timeout: std::time::Duration) -> CallOptions {
        CallOptions {
            headers: self.credentials.headers.clone(),
            timeout: Some(timeout),
            max_decoding_message_size: self.settings.max_decoding_message_size,
            max_encoding_message_size: self.settings.max_encoding_message_size,
            payload: self.behaviors.get(operation).cloned().unwrap_or_default(),
        }
    }

    /// Sends one request through the inspector and waits for its reply.
    ///
    /// One-way requests are sent in the background and complete immediately.
    pub(crate) async fn invoke(
        &self,
        entry: &OperationEntry,
        payload: serde_json::Value,
    ) -> Result<Reply, ProxyError> {
        let operation = entry.description();
        let record = self
            .inspector
            .as_ref()
            .map(|inspector| inspector.before_send_request(operation, &payload, &self.context));

        if let Some(record) = record.as_ref().filter(|r| r.one_way) {
            let client = self.client.clone();
            let method = entry.method().clone();
            let options = self.call_options(operation.name(), self.settings.send_timeout);
            let inspector = self.inspector.clone();
            let context = self.context.clone();
            let record = record.clone();

            tokio::spawn(async move {
                let failure = match client.dynamic(method, payload, &options).await {
                    Ok(DynamicResponse::Unary(Ok(_))) => None,
                    Ok(DynamicResponse::Unary(Err(status))) => Some(status.to_string()),
                    Ok(DynamicResponse::Streaming(_)) => None,
                    Err(err) => Some(err.to_string()),
                };
                if let Some(error) = failure {
                    tracing::warn!(action = %record.action, %error, "one-way request failed");
                    if let Some(inspector) = inspector {
                        inspector.report_error(&record, error, &context);
                    }
                }
            });

            return Ok(Reply::OneWay);
        }

        let options = self.call_options(operation.name(), self.settings.receive_timeout);
        let response = self
            .client
            .dynamic(entry.method().clone(), payload, &options)
            .await;

        let outcome = match response {
            Ok(DynamicResponse::Unary(Ok(value))) => Ok((value.clone(), Reply::Unary(value))),
            Ok(DynamicResponse::Unary(Err(status)))
            | Ok(DynamicResponse::Streaming(Err(status))) => Err(ProxyError::from_status(status)),
            Ok(DynamicResponse::Streaming(Ok(items))) => items
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map(|items| (serde_json::Value::Array(items.clone()), Reply::Streaming(items)))
                .map_err(ProxyError::from_status),
            Err(DynamicCallError::InvalidInput(message)) => {
                Err(ProxyError::InvalidArgument(message))
            }
            Err(DynamicCallError::GrpcRequestError(err)) => Err(ProxyError::from_request(err)),
        };

        match (outcome, record, self.inspector.as_ref()) {
            (Ok((value, reply)), Some(record), Some(inspector)) => {
                inspector.after_receive_reply(record, &value, &self.context);
                Ok(reply)
            }
            (Ok((_, reply)), _, _) => Ok(reply),
            (Err(err), Some(record), Some(inspector)) => {
                inspector.report_error(&record, &err, &self.context);
                Err(err)
            }
            (Err(err), _, _) => Err(err),
        }
    }
}
