//! # Proxy Lifecycle
//!
//! A [`Proxy`] owns at most one live client instance for an endpoint and exposes a
//! uniform invocation surface over it: by operation name, by name plus parameter
//! signature, or by an already resolved [`OperationDescription`].
//!
//! ```text
//! Unopened -> Opening -> Opened -> Closing -> Closed
//!                 \          \
//!                  Faulted    Aborted
//! ```
//!
//! `Closed`, `Faulted` and `Aborted` proxies can be opened again, which builds a fresh
//! instance. Nothing leaves the disposed state.
//!
//! The [`Strategy`] of the client type decides whether an instance serves a whole
//! session or a single call, and whether faults are returned or reported as events.
mod config;
mod instance;
mod strategy;

pub use config::{BindingCallback, ClientCredentials, CredentialsCallback, ResolverCallback};
pub use strategy::{FailurePolicy, Lifetime, Strategy};

use crate::{
    BoxError,
    binding::{BindingSettings, ConnectError, Connector},
    catalog::{EndpointDescription, OperationDescription},
    grpc::{client::GrpcRequestError, codec::PayloadBehavior},
    interception::{
        ClientInspector, EventContext, EventHub, EventKind, InspectorConfig, InterceptionEvent,
    },
    synthesis::{ClientType, OperationEntry},
};
use config::ProxyConfig;
use http::Uri;
use http_body::Body as HttpBody;
use instance::ClientInstance;
use std::{error::Error as _, sync::Arc};
use tonic::{Code, Status, client::GrpcService};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyState {
    Unopened,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
    Aborted,
}

/// A communication-layer failure.
#[derive(Debug, thiserror::Error)]
pub enum ChannelFault {
    #[error("Failed to open the channel: {0}")]
    Open(#[from] ConnectError),
    #[error("Failed to send the request: {0}")]
    Request(#[from] GrpcRequestError),
    #[error("Transport failure: {message}")]
    Transport { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Operation expects {expected} argument(s) but {actual} were supplied")]
    ArgumentMismatch { expected: usize, actual: usize },
    #[error("Method '{0}' not found")]
    MethodNotFound(String),
    #[error("The proxy has been disposed")]
    ObjectDisposed,
    #[error("Invalid endpoint address '{address}': '{source}'")]
    InvalidAddress {
        address: String,
        source: http::uri::InvalidUri,
    },
    #[error("Invalid argument: '{0}'")]
    InvalidArgument(String),
    #[error(transparent)]
    Channel(#[from] ChannelFault),
    #[error("The call failed with status {}: {}", .0.code(), .0.message())]
    Status(Status),
}

impl ProxyError {
    /// Maps a failed call, preferring the transport error wrapped by the status when present.
    pub fn from_status(status: Status) -> Self {
        match status.source() {
            Some(cause) => ProxyError::Channel(ChannelFault::Transport {
                message: cause.to_string(),
            }),
            None => ProxyError::Status(status),
        }
    }

    /// Maps a request that never reached the remote side, unwrapping the transport error
    /// of a client that could not become ready.
    pub fn from_request(err: GrpcRequestError) -> Self {
        match err {
            GrpcRequestError::ClientNotReady(cause) => {
                ProxyError::Channel(ChannelFault::Transport {
                    message: cause.to_string(),
                })
            }
            other => ProxyError::Channel(ChannelFault::Request(other)),
        }
    }

    /// Whether the channel itself failed, leaving the live instance unusable.
    pub fn is_channel_fault(&self) -> bool {
        matches!(self, ProxyError::Channel(_))
    }

    /// Whether this error is a fault of the channel or of the remote call, as opposed to
    /// a mistake of the caller.
    pub fn is_fault(&self) -> bool {
        matches!(self, ProxyError::Channel(_) | ProxyError::Status(_))
    }
}

/// A fault swallowed by an unthrowable proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    pub message: String,
    pub code: Option<Code>,
}

impl From<&ProxyError> for FaultRecord {
    fn from(err: &ProxyError) -> Self {
        Self {
            message: err.to_string(),
            code: match err {
                ProxyError::Status(status) => Some(status.code()),
                _ => None,
            },
        }
    }
}

/// The outcome of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The single reply of a unary or client-streaming operation.
    Unary(serde_json::Value),
    /// Every reply of a server-streaming or bidirectional operation.
    Streaming(Vec<serde_json::Value>),
    /// A one-way request was handed to the transport.
    OneWay,
    /// The call faulted and the proxy's policy is to report rather than fail.
    Faulted(FaultRecord),
}

/// Lifecycle manager of a client instance for one endpoint.
pub struct Proxy<C: Connector> {
    endpoint: EndpointDescription,
    client_type: Arc<ClientType>,
    connector: Arc<C>,
    events: Arc<EventHub>,
    inspector_config: InspectorConfig,
    config: ProxyConfig,
    instance: Option<ClientInstance<C::Service>>,
    state: ProxyState,
    disposed: bool,
    last_fault: Option<FaultRecord>,
}

impl<C: Connector> std::fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("endpoint", &self.endpoint.identity())
            .field("strategy", &self.client_type.strategy())
            .field("state", &self.state)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl<C: Connector> Proxy<C> {
    pub fn new(
        endpoint: EndpointDescription,
        client_type: Arc<ClientType>,
        connector: Arc<C>,
        events: Arc<EventHub>,
        inspector_config: InspectorConfig,
    ) -> Self {
        Self {
            endpoint,
            client_type,
            connector,
            events,
            inspector_config,
            config: ProxyConfig::default(),
            instance: None,
            state: ProxyState::Unopened,
            disposed: false,
            last_fault: None,
        }
    }

    pub fn endpoint(&self) -> &EndpointDescription {
        &self.endpoint
    }

    pub fn client_type(&self) -> &Arc<ClientType> {
        &self.client_type
    }

    pub fn strategy(&self) -> Strategy {
        self.client_type.strategy()
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// The last fault swallowed by an unthrowable proxy.
    pub fn last_fault(&self) -> Option<&FaultRecord> {
        self.last_fault.as_ref()
    }

    /// Replaces the credentials callback. Applied before the next call.
    pub fn configure_credentials(
        &mut self,
        callback: impl Fn(&mut ClientCredentials) + Send + Sync + 'static,
    ) {
        self.config.credentials.replace(Arc::new(callback));
    }

    /// Replaces the binding callback. Applied before the next open or call.
    pub fn configure_binding(
        &mut self,
        callback: impl Fn(&mut BindingSettings) + Send + Sync + 'static,
    ) {
        self.config.binding.replace(Arc::new(callback));
    }

    /// Replaces the per-operation payload behavior callback. Applied before the next call.
    pub fn configure_resolver(
        &mut self,
        callback: impl Fn(&OperationDescription, &mut PayloadBehavior) + Send + Sync + 'static,
    ) {
        self.config.resolver.replace(Arc::new(callback));
    }

    /// The payload behavior currently applied to an operation of the live instance.
    pub fn payload_behavior(&self, operation: &str) -> Option<&PayloadBehavior> {
        self.instance.as_ref()?.behavior(operation)
    }

    /// The credentials currently applied to the live instance.
    pub fn credentials(&self) -> Option<&ClientCredentials> {
        self.instance.as_ref().map(ClientInstance::credentials)
    }

    fn ensure_not_disposed(&self) -> Result<(), ProxyError> {
        if self.disposed {
            Err(ProxyError::ObjectDisposed)
        } else {
            Ok(())
        }
    }

    /// Tears down the live instance immediately.
    pub fn abort(&mut self) {
        self.instance = None;
        if !self.disposed {
            self.state = ProxyState::Aborted;
        }
        tracing::debug!(endpoint = %self.endpoint.identity(), "proxy aborted");
    }
}

impl<C> Proxy<C>
where
    C: Connector,
    C::Service: GrpcService<tonic::body::Body> + Clone + Send + Sync + 'static,
    <C::Service as GrpcService<tonic::body::Body>>::Future: Send,
    <C::Service as GrpcService<tonic::body::Body>>::Error: Into<BoxError>,
    <C::Service as GrpcService<tonic::body::Body>>::ResponseBody:
        HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <<C::Service as GrpcService<tonic::body::Body>>::ResponseBody as HttpBody>::Error:
        Into<BoxError> + Send,
{
    /// Opens the channel and initializes a fresh client instance.
    ///
    /// Opening an opened proxy does nothing. On failure the proxy is left `Faulted` and the
    /// original fault is returned, whatever the failure policy.
    pub async fn open(&mut self) -> Result<(), ProxyError> {
        self.ensure_not_disposed()?;
        if self.state == ProxyState::Opened && self.instance.is_some() {
            return Ok(());
        }

        self.state = ProxyState::Opening;
        match self.build_instance().await {
            Ok(instance) => {
                self.instance = Some(instance);
                self.state = ProxyState::Opened;
                tracing::debug!(endpoint = %self.endpoint.identity(), "proxy opened");
                Ok(())
            }
            Err(err) => {
                self.close_instance().await;
                self.state = ProxyState::Faulted;
                tracing::debug!(
                    endpoint = %self.endpoint.identity(),
                    error = %err,
                    "proxy faulted while opening"
                );
                Err(err)
            }
        }
    }

    async fn build_instance(&self) -> Result<ClientInstance<C::Service>, ProxyError> {
        let address = self.endpoint.address();
        let uri: Uri = address.parse().map_err(|source| ProxyError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;

        let mut binding = self.endpoint.binding().clone();
        if let Some(callback) = self.config.binding.callback() {
            callback(&mut binding.settings);
        }
        let binding = binding.normalized();

        if !self.connector.supports(&binding) {
            return Err(ChannelFault::Open(ConnectError::Refused {
                address: address.to_string(),
                reason: format!("binding '{}' is not supported", binding.type_name),
            })
            .into());
        }

        let timeout = binding.settings.open_timeout;
        let connect = self.connector.connect(&uri, &binding);
        let service = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(service)) => service,
            Ok(Err(err)) => return Err(ChannelFault::Open(err).into()),
            Err(_) => {
                return Err(ChannelFault::Open(ConnectError::Timeout {
                    address: address.to_string(),
                    timeout,
                })
                .into());
            }
        };

        let mut instance = ClientInstance::new(
            service,
            binding.settings.clone(),
            uri.authority().map(|a| a.to_string()),
        );
        instance.initialize(&self.config, &self.endpoint, &self.client_type, || {
            self.new_inspector()
        });
        Ok(instance)
    }

    fn new_inspector(&self) -> ClientInspector {
        ClientInspector::new(
            self.endpoint.identity(),
            self.client_type.schema(),
            self.events.clone(),
            self.inspector_config.clone(),
        )
    }

    /// Gracefully closes the live instance, aborting it if that fails.
    pub async fn close(&mut self) {
        if self.disposed {
            return;
        }
        if self.instance.is_none() {
            if self.state != ProxyState::Unopened {
                self.state = ProxyState::Closed;
            }
            return;
        }

        self.state = ProxyState::Closing;
        if self.close_instance().await {
            self.state = ProxyState::Closed;
            tracing::debug!(endpoint = %self.endpoint.identity(), "proxy closed");
        } else {
            self.abort();
        }
    }

    /// Returns whether the instance (if any) was released gracefully.
    async fn close_instance(&mut self) -> bool {
        let Some(instance) = self.instance.take() else {
            return true;
        };

        let timeout = instance.settings().close_timeout;
        let service = instance.service().clone();
        drop(instance);

        match tokio::time::timeout(timeout, self.connector.disconnect(service)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::warn!(
                    endpoint = %self.endpoint.identity(),
                    error = %err,
                    "graceful close failed, aborting"
                );
                false
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %self.endpoint.identity(),
                    ?timeout,
                    "close timed out, aborting"
                );
                false
            }
        }
    }

    /// Closes the proxy for good. Calling it again does nothing.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.close().await;
        self.disposed = true;
    }

    /// Invokes the first operation called `name`.
    pub async fn call(
        &mut self,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, ProxyError> {
        self.ensure_not_disposed()?;
        let entry = self
            .client_type
            .registry()
            .lookup(name)
            .cloned()
            .ok_or_else(|| ProxyError::MethodNotFound(name.to_string()))?;
        self.dispatch(&entry, args).await
    }

    /// Invokes the operation called `name` whose parameter types are `parameter_types`.
    pub async fn call_with_signature(
        &mut self,
        name: &str,
        parameter_types: &[&str],
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, ProxyError> {
        self.ensure_not_disposed()?;
        if parameter_types.len() != args.len() {
            return Err(ProxyError::ArgumentMismatch {
                expected: parameter_types.len(),
                actual: args.len(),
            });
        }
        let entry = self
            .client_type
            .registry()
            .lookup_signature(name, parameter_types)
            .cloned()
            .ok_or_else(|| ProxyError::MethodNotFound(name.to_string()))?;
        self.dispatch(&entry, args).await
    }

    /// Invokes an operation resolved beforehand from the contract.
    pub async fn call_operation(
        &mut self,
        operation: &OperationDescription,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, ProxyError> {
        self.ensure_not_disposed()?;
        let entry = self
            .client_type
            .registry()
            .lookup_operation(operation)
            .cloned()
            .ok_or_else(|| ProxyError::MethodNotFound(operation.name().to_string()))?;
        self.dispatch(&entry, args).await
    }

    async fn dispatch(
        &mut self,
        entry: &OperationEntry,
        args: Vec<serde_json::Value>,
    ) -> Result<Reply, ProxyError> {
        if args.len() != entry.arity() {
            return Err(ProxyError::ArgumentMismatch {
                expected: entry.arity(),
                actual: args.len(),
            });
        }
        let Some(payload) = args.into_iter().next() else {
            return Err(ProxyError::ArgumentMismatch {
                expected: entry.arity(),
                actual: 0,
            });
        };

        let outcome = if self.strategy().is_per_call() {
            self.call_once(entry, payload).await
        } else {
            self.call_in_session(entry, payload).await
        };

        match outcome {
            Err(err) if err.is_fault() && self.strategy().is_unthrowable() => {
                Ok(Reply::Faulted(self.record_fault(entry, &err)))
            }
            other => other,
        }
    }

    async fn call_in_session(
        &mut self,
        entry: &OperationEntry,
        payload: serde_json::Value,
    ) -> Result<Reply, ProxyError> {
        if self.instance.is_none() || self.state != ProxyState::Opened {
            self.open().await?;
        }

        let Some(instance) = self.instance.as_mut() else {
            return Err(ProxyError::ObjectDisposed);
        };
        let (config, endpoint, client_type) = (&self.config, &self.endpoint, &self.client_type);
        let events = &self.events;
        let inspector_config = &self.inspector_config;
        instance.initialize(config, endpoint, client_type, || {
            ClientInspector::new(
                endpoint.identity(),
                client_type.schema(),
                events.clone(),
                inspector_config.clone(),
            )
        });

        let result = instance.invoke(entry, payload).await;
        if let Err(err) = &result
            && err.is_channel_fault()
        {
            self.fault(err).await;
        }
        result
    }

    async fn call_once(
        &mut self,
        entry: &OperationEntry,
        payload: serde_json::Value,
    ) -> Result<Reply, ProxyError> {
        self.open().await?;

        let result = match self.instance.as_ref() {
            Some(instance) => instance.invoke(entry, payload).await,
            None => Err(ProxyError::ObjectDisposed),
        };

        match &result {
            Err(err) if err.is_channel_fault() => self.fault(err).await,
            _ => self.close().await,
        }
        result
    }

    /// Releases an instance whose channel failed and leaves the proxy `Faulted`.
    ///
    /// The next call opens a fresh instance.
    async fn fault(&mut self, err: &ProxyError) {
        self.close_instance().await;
        self.state = ProxyState::Faulted;
        tracing::debug!(
            endpoint = %self.endpoint.identity(),
            error = %err,
            "proxy faulted during a call"
        );
    }

    /// Reports and records a fault swallowed by the unthrowable policy.
    fn record_fault(&mut self, entry: &OperationEntry, err: &ProxyError) -> FaultRecord {
        tracing::warn!(
            endpoint = %self.endpoint.identity(),
            operation = entry.description().name(),
            error = %err,
            "call faulted"
        );

        // Exchange faults were already reported by the inspector with their correlation id.
        if matches!(err, ProxyError::Channel(ChannelFault::Open(_))) {
            self.events.publish(&InterceptionEvent {
                kind: EventKind::ErrorOccurred,
                correlation_id: Uuid::new_v4(),
                one_way: entry.description().is_one_way(),
                action: entry.description().concrete_action().to_string(),
                payload: None,
                validation_error: None,
                error: Some(err.to_string()),
                endpoint: Arc::from(self.endpoint.identity()),
                context: EventContext::default(),
            });
        }

        let record = FaultRecord::from(err);
        self.last_fault = Some(record.clone());
        record
    }
}
