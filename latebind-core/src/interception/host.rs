//! Host-side interception.
//!
//! [`InspectedService`] wraps any `tonic` server (or router) and reports the exchanges it
//! serves through a [`HostInspector`]. Unary exchanges are buffered so their payloads can
//! be decoded and validated; streaming exchanges pass through untouched and their events
//! carry no payload.
use super::{EventContext, EventHub, EventKind, InspectorConfig, InterceptionEvent, SchemaSet};
use crate::grpc::codec::{PayloadBehavior, message_to_json};
use futures_util::stream;
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use prost_reflect::{DynamicMessage, MessageDescriptor};
use std::{
    convert::Infallible,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{
    Status,
    body::Body,
    codegen::{BoxFuture, Bytes, Service},
    server::NamedService,
};
use uuid::Uuid;

const FRAME_HEADER_LEN: usize = 5;

/// Correlates the request and reply steps of one host-side exchange.
///
/// Also available to handlers through the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationToken {
    pub id: Uuid,
    pub one_way: bool,
    pub action: String,
}

/// Host-side inspector.
#[derive(Debug)]
pub struct HostInspector {
    endpoint: Arc<str>,
    schema: Arc<SchemaSet>,
    events: Arc<EventHub>,
    config: InspectorConfig,
}

impl HostInspector {
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

    pub fn schema(&self) -> &SchemaSet {
        &self.schema
    }

    /// Records an incoming request before it is dispatched.
    pub fn after_receive_request(
        &self,
        action: &str,
        payload: Option<&serde_json::Value>,
        context: &EventContext,
    ) -> CorrelationToken {
        let token = CorrelationToken {
            id: Uuid::new_v4(),
            one_way: self.schema.is_one_way(action),
            action: action.to_string(),
        };

        let validation_error = match payload {
            Some(payload) if self.config.validate_payloads => {
                self.schema.validate_request(action, payload).err()
            }
            _ => None,
        };
        if let Some(error) = &validation_error {
            self.publish(
                EventKind::ErrorOccurred,
                &token,
                payload.cloned(),
                Some(error.clone()),
                None,
                context,
            );
        }

        self.publish(
            EventKind::ReceivingRequest,
            &token,
            payload.cloned(),
            validation_error,
            None,
            context,
        );
        token
    }

    /// Records the reply of the exchange identified by `token` before it leaves the host.
    ///
    /// One-way exchanges have no reply the caller waits for, so nothing is published.
    pub fn before_send_reply(
        &self,
        token: CorrelationToken,
        reply: Option<&serde_json::Value>,
        context: &EventContext,
    ) {
        if token.one_way {
            return;
        }

        let validation_error = match reply {
            Some(reply) if self.config.validate_payloads => {
                self.schema.validate_reply(&token.action, reply).err()
            }
            _ => None,
        };
        if let Some(error) = &validation_error {
            self.publish(
                EventKind::ErrorOccurred,
                &token,
                reply.cloned(),
                Some(error.clone()),
                None,
                context,
            );
        }

        self.publish(
            EventKind::SendingReply,
            &token,
            reply.cloned(),
            validation_error,
            None,
            context,
        );
    }

    pub fn report_error(
        &self,
        token: &CorrelationToken,
        error: impl ToString,
        context: &EventContext,
    ) {
        self.publish(
            EventKind::ErrorOccurred,
            token,
            None,
            None,
            Some(error.to_string()),
            context,
        );
    }

    fn publish(
        &self,
        kind: EventKind,
        token: &CorrelationToken,
        payload: Option<serde_json::Value>,
        validation_error: Option<String>,
        error: Option<String>,
        context: &EventContext,
    ) {
        self.events.publish(&InterceptionEvent {
            kind,
            correlation_id: token.id,
            one_way: token.one_way,
            action: token.action.clone(),
            payload,
            validation_error,
            error,
            endpoint: self.endpoint.clone(),
            context: context.clone(),
        });
    }
}

/// A `tonic` service reporting every exchange it serves to a [`HostInspector`].
#[derive(Debug, Clone)]
pub struct InspectedService<S> {
    inner: S,
    inspector: Arc<HostInspector>,
}

impl<S> InspectedService<S> {
    pub fn new(inner: S, inspector: Arc<HostInspector>) -> Self {
        Self { inner, inspector }
    }
}

impl<S: NamedService> NamedService for InspectedService<S> {
    const NAME: &'static str = S::NAME;
}

impl<S> Service<http::Request<Body>> for InspectedService<S>
where
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        // The clone may not be ready; keep the instance that was polled.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let inspector = self.inspector.clone();

        Box::pin(async move { Ok(inspect(inspector, inner, request).await) })
    }
}

async fn inspect<S>(
    inspector: Arc<HostInspector>,
    mut inner: S,
    request: http::Request<Body>,
) -> http::Response<Body>
where
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>,
{
    let action = request.uri().path().to_string();
    let authority = request
        .uri()
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            request
                .headers()
                .get(http::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        });
    let context = EventContext::from_headers(authority.as_deref(), request.headers());

    let unary = inspector
        .schema
        .get(&action)
        .filter(|entry| entry.is_unary())
        .map(|entry| (entry.input.clone(), entry.output.clone()));

    let Some((input, output)) = unary else {
        let (mut parts, body) = request.into_parts();
        let token = inspector.after_receive_request(&action, None, &context);
        parts.extensions.insert(token.clone());

        let response = call(&mut inner, http::Request::from_parts(parts, body)).await;
        inspector.before_send_reply(token, None, &context);
        return response;
    };

    let (mut parts, body) = request.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(status) => {
            tracing::warn!(%action, error = %status, "failed to buffer inspected request");
            return status_response(status);
        }
    };

    let decoded = decode_frame(&bytes, &input);
    let token = inspector.after_receive_request(&action, decoded.as_ref().ok(), &context);
    if let Err(error) = &decoded {
        inspector.report_error(&token, error, &context);
    }
    parts.extensions.insert(token.clone());

    let request = http::Request::from_parts(parts, Body::new(Full::new(bytes)));
    let response = call(&mut inner, request).await;

    let (parts, body) = response.into_parts();
    let collected = match body.collect().await {
        Ok(collected) => collected,
        Err(status) => {
            inspector.report_error(&token, &status, &context);
            return status_response(status);
        }
    };
    let trailers = collected.trailers().cloned();
    let bytes = collected.to_bytes();

    let reply = if bytes.is_empty() {
        None
    } else {
        decode_frame(&bytes, &output).ok()
    };
    inspector.before_send_reply(token, reply.as_ref(), &context);

    let mut frames: Vec<Result<Frame<Bytes>, Infallible>> = Vec::with_capacity(2);
    if !bytes.is_empty() {
        frames.push(Ok(Frame::data(bytes)));
    }
    if let Some(trailers) = trailers {
        frames.push(Ok(Frame::trailers(trailers)));
    }

    http::Response::from_parts(parts, Body::new(StreamBody::new(stream::iter(frames))))
}

async fn call<S>(inner: &mut S, request: http::Request<Body>) -> http::Response<Body>
where
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>,
{
    match inner.call(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Decodes the first length-prefixed gRPC message of a buffered body.
fn decode_frame(bytes: &[u8], desc: &MessageDescriptor) -> Result<serde_json::Value, String> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err("truncated gRPC frame".to_string());
    }
    if bytes[0] != 0 {
        return Err("compressed gRPC frames are not inspected".to_string());
    }

    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let message = bytes
        .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)
        .ok_or_else(|| "truncated gRPC frame".to_string())?;

    let message = DynamicMessage::decode(desc.clone(), message).map_err(|e| e.to_string())?;
    message_to_json(&message, &PayloadBehavior::default())
        .map_err(|status| status.message().to_string())
}

fn status_response(status: Status) -> http::Response<Body> {
    let mut response = http::Response::new(Body::empty());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    if let Err(status) = status.add_header(response.headers_mut()) {
        tracing::warn!(error = %status, "failed to encode status headers");
    }
    response
}
