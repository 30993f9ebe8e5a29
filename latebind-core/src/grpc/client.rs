//! # Generic gRPC Client
//!
//! This module wraps a standard `tonic` client to provide a generic interface for
//! gRPC communication. It is agnostic to the specific Protobuf messages being exchanged.
//!
//! ## How it works
//!
//! The [`GrpcClient`] utilizes the [`super::codec::JsonCodec`] to handle serialization.
//! It does not need to know the structure of the data it is sending; it simply ensures
//! the service is ready and passes the `serde_json::Value` and `MethodDescriptor`
//! to the codec.
//!
//! ## Features
//!
//! * **Dynamic Pathing**: Constructs the HTTP/2 path (e.g., `/package.Service/Method`) at runtime.
//! * **Metadata Handling**: Converts standard Rust string tuples into Tonic's `MetadataMap` for headers.
//! * **Call Options**: Per-call timeout, message size limits and [`PayloadBehavior`].
//! * **Access Patterns**: Provides specific methods for Unary, Server Streaming, Client Streaming,
//!   and Bidirectional Streaming calls, plus [`GrpcClient::dynamic`] which picks one from
//!   the method's shape.
use super::codec::{JsonCodec, PayloadBehavior};
use crate::BoxError;
use futures_util::{Stream, StreamExt};
use http_body::Body as HttpBody;
use prost_reflect::MethodDescriptor;
use std::{str::FromStr, time::Duration};
use tonic::{
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::Channel,
};

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
    #[error("Invalid gRPC path '{path}': '{source}'")]
    InvalidPath {
        path: String,
        source: http::uri::InvalidUri,
    },
}

/// Errors that can occur during [`GrpcClient::dynamic`].
#[derive(Debug, thiserror::Error)]
pub enum DynamicCallError {
    #[error("Invalid input: '{0}'")]
    InvalidInput(String),
    #[error("gRPC client request error: '{0}'")]
    GrpcRequestError(#[from] GrpcRequestError),
}

/// The result of a dynamic gRPC call.
#[derive(Debug, Clone)]
pub enum DynamicResponse {
    /// A single response message (for Unary and Client Streaming calls).
    Unary(Result<serde_json::Value, tonic::Status>),
    /// A stream of response messages (for Server Streaming and Bidirectional calls).
    Streaming(Result<Vec<Result<serde_json::Value, tonic::Status>>, tonic::Status>),
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Custom gRPC metadata (headers) to attach to the request.
    pub headers: Vec<(String, String)>,
    /// Deadline propagated to the server through the `grpc-timeout` header.
    pub timeout: Option<Duration>,
    pub max_decoding_message_size: Option<usize>,
    pub max_encoding_message_size: Option<usize>,
    pub payload: PayloadBehavior,
}

/// A dynamic gRPC client speaking JSON over any `tonic` transport service.
///
/// The underlying service is cloned for every call so a `GrpcClient` can be shared freely.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    service: S,
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    async fn ready_client(
        &self,
        options: &CallOptions,
    ) -> Result<tonic::client::Grpc<S>, GrpcRequestError> {
        let mut client = tonic::client::Grpc::new(self.service.clone());
        if let Some(limit) = options.max_decoding_message_size {
            client = client.max_decoding_message_size(limit);
        }
        if let Some(limit) = options.max_encoding_message_size {
            client = client.max_encoding_message_size(limit);
        }

        client
            .ready()
            .await
            .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

        Ok(client)
    }

    /// Performs a Unary gRPC call (Single Request -> Single Response).
    ///
    /// # Returns
    /// * `Ok(Ok(Value))` - Successful RPC execution.
    /// * `Ok(Err(Status))` - RPC executed, but server returned an error.
    /// * `Err(GrpcRequestError)` - Failed to send request or connect.
    pub async fn unary(
        &self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        options: &CallOptions,
    ) -> Result<Result<serde_json::Value, tonic::Status>, GrpcRequestError> {
        let mut client = self.ready_client(options).await?;

        let codec = codec_for(&method, options);
        let path = http_path(&method)?;
        let request = build_request(payload, options)?;

        match client.unary(request, path, codec).await {
            Ok(response) => Ok(Ok(response.into_inner())),
            Err(status) => Ok(Err(status)),
        }
    }

    /// Performs a Server Streaming gRPC call (Single Request -> Stream of Responses).
    pub async fn server_streaming(
        &self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        options: &CallOptions,
    ) -> Result<
        Result<impl Stream<Item = Result<serde_json::Value, tonic::Status>>, tonic::Status>,
        GrpcRequestError,
    > {
        let mut client = self.ready_client(options).await?;

        let codec = codec_for(&method, options);
        let path = http_path(&method)?;
        let request = build_request(payload, options)?;

        match client.server_streaming(request, path, codec).await {
            Ok(response) => Ok(Ok(response.into_inner())),
            Err(status) => Ok(Err(status)),
        }
    }

    /// Performs a Client Streaming gRPC call (Stream of Requests -> Single Response).
    pub async fn client_streaming(
        &self,
        method: MethodDescriptor,
        payload_stream: impl Stream<Item = serde_json::Value> + Send + 'static,
        options: &CallOptions,
    ) -> Result<Result<serde_json::Value, tonic::Status>, GrpcRequestError> {
        let mut client = self.ready_client(options).await?;

        let codec = codec_for(&method, options);
        let path = http_path(&method)?;
        let request = build_request(payload_stream, options)?;

        match client.client_streaming(request, path, codec).await {
            Ok(response) => Ok(Ok(response.into_inner())),
            Err(status) => Ok(Err(status)),
        }
    }

    /// Performs a Bidirectional Streaming gRPC call (Stream of Requests -> Stream of Responses).
    pub async fn bidirectional_streaming(
        &self,
        method: MethodDescriptor,
        payload_stream: impl Stream<Item = serde_json::Value> + Send + 'static,
        options: &CallOptions,
    ) -> Result<
        Result<impl Stream<Item = Result<serde_json::Value, tonic::Status>>, tonic::Status>,
        GrpcRequestError,
    > {
        let mut client = self.ready_client(options).await?;

        let codec = codec_for(&method, options);
        let path = http_path(&method)?;
        let request = build_request(payload_stream, options)?;

        match client.streaming(request, path, codec).await {
            Ok(response) => Ok(Ok(response.into_inner())),
            Err(status) => Ok(Err(status)),
        }
    }

    /// Calls `method` with the access pattern matching its streaming shape.
    ///
    /// Client-streaming and bidirectional methods expect `payload` to be a JSON array,
    /// whose elements are sent as the request stream.
    pub async fn dynamic(
        &self,
        method: MethodDescriptor,
        payload: serde_json::Value,
        options: &CallOptions,
    ) -> Result<DynamicResponse, DynamicCallError> {
        match (method.is_client_streaming(), method.is_server_streaming()) {
            (false, false) => {
                let result = self.unary(method, payload, options).await?;
                Ok(DynamicResponse::Unary(result))
            }
            (false, true) => match self.server_streaming(method, payload, options).await? {
                Ok(stream) => Ok(DynamicResponse::Streaming(Ok(stream.collect().await))),
                Err(status) => Ok(DynamicResponse::Streaming(Err(status))),
            },
            (true, false) => {
                let input_stream =
                    json_array_to_stream(payload).map_err(DynamicCallError::InvalidInput)?;
                let result = self.client_streaming(method, input_stream, options).await?;
                Ok(DynamicResponse::Unary(result))
            }
            (true, true) => {
                let input_stream =
                    json_array_to_stream(payload).map_err(DynamicCallError::InvalidInput)?;
                match self
                    .bidirectional_streaming(method, input_stream, options)
                    .await?
                {
                    Ok(stream) => Ok(DynamicResponse::Streaming(Ok(stream.collect().await))),
                    Err(status) => Ok(DynamicResponse::Streaming(Err(status))),
                }
            }
        }
    }
}

fn codec_for(method: &MethodDescriptor, options: &CallOptions) -> JsonCodec {
    JsonCodec::with_behavior(method.input(), method.output(), options.payload.clone())
}

fn http_path(method: &MethodDescriptor) -> Result<http::uri::PathAndQuery, GrpcRequestError> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    http::uri::PathAndQuery::from_str(&path)
        .map_err(|source| GrpcRequestError::InvalidPath { path, source })
}

fn build_request<T>(
    payload: T,
    options: &CallOptions,
) -> Result<tonic::Request<T>, GrpcRequestError> {
    let mut request = tonic::Request::new(payload);
    for (k, v) in &options.headers {
        let key =
            MetadataKey::from_str(k).map_err(|source| GrpcRequestError::InvalidMetadataKey {
                key: k.clone(),
                source,
            })?;
        let val = MetadataValue::from_str(v).map_err(|source| {
            GrpcRequestError::InvalidMetadataValue {
                key: k.clone(),
                source,
            }
        })?;
        request.metadata_mut().insert(key, val);
    }
    if let Some(timeout) = options.timeout {
        request.set_timeout(timeout);
    }
    Ok(request)
}

fn json_array_to_stream(
    json: serde_json::Value,
) -> Result<impl Stream<Item = serde_json::Value> + Send + 'static, String> {
    match json {
        serde_json::Value::Array(items) => Ok(tokio_stream::iter(items)),
        _ => Err("Client streaming requires a JSON Array body".to_string()),
    }
}
