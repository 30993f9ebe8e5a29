//! # Generic gRPC Transport
//!
//! Low-level building blocks for performing gRPC calls with message types that are only
//! known at runtime.
//!
//! Unlike generated `tonic` clients, which are strongly typed (e.g., `HelloRequest`),
//! [`client::GrpcClient`] exchanges `serde_json::Value` structures and [`codec::JsonCodec`]
//! transcodes them to Protobuf binary format on the fly, following the
//! [`codec::PayloadBehavior`] of the operation being invoked.
pub mod client;
pub mod codec;
