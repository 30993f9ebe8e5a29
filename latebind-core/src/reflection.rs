//! # Server Reflection
//!
//! This module contains the logic necessary to interact with the gRPC Server Reflection Protocol.
//!
//! It lets the engine query a server for its own Protobuf schema at runtime, which is the
//! live metadata exchange feeding the [`ContractCatalog`](crate::catalog::ContractCatalog).
pub mod client;
mod source;

pub use source::ReflectionMetadataSource;
