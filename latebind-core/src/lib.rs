//! # Latebind Core
//!
//! `latebind-core` resolves gRPC services at runtime and calls them through late-bound
//! proxies, without compile-time knowledge of their Protobuf schema.
//!
//! ## Key Components
//!
//! * **[`ContractCatalog`](catalog::ContractCatalog):** Turns descriptor metadata (fetched
//!   through server reflection or loaded from a descriptor set) into contracts, bindings
//!   and endpoints.
//! * **[`ClientBuilder`](synthesis::ClientBuilder):** Produces the client type of a contract,
//!   either dynamically over the descriptors, by regenerating and compiling its proto
//!   source, or from a precompiled client module.
//! * **[`ClientTypeCache`](type_cache::ClientTypeCache):** Builds each client type once per
//!   contract and strategy.
//! * **[`Proxy`](proxy::Proxy):** Owns a client instance for an endpoint, with an explicit
//!   lifecycle and a per-call or per-session lifetime. Calls take and return JSON.
//! * **[`ProxyCache`](proxy_cache::ProxyCache):** Shares proxies across callers.
//! * **[`interception`]:** Reports every request and reply, on the client and on hosted
//!   services, to subscribed observers.
//!
//! ## Internal clients
//!
//! * **[`GrpcClient`](grpc::client::GrpcClient):** A dynamic gRPC client using a JSON codec.
//! * **[`ReflectionClient`](reflection::client::ReflectionClient):** A gRPC reflection client
//!   offering the lookups needed to discover services.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod binding;
pub mod catalog;
pub mod factory;
pub mod grpc;
pub mod interception;
pub mod metadata;
pub mod proxy;
pub mod proxy_cache;
pub mod reflection;
pub mod synthesis;
pub mod type_cache;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
