//! # Metadata Sources
//!
//! Raw schema information is acquired by a [`MetadataSource`] as a list of
//! [`MetadataFragment`]s, then handed to [`ContractCatalog::resolve`](crate::catalog::ContractCatalog::resolve).
//! Fetching and resolving are kept apart so the catalog never performs I/O.
use crate::reflection::client::ReflectionResolveError;
use prost::Message;
use prost_types::FileDescriptorSet;
use std::future::Future;

/// A raw piece of metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataFragment {
    /// An encoded `google.protobuf.FileDescriptorProto`.
    FileDescriptor(Vec<u8>),
    /// An encoded `google.protobuf.FileDescriptorSet`.
    FileDescriptorSet(Vec<u8>),
    /// An explicit endpoint for a contract, reached over a binding type or named binding.
    Endpoint {
        contract: String,
        address: String,
        binding: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid metadata address '{address}': '{source}'")]
    InvalidAddress {
        address: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("Failed to reach metadata endpoint '{address}': '{source}'")]
    Connect {
        address: String,
        #[source]
        source: crate::binding::ConnectError,
    },
    #[error("Reflection request failed: '{0}'")]
    Reflection(#[from] ReflectionResolveError),
}

/// Fetches the metadata published at an address.
pub trait MetadataSource {
    fn fetch(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Vec<MetadataFragment>, FetchError>>;
}

/// Serves a fixed set of fragments whatever the address.
///
/// Useful when descriptors are embedded in the binary, e.g. through
/// `tonic::include_file_descriptor_set!`.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadataSource {
    fragments: Vec<MetadataFragment>,
}

impl StaticMetadataSource {
    pub fn new(fragments: Vec<MetadataFragment>) -> Self {
        Self { fragments }
    }

    pub fn from_file_descriptor_set(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(vec![MetadataFragment::FileDescriptorSet(bytes.into())])
    }

    pub fn from_set(set: &FileDescriptorSet) -> Self {
        Self::from_file_descriptor_set(set.encode_to_vec())
    }

    pub fn with_fragment(mut self, fragment: MetadataFragment) -> Self {
        self.fragments.push(fragment);
        self
    }
}

impl MetadataSource for StaticMetadataSource {
    async fn fetch(&self, _address: &str) -> Result<Vec<MetadataFragment>, FetchError> {
        Ok(self.fragments.clone())
    }
}
