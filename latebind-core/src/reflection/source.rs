use super::client::ReflectionClient;
use crate::{
    BoxError,
    binding::{BindingDescriptor, Connector},
    metadata::{FetchError, MetadataFragment, MetadataSource},
};
use http::Uri;
use http_body::Body as HttpBody;
use prost::Message;
use tonic::client::GrpcService;

const REFLECTION_PACKAGE_PREFIX: &str = "grpc.reflection.";

/// A [`MetadataSource`] backed by the gRPC Server Reflection service of the target.
///
/// Every exposed service except the reflection service itself is resolved, and each file
/// is returned once as a [`MetadataFragment::FileDescriptor`].
#[derive(Debug, Clone)]
pub struct ReflectionMetadataSource<C> {
    connector: C,
    binding: BindingDescriptor,
}

impl<C: Connector> ReflectionMetadataSource<C> {
    pub fn new(connector: C) -> Self {
        Self::with_binding(connector, BindingDescriptor::default())
    }

    pub fn with_binding(connector: C, binding: BindingDescriptor) -> Self {
        Self {
            connector,
            binding: binding.normalized(),
        }
    }
}

impl<C> MetadataSource for ReflectionMetadataSource<C>
where
    C: Connector,
    C::Service: GrpcService<tonic::body::Body>,
    <C::Service as GrpcService<tonic::body::Body>>::Error: Into<BoxError>,
    <C::Service as GrpcService<tonic::body::Body>>::ResponseBody:
        HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <<C::Service as GrpcService<tonic::body::Body>>::ResponseBody as HttpBody>::Error:
        Into<BoxError> + Send,
{
    async fn fetch(&self, address: &str) -> Result<Vec<MetadataFragment>, FetchError> {
        let uri: Uri = address.parse().map_err(|source| FetchError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;

        let service = self
            .connector
            .connect(&uri, &self.binding)
            .await
            .map_err(|source| FetchError::Connect {
                address: address.to_string(),
                source,
            })?;

        let mut client = ReflectionClient::new(service);

        let services: Vec<String> = client
            .list_services()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with(REFLECTION_PACKAGE_PREFIX))
            .collect();

        tracing::debug!(%address, services = ?services, "fetching metadata through reflection");

        let mut files = client.files_containing_symbols(&services).await?;
        files.sort_by(|a, b| a.name().cmp(b.name()));

        Ok(files
            .into_iter()
            .map(|file| MetadataFragment::FileDescriptor(file.encode_to_vec()))
            .collect())
    }
}
