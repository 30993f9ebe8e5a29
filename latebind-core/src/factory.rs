//! # Proxy Factory
//!
//! Ties a resolved [`ContractCatalog`] to the rest of the engine: it validates construction
//! arguments, picks the endpoint and binding to use, obtains the client type from the
//! [`ClientTypeCache`] and hands out [`Proxy`] instances dialing through its [`Connector`].
use crate::{
    binding::{BindingDescriptor, BindingError, BindingRegistry, Connector},
    catalog::{ContractCatalog, EndpointDescription, ResolutionError},
    interception::{EventHub, InspectorConfig},
    proxy::{Proxy, Strategy},
    synthesis::{ClientBuilder, DynamicClientBuilder, SynthesisError},
    type_cache::ClientTypeCache,
};
use http::{
    Uri,
    uri::{Authority, InvalidUri},
};
use std::sync::Arc;

const MAX_PORT: i64 = u16::MAX as i64;

#[derive(Debug, thiserror::Error)]
pub enum ProxyCacheError {
    #[error("Invalid address '{address}': {reason}")]
    UriFormat { address: String, reason: String },
    #[error("Port {port} is out of range (0..=65535)")]
    PortOutOfRange { port: i64 },
    #[error("Invalid binding '{binding}': {reason}")]
    InvalidBinding { binding: String, reason: String },
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

/// Where the binding of a proxy comes from.
#[derive(Debug, Clone, Default)]
pub enum BindingSource {
    /// The binding the catalog resolved for the endpoint.
    #[default]
    Default,
    /// A named configuration of the binding registry.
    Named(String),
    /// A binding type of the binding registry, with its preset settings.
    Typed(String),
    /// A binding built by the caller. Proxies built from one are never shared.
    Instance(BindingDescriptor),
}

/// Arguments a proxy is constructed from.
#[derive(Debug, Clone)]
pub struct ConstructionArgs {
    pub contract: String,
    pub namespace: Option<String>,
    /// Overrides the address of the catalog endpoint.
    pub address: Option<String>,
    /// Overrides the port of the address.
    pub port: Option<i64>,
    pub binding: BindingSource,
}

impl ConstructionArgs {
    pub fn new(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            namespace: None,
            address: None,
            port: None,
            binding: BindingSource::Default,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: i64) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_binding(mut self, binding: BindingSource) -> Self {
        self.binding = binding;
        self
    }
}

/// Builds proxies for the contracts of a catalog.
pub struct ProxyFactory<C> {
    catalog: Arc<ContractCatalog>,
    bindings: Arc<BindingRegistry>,
    connector: Arc<C>,
    builder: Arc<dyn ClientBuilder>,
    types: Arc<ClientTypeCache>,
    events: Arc<EventHub>,
    inspector_config: InspectorConfig,
}

impl<C> std::fmt::Debug for ProxyFactory<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyFactory")
            .field("contracts", &self.catalog.contracts().len())
            .field("connector", &std::any::type_name::<C>())
            .field("inspector_config", &self.inspector_config)
            .finish()
    }
}

impl<C: Connector> ProxyFactory<C> {
    /// A factory dispatching dynamically over the catalog's descriptors, sharing the
    /// process-wide client type cache.
    pub fn new(catalog: Arc<ContractCatalog>, connector: C) -> Self {
        Self {
            catalog,
            bindings: Arc::new(BindingRegistry::new()),
            connector: Arc::new(connector),
            builder: Arc::new(DynamicClientBuilder),
            types: ClientTypeCache::global(),
            events: Arc::new(EventHub::new()),
            inspector_config: InspectorConfig::default(),
        }
    }

    pub fn with_bindings(mut self, bindings: Arc<BindingRegistry>) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_builder(mut self, builder: impl ClientBuilder + 'static) -> Self {
        self.builder = Arc::new(builder);
        self
    }

    pub fn with_type_cache(mut self, types: Arc<ClientTypeCache>) -> Self {
        self.types = types;
        self
    }

    pub fn with_events(mut self, events: Arc<EventHub>) -> Self {
        self.events = events;
        self
    }

    pub fn with_inspector_config(mut self, config: InspectorConfig) -> Self {
        self.inspector_config = config;
        self
    }

    pub fn catalog(&self) -> &Arc<ContractCatalog> {
        &self.catalog
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Validates `args` and resolves the endpoint a proxy built from them talks to.
    ///
    /// The address and port are checked before the catalog is consulted.
    pub fn endpoint(
        &self,
        args: &ConstructionArgs,
    ) -> Result<EndpointDescription, ProxyCacheError> {
        if let Some(port) = args.port
            && !(0..=MAX_PORT).contains(&port)
        {
            return Err(ProxyCacheError::PortOutOfRange { port });
        }
        if let Some(address) = &args.address {
            parse_absolute(address)?;
        }

        let found = self
            .catalog
            .find_endpoint(&args.contract, args.namespace.as_deref())
            .inspect_err(|err| tracing::error!(error = %err, "no endpoint for proxy"))?;

        let address = args.address.as_deref().unwrap_or(found.address());
        let address = match args.port {
            Some(port) => with_port(address, port)?,
            None => {
                parse_absolute(address)?;
                address.to_string()
            }
        };

        let (binding, configuration_name) = match &args.binding {
            BindingSource::Default => (found.binding().clone(), None),
            BindingSource::Named(name) => (self.bindings.resolve_named(name)?, Some(name.clone())),
            BindingSource::Typed(type_name) => {
                if !self.bindings.is_type(type_name) {
                    return Err(ProxyCacheError::InvalidBinding {
                        binding: type_name.clone(),
                        reason: "not a registered binding type".to_string(),
                    });
                }
                (self.bindings.resolve_type(type_name)?, None)
            }
            BindingSource::Instance(binding) => (binding.clone(), None),
        };

        if !self.connector.supports(&binding) {
            return Err(ProxyCacheError::InvalidBinding {
                binding: binding.type_name,
                reason: format!(
                    "not supported by connector {}",
                    std::any::type_name::<C>()
                ),
            });
        }

        let endpoint =
            EndpointDescription::new(found.contract().clone(), binding.normalized(), address);
        Ok(match configuration_name {
            Some(name) => endpoint.with_configuration_name(name),
            None => endpoint,
        })
    }

    /// Builds an unopened proxy for an already validated endpoint.
    pub fn build(
        &self,
        strategy: Strategy,
        endpoint: EndpointDescription,
    ) -> Result<Proxy<C>, ProxyCacheError> {
        let client_type = self
            .types
            .get_or_build(endpoint.contract(), strategy, self.builder.as_ref())?;

        tracing::debug!(endpoint = %endpoint.identity(), %strategy, "proxy created");
        Ok(Proxy::new(
            endpoint,
            client_type,
            self.connector.clone(),
            self.events.clone(),
            self.inspector_config.clone(),
        ))
    }

    /// Builds an unopened proxy that is not shared with anyone.
    pub fn create(
        &self,
        strategy: Strategy,
        args: &ConstructionArgs,
    ) -> Result<Proxy<C>, ProxyCacheError> {
        let endpoint = self.endpoint(args)?;
        self.build(strategy, endpoint)
    }
}

fn parse_absolute(address: &str) -> Result<Uri, ProxyCacheError> {
    let uri: Uri = address
        .parse()
        .map_err(|err: InvalidUri| ProxyCacheError::UriFormat {
            address: address.to_string(),
            reason: err.to_string(),
        })?;

    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ProxyCacheError::UriFormat {
            address: address.to_string(),
            reason: "expected an absolute URI with a scheme and an authority".to_string(),
        });
    }
    Ok(uri)
}

fn with_port(address: &str, port: i64) -> Result<String, ProxyCacheError> {
    let uri = parse_absolute(address)?;
    let invalid = |reason: String| ProxyCacheError::UriFormat {
        address: address.to_string(),
        reason,
    };

    let mut parts = uri.into_parts();
    let host = parts
        .authority
        .as_ref()
        .map(|authority| authority.host().to_string())
        .unwrap_or_default();
    let authority: Authority = format!("{host}:{port}")
        .parse()
        .map_err(|err: InvalidUri| invalid(err.to_string()))?;
    parts.authority = Some(authority);

    Uri::from_parts(parts)
        .map(|uri| uri.to_string())
        .map_err(|err| invalid(err.to_string()))
}
