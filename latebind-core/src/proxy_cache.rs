//! # Proxy Cache
//!
//! A process-wide store of shared proxies keyed by the arguments they were constructed
//! from. Proxies are handed out as [`SharedProxy`] so every holder goes through the same
//! lifecycle, one operation at a time.
//!
//! Requests with `from_cache = false`, and proxies built from a caller-supplied binding
//! instance, bypass the store entirely: they are neither looked up nor inserted.
use crate::{
    binding::Connector,
    catalog::EndpointDescription,
    factory::{BindingSource, ConstructionArgs, ProxyCacheError, ProxyFactory},
    proxy::{Proxy, Strategy},
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

pub type SharedProxy<C> = Arc<tokio::sync::Mutex<Proxy<C>>>;

static GLOBAL: Lazy<Arc<ProxyCache>> = Lazy::new(|| Arc::new(ProxyCache::new()));

#[derive(Default)]
pub struct ProxyCache {
    proxies: RwLock<HashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for ProxyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCache")
            .field("len", &self.len())
            .finish()
    }
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<ProxyCache> {
        GLOBAL.clone()
    }

    /// Returns a proxy for `args`, shared with every caller asking for the same key unless
    /// `from_cache` is false.
    ///
    /// The arguments are validated before the store is consulted.
    pub fn get<C>(
        &self,
        factory: &ProxyFactory<C>,
        strategy: Strategy,
        args: &ConstructionArgs,
        from_cache: bool,
    ) -> Result<SharedProxy<C>, ProxyCacheError>
    where
        C: Connector,
        Proxy<C>: Send,
    {
        let endpoint = factory.endpoint(args)?;

        if !from_cache || matches!(args.binding, BindingSource::Instance(_)) {
            tracing::debug!(endpoint = %endpoint.identity(), "building an unshared proxy");
            let proxy = factory.build(strategy, endpoint)?;
            return Ok(Arc::new(tokio::sync::Mutex::new(proxy)));
        }

        let key = (TypeId::of::<C>(), cache_key::<C>(&endpoint, strategy));

        if let Some(found) = self.lookup::<C>(&key) {
            return Ok(found);
        }

        // Built without holding the store lock. When another caller stores the key first,
        // theirs is returned and this one is dropped.
        let built: SharedProxy<C> = Arc::new(tokio::sync::Mutex::new(
            factory.build(strategy, endpoint)?,
        ));

        let mut proxies = self.proxies.write();
        if let Some(found) = proxies.get(&key).and_then(|entry| downcast::<C>(entry)) {
            return Ok(found);
        }
        proxies.insert(key, built.clone());
        Ok(built)
    }

    /// Whether a shared proxy is stored for the endpoint `args` resolves to.
    pub fn contains<C>(
        &self,
        factory: &ProxyFactory<C>,
        strategy: Strategy,
        args: &ConstructionArgs,
    ) -> Result<bool, ProxyCacheError>
    where
        C: Connector,
    {
        let endpoint = factory.endpoint(args)?;
        let key = (TypeId::of::<C>(), cache_key::<C>(&endpoint, strategy));
        Ok(self.proxies.read().contains_key(&key))
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<C>(&self, key: &(TypeId, String)) -> Option<SharedProxy<C>>
    where
        C: Connector,
        Proxy<C>: Send,
    {
        self.proxies.read().get(key).and_then(|entry| downcast::<C>(entry))
    }
}

fn downcast<C>(entry: &Arc<dyn Any + Send + Sync>) -> Option<SharedProxy<C>>
where
    C: Connector,
    Proxy<C>: Send,
{
    entry.clone().downcast::<tokio::sync::Mutex<Proxy<C>>>().ok()
}

/// Lowercase composite of the contract, strategy, connector type and either the
/// configuration name or the binding type, plus the address.
fn cache_key<C>(endpoint: &EndpointDescription, strategy: Strategy) -> String {
    let key = endpoint.key();
    let binding = match &key.configuration_name {
        Some(name) => format!("config={name}"),
        None => format!("type={}", key.binding_type),
    };
    format!(
        "{}|{}|{}|{}|{}",
        key.contract.full_name(),
        strategy,
        std::any::type_name::<C>(),
        binding,
        key.address,
    )
    .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::{BindingDescriptor, TonicConnector},
        catalog::ContractDescription,
    };
    use prost_reflect::DescriptorPool;

    fn endpoint(address: &str) -> EndpointDescription {
        let pool = DescriptorPool::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
        let service = pool.get_service_by_name("echo.EchoService").unwrap();
        let contract = ContractDescription::from_service(&service);
        EndpointDescription::new(contract, BindingDescriptor::default(), address)
    }

    #[test]
    fn keys_are_lowercase_composites() {
        let key =
            cache_key::<TonicConnector>(&endpoint("HTTP://Echo:50051"), Strategy::per_call());
        assert!(key.starts_with("echo.echoservice|per-call/throwable|"));
        assert!(key.ends_with("|type=grpc|http://echo:50051"));
        assert_eq!(key, key.to_lowercase());
    }

    #[test]
    fn configuration_names_replace_the_binding_type() {
        let named = endpoint("http://echo:50051").with_configuration_name("Slow");
        let key = cache_key::<TonicConnector>(&named, Strategy::per_session());
        assert!(key.contains("|config=slow|"));
        assert!(!key.contains("type=grpc"));
    }
}
