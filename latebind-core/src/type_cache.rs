//! # Client Type Cache
//!
//! Memoizes synthesized [`ClientType`]s. Synthesis can involve generating and compiling
//! source, so every (contract, strategy) pair is built at most once per process.
use crate::{
    catalog::{ContractDescription, ContractId},
    proxy::Strategy,
    synthesis::{ClientBuilder, ClientType, SynthesisError},
};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Identity of a contract plus a fingerprint of the schema backing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContractKey {
    pub id: ContractId,
    pub fingerprint: u64,
}

impl ContractKey {
    pub fn of(contract: &ContractDescription) -> Self {
        Self {
            id: contract.id().clone(),
            fingerprint: contract.schema_fingerprint(),
        }
    }
}

type TypeKey = (ContractKey, Strategy);

/// A client type being built, or already built, for one key.
type Slot = Arc<OnceCell<Arc<ClientType>>>;

static GLOBAL: Lazy<Arc<ClientTypeCache>> = Lazy::new(|| Arc::new(ClientTypeCache::new()));

/// Concurrent store of client types keyed by contract and strategy.
///
/// Entries never expire. The map lock is only held to find or create a key's slot, so a
/// slow build delays callers of that key alone.
#[derive(Debug, Default)]
pub struct ClientTypeCache {
    types: RwLock<HashMap<TypeKey, Slot>>,
}

impl ClientTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> Arc<ClientTypeCache> {
        GLOBAL.clone()
    }

    pub fn get(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
    ) -> Option<Arc<ClientType>> {
        self.types
            .read()
            .get(&(ContractKey::of(contract), strategy))
            .and_then(|slot| slot.get().cloned())
    }

    /// Returns the cached client type or builds it with `builder`.
    ///
    /// Concurrent misses for the same key wait for one another, so `builder` runs once.
    /// A failed build leaves the key empty and the next caller tries again.
    pub fn get_or_build(
        &self,
        contract: &ContractDescription,
        strategy: Strategy,
        builder: &dyn ClientBuilder,
    ) -> Result<Arc<ClientType>, SynthesisError> {
        let slot = self.slot((ContractKey::of(contract), strategy));

        slot.get_or_try_init(|| {
            tracing::debug!(contract = %contract.id(), ?strategy, "synthesizing client type");
            builder.build(contract, strategy).map(Arc::new)
        })
        .cloned()
    }

    fn slot(&self, key: TypeKey) -> Slot {
        if let Some(slot) = self.types.read().get(&key) {
            return slot.clone();
        }
        self.types.write().entry(key).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.types
            .read()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
