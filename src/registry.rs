//! Connection registry: one engine per tenant identity per process, built single-flight.

use crate::engine::{Connector, Engine, PoolStats};
use crate::error::TenancyError;
use crate::identity::TenantIdentity;
use crate::locks::KeyedLocks;
use crate::naming::database_name_for;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

pub struct ConnectionRegistry<C: Connector> {
    connector: Arc<C>,
    engines: RwLock<HashMap<TenantIdentity, C::Engine>>,
    /// Serializes construction and invalidation of the same key.
    locks: KeyedLocks<TenantIdentity>,
    created: AtomicU64,
    disposed: AtomicU64,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: Arc<C>) -> Self {
        ConnectionRegistry {
            connector,
            engines: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            created: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn database_name(&self, identity: &TenantIdentity) -> String {
        database_name_for(identity, self.connector.master_database())
    }

    /// Cached engine, if any. Never connects.
    pub fn get(&self, identity: &TenantIdentity) -> Option<C::Engine> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    pub fn contains(&self, identity: &TenantIdentity) -> bool {
        self.get(identity).is_some()
    }

    /// Cached engine for `identity`, building it on first use. Concurrent first callers wait
    /// for a single construction; a failed construction is not cached.
    pub async fn get_or_create(&self, identity: &TenantIdentity) -> Result<C::Engine, TenancyError> {
        if let Some(engine) = self.get(identity) {
            tracing::debug!(tenant = %identity, "engine cache hit");
            return Ok(engine);
        }
        let _guard = self.locks.acquire(identity).await;
        if let Some(engine) = self.get(identity) {
            return Ok(engine);
        }
        let database = self.database_name(identity);
        let started = Instant::now();
        let engine = match self.connector.connect(identity, &database).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::warn!(tenant = %identity, database = %database, error = %e, "engine construction failed");
                return Err(e);
            }
        };
        if let Err(e) = self.insert(identity, engine.clone()) {
            engine.dispose().await;
            return Err(e);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            tenant = %identity,
            database = %database,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine created"
        );
        Ok(engine)
    }

    fn insert(&self, identity: &TenantIdentity, engine: C::Engine) -> Result<(), TenancyError> {
        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = engines.get(identity) {
            if existing.instance_id() != engine.instance_id() {
                tracing::error!(
                    tenant = %identity,
                    existing = existing.instance_id(),
                    duplicate = engine.instance_id(),
                    "CACHE INVARIANT VIOLATION: second engine built for one tenant"
                );
                return Err(TenancyError::CacheInvariantViolation {
                    tenant: identity.key(),
                });
            }
        }
        engines.insert(*identity, engine);
        Ok(())
    }

    /// Remove and dispose the engine for `identity`. Returns false when nothing was cached.
    pub async fn invalidate(&self, identity: &TenantIdentity) -> bool {
        let removed = {
            let _guard = self.locks.acquire(identity).await;
            self.engines
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(identity)
        };
        match removed {
            Some(engine) => {
                engine.dispose().await;
                self.disposed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(tenant = %identity, database = engine.database(), "engine disposed");
                true
            }
            None => false,
        }
    }

    /// Dispose every cached engine, including ones still under construction. Returns how
    /// many were disposed.
    pub async fn invalidate_all(&self) -> usize {
        let mut keys = self.cached_identities();
        for key in self.locks.active_keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let disposed = futures::future::join_all(keys.iter().map(|identity| self.invalidate(identity))).await;
        let count = disposed.into_iter().filter(|removed| *removed).count();
        tracing::info!(count, "all engines disposed");
        count
    }

    /// Pool statistics per cached identity key.
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(identity, engine)| (identity.key(), engine.stats()))
            .collect()
    }

    pub fn cached_identities(&self) -> Vec<TenantIdentity> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.engines.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn engines_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn engines_disposed(&self) -> u64 {
        self.disposed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeConnector;
    use std::time::Duration;
    use uuid::Uuid;

    fn registry() -> (Arc<FakeConnector>, ConnectionRegistry<FakeConnector>) {
        let connector = Arc::new(FakeConnector::new("sonicus"));
        (connector.clone(), ConnectionRegistry::new(connector))
    }

    #[tokio::test]
    async fn cache_hit_returns_same_engine() {
        let (connector, registry) = registry();
        let id = TenantIdentity::Organization(Uuid::new_v4());
        let a = registry.get_or_create(&id).await.unwrap();
        let b = registry.get_or_create(&id).await.unwrap();
        assert_eq!(a.instance_id(), b.instance_id());
        assert_eq!(connector.connect_calls(), 1);
        assert_eq!(registry.engines_created(), 1);
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let (connector, registry) = registry();
        let id = TenantIdentity::LegacyUser(9);
        connector.fail_next_connects(1);
        let err = registry.get_or_create(&id).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!registry.contains(&id));
        registry.get_or_create(&id).await.unwrap();
        assert_eq!(connector.connect_calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_missing_key_is_noop() {
        let (_, registry) = registry();
        assert!(!registry.invalidate(&TenantIdentity::Master).await);
        assert_eq!(registry.engines_disposed(), 0);
    }

    #[tokio::test]
    async fn invalidate_disposes_and_next_call_rebuilds() {
        let (connector, registry) = registry();
        let id = TenantIdentity::Master;
        let first = registry.get_or_create(&id).await.unwrap();
        assert!(registry.invalidate(&id).await);
        assert!(first.is_disposed());
        let second = registry.get_or_create(&id).await.unwrap();
        assert_ne!(first.instance_id(), second.instance_id());
        assert!(!second.is_disposed());
        assert_eq!(connector.connect_calls(), 2);
    }

    #[tokio::test]
    async fn engines_connect_to_named_databases() {
        let (connector, registry) = registry();
        let org = Uuid::new_v4();
        registry.get_or_create(&TenantIdentity::Master).await.unwrap();
        registry.get_or_create(&TenantIdentity::Organization(org)).await.unwrap();
        registry.get_or_create(&TenantIdentity::LegacyUser(3)).await.unwrap();
        let dbs = connector.connected_databases();
        assert!(dbs.contains(&"sonicus".to_string()));
        assert!(dbs.contains(&crate::naming::organization_database_name(&org)));
        assert!(dbs.contains(&"sonicus_user_3".to_string()));
    }

    #[tokio::test]
    async fn invalidate_all_empties_cache() {
        let (_, registry) = registry();
        for i in 0..4 {
            registry.get_or_create(&TenantIdentity::LegacyUser(i)).await.unwrap();
        }
        assert_eq!(registry.stats().len(), 4);
        assert_eq!(registry.invalidate_all().await, 4);
        assert!(registry.is_empty());
        assert_eq!(registry.engines_disposed(), 4);
    }

    #[tokio::test]
    async fn invalidate_all_waits_for_engines_under_construction() {
        let (connector, registry) = registry();
        let registry = Arc::new(registry);
        connector.set_connect_delay(Duration::from_millis(60));
        let id = TenantIdentity::LegacyUser(11);
        let building = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert_eq!(registry.invalidate_all().await, 1);
        let engine = building.await.unwrap().unwrap();
        assert!(engine.is_disposed());
        assert!(registry.is_empty());
        assert_eq!(registry.engines_disposed(), 1);
    }
}
