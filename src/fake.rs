//! In-memory connector, directory and provisioning backend.
//!
//! Used by the unit and integration tests, and by embedders that want to exercise routing
//! without a PostgreSQL server. Every fake counts the calls made against it.

use crate::directory::OrganizationDirectory;
use crate::engine::{next_engine_instance, Connector, Engine, PoolStats, Session};
use crate::error::TenancyError;
use crate::identity::{Organization, TenantIdentity};
use crate::provisioner::ProvisioningBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

const FAKE_POOL_SIZE: u32 = 5;

pub struct FakeConnector {
    master_database: String,
    pool_size: u32,
    connect_calls: AtomicUsize,
    fail_next: AtomicUsize,
    connect_delay_ms: AtomicU64,
    databases: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(master_database: &str) -> Self {
        FakeConnector {
            master_database: master_database.to_string(),
            pool_size: FAKE_POOL_SIZE,
            connect_calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            connect_delay_ms: AtomicU64::new(0),
            databases: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Number of engine constructions attempted, failed ones included.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` constructions fail with a connection error.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Stretch each construction so concurrent callers overlap.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connected_databases(&self) -> Vec<String> {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Engine = FakeEngine;

    fn master_database(&self) -> &str {
        &self.master_database
    }

    async fn connect(&self, identity: &TenantIdentity, database: &str) -> Result<FakeEngine, TenancyError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TenancyError::connection(identity, "connection refused"));
        }
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(database.to_string());
        Ok(FakeEngine::new(database, self.pool_size))
    }
}

#[derive(Debug)]
struct EngineState {
    database: String,
    instance: u64,
    pool_size: u32,
    disposed: AtomicBool,
    checked_out: AtomicU32,
    sessions_begun: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    fail_pings: AtomicBool,
    ping_delay_ms: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct FakeEngine {
    state: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new(database: &str, pool_size: u32) -> Self {
        FakeEngine {
            state: Arc::new(EngineState {
                database: database.to_string(),
                instance: next_engine_instance(),
                pool_size,
                disposed: AtomicBool::new(false),
                checked_out: AtomicU32::new(0),
                sessions_begun: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
                fail_pings: AtomicBool::new(false),
                ping_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Sessions currently open against this engine.
    pub fn checked_out(&self) -> u32 {
        self.state.checked_out.load(Ordering::SeqCst)
    }

    pub fn sessions_begun(&self) -> u64 {
        self.state.sessions_begun.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Explicit rollbacks plus sessions dropped without an outcome.
    pub fn rollbacks(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.state
            .ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Engine for FakeEngine {
    type Session = FakeSession;

    fn database(&self) -> &str {
        &self.state.database
    }

    fn instance_id(&self) -> u64 {
        self.state.instance
    }

    async fn begin(&self) -> Result<FakeSession, TenancyError> {
        if self.is_disposed() {
            return Err(TenancyError::connection(&self.state.database, "pool closed"));
        }
        self.state.sessions_begun.fetch_add(1, Ordering::SeqCst);
        self.state.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            state: Arc::clone(&self.state),
            finished: false,
        })
    }

    async fn ping(&self) -> Result<(), TenancyError> {
        let delay = self.state.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.is_disposed() || self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(TenancyError::connection(&self.state.database, "ping failed"));
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let checked_out = self.checked_out();
        PoolStats {
            pool_size: self.state.pool_size,
            checked_out,
            idle: self.state.pool_size.saturating_sub(checked_out),
            overflow: checked_out.saturating_sub(self.state.pool_size),
        }
    }

    async fn dispose(&self) {
        self.state.disposed.store(true, Ordering::SeqCst);
    }
}

/// Holds one checked-out slot until committed, rolled back or dropped.
pub struct FakeSession {
    state: Arc<EngineState>,
    finished: bool,
}

impl FakeSession {
    pub fn database(&self) -> &str {
        &self.state.database
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn commit(mut self) -> Result<(), TenancyError> {
        self.finished = true;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), TenancyError> {
        self.finished = true;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if !self.finished {
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.state.checked_out.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Organization catalog held in memory.
#[derive(Default)]
pub struct MemoryDirectory {
    organizations: Mutex<HashMap<Uuid, Organization>>,
    lookups: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, organization: Organization) {
        self.organizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(organization.id, organization);
    }

    pub fn get(&self, id: Uuid) -> Option<Organization> {
        self.organizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of `find_*` calls served.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn find(&self, matches: impl Fn(&Organization) -> bool) -> Option<Organization> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.organizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|o| matches(o))
            .cloned()
    }
}

fn same_host(stored: &Option<String>, wanted: &str) -> bool {
    stored
        .as_deref()
        .map(|s| s.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

#[async_trait]
impl OrganizationDirectory for MemoryDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Organization>, TenancyError> {
        Ok(self.find(|o| o.id == id))
    }

    async fn find_by_custom_domain(&self, host: &str) -> Result<Option<Organization>, TenancyError> {
        Ok(self.find(|o| same_host(&o.custom_domain, host)))
    }

    async fn find_by_subdomain(&self, label: &str) -> Result<Option<Organization>, TenancyError> {
        Ok(self.find(|o| same_host(&o.domain, label)))
    }

    async fn mark_database_created(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, TenancyError> {
        let mut orgs = self.organizations.lock().unwrap_or_else(PoisonError::into_inner);
        match orgs.get_mut(&id) {
            Some(org) if !org.database_created => {
                org.database_created = true;
                org.database_created_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
struct BackendState {
    databases: HashSet<String>,
    seeded: HashSet<String>,
}

/// Provisioning backend that tracks databases in a set. Seeds insert one row the first time
/// a database is seeded and nothing afterwards.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
    exists_calls: AtomicUsize,
    create_calls: AtomicUsize,
    schema_calls: AtomicUsize,
    seed_calls: AtomicUsize,
    fail_schema: AtomicBool,
    concurrent_creator: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .databases
            .contains(database)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    pub fn seed_calls(&self) -> usize {
        self.seed_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
            + self.create_calls()
            + self.schema_calls()
            + self.seed_calls()
    }

    pub fn fail_schema(&self, fail: bool) {
        self.fail_schema.store(fail, Ordering::SeqCst);
    }

    /// Make CREATE DATABASE behave as if another process created the database first.
    pub fn simulate_concurrent_creator(&self, enabled: bool) {
        self.concurrent_creator.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProvisioningBackend for FakeBackend {
    async fn database_exists(&self, database: &str) -> Result<bool, TenancyError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.has_database(database))
    }

    async fn create_database(&self, database: &str) -> Result<bool, TenancyError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let inserted = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .databases
            .insert(database.to_string());
        Ok(inserted && !self.concurrent_creator.load(Ordering::SeqCst))
    }

    async fn apply_schema(&self, database: &str) -> Result<usize, TenancyError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_schema.load(Ordering::SeqCst) {
            return Err(TenancyError::connection(database, "relation already locked"));
        }
        if !self.has_database(database) {
            return Err(TenancyError::connection(database, "database does not exist"));
        }
        Ok(5)
    }

    async fn seed_defaults(&self, database: &str) -> Result<u64, TenancyError> {
        self.seed_calls.fetch_add(1, Ordering::SeqCst);
        let first = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seeded
            .insert(database.to_string());
        Ok(u64::from(first))
    }
}
