//! Session broker: the one sanctioned way to get a database session for a tenant.

use crate::directory::OrganizationDirectory;
use crate::engine::{Connector, Engine, Session};
use crate::error::{ResolutionError, TenancyError};
use crate::identity::{Organization, Principal, TenantIdentity};
use crate::provisioner::Provisioner;
use crate::registry::ConnectionRegistry;
use crate::resolver::resolve_principal;
use futures::future::BoxFuture;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

/// Session type handed out for connector `C`.
pub type SessionOf<C> = <<C as Connector>::Engine as Engine>::Session;

/// A session bound to one tenant database.
///
/// Commit or roll back explicitly; dropping it without either rolls the work back and
/// returns the connection to the pool.
pub struct ScopedSession<S: Session> {
    identity: TenantIdentity,
    session: S,
    started: Instant,
}

impl<S: Session> ScopedSession<S> {
    pub fn identity(&self) -> &TenantIdentity {
        &self.identity
    }

    pub async fn commit(self) -> Result<(), TenancyError> {
        let ScopedSession { identity, session, started } = self;
        session.commit().await?;
        tracing::debug!(tenant = %identity, elapsed_ms = started.elapsed().as_millis() as u64, "session committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), TenancyError> {
        let ScopedSession { identity, session, started } = self;
        session.rollback().await?;
        tracing::debug!(tenant = %identity, elapsed_ms = started.elapsed().as_millis() as u64, "session rolled back");
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.session
    }
}

impl<S: Session> Deref for ScopedSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: Session> DerefMut for ScopedSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

pub struct SessionBroker<C: Connector> {
    registry: Arc<ConnectionRegistry<C>>,
    provisioner: Arc<Provisioner>,
    directory: Arc<dyn OrganizationDirectory>,
}

impl<C: Connector> Clone for SessionBroker<C> {
    fn clone(&self) -> Self {
        SessionBroker {
            registry: Arc::clone(&self.registry),
            provisioner: Arc::clone(&self.provisioner),
            directory: Arc::clone(&self.directory),
        }
    }
}

impl<C: Connector> SessionBroker<C> {
    pub fn new(
        registry: Arc<ConnectionRegistry<C>>,
        provisioner: Arc<Provisioner>,
        directory: Arc<dyn OrganizationDirectory>,
    ) -> Self {
        SessionBroker {
            registry,
            provisioner,
            directory,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C>> {
        &self.registry
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn directory(&self) -> &Arc<dyn OrganizationDirectory> {
        &self.directory
    }

    /// Engine for `identity`, provisioning the tenant database on first access. A cached
    /// engine is returned without touching the catalog.
    pub async fn engine_for(&self, identity: &TenantIdentity) -> Result<C::Engine, TenancyError> {
        if let Some(engine) = self.registry.get(identity) {
            return Ok(engine);
        }
        match identity {
            TenantIdentity::Master => {}
            TenantIdentity::Organization(id) => {
                let org = self
                    .directory
                    .find_by_id(*id)
                    .await?
                    .ok_or_else(|| ResolutionError::OrganizationNotFound(id.to_string()))?;
                if !org.database_created {
                    self.provision(org).await?;
                }
            }
            TenantIdentity::LegacyUser(user_id) => {
                let provisioner = Arc::clone(&self.provisioner);
                let user_id = *user_id;
                self.run_detached(identity, async move { provisioner.prepare_legacy_user(user_id).await.map(|_| ()) })
                    .await?;
            }
        }
        self.registry.get_or_create(identity).await
    }

    async fn provision(&self, org: Organization) -> Result<(), TenancyError> {
        let identity = org.identity();
        let provisioner = Arc::clone(&self.provisioner);
        tracing::info!(tenant = %identity, "organization database not ready, provisioning on demand");
        self.run_detached(&identity, async move { provisioner.try_provision(&org, false).await.map(|_| ()) })
            .await
    }

    /// Run provisioning work on its own task so a cancelled caller cannot abandon it midway.
    async fn run_detached<F>(&self, identity: &TenantIdentity, work: F) -> Result<(), TenancyError>
    where
        F: std::future::Future<Output = Result<(), TenancyError>> + Send + 'static,
    {
        match tokio::spawn(work).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ TenancyError::Resolution(_))) | Ok(Err(e @ TenancyError::Provisioning { .. })) => Err(e),
            Ok(Err(e)) => Err(TenancyError::provisioning(identity, e)),
            Err(join) => Err(TenancyError::provisioning(identity, join)),
        }
    }

    /// Open an independent session on the tenant's database.
    pub async fn acquire(&self, identity: &TenantIdentity) -> Result<ScopedSession<SessionOf<C>>, TenancyError> {
        let engine = self.engine_for(identity).await?;
        let session = engine.begin().await?;
        tracing::debug!(tenant = %identity, database = engine.database(), "session acquired");
        Ok(ScopedSession {
            identity: *identity,
            session,
            started: Instant::now(),
        })
    }

    /// Resolve the principal and open a session on its database.
    pub async fn acquire_for_user(&self, principal: &Principal) -> Result<ScopedSession<SessionOf<C>>, TenancyError> {
        let resolution = resolve_principal(principal);
        self.acquire(&resolution.identity).await
    }

    /// Run `work` in a session: commit on `Ok`, roll back on `Err`. A panic inside `work`
    /// drops the session, which also rolls back.
    pub async fn scoped<T, E, F>(&self, identity: &TenantIdentity, work: F) -> Result<T, E>
    where
        E: From<TenancyError>,
        F: for<'s> FnOnce(&'s mut SessionOf<C>) -> BoxFuture<'s, Result<T, E>>,
    {
        let mut session = self.acquire(identity).await?;
        match work(&mut *session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    tracing::warn!(tenant = %identity, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// [`acquire`](Self::acquire) for synchronous callers. Must not be called from a thread
    /// that is already driving the runtime behind `handle`.
    pub fn acquire_blocking(
        &self,
        handle: &tokio::runtime::Handle,
        identity: &TenantIdentity,
    ) -> Result<ScopedSession<SessionOf<C>>, TenancyError> {
        handle.block_on(self.acquire(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBackend, FakeConnector, MemoryDirectory};
    use crate::identity::{SubscriptionStatus, UserRole};
    use uuid::Uuid;

    struct Harness {
        connector: Arc<FakeConnector>,
        backend: Arc<FakeBackend>,
        directory: Arc<MemoryDirectory>,
        broker: SessionBroker<FakeConnector>,
    }

    fn harness() -> Harness {
        let connector = Arc::new(FakeConnector::new("sonicus"));
        let backend = Arc::new(FakeBackend::new());
        let directory = Arc::new(MemoryDirectory::new());
        let registry = Arc::new(ConnectionRegistry::new(connector.clone()));
        let provisioner = Arc::new(Provisioner::new(backend.clone(), directory.clone(), "sonicus"));
        let broker = SessionBroker::new(registry, provisioner, directory.clone());
        Harness {
            connector,
            backend,
            directory,
            broker,
        }
    }

    fn new_org(h: &Harness) -> Organization {
        let org = Organization {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            domain: Some("acme".into()),
            custom_domain: None,
            subscription_status: SubscriptionStatus::Trial,
            database_created: false,
            database_created_at: None,
        };
        h.directory.insert(org.clone());
        org
    }

    #[tokio::test]
    async fn first_access_provisions_then_routes() {
        let h = harness();
        let org = new_org(&h);
        let user = Principal::new(10, UserRole::BusinessAdmin).with_organization(org.id);

        let session = h.broker.acquire_for_user(&user).await.unwrap();
        assert_eq!(session.database(), crate::naming::organization_database_name(&org.id));
        session.commit().await.unwrap();
        assert!(h.directory.get(org.id).unwrap().database_created);

        let again = h.broker.acquire_for_user(&user).await.unwrap();
        drop(again);
        assert_eq!(h.backend.create_calls(), 1);
        assert_eq!(h.backend.schema_calls(), 1);
        assert_eq!(h.connector.connect_calls(), 1);
    }

    #[tokio::test]
    async fn super_admin_with_organization_gets_master() {
        let h = harness();
        let org = new_org(&h);
        let admin = Principal::new(1, UserRole::SuperAdmin).with_organization(org.id);
        let session = h.broker.acquire_for_user(&admin).await.unwrap();
        assert_eq!(session.database(), "sonicus");
        assert_eq!(h.backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn provisioning_failure_is_retryable_and_not_cached() {
        let h = harness();
        let org = new_org(&h);
        h.backend.fail_schema(true);
        let id = org.identity();
        let err = h.broker.acquire(&id).await.err().unwrap();
        assert!(err.is_retryable());
        assert!(!h.broker.registry().contains(&id));
        assert!(!h.directory.get(org.id).unwrap().database_created);

        h.backend.fail_schema(false);
        assert!(h.broker.acquire(&id).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_organization_is_not_found() {
        let h = harness();
        let err = h
            .broker
            .acquire(&TenantIdentity::Organization(Uuid::new_v4()))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TenancyError::Resolution(ResolutionError::OrganizationNotFound(_))
        ));
        assert_eq!(h.connector.connect_calls(), 0);
    }

    #[tokio::test]
    async fn scoped_commits_on_ok_and_rolls_back_on_err() {
        let h = harness();
        let id = TenantIdentity::Master;
        let value: Result<u32, TenancyError> = h.broker.scoped(&id, |_s| Box::pin(async { Ok::<u32, TenancyError>(7) })).await;
        assert_eq!(value.unwrap(), 7);

        let failed: Result<(), TenancyError> = h
            .broker
            .scoped(&id, |_s| Box::pin(async { Err::<(), TenancyError>(TenancyError::Backup("boom".into())) }))
            .await;
        assert!(failed.is_err());

        let engine = h.broker.registry().get(&id).unwrap();
        assert_eq!(engine.commits(), 1);
        assert_eq!(engine.rollbacks(), 1);
        assert_eq!(engine.checked_out(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_get_independent_sessions() {
        let h = harness();
        let id = TenantIdentity::LegacyUser(3);
        let a = h.broker.acquire(&id).await.unwrap();
        let b = h.broker.acquire(&id).await.unwrap();
        let engine = h.broker.registry().get(&id).unwrap();
        assert_eq!(engine.sessions_begun(), 2);
        assert_eq!(engine.checked_out(), 2);
        drop(a);
        b.rollback().await.unwrap();
        assert_eq!(engine.checked_out(), 0);
        assert_eq!(h.connector.connect_calls(), 1);
    }

    #[test]
    fn blocking_acquire_from_sync_code() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let h = harness();
        let session = h
            .broker
            .acquire_blocking(rt.handle(), &TenantIdentity::Master)
            .unwrap();
        assert_eq!(session.database(), "sonicus");
        rt.block_on(session.commit()).unwrap();
    }
}
