//! Shared tenancy state handed to routes and middleware. Built once at startup.

use crate::broker::SessionBroker;
use crate::config::TenancySettings;
use crate::directory::{ensure_catalog_tables, OrganizationDirectory, PgOrganizationDirectory};
use crate::engine::{Connector, PgConnector};
use crate::error::TenancyError;
use crate::identity::TenantIdentity;
use crate::maintenance::{BackupSettings, Maintenance};
use crate::provisioner::{PgProvisioningBackend, Provisioner};
use crate::registry::ConnectionRegistry;
use crate::resolver::HostResolver;
use std::sync::Arc;

pub struct TenancyState<C: Connector = PgConnector> {
    pub broker: SessionBroker<C>,
    pub maintenance: Arc<Maintenance<C>>,
    pub resolver: HostResolver,
}

impl<C: Connector> Clone for TenancyState<C> {
    fn clone(&self) -> Self {
        TenancyState {
            broker: self.broker.clone(),
            maintenance: Arc::clone(&self.maintenance),
            resolver: self.resolver.clone(),
        }
    }
}

impl<C: Connector> TenancyState<C> {
    /// Wire the components around an existing connector, directory and provisioner.
    pub fn assemble(
        connector: Arc<C>,
        directory: Arc<dyn OrganizationDirectory>,
        provisioner: Arc<Provisioner>,
        settings: &TenancySettings,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(connector));
        let broker = SessionBroker::new(registry, provisioner, Arc::clone(&directory));
        let maintenance = Arc::new(Maintenance::new(
            broker.clone(),
            settings.health.clone(),
            BackupSettings::from_settings(settings),
        ));
        TenancyState {
            broker,
            maintenance,
            resolver: HostResolver::new(directory, settings.host.clone()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry<C>> {
        self.broker.registry()
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        self.broker.provisioner()
    }
}

impl TenancyState<PgConnector> {
    /// Connect to the master catalog, make sure its tables exist and wire everything for
    /// PostgreSQL.
    pub async fn connect(settings: &TenancySettings) -> Result<Self, TenancyError> {
        let connector = Arc::new(PgConnector::from_settings(settings)?);
        // Catalog pool stays outside the registry; invalidating master must not close it.
        let master = connector
            .connect(&TenantIdentity::Master, connector.master_database())
            .await?;
        ensure_catalog_tables(master.pool()).await?;
        let directory: Arc<dyn OrganizationDirectory> =
            Arc::new(PgOrganizationDirectory::new(master.pool().clone()));

        let schema = settings.tenant_schema().await?;
        let backend = PgProvisioningBackend::new((*connector).clone(), schema);
        let provisioner = Arc::new(Provisioner::new(
            Arc::new(backend),
            Arc::clone(&directory),
            connector.master_database(),
        ));
        tracing::info!(master = connector.master_database(), "tenancy state ready");
        Ok(Self::assemble(connector, directory, provisioner, settings))
    }
}
