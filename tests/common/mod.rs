#![allow(dead_code)]

use sonicus_tenancy::fake::{FakeBackend, FakeConnector, MemoryDirectory};
use sonicus_tenancy::{Organization, Provisioner, SubscriptionStatus, TenancySettings, TenancyState};
use std::sync::Arc;
use uuid::Uuid;

pub const MASTER_DB: &str = "sonicus";

pub struct TestTenancy {
    pub connector: Arc<FakeConnector>,
    pub backend: Arc<FakeBackend>,
    pub directory: Arc<MemoryDirectory>,
    pub state: TenancyState<FakeConnector>,
}

pub fn setup() -> TestTenancy {
    let connector = Arc::new(FakeConnector::new(MASTER_DB));
    let backend = Arc::new(FakeBackend::new());
    let directory = Arc::new(MemoryDirectory::new());
    let provisioner = Arc::new(Provisioner::new(backend.clone(), directory.clone(), MASTER_DB));
    let settings = TenancySettings::new("postgres://localhost/sonicus");
    let state = TenancyState::assemble(connector.clone(), directory.clone(), provisioner, &settings);
    TestTenancy {
        connector,
        backend,
        directory,
        state,
    }
}

impl TestTenancy {
    /// Register an organization the way sign-up does: catalog row only, no database yet.
    pub fn register(&self, domain: &str, status: SubscriptionStatus) -> Organization {
        let org = Organization {
            id: Uuid::new_v4(),
            name: domain.to_uppercase(),
            domain: Some(domain.to_string()),
            custom_domain: None,
            subscription_status: status,
            database_created: false,
            database_created_at: None,
        };
        self.directory.insert(org.clone());
        org
    }
}
