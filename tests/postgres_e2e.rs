//! Runs against a real server when `SONICUS_TEST_DATABASE_URL` points at a database the test
//! user may create databases from. Skipped otherwise.

use sonicus_tenancy::naming::organization_database_name;
use sonicus_tenancy::{
    Organization, OrganizationDirectory, PgConnector, PgOrganizationDirectory, Principal, SubscriptionStatus, TenancySettings,
    TenancyState, UserRole,
};
use uuid::Uuid;

fn test_url() -> Option<String> {
    match std::env::var("SONICUS_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("SONICUS_TEST_DATABASE_URL not set, skipping live PostgreSQL test");
            None
        }
    }
}

fn organization(name: &str) -> Organization {
    let id = Uuid::new_v4();
    Organization {
        id,
        name: name.to_string(),
        domain: Some(format!("{}-{}", name, &id.simple().to_string()[..8])),
        custom_domain: None,
        subscription_status: SubscriptionStatus::Trial,
        database_created: false,
        database_created_at: None,
    }
}

#[tokio::test]
async fn provisioned_organizations_are_isolated() {
    let Some(url) = test_url() else { return };
    let state = TenancyState::<PgConnector>::connect(&TenancySettings::new(url.clone())).await.unwrap();
    let catalog = PgOrganizationDirectory::new(sqlx::PgPool::connect(&url).await.unwrap());

    let a = organization("alpha");
    let b = organization("beta");
    catalog.insert(&a).await.unwrap();
    catalog.insert(&b).await.unwrap();

    assert!(state.provisioner().provision(&a, false).await);
    let stored = catalog.find_by_id(a.id).await.unwrap().unwrap();
    assert!(stored.database_created);

    let alice = Principal::new(1, UserRole::BusinessAdmin).with_organization(a.id);
    let mut session = state.broker.acquire_for_user(&alice).await.unwrap();
    let (db,): (String,) = sqlx::query_as("SELECT current_database()")
        .fetch_one(&mut **session)
        .await
        .unwrap();
    assert_eq!(db, organization_database_name(&a.id));
    sqlx::query("INSERT INTO content (slug, title) VALUES ('alpha-only', 'Alpha')")
        .execute(&mut **session)
        .await
        .unwrap();
    session.commit().await.unwrap();

    // Beta is provisioned on demand by its first request.
    let bob = Principal::new(2, UserRole::Staff).with_organization(b.id);
    let mut session = state.broker.acquire_for_user(&bob).await.unwrap();
    let (leaked,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM content WHERE slug = 'alpha-only'")
        .fetch_one(&mut **session)
        .await
        .unwrap();
    assert_eq!(leaked, 0);
    let (welcome,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM content WHERE slug = 'welcome'")
        .fetch_one(&mut **session)
        .await
        .unwrap();
    assert_eq!(welcome, 1);
    session.rollback().await.unwrap();
    assert!(catalog.find_by_id(b.id).await.unwrap().unwrap().database_created);

    // Forced re-provisioning is idempotent: still exactly one seed row.
    let refreshed = catalog.find_by_id(b.id).await.unwrap().unwrap();
    state.provisioner().try_provision(&refreshed, true).await.unwrap();
    let mut session = state.broker.acquire(&refreshed.identity()).await.unwrap();
    let (welcome,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM content WHERE slug = 'welcome'")
        .fetch_one(&mut **session)
        .await
        .unwrap();
    assert_eq!(welcome, 1);
    session.commit().await.unwrap();

    state.registry().invalidate_all().await;
}
