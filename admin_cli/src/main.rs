//! Operator CLI for tenant databases.
//!
//! Run from repo root: `cargo run -p sonicus-tenancy-admin -- <command>`
//! Settings come from `SONICUS_*` variables (a `.env` file is honored).

use axum::{middleware::from_fn_with_state, routing::get, Json, Router};
use clap::{Parser, Subcommand};
use sonicus_tenancy::{
    admin_routes, common_routes_with_ready, database_name_for, resolve_tenant, CurrentTenant,
    OrganizationDirectory, PgConnector, ResolutionError, TenancySettings, TenancyState, TenantContext, TenantIdentity,
};
use std::path::PathBuf;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sonicus-tenancy-admin")]
#[command(about = "Manage Sonicus tenant databases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, migrate and seed an organization's database.
    Provision {
        organization_id: Uuid,
        /// Re-run every step even if the organization is already provisioned.
        #[arg(short, long)]
        force: bool,
    },
    /// Show the provisioning flag and whether the database exists.
    Status { organization_id: Uuid },
    /// Round-trip check against a tenant (`master`, `org:<uuid>`, `user:<id>`). Exits 2 when unhealthy.
    Health { tenant: String },
    /// Dump a tenant database with pg_dump.
    Backup { tenant: String, path: PathBuf },
    /// Print the physical database name for a tenant key.
    DatabaseName { tenant: String },
    /// Serve the health, admin and tenant-echo routes.
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn echo_tenant(CurrentTenant(context): CurrentTenant) -> Json<TenantContext> {
    Json(context)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sonicus_tenancy=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = TenancySettings::from_env()?;

    if let Commands::DatabaseName { tenant } = &cli.command {
        let identity: TenantIdentity = tenant.parse()?;
        let connector = PgConnector::from_settings(&settings)?;
        println!("{}", database_name_for(&identity, sonicus_tenancy::Connector::master_database(&connector)));
        return Ok(());
    }

    let state = TenancyState::<PgConnector>::connect(&settings).await?;
    match cli.command {
        Commands::Provision { organization_id, force } => {
            let org = state
                .broker
                .directory()
                .find_by_id(organization_id)
                .await?
                .ok_or_else(|| ResolutionError::OrganizationNotFound(organization_id.to_string()))?;
            let outcome = state.provisioner().try_provision(&org, force).await?;
            // A forced run may have changed the schema under a live pool.
            if force {
                state.registry().invalidate(&org.identity()).await;
            }
            print_json(&outcome)?;
        }
        Commands::Status { organization_id } => {
            print_json(&state.provisioner().status(organization_id).await?)?;
        }
        Commands::Health { tenant } => {
            let identity: TenantIdentity = tenant.parse()?;
            let report = state.maintenance.health_check(&identity).await?;
            print_json(&report)?;
            if !report.status.is_available() {
                state.registry().invalidate_all().await;
                std::process::exit(2);
            }
        }
        Commands::Backup { tenant, path } => {
            let identity: TenantIdentity = tenant.parse()?;
            print_json(&state.maintenance.backup(&identity, &path).await?)?;
        }
        Commands::Serve { bind } => {
            let app = Router::new()
                .route("/tenant", get(echo_tenant))
                .route_layer(from_fn_with_state(state.clone(), resolve_tenant::<PgConnector>))
                .merge(common_routes_with_ready(state.clone()))
                .merge(admin_routes(state.clone()));
            let listener = TcpListener::bind(&bind).await?;
            tracing::info!("listening on http://{}", listener.local_addr()?);
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        Commands::DatabaseName { .. } => {}
    }
    state.registry().invalidate_all().await;
    Ok(())
}
