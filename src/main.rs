//! Main entry point for the Creator Toolkit Gateway

use std::sync::Arc;
use std::time::Duration;
use toolkit_gateway::{
    api,
    config::Settings,
    credits::{CreditLedger, CreditPricing, InMemoryLedger, RpcCreditLedger},
    persistence::{InMemoryJobRepository, JobRepository, RestJobRepository},
    pipeline::JobPipeline,
    storage::{AssetRelocator, LocalObjectStore, ObjectStore, SupabaseObjectStore, TempSweeper},
    vendor::VendorRegistry,
    AppState,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Load configuration
    let settings = Settings::load()?;
    settings.validate()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if settings.logging.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }

    info!(
        "Starting Creator Toolkit Gateway: server={}:{}",
        settings.server.host, settings.server.port
    );

    let vendors = Arc::new(VendorRegistry::from_config(&settings.vendors)?);

    let (ledger, repository): (Arc<dyn CreditLedger>, Arc<dyn JobRepository>) =
        if settings.supabase.is_configured() {
            info!(url = %settings.supabase.url, "Using Supabase for credits and job history");
            (
                Arc::new(RpcCreditLedger::new(&settings.supabase)?),
                Arc::new(RestJobRepository::new(&settings.supabase)?),
            )
        } else {
            warn!("Supabase not configured; credits and job history are kept in memory");
            (
                Arc::new(InMemoryLedger::new(settings.credits.monthly_allowance)),
                Arc::new(InMemoryJobRepository::new()),
            )
        };

    let store: Arc<dyn ObjectStore> = match settings.storage.backend.as_str() {
        "supabase" => Arc::new(SupabaseObjectStore::new(&settings.supabase)?),
        _ => Arc::new(LocalObjectStore::new(
            &settings.storage.base_path,
            &settings.storage.url_prefix,
        )),
    };
    info!(
        backend = %settings.storage.backend,
        bucket = %settings.storage.bucket,
        "Object storage ready"
    );

    let relocator = Arc::new(AssetRelocator::new(
        store.clone(),
        &settings.storage.bucket,
        Duration::from_millis(settings.storage.fetch_timeout_ms),
    )?);

    // Expired temporary uploads are removed in the background
    let sweeper = TempSweeper::new(
        store,
        &settings.storage.temp_bucket,
        Duration::from_secs(settings.storage.temp_max_age_secs),
    );
    sweeper
        .start(Duration::from_secs(settings.storage.sweep_interval_secs))
        .await;

    let pipeline = Arc::new(JobPipeline::new(
        vendors,
        ledger,
        repository,
        relocator,
        CreditPricing::from_config(&settings.credits)?,
        settings.polling.clone(),
    ));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    // Create application state
    let app_state = Arc::new(AppState {
        settings: Arc::new(settings),
        pipeline,
    });

    // Build the router
    let app = api::routes::create_router(app_state);

    info!("Server listening on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    sweeper.stop().await;
    Ok(())
}
