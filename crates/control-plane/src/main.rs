// Waitlist API server
//
// Storage: Postgres when DATABASE_URL is set, in-memory otherwise (dev mode).

use std::sync::Arc;

use anyhow::{Context, Result};
use waitlist_control_plane::app::build_app;
use waitlist_control_plane::config::AppConfig;
use waitlist_control_plane::scheduler::spawn_reconcile_loop;
use waitlist_control_plane::services::PositionService;
use waitlist_control_plane::storage::StorageBackend;
use waitlist_control_plane::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment variables take precedence
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "waitlist-control-plane")
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG: Log filter
    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.service_version = Some(env!("CARGO_PKG_VERSION").to_string());

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    tracing::info!("waitlist-control-plane starting...");

    let config = AppConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        free_tier_threshold = config.free_tier_threshold,
        max_attempts = config.allocation_retry.max_attempts,
        reconcile_batch_size = config.reconcile_batch_size,
        "Configuration loaded"
    );

    let backend = StorageBackend::from_config(&config)
        .await
        .context("Failed to initialize storage")?;
    tracing::info!(storage = backend.name(), "Storage initialized");

    let service = Arc::new(PositionService::new(backend.store(), &config));

    let _reconcile_loop = config
        .reconcile_interval
        .map(|interval| spawn_reconcile_loop(service.clone(), interval));

    let app = build_app(service, backend.name(), &config);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;
    tracing::info!("HTTP server listening on {}", config.listen_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
