// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc};

use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::autoprocess::registry::RuleRegistry;
use crate::application::catalog::Catalog;
use crate::application::dispatcher::Dispatcher;
use crate::application::outbox::TriggerOutbox;
use crate::application::record_store::RecordStore;
use crate::application::timeseries_service::TimeseriesStore;
use crate::infrastructure::config::{load_app_config, load_pipeline_config, StorageBackend};
use crate::infrastructure::influx_store::InfluxRecordStore;
use crate::infrastructure::memory_store::MemoryRecordStore;
use crate::presentation::app_state::AppState;
use crate::presentation::router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let app_config = load_app_config()?;
    let pipeline = load_pipeline_config()?;

    // Create record store (infrastructure layer)
    let records: Arc<dyn RecordStore> = match app_config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryRecordStore::new()),
        StorageBackend::Influx => {
            let influx = app_config
                .storage
                .influx
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.backend is influx but [storage.influx] is missing"))?;
            Arc::new(InfluxRecordStore::new(
                influx.host,
                influx.token,
                influx.database,
                influx.retention_policy,
            ))
        }
    };

    // Create services (application layer)
    let catalog = Arc::new(Catalog::new());
    let registry = Arc::new(RuleRegistry::new());
    pipeline.apply(&catalog, &registry)?;
    let store = TimeseriesStore::new(records, catalog, Arc::new(TriggerOutbox::new()));

    let (dispatcher, failures) = Dispatcher::start(
        store.clone(),
        registry,
        app_config.dispatcher.workers,
        app_config.dispatcher.execution_timeout(),
    );
    tokio::spawn(async move {
        let mut failures = UnboundedReceiverStream::new(failures);
        while let Some(failure) = failures.next().await {
            tracing::error!(rule_id = failure.rule_id(), error = %failure, "auto process failed");
        }
    });
    // Catch up on whatever arrived while the service was down
    dispatcher.schedule_all();

    // Create application state
    let state = Arc::new(AppState { store, dispatcher });

    // Build router (presentation layer)
    let router = router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = app_config.server.bind_addr.parse()?;
    tracing::info!(%addr, backend = ?app_config.storage.backend, "starting hydro-timeseries service");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router).await?;

    Ok(())
}
