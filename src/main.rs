use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use report_sync::client::{RemoteReportClient, ReportApi};
use report_sync::config::{CliArgs, SyncConfig};
use report_sync::events::{EventLevel, EventSource};
use report_sync::fake::FakeReportApi;
use report_sync::poll_loop::PollLoop;
use report_sync::server::{self, AppState};
use report_sync::settings::{load_settings, save_settings, PersistentSettings};
use report_sync::state::{SharedState, SyncState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "report_sync=info,tower_http=info".into()),
        )
        .init();

    let args = CliArgs::parse();
    info!("Starting report-sync v{}", env!("CARGO_PKG_VERSION"));

    let settings = match &args.settings {
        Some(path) => load_settings(path),
        None => PersistentSettings::default(),
    };
    let settings_path = args.settings.clone();
    let save = args.save_settings;
    let config = SyncConfig::resolve(args, settings);

    if save {
        if let Some(path) = &settings_path {
            save_settings(path, &config.to_settings());
            info!("Settings written to {:?}", path);
        }
    }

    if config.demo {
        info!("Demo mode: serving a built-in sample report");
        run(Arc::new(FakeReportApi::demo()), config).await
    } else {
        info!("Backend: {}", config.api_root());
        let client = RemoteReportClient::new(&config)?;
        run(Arc::new(client), config).await
    }
}

async fn run<A: ReportApi>(api: Arc<A>, config: SyncConfig) -> anyhow::Result<()> {
    let port = config.port;
    let serve = config.serve;
    let state: SharedState = Arc::new(SyncState::new(config));

    state
        .events
        .emit(EventSource::Session, EventLevel::Info, "Sync session started")
        .await;

    let poll_loop = Arc::new(PollLoop::new(api.clone(), state.clone()));
    let poll_handle = poll_loop.spawn();

    if serve {
        let router = server::build_router(AppState::new(api, state.clone()));
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
        info!("View server listening on http://127.0.0.1:{}", port);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(state.clone()))
            .await?;
    } else {
        shutdown_signal(state.clone()).await;
    }

    info!("Shutting down");
    state.tree.end_session().await;
    if let Err(e) = poll_handle.await {
        error!("Poll loop task failed: {}", e);
    }

    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received shutdown signal");
    state
        .events
        .emit(EventSource::Session, EventLevel::Info, "Shutdown signal received")
        .await;
}
