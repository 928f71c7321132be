//! finserve - OpenAI-compatible chat completions for a financial LLM

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use finserve::app;
use finserve::config::ServiceSettings;
use finserve::server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_handle = app::init_tracing();

    info!("Starting finserve v{}", env!("CARGO_PKG_VERSION"));

    let settings = ServiceSettings::load()?;
    app::apply_log_level(&log_handle, &settings.log_level);
    info!("Model cache directory: {:?}", settings.cache_dir);

    let service = Arc::new(app::build_service(&settings)?);
    let state = AppState::new(Arc::clone(&service), settings.request_timeout());
    let router = create_router(state);

    let addr = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    // Load after binding so probes answer while the model loads
    app::spawn_warm_up(Arc::clone(service.manager()), settings.force_model_reload);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
