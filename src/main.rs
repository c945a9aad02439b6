mod auth;
mod config;
mod converter;
mod engines;
mod error;
mod handlers;

use anyhow::Context;
use auth::AuthService;
use config::Config;
use converter::Converter;
use engines::{ChromiumLauncher, RenderEngine};
use handlers::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env may set RUST_LOG, so it loads before the subscriber
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdfforge=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let mut launcher = ChromiumLauncher::new();
    if let Some(path) = &config.chrome_path {
        launcher = launcher.with_chrome_path(path.clone());
    }
    if launcher.is_available().await {
        info!("✓ Chromium available, browser starts on first render");
    } else {
        warn!("✗ Chromium not found, DOCX/Markdown/HTML conversions will fail until it is installed");
    }

    let engine = RenderEngine::new(launcher, config.render_timeout);
    let auth = AuthService::new(&config.auth).context("Invalid auth configuration")?;
    let state = Arc::new(AppState {
        converter: Converter::new(Arc::new(engine), config.max_upload_bytes),
        auth,
    });

    let app = handlers::router(Arc::clone(&state), &config.rate_limit)
        .context("Failed to build router")?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;

    info!("🚀 PDFForge server running on http://{}", config.addr);
    info!("📖 API documentation: http://{}/info", config.addr);
    info!(
        "⏱ Rate limit: {} requests per {}ms per client",
        config.rate_limit.max,
        config.rate_limit.window.as_millis()
    );
    info!("🔄 Convert files: POST http://{}/files/convert/pdf", config.addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Shutting down render engine");
    state.converter.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
