//! Warm pool manager
//!
//! Runs the pool reconciler and, when a listen address is configured, the
//! claim API.
//!
//! ## Architecture
//!
//! - **Reconciler**: tops the idle pool up to its target every tick
//! - **Claim API**: `POST /editor` hands an idle instance to the caller
//! - **Platform**: Heroku-compatible Platform API client shared by both

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warmpool_manager::api::create_router;
use warmpool_manager::platform::{AccountResolver, Platform};
use warmpool_manager::{AppState, Claimer, Config, HttpPlatform, PoolReconciler, Provisioner};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level applies
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_url = %config.api_url,
        pool_size = config.pool_size,
        batch_size = config.batch_size,
        version = %config.version,
        template_dir = %config.template_dir.display(),
        "Starting warm pool manager"
    );

    ensure!(
        config.template_dir.is_dir(),
        "template directory {} does not exist",
        config.template_dir.display()
    );

    let codec = config.codec()?;
    let http = Arc::new(
        HttpPlatform::new(config.api_url.clone(), config.api_key.clone())
            .context("Failed to build platform client")?,
    );
    let platform: Arc<dyn Platform> = http.clone();

    let shutdown = CancellationToken::new();

    // Start the reconciliation loop
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&platform),
        codec.clone(),
        config.provisioner_config(),
    ));
    let reconciler = PoolReconciler::new(
        Arc::clone(&platform),
        provisioner,
        config.reconciler_config(),
    );
    let mut reconciler_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    // Start the claim API
    let server_handle = match config.listen_addr {
        Some(addr) => {
            let resolver: Arc<dyn AccountResolver> = http;
            let state = AppState::new(
                Claimer::new(Arc::clone(&platform), codec),
                resolver,
                config.allowed_users.clone(),
                shutdown.clone(),
            );
            let app = create_router(state);

            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            info!(%addr, "Claim API listening");

            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    // Wait for shutdown signal
    let mut reconciler_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            reconciler_done = true;
            match result {
                Ok(()) => info!("Reconciler exited"),
                Err(e) => error!(error = %e, "Reconciler task panicked"),
            }
        }
    }

    // Signal shutdown to all workers; in-flight runs roll back
    shutdown.cancel();

    info!("Waiting for workers to shut down...");
    let drain = async {
        if !reconciler_done {
            if let Err(e) = reconciler_handle.await {
                error!(error = %e, "Reconciler task panicked");
            }
        }
        if let Some(handle) = server_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Claim API error"),
                Err(e) => error!(error = %e, "Claim API task panicked"),
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        error!("Workers did not shut down in time");
    }

    info!("Warm pool manager shutdown complete");
    Ok(())
}
