use anyhow::{Context, Result};
use social_cache::{CacheConfig, CacheRuntime};
use tracing::info;
use tracing_subscriber::prelude::*;

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,social_cache=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
        .init();

    let config = CacheConfig::from_env().context("Failed to load cache configuration")?;
    info!(backend = ?config.backend, "Starting cache maintenance");

    let runtime = CacheRuntime::connect(config)
        .await
        .context("Failed to initialize cache stores")?;
    runtime
        .health_check()
        .await
        .context("Initial cache health check failed")?;
    info!("✅ Cache stores reachable");

    let health = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.run_health_checks().await }
    });

    shutdown_signal().await?;
    info!("Shutdown signal received");

    runtime.shutdown();
    health.await.context("Health check task failed")?;

    info!("Cache maintenance stopped");
    Ok(())
}
