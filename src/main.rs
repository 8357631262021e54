use anyhow::{Context, Result};
use clap::Parser;
use matrix_rssbot::config::Config;
use matrix_rssbot::matrix::{DeliveryQueue, HomeserverClient, QueueOptions};
use matrix_rssbot::poller::spawn_pollers;
use matrix_rssbot::storage::SeenStore;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

const USER_AGENT: &str = concat!("matrix-rssbot/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_REDIRECTS: usize = 5;

#[derive(Parser, Debug)]
#[command(
    name = "matrix-rssbot",
    about = "Posts new RSS and Atom entries into Matrix rooms"
)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "FILE", default_value = "config.toml")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config_file).with_context(|| {
        format!(
            "Failed to load configuration from '{}'",
            args.config_file.display()
        )
    })?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to create HTTP client")?;

    let homeserver = HomeserverClient::new(
        http.clone(),
        &config.homeserver_url,
        &config.api_prefix,
        SecretString::from(config.as_token.clone()),
    )
    .context("Invalid homeserver URL")?;

    let store = SeenStore::open(&config.entry_cache_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open entry cache '{}': check file permissions",
                config.entry_cache_path
            )
        })?;
    tracing::info!(
        path = %config.entry_cache_path,
        entries = store.len().await,
        "Loaded entry cache"
    );
    let store = Arc::new(store);

    let queue = DeliveryQueue::start(
        homeserver,
        QueueOptions {
            backoff_unit: config.backoff_unit(),
            max_backoff: config.max_backoff(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pollers = spawn_pollers(
        &config.room_mapping,
        &http,
        &store,
        &queue.sender(),
        config.poll_interval(),
        &shutdown_rx,
    );

    tracing::info!(
        user = %config.bot_username,
        feeds = pollers.len(),
        "Bot started"
    );

    wait_for_shutdown_signal().await?;

    // Pollers stop before the delivery worker.
    let _ = shutdown_tx.send(true);
    for handle in pollers {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Feed poller task ended abnormally");
        }
    }

    let sender = queue.sender();
    queue.shutdown().await;
    let stats = sender.stats();
    tracing::info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        pending = stats.depth,
        "Shut down"
    );

    Ok(())
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Received Ctrl-C, shutting down gracefully");
    }

    Ok(())
}
