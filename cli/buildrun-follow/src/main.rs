//! BuildRun follower
//!
//! Watches the pods of one Shipwright BuildRun and reports their phases until
//! the build pod succeeds, fails or is deleted. Exits non-zero when the build
//! fails, its pod is deleted or the follow times out.

mod config;
mod error;
mod follower;

use crate::config::FollowConfig;
use crate::error::FollowError;
use crate::follower::{FollowOutcome, follow};
use pod_reactor::{KubePodClient, WatchContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), FollowError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting BuildRun follower");

    let config = FollowConfig::from_env()?;

    info!("Configuration:");
    info!("  BuildRun: {}", config.build_run);
    info!("  Namespace: {}", config.namespace);
    info!(
        "  Timeout: {}",
        config
            .timeout
            .map_or_else(|| "none".to_string(), |t| format!("{t:?}"))
    );

    let client = KubePodClient::try_default().await?;

    let ctx = WatchContext::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            interrupt.cancel();
        }
    });

    let outcome = follow(ctx, client, &config).await?;
    match &outcome {
        FollowOutcome::Succeeded { pod } => {
            info!("BuildRun {} succeeded (pod {})", config.build_run, pod);
        }
        FollowOutcome::Interrupted => info!("Stopped following BuildRun {}", config.build_run),
        _ => {}
    }
    outcome.into_result(&config.build_run)
}
