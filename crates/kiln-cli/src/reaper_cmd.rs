//! The `kiln reaper` command: runs the pod reaper until ctrl-c.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use kiln_core::config::KilnConfig;
use kiln_core::reaper::{self, ReaperConfig};

pub async fn run_reaper(config: &KilnConfig) -> Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client (in-cluster config or kubeconfig)")?;

    let reaper_config = ReaperConfig {
        namespace: config.reaper_namespace.clone(),
        watch_all_namespaces: config.reaper_watch_all,
        grace_period_secs: config.reaper_grace_period_secs,
        preserve_debug_pods: config.reaper_preserve_debug,
    };

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(reaper::run_reaper(client, reaper_config, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    let _ = handle.await;

    Ok(())
}
