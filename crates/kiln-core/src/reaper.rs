//! Pod reaper: watches the worker runtime and deletes terminal evaluation
//! pods so failed workloads do not pile up.
//!
//! Policy, in order:
//! - only `Failed` and `Succeeded` phases are considered;
//! - `Succeeded` pods are deleted only when labelled `app=evaluation`
//!   (other workloads clean up after themselves);
//! - pods annotated `debug=true` or `preserve=true` are never touched;
//! - pods younger than the minimum age are skipped so log collection can
//!   finish.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;

/// Minimum pod age before deletion, allowing log collection.
pub const MIN_AGE: Duration = Duration::from_secs(10);

/// Backoff before restarting a failed watch stream.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Pod phases that mark a workload as finished.
const TERMINAL_PHASES: [&str; 2] = ["Failed", "Succeeded"];

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub namespace: String,
    pub watch_all_namespaces: bool,
    pub grace_period_secs: u32,
    pub preserve_debug_pods: bool,
}

/// Decide whether a pod should be deleted.
pub fn should_delete(pod: &Pod, preserve_debug: bool, now: DateTime<Utc>) -> bool {
    if preserve_debug {
        let annotations = pod.annotations();
        if annotations.get("debug").map(String::as_str) == Some("true")
            || annotations.get("preserve").map(String::as_str) == Some("true")
        {
            return false;
        }
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    if !TERMINAL_PHASES.contains(&phase) {
        return false;
    }

    // Succeeded pods from other components are left alone.
    if phase == "Succeeded" && pod.labels().get("app").map(String::as_str) != Some("evaluation") {
        return false;
    }

    if let Some(created) = pod.metadata.creation_timestamp.as_ref() {
        let age = now.signed_duration_since(created.0);
        if age < chrono::Duration::from_std(MIN_AGE).unwrap_or_default() {
            return false;
        }
    }

    true
}

/// Run the reaper until shutdown, restarting the watch stream on transient
/// errors.
pub async fn run_reaper(client: Client, config: ReaperConfig, shutdown: CancellationToken) {
    tracing::info!(
        namespace = %config.namespace,
        watch_all = config.watch_all_namespaces,
        grace_period = config.grace_period_secs,
        preserve_debug = config.preserve_debug_pods,
        "starting pod reaper"
    );

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let result = watch_pods(&client, &config, &shutdown).await;
        match result {
            Ok(()) => return, // clean shutdown
            Err(e) => {
                tracing::error!(error = %e, "watch stream failed; restarting in 5s");
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

async fn watch_pods(
    client: &Client,
    config: &ReaperConfig,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let pods: Api<Pod> = if config.watch_all_namespaces {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), &config.namespace)
    };

    let mut stream = std::pin::pin!(watcher(pods, watcher::Config::default()));

    loop {
        let event = tokio::select! {
            event = stream.try_next() => event?,
            _ = shutdown.cancelled() => {
                tracing::info!("pod reaper shutting down");
                return Ok(());
            }
        };

        let Some(event) = event else {
            anyhow::bail!("watch stream ended");
        };

        // Added and modified pods both matter; deletions and bookmarks do
        // not.
        let pod = match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => pod,
            _ => continue,
        };

        if !should_delete(&pod, config.preserve_debug_pods, Utc::now()) {
            continue;
        }

        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_else(|| config.namespace.clone());
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();

        tracing::info!(pod = %name, namespace = %namespace, phase = %phase, "deleting terminal pod");

        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let params = DeleteParams::default().grace_period(config.grace_period_secs);
        match api.delete(&name, &params).await {
            Ok(_) => {
                tracing::info!(pod = %name, namespace = %namespace, "deleted pod");
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                tracing::debug!(pod = %name, "pod already deleted");
            }
            Err(e) => {
                tracing::error!(pod = %name, error = %e, "failed to delete pod");
            }
        }
    }
}
