//! Keeps the registry and the cluster in agreement: a long-running pod watch
//! for prompt eviction, and a periodic list-based sweep that also recovers
//! sessions after a hub restart.

use std::collections::HashSet;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use tracing::{info, warn};

use crate::errors::PlatformError;
use crate::platform::ServiceStatus;
use crate::state::{spawn_idle_timer, AppState};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Seed the registry from the current cluster state. Fails when the
/// Kubernetes API is unreachable, which the caller treats as fatal.
pub async fn bootstrap(state: &AppState) -> Result<usize, PlatformError> {
    let snapshot = state.platform.list().await?;
    Ok(reconcile_snapshot(state, snapshot.services))
}

/// Consume the pod watch forever, reconnecting with exponential backoff.
pub async fn run_watch(state: AppState) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match state.platform.watch().await {
            Ok(mut stream) => {
                info!("pod watch established");
                backoff = INITIAL_BACKOFF;
                loop {
                    match stream.try_next().await {
                        Ok(Some(event)) => handle_event(&state, event),
                        // Server-side expiry; reconnect.
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "pod watch interrupted");
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to establish pod watch"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn handle_event(state: &AppState, event: WatchEvent<Pod>) {
    match event {
        WatchEvent::Deleted(pod) => {
            if let Some(name) = pod.metadata.name {
                if state.registry.remove(&name).is_some() {
                    info!(session_id = %name, "pod deleted on platform, session evicted");
                }
            }
        }
        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
            // Refresh the view of sessions we already track; admission of new
            // ones stays with the quota-gated create and adopt paths.
            if let Some(service) = state.platform.service_from_pod(&pod) {
                if state.registry.contains(&service.session_id) {
                    state.registry.put(service, None);
                }
            }
        }
        WatchEvent::Bookmark(_) => {}
        WatchEvent::Error(resp) => {
            warn!(code = resp.code, reason = %resp.reason, "pod watch error event")
        }
    }
}

/// Periodic sweep. Catches whatever a dropped watch stream missed.
pub async fn run_reaper(state: AppState) {
    let mut ticker = tokio::time::interval(state.config.reconcile_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match state.platform.list().await {
            Ok(snapshot) => {
                reconcile_snapshot(&state, snapshot.services);
            }
            Err(err) => warn!(error = %err, "failed to list pods, skipping reconcile"),
        }
    }
}

/// Evict registry entries without a backing pod and adopt Running pods the
/// registry does not know about (left over from a previous hub process).
/// Adoption goes through the quota gate so the session limit holds.
fn reconcile_snapshot(state: &AppState, services: Vec<crate::platform::Service>) -> usize {
    let alive: HashSet<&str> = services
        .iter()
        .map(|service| service.session_id.as_str())
        .collect();

    for session in state.registry.list() {
        if !alive.contains(session.session_id.as_str()) {
            warn!(session_id = %session.session_id, "session has no backing pod, evicting");
            state.registry.remove(&session.session_id);
        }
    }

    let mut adopted = 0;
    for service in services {
        if service.status != ServiceStatus::Running || state.registry.contains(&service.session_id)
        {
            continue;
        }
        match state.registry.reserve() {
            Ok(reservation) => {
                info!(session_id = %service.session_id, "adopting orphan session pod");
                let timer = spawn_idle_timer(state, service.session_id.clone());
                reservation.commit(service, Some(timer));
                adopted += 1;
            }
            Err(_) => {
                warn!(
                    session_id = %service.session_id,
                    "orphan pod exceeds the session limit, skipping adoption"
                );
            }
        }
    }
    adopted
}
