//! Shared application state: the session registry, its quota gate, and the
//! per-session idle timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::browser::BrowserCatalog;
use crate::errors::{HubError, PlatformError};
use crate::platform::{Platform, Service};

pub struct HubConfig {
    pub session_idle_timeout: Duration,
    pub reconcile_interval: Duration,
    pub limit: usize,
}

/// Shared application state, cloned into every handler and task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub catalog: Arc<BrowserCatalog>,
    pub platform: Arc<Platform>,
    pub registry: SessionRegistry,
    pub client: reqwest::Client,
}

impl AppState {
    /// Tear a session down: delete the pod (a missing pod is fine) and evict
    /// the registry entry. Safe to call from any number of racing paths;
    /// the loser is a no-op.
    pub async fn terminate_session(&self, session_id: &str) {
        match self.platform.delete(session_id).await {
            Ok(()) | Err(PlatformError::PodNotFound(_)) => {}
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to delete session pod")
            }
        }
        self.registry.remove(session_id);
    }
}

/// Spawn the single-shot idle timer for a session. Any message on the
/// returned channel pushes the deadline out; dropping the sender (which
/// happens when the registry entry is removed) cancels the timer.
pub fn spawn_idle_timer(state: &AppState, session_id: String) -> mpsc::UnboundedSender<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let idle = state.config.session_idle_timeout;
    let state = state.clone();
    tokio::spawn(async move {
        let mut deadline = tokio::time::Instant::now() + idle;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(()) => deadline = tokio::time::Instant::now() + idle,
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    info!(session_id = %session_id, "session idle timeout expired");
                    state.terminate_session(&session_id).await;
                    return;
                }
            }
        }
    });
    tx
}

struct SessionEntry {
    service: Service,
    timer: Option<mpsc::UnboundedSender<()>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionEntry>,
    reserved: usize,
}

/// Concurrent session index, bounded by the configured limit.
///
/// One mutex protects both the map and the reservation counter so the quota
/// check cannot race against inserts. The lock is never held across an await
/// point; the slow platform create runs against a [`Reservation`] instead.
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct SessionRegistry {
    limit: usize,
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim one session slot ahead of the (slow) platform create. The slot
    /// is freed when the reservation is dropped, unless it was committed.
    pub fn reserve(&self) -> Result<Reservation, HubError> {
        let mut inner = self.lock();
        if inner.sessions.len() + inner.reserved >= self.limit {
            return Err(HubError::SessionLimitReached);
        }
        inner.reserved += 1;
        Ok(Reservation {
            registry: self.clone(),
            consumed: false,
        })
    }

    /// Last-writer-wins upsert for the same key, bypassing the quota gate.
    /// Passing no timer keeps the timer of an existing entry, so the watch
    /// reconciler can refresh a session without cancelling its idle clock.
    pub fn put(&self, service: Service, timer: Option<mpsc::UnboundedSender<()>>) {
        let mut inner = self.lock();
        let key = service.session_id.clone();
        match inner.sessions.get_mut(&key) {
            Some(entry) => {
                entry.service = service;
                if timer.is_some() {
                    entry.timer = timer;
                }
            }
            None => {
                inner.sessions.insert(key, SessionEntry { service, timer });
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Service> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.service.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    /// Evict an entry. Dropping it also drops the timer sender, which
    /// cancels the idle timer task.
    pub fn remove(&self, session_id: &str) -> Option<Service> {
        self.lock()
            .sessions
            .remove(session_id)
            .map(|entry| entry.service)
    }

    /// Reset the session's idle timer. Returns false for unknown sessions.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.lock().sessions.get(session_id) {
            Some(entry) => {
                if let Some(timer) = &entry.timer {
                    let _ = timer.send(());
                }
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<Service> {
        self.lock()
            .sessions
            .values()
            .map(|entry| entry.service.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Quota token covering the window between the limit check and the commit.
pub struct Reservation {
    registry: SessionRegistry,
    consumed: bool,
}

impl Reservation {
    /// Exchange the reserved slot for a live registry entry.
    pub fn commit(mut self, service: Service, timer: Option<mpsc::UnboundedSender<()>>) {
        let mut inner = self.registry.lock();
        inner.reserved -= 1;
        inner
            .sessions
            .insert(service.session_id.clone(), SessionEntry { service, timer });
        self.consumed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.consumed {
            self.registry.lock().reserved -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::ServiceStatus;
    use chrono::Utc;

    fn service(id: &str) -> Service {
        Service {
            session_id: id.to_string(),
            url: format!("http://{id}.selenosis:4445"),
            status: ServiceStatus::Running,
            started: Utc::now(),
            labels: Default::default(),
        }
    }

    #[test]
    fn reserve_fails_at_limit() {
        let registry = SessionRegistry::new(1);
        let first = registry.reserve().unwrap();
        assert!(matches!(
            registry.reserve(),
            Err(HubError::SessionLimitReached)
        ));
        first.commit(service("a"), None);
        // The committed session still occupies the slot.
        assert!(registry.reserve().is_err());
    }

    #[test]
    fn one_free_slot_admits_exactly_one_of_two_racers() {
        let registry = SessionRegistry::new(2);
        registry.put(service("existing"), None);

        let winner = registry.reserve();
        let loser = registry.reserve();
        assert!(winner.is_ok());
        assert!(matches!(loser, Err(HubError::SessionLimitReached)));
    }

    #[test]
    fn dropped_reservation_frees_the_slot() {
        let registry = SessionRegistry::new(1);
        drop(registry.reserve().unwrap());
        assert!(registry.reserve().is_ok());
    }

    #[test]
    fn commit_makes_the_session_visible() {
        let registry = SessionRegistry::new(1);
        let reservation = registry.reserve().unwrap();
        assert!(registry.get("a").is_none());
        reservation.commit(service("a"), None);
        assert_eq!(registry.get("a").unwrap().session_id, "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new(2);
        registry.put(service("a"), None);
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn put_is_last_writer_wins() {
        let registry = SessionRegistry::new(2);
        registry.put(service("a"), None);
        let mut replacement = service("a");
        replacement.url = "http://elsewhere:4445".to_string();
        registry.put(replacement, None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().url, "http://elsewhere:4445");
    }

    #[test]
    fn put_without_timer_keeps_the_existing_timer() {
        let registry = SessionRegistry::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.put(service("a"), Some(tx));
        registry.put(service("a"), None);
        assert!(registry.touch("a"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn touch_reports_unknown_sessions() {
        let registry = SessionRegistry::new(2);
        registry.put(service("a"), None);
        assert!(registry.touch("a"));
        assert!(!registry.touch("b"));
    }

    #[tokio::test]
    async fn removing_the_entry_cancels_its_timer() {
        let registry = SessionRegistry::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.put(service("a"), Some(tx));
        registry.remove("a");
        // Sender dropped with the entry: the timer task would observe None.
        assert_eq!(rx.recv().await, None);
    }
}
