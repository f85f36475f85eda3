//! Probe registry and liveness tracker.
//!
//! Authoritative owner of probe state: registration, heartbeat
//! freshness, the background offline sweep, and status-change fan-out
//! to subscribers.
//!
//! Locking discipline: mutations take the write lock, reads the read
//! lock, and iteration always produces a snapshot. Subscriber callbacks
//! are never invoked while any registry lock is held — the callback
//! list is copied under the lock, the lock is released, then the
//! callbacks run. Each probe status transition produces exactly one
//! notification.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use spyglass_core::protocol::{ProbeInfo, ProbeStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable view of one probe, handed to subscribers and sessions.
#[derive(Debug, Clone)]
pub struct ProbeSnapshot {
    /// Last-seen registration info.
    pub info: ProbeInfo,
    /// Liveness status.
    pub status: ProbeStatus,
    /// In-flight task count per the coordinator's bookkeeping.
    pub current_tasks: u32,
}

struct ProbeState {
    info: ProbeInfo,
    status: ProbeStatus,
    last_heartbeat: Instant,
    current_tasks: u32,
}

impl ProbeState {
    fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            info: self.info.clone(),
            status: self.status,
            current_tasks: self.current_tasks,
        }
    }
}

/// Status-change subscriber; receives a full fleet snapshot on every
/// transition. Must be cheap or internally queue.
pub type StatusCallback = Arc<dyn Fn(Vec<ProbeSnapshot>) + Send + Sync>;

/// Registry lookup errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No probe with the given id is known.
    #[error("probe not found: {0}")]
    NotFound(String),
}

/// Authoritative probe state store.
pub struct ProbeRegistry {
    probes: RwLock<HashMap<String, ProbeState>>,
    callbacks: RwLock<Vec<StatusCallback>>,
    heartbeat_timeout: Duration,
    probe_default_max: u32,
}

impl ProbeRegistry {
    /// Create a registry.
    ///
    /// `probe_default_max` substitutes for probes that advertise no
    /// per-probe ceiling.
    #[must_use]
    pub fn new(heartbeat_timeout: Duration, probe_default_max: u32) -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            heartbeat_timeout,
            probe_default_max,
        }
    }

    /// Register a subscriber for status-change events.
    pub fn subscribe(&self, callback: StatusCallback) {
        self.callbacks.write().expect("callbacks lock").push(callback);
    }

    /// Register a new probe or update an existing one on (re)connect.
    ///
    /// Returns `was_offline`: `true` when this registration brought the
    /// probe online (first registration, or return from Offline), in
    /// which case subscribers have been notified.
    pub fn register_or_update(&self, mut info: ProbeInfo) -> bool {
        if info.max_concurrent == 0 {
            info.max_concurrent = self.probe_default_max;
        }

        let probe_id = info.id.clone();
        let was_offline;
        {
            let mut probes = self.probes.write().expect("probes lock");
            match probes.get_mut(&probe_id) {
                Some(state) => {
                    was_offline = state.status == ProbeStatus::Offline;
                    state.info = info;
                    state.status = ProbeStatus::Online;
                    state.last_heartbeat = Instant::now();
                    debug!(probe_id = %probe_id, was_offline, "probe re-registered");
                }
                None => {
                    was_offline = true;
                    probes.insert(
                        probe_id.clone(),
                        ProbeState {
                            info,
                            status: ProbeStatus::Online,
                            last_heartbeat: Instant::now(),
                            current_tasks: 0,
                        },
                    );
                    info!(probe_id = %probe_id, "probe registered");
                }
            }
        }

        if was_offline {
            info!(probe_id = %probe_id, "probe online");
            self.notify_status_change();
        }
        was_offline
    }

    /// Refresh a probe's heartbeat timestamp and reported task count.
    ///
    /// Does **not** flip an Offline probe back online — liveness
    /// requires an active stream, which only a new registration proves.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the probe is unknown.
    pub fn update_heartbeat(&self, probe_id: &str, current_tasks: u32) -> Result<(), RegistryError> {
        let mut probes = self.probes.write().expect("probes lock");
        let state = probes
            .get_mut(probe_id)
            .ok_or_else(|| RegistryError::NotFound(probe_id.to_string()))?;

        state.last_heartbeat = Instant::now();
        state.current_tasks = current_tasks;
        debug!(probe_id, current_tasks, "heartbeat updated");
        Ok(())
    }

    /// Mark a probe offline. Idempotent: only an Online→Offline
    /// transition fires a notification; repeats and unknown ids are
    /// no-ops.
    pub fn mark_offline(&self, probe_id: &str) {
        let transitioned = {
            let mut probes = self.probes.write().expect("probes lock");
            match probes.get_mut(probe_id) {
                Some(state) if state.status == ProbeStatus::Online => {
                    state.status = ProbeStatus::Offline;
                    true
                }
                _ => false,
            }
        };

        if transitioned {
            warn!(probe_id, "probe offline");
            self.notify_status_change();
        }
    }

    /// Sweep all Online probes whose heartbeat has gone stale.
    pub fn check_offline(&self) {
        let stale: Vec<String> = {
            let probes = self.probes.read().expect("probes lock");
            let now = Instant::now();
            probes
                .iter()
                .filter(|(_, state)| {
                    state.status == ProbeStatus::Online
                        && now.duration_since(state.last_heartbeat) > self.heartbeat_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for probe_id in stale {
            warn!(probe_id = %probe_id, "heartbeat timed out");
            self.mark_offline(&probe_id);
        }
    }

    /// Spawn the background offline sweep; runs until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.check_offline(),
                    () = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Look up one probe.
    #[must_use]
    pub fn get(&self, probe_id: &str) -> Option<ProbeSnapshot> {
        self.probes
            .read()
            .expect("probes lock")
            .get(probe_id)
            .map(ProbeState::snapshot)
    }

    /// Consistent snapshot of the whole fleet, ordered by probe id.
    #[must_use]
    pub fn get_all(&self) -> Vec<ProbeSnapshot> {
        let probes = self.probes.read().expect("probes lock");
        let mut all: Vec<ProbeSnapshot> = probes.values().map(ProbeState::snapshot).collect();
        all.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        all
    }

    /// Increment a probe's in-flight task count (admission bookkeeping).
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the probe is unknown.
    pub fn increment_task_count(&self, probe_id: &str) -> Result<(), RegistryError> {
        let mut probes = self.probes.write().expect("probes lock");
        let state = probes
            .get_mut(probe_id)
            .ok_or_else(|| RegistryError::NotFound(probe_id.to_string()))?;
        state.current_tasks = state.current_tasks.saturating_add(1);
        Ok(())
    }

    /// Decrement a probe's in-flight task count; never goes negative.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if the probe is unknown.
    pub fn decrement_task_count(&self, probe_id: &str) -> Result<(), RegistryError> {
        let mut probes = self.probes.write().expect("probes lock");
        let state = probes
            .get_mut(probe_id)
            .ok_or_else(|| RegistryError::NotFound(probe_id.to_string()))?;
        state.current_tasks = state.current_tasks.saturating_sub(1);
        Ok(())
    }

    /// Copy the callback list under the lock, release, then call.
    /// Holding the lock across a callback is a known deadlock.
    fn notify_status_change(&self) {
        let snapshot = self.get_all();
        let callbacks: Vec<StatusCallback> = self
            .callbacks
            .read()
            .expect("callbacks lock")
            .iter()
            .map(Arc::clone)
            .collect();

        for callback in callbacks {
            callback(snapshot.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn registry() -> ProbeRegistry {
        ProbeRegistry::new(Duration::from_secs(60), 5)
    }

    fn info(id: &str) -> ProbeInfo {
        ProbeInfo {
            id: id.to_string(),
            display_name: format!("probe {id}"),
            max_concurrent: 3,
            ..Default::default()
        }
    }

    fn count_events(registry: &ProbeRegistry) -> Arc<AtomicUsize> {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        counter
    }

    #[test]
    fn first_registration_is_a_transition() {
        let registry = registry();
        let events = count_events(&registry);

        assert!(registry.register_or_update(info("P1")));
        assert_eq!(events.load(Ordering::SeqCst), 1);

        let snap = registry.get("P1").unwrap();
        assert_eq!(snap.status, ProbeStatus::Online);
        assert_eq!(snap.current_tasks, 0);
    }

    #[test]
    fn reregister_while_online_is_silent() {
        let registry = registry();
        let events = count_events(&registry);

        registry.register_or_update(info("P1"));
        assert!(!registry.register_or_update(info("P1")));
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_offline_is_idempotent() {
        let registry = registry();
        registry.register_or_update(info("P1"));
        let events = count_events(&registry);

        registry.mark_offline("P1");
        registry.mark_offline("P1");
        registry.mark_offline("unknown");
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("P1").unwrap().status, ProbeStatus::Offline);
    }

    #[test]
    fn reconnect_after_offline_fires_exactly_one_event() {
        let registry = registry();
        registry.register_or_update(info("P1"));
        registry.mark_offline("P1");
        let events = count_events(&registry);

        assert!(registry.register_or_update(info("P1")));
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get("P1").unwrap().status, ProbeStatus::Online);
    }

    #[test]
    fn heartbeat_does_not_resurrect_offline_probe() {
        let registry = registry();
        registry.register_or_update(info("P1"));
        registry.mark_offline("P1");

        registry.update_heartbeat("P1", 2).unwrap();
        let snap = registry.get("P1").unwrap();
        assert_eq!(snap.status, ProbeStatus::Offline);
        assert_eq!(snap.current_tasks, 2);
    }

    #[test]
    fn heartbeat_unknown_probe_errors() {
        let registry = registry();
        assert_eq!(
            registry.update_heartbeat("nope", 0),
            Err(RegistryError::NotFound("nope".to_string()))
        );
    }

    #[test]
    fn stale_heartbeat_sweep_marks_offline_once() {
        let registry = ProbeRegistry::new(Duration::from_millis(0), 5);
        registry.register_or_update(info("P1"));
        let events = count_events(&registry);

        std::thread::sleep(Duration::from_millis(5));
        registry.check_offline();
        registry.check_offline();

        assert_eq!(registry.get("P1").unwrap().status, ProbeStatus::Offline);
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_count_never_negative() {
        let registry = registry();
        registry.register_or_update(info("P1"));

        registry.decrement_task_count("P1").unwrap();
        assert_eq!(registry.get("P1").unwrap().current_tasks, 0);

        registry.increment_task_count("P1").unwrap();
        registry.increment_task_count("P1").unwrap();
        registry.decrement_task_count("P1").unwrap();
        assert_eq!(registry.get("P1").unwrap().current_tasks, 1);
    }

    #[test]
    fn default_ceiling_substituted_when_unadvertised() {
        let registry = registry();
        let mut no_ceiling = info("P1");
        no_ceiling.max_concurrent = 0;
        registry.register_or_update(no_ceiling);

        assert_eq!(registry.get("P1").unwrap().info.max_concurrent, 5);
    }

    #[test]
    fn get_all_is_sorted_by_id() {
        let registry = registry();
        registry.register_or_update(info("P2"));
        registry.register_or_update(info("P1"));

        let ids: Vec<String> = registry
            .get_all()
            .into_iter()
            .map(|s| s.info.id)
            .collect();
        assert_eq!(ids, vec!["P1".to_string(), "P2".to_string()]);
    }
}
