//! Connectivity tracking and the single-flight sync guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use poleshift_storage::ConnectivityProbe;

use crate::config::NetworkConfig;
use crate::state::{ConnectivityState, NetworkPhase, SkipReason};

struct Inner {
    state: watch::Sender<ConnectivityState>,
    probe: Arc<dyn ConnectivityProbe>,
    config: NetworkConfig,
    /// Pending automatic probe.
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every platform signal so stale probe results are dropped.
    generation: AtomicU64,
}

/// Tracks reachability of the backend.
///
/// This is the only writer of [`ConnectivityState`]; everything else
/// observes it through [`NetworkMonitor::subscribe`]. Cloning is cheap and
/// every clone drives the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    /// Create a monitor that starts offline.
    pub fn new(probe: Arc<dyn ConnectivityProbe>, config: NetworkConfig) -> Self {
        let (state, _) = watch::channel(ConnectivityState::new(
            config.initial_reconnect_interval_ms,
        ));
        Self {
            inner: Arc::new(Inner {
                state,
                probe,
                config,
                reconnect: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectivityState {
        self.inner.state.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.borrow().is_online()
    }

    /// The platform reported that connectivity is gone.
    ///
    /// Work already in flight finishes; the components check the state
    /// before starting anything new.
    pub fn connectivity_lost(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_reconnect();
        self.inner.state.send_if_modified(|state| {
            if state.phase == NetworkPhase::Offline {
                return false;
            }
            state.phase = NetworkPhase::Offline;
            true
        });
        info!("Connectivity lost");
    }

    /// The platform reported that connectivity may be back.
    ///
    /// Starts a fresh reconnect series and probes immediately. Returns
    /// whether the backend answered.
    pub async fn connectivity_restored(&self) -> bool {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_reconnect();
        let initial = self.inner.config.initial_reconnect_interval_ms;
        self.inner.state.send_modify(|state| {
            state.reconnect_attempts = 0;
            state.reconnect_interval_ms = initial;
        });
        self.check_now().await
    }

    /// Probe the backend once and update the state.
    ///
    /// A failed probe schedules the next automatic probe until
    /// `max_reconnect_attempts` consecutive failures.
    pub async fn check_now(&self) -> bool {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.state.send_if_modified(|state| {
            if state.phase != NetworkPhase::Offline {
                return false;
            }
            state.phase = NetworkPhase::Checking;
            true
        });

        let result = self.inner.probe.probe().await;

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding probe result after connectivity change");
            return self.is_online();
        }

        match result {
            Ok(()) => {
                let initial = self.inner.config.initial_reconnect_interval_ms;
                let was_online = self.is_online();
                self.inner.state.send_modify(|state| {
                    state.phase = NetworkPhase::Online;
                    state.reconnect_attempts = 0;
                    state.reconnect_interval_ms = initial;
                });
                if !was_online {
                    info!("Backend reachable");
                }
                true
            }
            Err(e) => {
                let config = &self.inner.config;
                let mut schedule = None;
                self.inner.state.send_modify(|state| {
                    state.phase = NetworkPhase::Offline;
                    state.reconnect_attempts += 1;
                    if state.reconnect_attempts < config.max_reconnect_attempts {
                        schedule = Some(Duration::from_millis(state.reconnect_interval_ms));
                        state.reconnect_interval_ms = state
                            .reconnect_interval_ms
                            .saturating_mul(2)
                            .min(config.max_reconnect_interval_ms);
                    }
                });

                match schedule {
                    Some(delay) => {
                        debug!("Probe failed: {}. Next probe in {:?}", e, delay);
                        self.schedule_reconnect(delay);
                    }
                    None => warn!(
                        "Probe failed: {}. Giving up after {} attempts",
                        e, config.max_reconnect_attempts
                    ),
                }
                false
            }
        }
    }

    /// Acquire the single-flight guard for a sync cycle.
    ///
    /// Fails if offline or if another cycle holds the guard.
    pub fn begin_sync(&self) -> Result<SyncGuard, SkipReason> {
        let mut refused = None;
        self.inner.state.send_if_modified(|state| {
            if !state.is_online() {
                refused = Some(SkipReason::Offline);
                false
            } else if state.is_syncing {
                refused = Some(SkipReason::AlreadySyncing);
                false
            } else {
                state.is_syncing = true;
                true
            }
        });

        match refused {
            Some(reason) => Err(reason),
            None => Ok(SyncGuard {
                monitor: self.clone(),
            }),
        }
    }

    /// Stop automatic probing.
    pub fn shutdown(&self) {
        self.cancel_reconnect();
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            monitor.check_now().await;
        });

        // The replaced handle belongs to the task running this probe, if any.
        if let Ok(mut slot) = self.inner.reconnect.lock() {
            *slot = Some(handle);
        }
    }

    fn cancel_reconnect(&self) {
        if let Ok(mut slot) = self.inner.reconnect.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Held while a sync cycle runs. Dropping it clears `is_syncing`, on every
/// exit path.
pub struct SyncGuard {
    monitor: NetworkMonitor,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.monitor.inner.state.send_modify(|state| {
            state.is_syncing = false;
        });
    }
}
