//! Connectivity state shared by the engine components.

use serde::{Deserialize, Serialize};

/// Reachability of the backend as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPhase {
    /// Backend unreachable or connectivity reported lost.
    Offline,
    /// A probe is in flight.
    Checking,
    /// Last probe succeeded.
    Online,
}

/// Observable network state, owned by the network monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub phase: NetworkPhase,
    /// A sync cycle holds the single-flight guard.
    pub is_syncing: bool,
    /// Consecutive failed probes since the last success.
    pub reconnect_attempts: u32,
    /// Delay before the next automatic probe.
    pub reconnect_interval_ms: u64,
}

impl ConnectivityState {
    /// Initial state: offline until the first probe succeeds.
    pub fn new(initial_interval_ms: u64) -> Self {
        Self {
            phase: NetworkPhase::Offline,
            is_syncing: false,
            reconnect_attempts: 0,
            reconnect_interval_ms: initial_interval_ms,
        }
    }

    /// Whether the backend was reachable at the last probe.
    pub fn is_online(&self) -> bool {
        self.phase == NetworkPhase::Online
    }

    /// Coarse label for status displays.
    pub fn label(&self) -> &'static str {
        match (self.phase, self.is_syncing) {
            (NetworkPhase::Online, true) => "syncing",
            (NetworkPhase::Online, false) => "online",
            (NetworkPhase::Checking, _) => "checking",
            (NetworkPhase::Offline, _) => "offline",
        }
    }
}

/// Why a sync cycle request did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another cycle holds the guard.
    AlreadySyncing,
    /// The backend is not reachable.
    Offline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = ConnectivityState::new(1000);
        assert!(!state.is_online());
        assert!(!state.is_syncing);
        assert_eq!(state.reconnect_interval_ms, 1000);
        assert_eq!(state.label(), "offline");
    }

    #[test]
    fn test_labels() {
        let mut state = ConnectivityState::new(1000);
        state.phase = NetworkPhase::Checking;
        assert_eq!(state.label(), "checking");
        state.phase = NetworkPhase::Online;
        assert_eq!(state.label(), "online");
        state.is_syncing = true;
        assert_eq!(state.label(), "syncing");
    }

    #[test]
    fn test_serialization() {
        let mut state = ConnectivityState::new(500);
        state.phase = NetworkPhase::Online;
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"online\""));
        let back: ConnectivityState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
