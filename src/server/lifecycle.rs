use crate::config::ServerDefinition;
use crate::error::{Error, Result};
use crate::server::process::ProcessHandle;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Maximum number of lifecycle events kept in memory.
const EVENT_HISTORY_LIMIT: usize = 1000;

/// Status of a supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Server is not running
    Stopped,
    /// Server process was launched and is warming up
    Starting,
    /// Server is running
    Running,
    /// Server failed to start or stopped answering
    Failed,
}

impl ServerStatus {
    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// `Stopped → Starting → Running`, `Failed` from `Starting` or `Running`,
    /// `Stopped` from anywhere. `Stopped`/`Failed → Running` covers adopting
    /// a server that already answers and monitor recovery.
    pub fn can_transition_to(self, to: ServerStatus) -> bool {
        use ServerStatus::*;
        match (self, to) {
            (from, to) if from == to => true,
            (_, Stopped) => true,
            (Stopped | Failed, Starting) => true,
            (Starting, Running | Failed) => true,
            (Running, Failed) => true,
            (Stopped | Failed, Running) => true,
            _ => false,
        }
    }

    /// Lowercase name, as reported to operators.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycleEvent {
    /// Launch attempt began
    Starting,
    /// Server answered and is running
    Started,
    /// Server was found already answering and adopted without a launch
    Adopted,
    /// Server is running but never confirmed healthy within the startup bound
    AssumedRunning,
    /// Server stopped
    Stopped,
    /// Server failed
    Failed,
    /// Server answered again after a failure
    Recovered,
}

impl ServerLifecycleEvent {
    fn status(self) -> ServerStatus {
        match self {
            ServerLifecycleEvent::Starting => ServerStatus::Starting,
            ServerLifecycleEvent::Started
            | ServerLifecycleEvent::Adopted
            | ServerLifecycleEvent::AssumedRunning
            | ServerLifecycleEvent::Recovered => ServerStatus::Running,
            ServerLifecycleEvent::Stopped => ServerStatus::Stopped,
            ServerLifecycleEvent::Failed => ServerStatus::Failed,
        }
    }
}

/// Server lifecycle event
#[derive(Debug, Clone)]
pub struct ServerEvent {
    /// Server name
    pub name: String,
    /// Event type
    pub event: ServerLifecycleEvent,
    /// Event timestamp
    pub timestamp: SystemTime,
    /// Event details
    pub details: Option<String>,
}

/// Mutable runtime state of one server.
#[derive(Debug, Clone)]
pub struct ServerRuntimeState {
    /// Current status
    pub status: ServerStatus,
    /// Live process, if one was launched and not yet confirmed gone
    pub process: Option<ProcessHandle>,
    /// Most recent failure description
    pub last_error: Option<String>,
    /// Definition the server was last launched from
    pub definition: Option<ServerDefinition>,
}

impl Default for ServerRuntimeState {
    fn default() -> Self {
        Self {
            status: ServerStatus::Stopped,
            process: None,
            last_error: None,
            definition: None,
        }
    }
}

impl ServerRuntimeState {
    /// The process handle, if the process is still running.
    pub fn live_process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref().filter(|p| p.is_alive())
    }
}

/// Per-server slot: an operation lock plus the runtime state.
///
/// The operation lock serializes start/stop for one server and may be held
/// across awaits; the state lock is only held for short synchronous updates,
/// so status snapshots never wait for a slow start.
pub struct ServerSlot {
    name: String,
    op: tokio::sync::Mutex<()>,
    state: Mutex<ServerRuntimeState>,
}

impl ServerSlot {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            op: tokio::sync::Mutex::new(()),
            state: Mutex::new(ServerRuntimeState::default()),
        }
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation lock serializing lifecycle operations on this server.
    pub fn op_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.op
    }

    /// Whether a lifecycle operation currently holds this server.
    pub fn is_busy(&self) -> bool {
        self.op.try_lock().is_err()
    }

    /// Locks the runtime state.
    pub fn state(&self) -> MutexGuard<'_, ServerRuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the runtime state.
    pub fn snapshot(&self) -> ServerRuntimeState {
        self.state().clone()
    }

    /// Current status.
    pub fn status(&self) -> ServerStatus {
        self.state().status
    }
}

impl fmt::Debug for ServerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSlot")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Server lifecycle manager
///
/// Owns every server's runtime state and the history of lifecycle events.
/// All status changes go through [`record_event`](Self::record_event), which
/// enforces the state machine.
pub struct ServerLifecycleManager {
    /// Runtime slots by server name
    slots: Mutex<HashMap<String, Arc<ServerSlot>>>,
    /// Server events
    events: Mutex<VecDeque<ServerEvent>>,
}

impl ServerLifecycleManager {
    /// Create a new server lifecycle manager
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot for `name`, created in `Stopped` state if absent
    pub fn slot(&self, name: &str) -> Arc<ServerSlot> {
        Arc::clone(
            self.lock_slots()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServerSlot::new(name))),
        )
    }

    /// Slot for `name`, if a start was ever attempted
    pub fn existing(&self, name: &str) -> Option<Arc<ServerSlot>> {
        self.lock_slots().get(name).cloned()
    }

    /// All slots
    pub fn slots(&self) -> Vec<Arc<ServerSlot>> {
        self.lock_slots().values().cloned().collect()
    }

    /// Record a server event and apply the status it implies
    pub fn record_event(
        &self,
        slot: &ServerSlot,
        event: ServerLifecycleEvent,
        details: Option<String>,
    ) -> Result<()> {
        self.transition(slot, event, details, |_| {})
    }

    /// Record a server event, apply its status and run `update` on the
    /// runtime state within the same critical section.
    ///
    /// Nothing is changed if the state machine rejects the transition.
    pub fn transition<F>(
        &self,
        slot: &ServerSlot,
        event: ServerLifecycleEvent,
        details: Option<String>,
        update: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ServerRuntimeState),
    {
        self.apply(slot, None, event, details, update).map(|_| ())
    }

    /// Like [`transition`](Self::transition), but only if the server is
    /// currently in `expected`. Returns whether the transition happened.
    pub fn transition_from<F>(
        &self,
        slot: &ServerSlot,
        expected: ServerStatus,
        event: ServerLifecycleEvent,
        details: Option<String>,
        update: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut ServerRuntimeState),
    {
        self.apply(slot, Some(expected), event, details, update)
    }

    fn apply<F>(
        &self,
        slot: &ServerSlot,
        expected: Option<ServerStatus>,
        event: ServerLifecycleEvent,
        details: Option<String>,
        update: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut ServerRuntimeState),
    {
        {
            let mut state = slot.state();
            if expected.is_some_and(|expected| expected != state.status) {
                return Ok(false);
            }
            let to = event.status();
            if !state.status.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    name: slot.name.clone(),
                    from: state.status,
                    to,
                });
            }
            state.status = to;
            update(&mut state);
        }

        let server_event = ServerEvent {
            name: slot.name.clone(),
            event,
            timestamp: SystemTime::now(),
            details,
        };
        tracing::trace!(server_name = %slot.name, event = ?event, "Recorded lifecycle event");

        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.push_back(server_event);
        if events.len() > EVENT_HISTORY_LIMIT {
            events.pop_front();
        }

        Ok(true)
    }

    /// Get server status
    pub fn get_status(&self, name: &str) -> Result<ServerStatus> {
        self.existing(name)
            .map(|slot| slot.status())
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Get recent events for a server, newest first
    pub fn get_server_events(&self, name: &str, limit: Option<usize>) -> Vec<ServerEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .rev()
            .filter(|e| e.name == name)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Get all events, newest first
    pub fn get_all_events(&self, limit: Option<usize>) -> Vec<ServerEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

impl Default for ServerLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use ServerStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Failed));
    }

    #[test]
    fn test_record_event_enforces_transitions() {
        let manager = ServerLifecycleManager::new();
        let slot = manager.slot("toolA");

        manager
            .record_event(&slot, ServerLifecycleEvent::Starting, None)
            .unwrap();
        manager
            .record_event(&slot, ServerLifecycleEvent::Started, Some("healthy".into()))
            .unwrap();
        assert_eq!(manager.get_status("toolA").unwrap(), ServerStatus::Running);

        let err = manager
            .record_event(&slot, ServerLifecycleEvent::Starting, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(slot.status(), ServerStatus::Running);

        let events = manager.get_server_events("toolA", None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, ServerLifecycleEvent::Started);
        assert_eq!(events[1].event, ServerLifecycleEvent::Starting);
    }

    #[test]
    fn test_transition_from_only_applies_to_expected_status() {
        let manager = ServerLifecycleManager::new();
        let slot = manager.slot("toolA");

        let changed = manager
            .transition_from(
                &slot,
                ServerStatus::Running,
                ServerLifecycleEvent::Failed,
                None,
                |state| state.last_error = Some("unhealthy".to_string()),
            )
            .unwrap();
        assert!(!changed);
        assert_eq!(slot.status(), ServerStatus::Stopped);
        assert!(slot.snapshot().last_error.is_none());
        assert!(manager.get_all_events(None).is_empty());
    }

    #[test]
    fn test_unknown_status() {
        let manager = ServerLifecycleManager::new();
        assert!(matches!(
            manager.get_status("nope"),
            Err(Error::ServerNotFound(_))
        ));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(ServerStatus::Failed.to_string(), "failed");
    }
}
