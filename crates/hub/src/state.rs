use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub controllers: HashMap<String, ControllerState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ControllerState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_contact: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Water,
    Light,
    Stop,
    Notification,
    Scheduler,
    Health,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub scheduled_jobs: usize,
    pub controllers: HashMap<String, ControllerState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            controllers: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a health message from the controller behind `prefix`.
    pub fn record_health(&mut self, prefix: &str, at: OffsetDateTime) {
        self.controllers
            .insert(prefix.to_string(), ControllerState { last_contact: at });
        self.push_event(EventKind::Health, format!("{prefix} checked in"));
    }

    pub fn last_contact(&self, prefix: &str) -> Option<OffsetDateTime> {
        self.controllers.get(prefix).map(|c| c.last_contact)
    }

    pub fn record_water(&mut self, detail: String) {
        self.push_event(EventKind::Water, detail);
    }

    pub fn record_light(&mut self, detail: String) {
        self.push_event(EventKind::Light, detail);
    }

    pub fn record_stop(&mut self, detail: String) {
        self.push_event(EventKind::Stop, detail);
    }

    pub fn record_notification(&mut self, title: &str, message: &str) {
        self.push_event(EventKind::Notification, format!("{title}: {message}"));
    }

    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Details of retained events of `kind`, oldest first.
    #[cfg(test)]
    pub fn events_of(&self, kind: EventKind) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.detail.as_str())
            .collect()
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, scheduled_jobs: usize) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            scheduled_jobs,
            controllers: self.controllers.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn health_tracks_last_contact() {
        let mut st = SystemState::new();
        assert_eq!(st.last_contact("garden"), None);
        st.record_health("garden", datetime!(2023-08-23 10:00 UTC));
        st.record_health("garden", datetime!(2023-08-23 10:01 UTC));
        assert_eq!(st.last_contact("garden"), Some(datetime!(2023-08-23 10:01 UTC)));
        assert_eq!(st.events_of(EventKind::Health).len(), 2);
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = SystemState::new();
        st.record_water("first".into());
        st.record_light("second".into());
        let status = st.to_status(3);
        assert_eq!(status.scheduled_jobs, 3);
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Light);
    }
}
