//! # Monitor Events
//!
//! The normalized event emitted by every monitor. Platform-specific
//! signals (Docker daemon events, launcher RPCs) are translated into
//! `EventInfo` before they reach the orchestrator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle event types for a processing unit.
///
/// The same `(pu_id, event_type)` pair may be redelivered by a monitor
/// (resync, daemon reconnect); consumers must treat redelivery as
/// idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// The PU came into existence.
    Create,
    /// The PU started running. Carries the complete runtime information.
    Start,
    /// The PU stopped running.
    Stop,
    /// The PU was removed.
    Destroy,
    /// The PU was paused.
    Pause,
    /// The PU resumed from pause.
    Unpause,
}

impl EventType {
    /// Short lowercase name, matching the wire form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Start => "start",
            EventType::Stop => "stop",
            EventType::Destroy => "destroy",
            EventType::Pause => "pause",
            EventType::Unpause => "unpause",
        }
    }
}

/// The normalized event a monitor hands to the orchestrator.
///
/// `pu_id` is the stable identifier of the processing unit across its
/// whole lifecycle. The `event_type` field is mandatory: a request that
/// omits it fails deserialization and is rejected at the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInfo {
    /// Stable identifier of the processing unit.
    pub pu_id: String,

    /// Human-readable name (container name or launched command).
    pub name: String,

    /// Metadata tags attached to the PU.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Pid of the main process, as a decimal string.
    pub pid: String,

    /// The lifecycle transition this event describes.
    pub event_type: EventType,

    /// Addresses the monitor learned for this PU, keyed by namespace.
    /// Monitors without address knowledge (the launcher path) leave this
    /// empty and the supervisor falls back to the catch-all network.
    #[serde(default)]
    pub ip_addresses: HashMap<String, String>,
}

impl EventInfo {
    /// Parse the pid field. Returns `None` for absent or malformed pids.
    #[must_use]
    pub fn pid_as_i32(&self) -> Option<i32> {
        self.pid.parse::<i32>().ok().filter(|p| *p > 0)
    }
}
