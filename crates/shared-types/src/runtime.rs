//! # Processing Unit Runtime
//!
//! The runtime description of a managed PU: pid, name, tags and the
//! addresses it answers on. Owned by the orchestrator; everything a
//! reader obtains is a copy.

use crate::events::EventInfo;
use crate::policy::{IpMap, TagMap};
use crate::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};

/// Runtime parameters of a processing unit.
///
/// Created on the first `create` event for a PU and mutated only by the
/// monitor path that owns it. Accessors hand out owned copies so no
/// reader shares mutable state with the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuRuntime {
    pid: i32,
    name: String,
    tags: TagMap,
    ip_addresses: IpMap,
}

impl PuRuntime {
    /// Build a runtime from its parts.
    #[must_use]
    pub fn new(pid: i32, name: impl Into<String>, tags: TagMap, ip_addresses: IpMap) -> Self {
        Self {
            pid,
            name: name.into(),
            tags,
            ip_addresses,
        }
    }

    /// Build a runtime from a normalized monitor event.
    #[must_use]
    pub fn from_event(event: &EventInfo) -> Self {
        Self {
            pid: event.pid_as_i32().unwrap_or(0),
            name: event.name.clone(),
            tags: event.tags.clone(),
            ip_addresses: event.ip_addresses.clone(),
        }
    }

    /// Pid of the PU's main process. Zero when unknown.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Process or container name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.clone()
    }

    /// Value of one tag.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags.get(key).cloned()
    }

    /// Copy of all tags.
    #[must_use]
    pub fn tags(&self) -> TagMap {
        self.tags.clone()
    }

    /// Copy of all known addresses, keyed by namespace.
    #[must_use]
    pub fn ip_addresses(&self) -> IpMap {
        self.ip_addresses.clone()
    }

    /// The address stored under the default namespace, if any.
    #[must_use]
    pub fn default_ip_address(&self) -> Option<String> {
        self.ip_addresses.get(DEFAULT_NAMESPACE).cloned()
    }

    /// Replace the address map. Used when a later event carries addresses
    /// the original `create` did not (containers get their IP at start).
    pub fn set_ip_addresses(&mut self, ips: IpMap) {
        self.ip_addresses = ips;
    }

    /// Replace the pid. Zero pids from early events are upgraded in place.
    pub fn set_pid(&mut self, pid: i32) {
        self.pid = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn runtime() -> PuRuntime {
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), "db".to_string());
        let mut ips = HashMap::new();
        ips.insert(DEFAULT_NAMESPACE.to_string(), "10.0.0.5".to_string());
        ips.insert("backplane".to_string(), "192.168.0.5".to_string());
        PuRuntime::new(1234, "/bin/cat", tags, ips)
    }

    #[test]
    fn test_accessors_are_copies() {
        let rt = runtime();
        let mut tags = rt.tags();
        tags.insert("role".to_string(), "web".to_string());
        // The runtime is unaffected by mutation of the copy.
        assert_eq!(rt.tag("role").as_deref(), Some("db"));
    }

    #[test]
    fn test_default_ip() {
        let rt = runtime();
        assert_eq!(rt.default_ip_address().as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_from_event_without_ips() {
        let raw = r#"{"pu_id":"svcA","name":"/bin/cat","pid":"1234","event_type":"create"}"#;
        let event: EventInfo = serde_json::from_str(raw).unwrap();
        let rt = PuRuntime::from_event(&event);
        assert_eq!(rt.pid(), 1234);
        assert!(rt.default_ip_address().is_none());
    }
}
