//! # Event Collector
//!
//! The sink for lifecycle and enforcement records. The default
//! implementation logs; deployments plug their own sink in.

use crate::policy::{PolicyAction, TagMap};
use tracing::info;

/// External sink for control-plane events.
pub trait Collector: Send + Sync {
    /// A PU lifecycle event: programmed, stopped, failed.
    fn collect_container_event(&self, context_id: &str, ip: &str, tags: &TagMap, event: &str);

    /// A flow observation reported by a datapath.
    fn collect_flow_event(
        &self,
        context_id: &str,
        source_ip: &str,
        destination_ip: &str,
        action: PolicyAction,
    );
}

/// Collector that writes records to the log and nothing else.
#[derive(Debug, Default)]
pub struct DefaultCollector;

impl Collector for DefaultCollector {
    fn collect_container_event(&self, context_id: &str, ip: &str, tags: &TagMap, event: &str) {
        info!(context_id, ip, ?tags, event, "Container event");
    }

    fn collect_flow_event(
        &self,
        context_id: &str,
        source_ip: &str,
        destination_ip: &str,
        action: PolicyAction,
    ) {
        info!(context_id, source_ip, destination_ip, ?action, "Flow event");
    }
}
