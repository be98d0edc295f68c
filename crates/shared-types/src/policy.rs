//! # Policy Model
//!
//! The policy a resolver hands back for a processing unit, plus the
//! rule and selector types it is built from. A `PuPolicy` is immutable
//! once resolved; policy version changes replace the whole value.

use std::collections::HashMap;

use crate::runtime::PuRuntime;
use serde::{Deserialize, Serialize};

/// Tags attached to a PU, keyed by tag name.
pub type TagMap = HashMap<String, String>;

/// Addresses of a PU, keyed by namespace. The default namespace is `""`.
pub type IpMap = HashMap<String, String>;

/// Action a policy prescribes for a PU or a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Allow the traffic.
    Accept,
    /// Drop the traffic.
    Reject,
}

/// A single L3/L4 ACL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRule {
    /// CIDR or address to match.
    pub address: String,
    /// Destination port, or `"0"` for any.
    pub port: String,
    /// Protocol name as iptables understands it.
    pub protocol: String,
}

/// Ordered list of ACL entries.
pub type IpRuleList = Vec<IpRule>;

/// Comparison operator inside a tag clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Equal,
    NotEqual,
    KeyExists,
}

/// One term of a tag selector clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueOperator {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

/// A receiver or transmitter rule: all clause terms must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSelector {
    pub clause: Vec<KeyValueOperator>,
    pub action: PolicyAction,
}

/// Ordered list of tag selectors.
pub type TagSelectorList = Vec<TagSelector>;

/// The resolved policy for one processing unit.
///
/// Treated as immutable by every consumer. The orchestrator swaps the
/// whole value atomically on a policy version change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PuPolicy {
    /// Identifier assigned by the management plane.
    pub management_id: String,

    /// Default disposition for the PU's traffic.
    pub action: Option<PolicyAction>,

    /// ACLs applied to traffic entering the PU.
    pub ingress_acls: IpRuleList,

    /// ACLs applied to traffic leaving the PU.
    pub egress_acls: IpRuleList,

    /// Identity tags exchanged on the wire during the token handshake.
    pub identity: TagMap,

    /// Free-form annotations, not part of the identity.
    pub annotations: TagMap,

    /// Addresses the policy applies to, keyed by namespace.
    pub policy_ips: IpMap,

    /// Rules evaluated against a transmitter's identity on receive.
    pub receiver_rules: TagSelectorList,

    /// Rules evaluated against a receiver's identity on transmit.
    pub transmitter_rules: TagSelectorList,
}

impl PuPolicy {
    /// Copy of the ingress ACLs.
    #[must_use]
    pub fn ingress_acls(&self) -> IpRuleList {
        self.ingress_acls.clone()
    }

    /// Copy of the egress ACLs.
    #[must_use]
    pub fn egress_acls(&self) -> IpRuleList {
        self.egress_acls.clone()
    }

    /// Copy of the identity tags.
    #[must_use]
    pub fn identity(&self) -> TagMap {
        self.identity.clone()
    }

    /// Copy of the annotations.
    #[must_use]
    pub fn annotations(&self) -> TagMap {
        self.annotations.clone()
    }

    /// The address under the default namespace, if the policy pins one.
    #[must_use]
    pub fn default_ip_address(&self) -> Option<String> {
        self.policy_ips.get(crate::DEFAULT_NAMESPACE).cloned()
    }
}

/// A processing unit as handed to Supervisor and Enforcer: the stable
/// identifier plus the runtime observed by the monitor and the policy
/// resolved for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PuInfo {
    pub context_id: String,
    pub runtime: PuRuntime,
    pub policy: PuPolicy,
}

impl PuInfo {
    #[must_use]
    pub fn new(context_id: impl Into<String>, runtime: PuRuntime, policy: PuPolicy) -> Self {
        Self {
            context_id: context_id.into(),
            runtime,
            policy,
        }
    }
}

/// Lifecycle state of a PU context inside the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PuState {
    /// Context allocated, nothing programmed yet.
    New,
    /// Policy resolved and datapath programmed.
    Programmed,
    /// Kernel state removed, context retained.
    Stopped,
    /// Context dropped.
    Destroyed,
    /// A transition failed and was rolled back.
    Failed,
}

/// NFQUEUE layout shared between the supervisor (which steers packets)
/// and the enforcer datapath (which consumes them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQueue {
    /// Mark applied to packets the enforcer has already processed.
    pub mark_value: u32,
    /// First queue index for network-side packets.
    pub network_queue: u16,
    /// Number of network-side queues.
    pub number_of_network_queues: u16,
    /// First queue index for application-side packets.
    pub application_queue: u16,
    /// Number of application-side queues.
    pub number_of_application_queues: u16,
}

impl FilterQueue {
    /// `first:last` balance range for the application queues.
    #[must_use]
    pub fn application_balance(&self) -> String {
        balance(self.application_queue, self.number_of_application_queues)
    }

    /// `first:last` balance range for the network queues.
    #[must_use]
    pub fn network_balance(&self) -> String {
        balance(self.network_queue, self.number_of_network_queues)
    }
}

impl Default for FilterQueue {
    fn default() -> Self {
        Self {
            mark_value: 1000,
            network_queue: 4,
            number_of_network_queues: 4,
            application_queue: 0,
            number_of_application_queues: 4,
        }
    }
}

fn balance(first: u16, count: u16) -> String {
    let last = first + count.saturating_sub(1);
    format!("{first}:{last}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_balance_ranges() {
        let fq = FilterQueue::default();
        assert_eq!(fq.application_balance(), "0:3");
        assert_eq!(fq.network_balance(), "4:7");
    }

    #[test]
    fn test_policy_accessors_are_copies() {
        let mut policy = PuPolicy::default();
        policy.egress_acls.push(IpRule {
            address: "10.0.0.0/8".to_string(),
            port: "443".to_string(),
            protocol: "tcp".to_string(),
        });
        let mut copy = policy.egress_acls();
        copy.clear();
        assert_eq!(policy.egress_acls.len(), 1);
    }
}
