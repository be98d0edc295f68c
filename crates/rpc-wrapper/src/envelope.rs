//! # Wire Envelope
//!
//! One request envelope and one closed payload union for every RPC
//! surface in the control plane. The tagged union doubles as the method
//! selector: servers expose a single entry point and dispatch on the
//! variant.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use shared_types::{
    EventInfo, FilterQueue, IpMap, IpRuleList, PolicyAction, PuInfo, PuRuntime, SecretsType,
    TagMap, TagSelectorList,
};

/// The generic request envelope. `hash_auth` authenticates `payload`.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// HMAC-SHA256 over the canonical serialization of `payload`.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub hash_auth: Vec<u8>,

    /// The operation and its arguments.
    pub payload: RequestPayload,
}

/// The response to every RPC call, carrying the status of the function
/// call made on the remote end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: RpcStatus,
}

impl Response {
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: RpcStatus::Success,
        }
    }

    #[must_use]
    pub fn unauthenticated() -> Self {
        Self {
            status: RpcStatus::Unauthenticated,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::Error(message.into()),
        }
    }

    /// True when the remote handler ran and succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RpcStatus::Success
    }
}

/// Outcome of the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    /// The handler ran and succeeded.
    Success,
    /// The authenticator did not verify; the handler never ran.
    Unauthenticated,
    /// The handler ran and failed.
    Error(String),
}

/// Closed set of operations carried by the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RequestPayload {
    /// Configure a freshly launched enforcer child.
    Init(InitRequestPayload),
    /// Configure the supervisor half of an enforcer child.
    InitSupervisor(InitSupervisorPayload),
    /// Program a policy into the datapath.
    Enforce(EnforcePayload),
    /// Program kernel filters for a PU.
    Supervise(SupervisePayload),
    /// Evict a policy from the datapath.
    UnEnforce(UnEnforcePayload),
    /// Remove kernel filters for a PU.
    UnSupervise(UnSupervisePayload),
    /// Flow statistics reported by a child.
    Stats(StatsPayload),
    /// Ask a child to exit gracefully.
    EnforcerExit(EnforcerExitPayload),
    /// A monitor event from a launcher.
    HandleEvent(EventInfo),
}

impl RequestPayload {
    /// Short operation name for logging.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            RequestPayload::Init(_) => "Init",
            RequestPayload::InitSupervisor(_) => "InitSupervisor",
            RequestPayload::Enforce(_) => "Enforce",
            RequestPayload::Supervise(_) => "Supervise",
            RequestPayload::UnEnforce(_) => "UnEnforce",
            RequestPayload::UnSupervise(_) => "UnSupervise",
            RequestPayload::Stats(_) => "Stats",
            RequestPayload::EnforcerExit(_) => "EnforcerExit",
            RequestPayload::HandleEvent(_) => "HandleEvent",
        }
    }
}

/// Queue configuration and secret material for a new enforcer child.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequestPayload {
    pub filter_queue: FilterQueue,
    pub mutual_auth: bool,
    /// Token validity in seconds.
    pub validity_secs: u64,
    pub secret_type: SecretsType,
    pub context_id: String,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub ca_pem: Vec<u8>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub public_pem: Vec<u8>,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub private_pem: Vec<u8>,
}

/// Queue identifiers and target networks for a child supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSupervisorPayload {
    pub network_queues: String,
    pub application_queues: String,
    pub target_networks: Vec<String>,
}

/// Arguments of an `Enforce` call: the policy, flattened, plus the
/// runtime the child needs to reconstruct the PU locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcePayload {
    pub context_id: String,
    pub management_id: String,
    pub action: Option<PolicyAction>,
    pub ingress_acls: IpRuleList,
    pub egress_acls: IpRuleList,
    pub identity: TagMap,
    pub annotations: TagMap,
    pub policy_ips: IpMap,
    pub receiver_rules: TagSelectorList,
    pub transmitter_rules: TagSelectorList,
    pub runtime: PuRuntime,
}

impl EnforcePayload {
    #[must_use]
    pub fn from_pu(pu: &PuInfo) -> Self {
        Self {
            context_id: pu.context_id.clone(),
            management_id: pu.policy.management_id.clone(),
            action: pu.policy.action,
            ingress_acls: pu.policy.ingress_acls(),
            egress_acls: pu.policy.egress_acls(),
            identity: pu.policy.identity(),
            annotations: pu.policy.annotations(),
            policy_ips: pu.policy.policy_ips.clone(),
            receiver_rules: pu.policy.receiver_rules.clone(),
            transmitter_rules: pu.policy.transmitter_rules.clone(),
            runtime: pu.runtime.clone(),
        }
    }

    /// Rebuild the `PuInfo` on the serving side.
    #[must_use]
    pub fn into_pu(self) -> PuInfo {
        let policy = shared_types::PuPolicy {
            management_id: self.management_id,
            action: self.action,
            ingress_acls: self.ingress_acls,
            egress_acls: self.egress_acls,
            identity: self.identity,
            annotations: self.annotations,
            policy_ips: self.policy_ips,
            receiver_rules: self.receiver_rules,
            transmitter_rules: self.transmitter_rules,
        };
        PuInfo::new(self.context_id.clone(), self.runtime, policy)
    }
}

/// Arguments of a `Supervise` call. Same shape as `Enforce`, addressed
/// to the supervisor half of the child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisePayload {
    pub context_id: String,
    pub management_id: String,
    pub action: Option<PolicyAction>,
    pub ingress_acls: IpRuleList,
    pub egress_acls: IpRuleList,
    pub identity: TagMap,
    pub annotations: TagMap,
    pub policy_ips: IpMap,
    pub receiver_rules: TagSelectorList,
    pub transmitter_rules: TagSelectorList,
    pub runtime: PuRuntime,
}

impl SupervisePayload {
    #[must_use]
    pub fn from_pu(pu: &PuInfo) -> Self {
        let e = EnforcePayload::from_pu(pu);
        Self {
            context_id: e.context_id,
            management_id: e.management_id,
            action: e.action,
            ingress_acls: e.ingress_acls,
            egress_acls: e.egress_acls,
            identity: e.identity,
            annotations: e.annotations,
            policy_ips: e.policy_ips,
            receiver_rules: e.receiver_rules,
            transmitter_rules: e.transmitter_rules,
            runtime: e.runtime,
        }
    }

    /// Rebuild the `PuInfo` on the serving side.
    #[must_use]
    pub fn into_pu(self) -> PuInfo {
        let policy = shared_types::PuPolicy {
            management_id: self.management_id,
            action: self.action,
            ingress_acls: self.ingress_acls,
            egress_acls: self.egress_acls,
            identity: self.identity,
            annotations: self.annotations,
            policy_ips: self.policy_ips,
            receiver_rules: self.receiver_rules,
            transmitter_rules: self.transmitter_rules,
        };
        PuInfo::new(self.context_id.clone(), self.runtime, policy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnEnforcePayload {
    pub context_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnSupervisePayload {
    pub context_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerExitPayload {
    pub pid: u32,
}

/// One observed flow, as reported by a child datapath.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub context_id: String,
    pub source_ip: String,
    pub destination_ip: String,
    pub action: PolicyAction,
}

/// Flow statistics batch from a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsPayload {
    pub num_flows: u32,
    pub flows: Vec<FlowRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::PuPolicy;

    #[test]
    fn test_payload_tagging() {
        let payload = RequestPayload::UnEnforce(UnEnforcePayload {
            context_id: "svcA".to_string(),
        });
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"method\":\"UnEnforce\""), "{json}");
        assert!(json.contains("\"context_id\":\"svcA\""), "{json}");
    }

    #[test]
    fn test_enforce_payload_roundtrip() {
        let mut policy = PuPolicy::default();
        policy
            .policy_ips
            .insert(String::new(), "10.0.0.5".to_string());
        let pu = PuInfo::new("svcA", shared_types::PuRuntime::default(), policy);
        let payload = EnforcePayload::from_pu(&pu);
        let back = payload.into_pu();
        assert_eq!(back.context_id, "svcA");
        assert_eq!(
            back.policy.default_ip_address().as_deref(),
            Some("10.0.0.5")
        );
    }
}
