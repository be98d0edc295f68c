//! # Direct Supervisor
//!
//! Programs the local kernel through an [`IptablesProvider`]. Each PU
//! gets a monotonically indexed pair of chains; policy updates build the
//! next index completely before the steering rules move over, and a
//! failed installation rolls back every rule of the in-flight index.

use std::sync::Arc;

use async_trait::async_trait;
use cache::Cache;
use shared_types::{FilterQueue, PuInfo};
use tracing::{debug, info, warn};

use crate::provider::IptablesProvider;
use crate::rules::{
    app_chain_name, chain_rules, default_cache_ip, exclusion_rules, net_chain_name, trap_rules,
    RuleSpec, APP_ACK_PACKET_TABLE, APP_PACKET_SECTION, APP_PACKET_TABLE, CHAIN_PREFIX,
    NET_PACKET_SECTION, NET_PACKET_TABLE,
};
use crate::{rules, Excluder, Supervisor, SupervisorError};

/// Supervised-PU bookkeeping: the live chain index and the address the
/// steering rules were keyed on.
#[derive(Debug, Clone)]
struct VersionEntry {
    index: u32,
    ip: String,
}

/// Supervisor programming the local iptables.
pub struct IptablesSupervisor {
    ipt: Arc<dyn IptablesProvider>,
    filter_queue: FilterQueue,
    target_networks: Vec<String>,
    versions: Cache<String, VersionEntry>,
}

impl IptablesSupervisor {
    #[must_use]
    pub fn new(
        ipt: Arc<dyn IptablesProvider>,
        filter_queue: FilterQueue,
        target_networks: Vec<String>,
    ) -> Self {
        Self {
            ipt,
            filter_queue,
            target_networks,
            versions: Cache::new(),
        }
    }

    /// The address steering is keyed on: the policy's pinned address
    /// when present, else the address the monitor observed, else the
    /// catch-all network.
    fn cache_ip(pu: &PuInfo) -> String {
        match pu.policy.default_ip_address() {
            Some(ip) if !ip.is_empty() => ip,
            _ => default_cache_ip(&pu.runtime.ip_addresses()),
        }
    }

    /// Build the complete chain set for one index. On failure every
    /// piece installed so far is removed before returning.
    fn install_version(
        &self,
        context_id: &str,
        pu: &PuInfo,
        index: u32,
    ) -> Result<(), SupervisorError> {
        let app_chain = app_chain_name(context_id, index);
        let net_chain = net_chain_name(context_id, index);

        let chains = [
            (APP_PACKET_TABLE, app_chain.as_str()),
            (APP_ACK_PACKET_TABLE, app_chain.as_str()),
            (NET_PACKET_TABLE, net_chain.as_str()),
        ];

        let result = (|| {
            for (table, chain) in &chains {
                self.ipt
                    .new_chain(table, chain)
                    .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
            }

            let mut specs: Vec<RuleSpec> = Vec::new();
            for network in &self.target_networks {
                specs.extend(trap_rules(
                    &app_chain,
                    &net_chain,
                    network,
                    &self.filter_queue.application_balance(),
                    &self.filter_queue.network_balance(),
                ));
            }
            specs.extend(rules::app_acl_rules(&app_chain, &pu.policy.egress_acls));
            specs.extend(rules::net_acl_rules(&net_chain, &pu.policy.ingress_acls));

            for (table, chain, rule) in &specs {
                self.ipt
                    .append(table, chain, rule)
                    .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
            }
            Ok(())
        })();

        if result.is_err() {
            self.remove_version_chains(context_id, index);
        }
        result
    }

    /// Flush and delete both chains of an index. Best effort; chains
    /// that never got created are skipped silently by the provider
    /// errors being dropped.
    fn remove_version_chains(&self, context_id: &str, index: u32) {
        let app_chain = app_chain_name(context_id, index);
        let net_chain = net_chain_name(context_id, index);
        for (table, chain) in [
            (APP_PACKET_TABLE, app_chain.as_str()),
            (APP_ACK_PACKET_TABLE, app_chain.as_str()),
            (NET_PACKET_TABLE, net_chain.as_str()),
        ] {
            let _ = self.ipt.clear_chain(table, chain);
            let _ = self.ipt.delete_chain(table, chain);
        }
    }

    /// Install the three steering rules for an index. On failure the
    /// rules added so far are removed.
    fn add_steering(&self, context_id: &str, index: u32, ip: &str) -> Result<(), SupervisorError> {
        let specs = self.steering_specs(context_id, index, ip);
        for (at, (table, chain, rule)) in specs.iter().enumerate() {
            if let Err(e) = self.ipt.append(table, chain, rule) {
                for (table, chain, rule) in &specs[..at] {
                    let _ = self.ipt.delete(table, chain, rule);
                }
                return Err(SupervisorError::KernelProgrammingFailed(e.to_string()));
            }
        }
        Ok(())
    }

    fn delete_steering(&self, context_id: &str, index: u32, ip: &str) {
        for (table, chain, rule) in self.steering_specs(context_id, index, ip) {
            if let Err(e) = self.ipt.delete(&table, &chain, &rule) {
                debug!(context_id, error = %e, "Steering rule already gone");
            }
        }
    }

    fn steering_specs(&self, context_id: &str, index: u32, ip: &str) -> Vec<RuleSpec> {
        chain_rules(
            &app_chain_name(context_id, index),
            &net_chain_name(context_id, index),
            ip,
        )
    }

    fn create_pu(&self, context_id: &str, pu: &PuInfo, ip: String) -> Result<(), SupervisorError> {
        self.install_version(context_id, pu, 1)?;
        if let Err(e) = self.add_steering(context_id, 1, &ip) {
            self.remove_version_chains(context_id, 1);
            return Err(e);
        }
        self.versions
            .add_or_update(context_id.to_string(), VersionEntry { index: 1, ip });
        info!(context_id, "Supervised PU at index 1");
        Ok(())
    }

    fn update_pu(
        &self,
        context_id: &str,
        pu: &PuInfo,
        ip: String,
        old: &VersionEntry,
    ) -> Result<(), SupervisorError> {
        let index = old.index + 1;
        self.install_version(context_id, pu, index)?;

        // Re-point steering: every old rule goes before any new rule
        // lands, so the old and new index are never referenced at the
        // same time.
        let old_specs = self.steering_specs(context_id, old.index, &old.ip);
        let new_specs = self.steering_specs(context_id, index, &ip);
        for (table, chain, rule) in &old_specs {
            if let Err(e) = self.ipt.delete(table, chain, rule) {
                debug!(context_id, error = %e, "Old steering rule already gone");
            }
        }
        for (at, (table, chain, rule)) in new_specs.iter().enumerate() {
            if let Err(e) = self.ipt.append(table, chain, rule) {
                // Drop the new rules landed so far, restore the old set.
                for (table, chain, rule) in &new_specs[..at] {
                    let _ = self.ipt.delete(table, chain, rule);
                }
                for (table, chain, rule) in &old_specs {
                    let _ = self.ipt.append(table, chain, rule);
                }
                self.remove_version_chains(context_id, index);
                return Err(SupervisorError::KernelProgrammingFailed(e.to_string()));
            }
        }

        self.remove_version_chains(context_id, old.index);
        self.versions
            .add_or_update(context_id.to_string(), VersionEntry { index, ip });
        info!(context_id, index, "Swapped PU to new chain index");
        Ok(())
    }

    /// Flush the steering sections and remove every chain carrying our
    /// prefix. Reclaims state after an unclean shutdown.
    fn clean_all(&self) -> Result<(), SupervisorError> {
        for (table, section) in [
            (APP_PACKET_TABLE, APP_PACKET_SECTION),
            (APP_ACK_PACKET_TABLE, APP_PACKET_SECTION),
            (NET_PACKET_TABLE, NET_PACKET_SECTION),
        ] {
            if let Err(e) = self.ipt.clear_chain(table, section) {
                warn!(table, section, error = %e, "Cannot flush steering section");
            }
        }
        for table in [APP_PACKET_TABLE, APP_ACK_PACKET_TABLE, NET_PACKET_TABLE] {
            let chains = self
                .ipt
                .list_chains(table)
                .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
            for chain in chains {
                if chain.contains(CHAIN_PREFIX) {
                    let _ = self.ipt.clear_chain(table, &chain);
                    let _ = self.ipt.delete_chain(table, &chain);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Supervisor for IptablesSupervisor {
    async fn supervise(&self, context_id: &str, pu: &PuInfo) -> Result<(), SupervisorError> {
        let ip = Self::cache_ip(pu);
        match self.versions.get(&context_id.to_string()) {
            Err(_) => self.create_pu(context_id, pu, ip),
            Ok(entry) => self.update_pu(context_id, pu, ip, &entry),
        }
    }

    async fn unsupervise(&self, context_id: &str) -> Result<(), SupervisorError> {
        let Ok(entry) = self.versions.get(&context_id.to_string()) else {
            debug!(context_id, "Unsupervise for unknown context");
            return Ok(());
        };
        self.delete_steering(context_id, entry.index, &entry.ip);
        self.remove_version_chains(context_id, entry.index);
        let _ = self.versions.remove(&context_id.to_string());
        info!(context_id, "Unsupervised PU");
        Ok(())
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        self.clean_all()
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        for context_id in self.versions.keys() {
            if let Ok(entry) = self.versions.get(&context_id) {
                self.delete_steering(&context_id, entry.index, &entry.ip);
                self.remove_version_chains(&context_id, entry.index);
                let _ = self.versions.remove(&context_id);
            }
        }
        self.clean_all()
    }
}

impl Excluder for IptablesSupervisor {
    fn add_excluded_ip(&self, ip: &str) -> Result<(), SupervisorError> {
        for (table, section, rule) in exclusion_rules(ip) {
            self.ipt
                .insert(&table, &section, 1, &rule)
                .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn remove_excluded_ip(&self, ip: &str) -> Result<(), SupervisorError> {
        for (table, section, rule) in exclusion_rules(ip) {
            self.ipt
                .delete(&table, &section, &rule)
                .map_err(|e| SupervisorError::KernelProgrammingFailed(e.to_string()))?;
        }
        Ok(())
    }
}
