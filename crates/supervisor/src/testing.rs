//! # Test Provider
//!
//! An in-memory iptables model for tests: tracks tables, chains and
//! rules, enforces the semantics the supervisor relies on (no deleting
//! referenced or non-empty chains, no duplicate chains) and records a
//! snapshot of the referenced per-PU chains after every mutation so
//! tests can assert the atomic-swap property over time.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::provider::{IptablesProvider, ProviderError};
use crate::rules::{
    APP_ACK_PACKET_TABLE, APP_PACKET_SECTION, APP_PACKET_TABLE, CHAIN_PREFIX, NET_PACKET_SECTION,
    NET_PACKET_TABLE,
};

type ChainKey = (String, String);

#[derive(Default)]
struct FakeState {
    chains: HashMap<ChainKey, Vec<Vec<String>>>,
    /// Jump targets with our prefix visible from the built-in sections,
    /// snapshotted after every mutation.
    reference_history: Vec<BTreeSet<String>>,
    fail_on: Option<String>,
}

/// In-memory stand-in for the kernel iptables state.
pub struct FakeIptables {
    state: Mutex<FakeState>,
}

impl FakeIptables {
    #[must_use]
    pub fn new() -> Self {
        let fake = Self {
            state: Mutex::new(FakeState::default()),
        };
        // Built-in sections exist from the start.
        {
            let mut state = fake.state.lock();
            for (table, section) in builtin_sections() {
                state.chains.insert((table, section), Vec::new());
            }
        }
        fake
    }

    /// Make every operation whose description contains `needle` fail.
    pub fn fail_on(&self, needle: impl Into<String>) {
        self.state.lock().fail_on = Some(needle.into());
    }

    /// Stop injecting failures.
    pub fn fail_off(&self) {
        self.state.lock().fail_on = None;
    }

    /// Seed a user chain directly, simulating leftovers from a prior
    /// run.
    pub fn seed_chain(&self, table: &str, chain: &str) {
        self.state
            .lock()
            .chains
            .insert((table.to_string(), chain.to_string()), Vec::new());
    }

    /// Current rules of a chain, empty when absent.
    #[must_use]
    pub fn rules_of(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a chain exists in a table.
    #[must_use]
    pub fn chain_exists(&self, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .chains
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    /// All chains across tables whose name carries our prefix.
    #[must_use]
    pub fn prefixed_chains(&self) -> Vec<String> {
        self.state
            .lock()
            .chains
            .keys()
            .filter(|(_, chain)| chain.contains(CHAIN_PREFIX))
            .map(|(_, chain)| chain.clone())
            .collect()
    }

    /// Snapshots of the prefixed jump targets seen from the built-in
    /// sections, one per mutation.
    #[must_use]
    pub fn reference_history(&self) -> Vec<BTreeSet<String>> {
        self.state.lock().reference_history.clone()
    }

    fn mutate<F>(&self, description: String, op: F) -> Result<(), ProviderError>
    where
        F: FnOnce(&mut FakeState) -> Result<(), ProviderError>,
    {
        let mut state = self.state.lock();
        if let Some(needle) = &state.fail_on {
            if description.contains(needle.as_str()) {
                return Err(ProviderError::CommandFailed {
                    args: description,
                    message: "injected failure".to_string(),
                });
            }
        }
        op(&mut state)?;
        let references = referenced_targets(&state);
        state.reference_history.push(references);
        Ok(())
    }
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl IptablesProvider for FakeIptables {
    fn append(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<(), ProviderError> {
        let key = (table.to_string(), chain.to_string());
        self.mutate(format!("-A {table} {chain} {}", rulespec.join(" ")), |s| {
            s.chains
                .get_mut(&key)
                .ok_or_else(|| no_such_chain(table, chain))?
                .push(rulespec.to_vec());
            Ok(())
        })
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        rulespec: &[String],
    ) -> Result<(), ProviderError> {
        let key = (table.to_string(), chain.to_string());
        self.mutate(format!("-I {table} {chain} {pos}"), |s| {
            let rules = s
                .chains
                .get_mut(&key)
                .ok_or_else(|| no_such_chain(table, chain))?;
            let at = (pos.saturating_sub(1) as usize).min(rules.len());
            rules.insert(at, rulespec.to_vec());
            Ok(())
        })
    }

    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<(), ProviderError> {
        let key = (table.to_string(), chain.to_string());
        self.mutate(format!("-D {table} {chain} {}", rulespec.join(" ")), |s| {
            let rules = s
                .chains
                .get_mut(&key)
                .ok_or_else(|| no_such_chain(table, chain))?;
            let at = rules.iter().position(|r| r.as_slice() == rulespec).ok_or_else(|| {
                ProviderError::CommandFailed {
                    args: format!("-D {table} {chain}"),
                    message: "no matching rule".to_string(),
                }
            })?;
            rules.remove(at);
            Ok(())
        })
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        let key = (table.to_string(), chain.to_string());
        self.mutate(format!("-N {table} {chain}"), |s| {
            if s.chains.contains_key(&key) {
                return Err(ProviderError::CommandFailed {
                    args: format!("-N {table} {chain}"),
                    message: "chain already exists".to_string(),
                });
            }
            s.chains.insert(key.clone(), Vec::new());
            Ok(())
        })
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        let key = (table.to_string(), chain.to_string());
        self.mutate(format!("-F {table} {chain}"), |s| {
            s.chains
                .get_mut(&key)
                .ok_or_else(|| no_such_chain(table, chain))?
                .clear();
            Ok(())
        })
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        let key = (table.to_string(), chain.to_string());
        self.mutate(format!("-X {table} {chain}"), |s| {
            let rules = s.chains.get(&key).ok_or_else(|| no_such_chain(table, chain))?;
            if !rules.is_empty() {
                return Err(ProviderError::CommandFailed {
                    args: format!("-X {table} {chain}"),
                    message: "chain not empty".to_string(),
                });
            }
            let referenced = s
                .chains
                .iter()
                .filter(|((t, _), _)| t == table)
                .flat_map(|(_, rules)| rules.iter())
                .any(|rule| jump_target(rule) == Some(chain));
            if referenced {
                return Err(ProviderError::CommandFailed {
                    args: format!("-X {table} {chain}"),
                    message: "chain is referenced".to_string(),
                });
            }
            s.chains.remove(&key);
            Ok(())
        })
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .state
            .lock()
            .chains
            .keys()
            .filter(|(t, _)| t == table)
            .map(|(_, chain)| chain.clone())
            .collect())
    }
}

fn builtin_sections() -> Vec<(String, String)> {
    vec![
        (APP_PACKET_TABLE.to_string(), APP_PACKET_SECTION.to_string()),
        (
            APP_ACK_PACKET_TABLE.to_string(),
            APP_PACKET_SECTION.to_string(),
        ),
        (NET_PACKET_TABLE.to_string(), NET_PACKET_SECTION.to_string()),
    ]
}

fn no_such_chain(table: &str, chain: &str) -> ProviderError {
    ProviderError::CommandFailed {
        args: format!("{table} {chain}"),
        message: "no chain/target/match by that name".to_string(),
    }
}

fn jump_target(rule: &[String]) -> Option<&str> {
    rule.iter()
        .position(|p| p == "-j")
        .and_then(|at| rule.get(at + 1))
        .map(String::as_str)
}

fn referenced_targets(state: &FakeState) -> BTreeSet<String> {
    let sections = builtin_sections();
    state
        .chains
        .iter()
        .filter(|(key, _)| sections.contains(key))
        .flat_map(|(_, rules)| rules.iter())
        .filter_map(|rule| jump_target(rule))
        .filter(|target| target.contains(CHAIN_PREFIX))
        .map(str::to_string)
        .collect()
}
