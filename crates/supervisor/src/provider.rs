//! # iptables Provider
//!
//! The seam between rule construction and the kernel. The shell
//! implementation drives the `iptables` binary; tests substitute a
//! recording provider.

use std::process::Command;

use thiserror::Error;
use tracing::trace;

/// Errors from the iptables backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The iptables binary is missing or not executable.
    #[error("iptables binary unavailable: {0}")]
    BinaryUnavailable(String),

    /// iptables ran and failed.
    #[error("iptables {args} failed: {message}")]
    CommandFailed { args: String, message: String },
}

/// Operations the supervisor needs from iptables.
pub trait IptablesProvider: Send + Sync {
    fn append(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<(), ProviderError>;
    fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        rulespec: &[String],
    ) -> Result<(), ProviderError>;
    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<(), ProviderError>;
    fn new_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError>;
    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError>;
    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError>;
    fn list_chains(&self, table: &str) -> Result<Vec<String>, ProviderError>;
}

/// Provider shelling out to the system `iptables` binary.
pub struct ShellIptables {
    binary: String,
}

impl ShellIptables {
    /// Provider over the `iptables` binary on PATH. Fails when the
    /// binary cannot be executed, so a missing prerequisite is caught at
    /// boot rather than at the first supervise.
    pub fn new() -> Result<Self, ProviderError> {
        let provider = Self {
            binary: "iptables".to_string(),
        };
        provider.run(&["--version".to_string()]).map_err(|e| {
            ProviderError::BinaryUnavailable(e.to_string())
        })?;
        Ok(provider)
    }

    fn run(&self, args: &[String]) -> Result<String, ProviderError> {
        trace!(binary = %self.binary, ?args, "iptables");
        let output = Command::new(&self.binary)
            .arg("-w") // wait on the xtables lock instead of failing
            .args(args)
            .output()
            .map_err(|e| ProviderError::BinaryUnavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(ProviderError::CommandFailed {
                args: args.join(" "),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_rule(
        &self,
        table: &str,
        flag: &str,
        chain_args: &[String],
        rulespec: &[String],
    ) -> Result<(), ProviderError> {
        let mut args = vec!["-t".to_string(), table.to_string(), flag.to_string()];
        args.extend_from_slice(chain_args);
        args.extend_from_slice(rulespec);
        self.run(&args).map(|_| ())
    }
}

impl IptablesProvider for ShellIptables {
    fn append(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<(), ProviderError> {
        self.run_rule(table, "-A", &[chain.to_string()], rulespec)
    }

    fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        rulespec: &[String],
    ) -> Result<(), ProviderError> {
        self.run_rule(table, "-I", &[chain.to_string(), pos.to_string()], rulespec)
    }

    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<(), ProviderError> {
        self.run_rule(table, "-D", &[chain.to_string()], rulespec)
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        self.run(&[
            "-t".to_string(),
            table.to_string(),
            "-N".to_string(),
            chain.to_string(),
        ])
        .map(|_| ())
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        self.run(&[
            "-t".to_string(),
            table.to_string(),
            "-F".to_string(),
            chain.to_string(),
        ])
        .map(|_| ())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<(), ProviderError> {
        self.run(&[
            "-t".to_string(),
            table.to_string(),
            "-X".to_string(),
            chain.to_string(),
        ])
        .map(|_| ())
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>, ProviderError> {
        let listing = self.run(&["-t".to_string(), table.to_string(), "-S".to_string()])?;
        Ok(parse_chain_names(&listing))
    }
}

/// Chain names from `iptables -S` output: builtins come as `-P <name>
/// <policy>`, user chains as `-N <name>`.
fn parse_chain_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("-P") | Some("-N") => parts.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chain_names() {
        let listing = "\
-P PREROUTING ACCEPT
-P OUTPUT ACCEPT
-N TRIREME-App-svcA-1
-A PREROUTING -s 10.0.0.5/32 -j TRIREME-App-svcA-1
-N TRIREME-Net-svcA-1
";
        let chains = parse_chain_names(listing);
        assert_eq!(
            chains,
            vec![
                "PREROUTING",
                "OUTPUT",
                "TRIREME-App-svcA-1",
                "TRIREME-Net-svcA-1"
            ]
        );
    }
}
