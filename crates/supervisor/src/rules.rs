//! # Rule Construction
//!
//! Chain naming and the rule sets the supervisor installs: steering
//! rules in the built-in sections, NFQUEUE trap rules inside the per-PU
//! chains, policy ACLs and exclusion bypasses.

use shared_types::{IpMap, IpRuleList, DEFAULT_NAMESPACE};

/// Prefix identifying every chain this supervisor owns.
pub const CHAIN_PREFIX: &str = "TRIREME-";

/// Table and section carrying application-side first packets.
pub const APP_PACKET_TABLE: &str = "raw";
/// Table carrying application-side acks and everything after.
pub const APP_ACK_PACKET_TABLE: &str = "mangle";
/// Section the application steering rules live in.
pub const APP_PACKET_SECTION: &str = "PREROUTING";
/// Table carrying network-side packets.
pub const NET_PACKET_TABLE: &str = "mangle";
/// Section the network steering rules live in.
pub const NET_PACKET_SECTION: &str = "POSTROUTING";

/// One rule to be installed: table, chain, rulespec.
pub type RuleSpec = (String, String, Vec<String>);

/// Application chain name for a context and version index.
#[must_use]
pub fn app_chain_name(context_id: &str, index: u32) -> String {
    format!("{CHAIN_PREFIX}App-{context_id}-{index}")
}

/// Network chain name for a context and version index.
#[must_use]
pub fn net_chain_name(context_id: &str, index: u32) -> String {
    format!("{CHAIN_PREFIX}Net-{context_id}-{index}")
}

/// The address rules are keyed on: the default-namespace entry when one
/// exists, otherwise the catch-all network. PUs created before their
/// address is known are steered on the catch-all until the update with
/// the real address arrives.
#[must_use]
pub fn default_cache_ip(ips: &IpMap) -> String {
    ips.get(DEFAULT_NAMESPACE)
        .filter(|ip| !ip.is_empty())
        .cloned()
        .unwrap_or_else(|| "0.0.0.0/0".to_string())
}

fn comment() -> Vec<String> {
    svec(&["-m", "comment", "--comment", "Container specific chain"])
}

/// The three steering rules pointing a PU's traffic at its chains.
#[must_use]
pub fn chain_rules(app_chain: &str, net_chain: &str, ip: &str) -> Vec<RuleSpec> {
    let mut app = svec(&["-s", ip]);
    app.extend(comment());
    app.extend(svec(&["-j", app_chain]));

    let mut app_ack = svec(&["-s", ip, "-p", "tcp"]);
    app_ack.extend(comment());
    app_ack.extend(svec(&["-j", app_chain]));

    let mut net = svec(&["-d", ip]);
    net.extend(comment());
    net.extend(svec(&["-j", net_chain]));

    vec![
        (
            APP_PACKET_TABLE.to_string(),
            APP_PACKET_SECTION.to_string(),
            app,
        ),
        (
            APP_ACK_PACKET_TABLE.to_string(),
            APP_PACKET_SECTION.to_string(),
            app_ack,
        ),
        (
            NET_PACKET_TABLE.to_string(),
            NET_PACKET_SECTION.to_string(),
            net,
        ),
    ]
}

/// The NFQUEUE trap rules inside a PU's chains for one target network:
/// application SYN and SYN/ACK, application post-handshake packets, and
/// the network side mirror.
#[must_use]
pub fn trap_rules(
    app_chain: &str,
    net_chain: &str,
    network: &str,
    app_queue: &str,
    net_queue: &str,
) -> Vec<RuleSpec> {
    vec![
        // Application Syn and Syn/Ack
        (
            APP_PACKET_TABLE.to_string(),
            app_chain.to_string(),
            svec(&[
                "-d", network, "-p", "tcp", "--tcp-flags", "FIN,SYN,RST,PSH,URG", "SYN", "-j",
                "NFQUEUE", "--queue-balance", app_queue,
            ]),
        ),
        // Application everything else, first three packets of a flow
        (
            APP_ACK_PACKET_TABLE.to_string(),
            app_chain.to_string(),
            svec(&[
                "-d", network, "-p", "tcp", "--tcp-flags", "SYN,ACK", "ACK", "-m", "connbytes",
                "--connbytes", ":3", "--connbytes-dir", "original", "--connbytes-mode", "packets",
                "-j", "NFQUEUE", "--queue-balance", app_queue,
            ]),
        ),
        // Network side rules
        (
            NET_PACKET_TABLE.to_string(),
            net_chain.to_string(),
            svec(&[
                "-s", network, "-p", "tcp", "-m", "connbytes", "--connbytes", ":3",
                "--connbytes-dir", "original", "--connbytes-mode", "packets", "-j", "NFQUEUE",
                "--queue-balance", net_queue,
            ]),
        ),
    ]
}

/// ACL rules for traffic leaving the PU, appended after the traps, plus
/// the trailing default drop for new flows.
#[must_use]
pub fn app_acl_rules(app_chain: &str, acls: &IpRuleList) -> Vec<RuleSpec> {
    let mut specs: Vec<RuleSpec> = acls
        .iter()
        .map(|rule| {
            (
                APP_ACK_PACKET_TABLE.to_string(),
                app_chain.to_string(),
                svec(&[
                    "-p",
                    rule.protocol.as_str(),
                    "-d",
                    rule.address.as_str(),
                    "--dport",
                    rule.port.as_str(),
                    "-j",
                    "ACCEPT",
                ]),
            )
        })
        .collect();
    specs.push((
        APP_ACK_PACKET_TABLE.to_string(),
        app_chain.to_string(),
        svec(&[
            "-d", "0.0.0.0/0", "-p", "tcp", "-m", "state", "--state", "NEW", "-j", "DROP",
        ]),
    ));
    specs
}

/// ACL rules for traffic entering the PU, same shape on the network
/// chain.
#[must_use]
pub fn net_acl_rules(net_chain: &str, acls: &IpRuleList) -> Vec<RuleSpec> {
    let mut specs: Vec<RuleSpec> = acls
        .iter()
        .map(|rule| {
            (
                NET_PACKET_TABLE.to_string(),
                net_chain.to_string(),
                svec(&[
                    "-p",
                    rule.protocol.as_str(),
                    "-s",
                    rule.address.as_str(),
                    "--dport",
                    rule.port.as_str(),
                    "-j",
                    "ACCEPT",
                ]),
            )
        })
        .collect();
    specs.push((
        NET_PACKET_TABLE.to_string(),
        net_chain.to_string(),
        svec(&[
            "-s", "0.0.0.0/0", "-p", "tcp", "-m", "state", "--state", "NEW", "-j", "DROP",
        ]),
    ));
    specs
}

/// Bypass rules for an excluded address, inserted ahead of the steering
/// rules in every section.
#[must_use]
pub fn exclusion_rules(ip: &str) -> Vec<RuleSpec> {
    vec![
        (
            APP_PACKET_TABLE.to_string(),
            APP_PACKET_SECTION.to_string(),
            svec(&["-s", ip, "-j", "ACCEPT"]),
        ),
        (
            APP_ACK_PACKET_TABLE.to_string(),
            APP_PACKET_SECTION.to_string(),
            svec(&["-s", ip, "-j", "ACCEPT"]),
        ),
        (
            NET_PACKET_TABLE.to_string(),
            NET_PACKET_SECTION.to_string(),
            svec(&["-d", ip, "-j", "ACCEPT"]),
        ),
    ]
}

fn svec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::IpRule;

    #[test]
    fn test_chain_names() {
        assert_eq!(app_chain_name("somecontext", 345), "TRIREME-App-somecontext-345");
        assert_eq!(
            net_chain_name("somecontext", 12_321_312),
            "TRIREME-Net-somecontext-12321312"
        );
    }

    #[test]
    fn test_default_cache_ip() {
        assert_eq!(default_cache_ip(&IpMap::new()), "0.0.0.0/0");

        let mut ips = IpMap::new();
        ips.insert(DEFAULT_NAMESPACE.to_string(), "172.0.0.1".to_string());
        ips.insert("otherspace".to_string(), "10.10.10.10".to_string());
        assert_eq!(default_cache_ip(&ips), "172.0.0.1");
    }

    #[test]
    fn test_chain_rules_shape() {
        let rules = chain_rules("appChain", "netChain", "10.10.10.10");
        let expected: Vec<RuleSpec> = vec![
            (
                "raw".to_string(),
                "PREROUTING".to_string(),
                svec(&[
                    "-s", "10.10.10.10", "-m", "comment", "--comment",
                    "Container specific chain", "-j", "appChain",
                ]),
            ),
            (
                "mangle".to_string(),
                "PREROUTING".to_string(),
                svec(&[
                    "-s", "10.10.10.10", "-p", "tcp", "-m", "comment", "--comment",
                    "Container specific chain", "-j", "appChain",
                ]),
            ),
            (
                "mangle".to_string(),
                "POSTROUTING".to_string(),
                svec(&[
                    "-d", "10.10.10.10", "-m", "comment", "--comment",
                    "Container specific chain", "-j", "netChain",
                ]),
            ),
        ];
        assert_eq!(rules, expected);
    }

    #[test]
    fn test_trap_rules_shape() {
        let rules = trap_rules("appChain", "netChain", "10.10.10.10/32", "0:3", "4:7");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].0, "raw");
        assert_eq!(rules[0].1, "appChain");
        assert!(rules[0].2.contains(&"SYN".to_string()));
        assert!(rules[0].2.ends_with(&svec(&["--queue-balance", "0:3"])));
        assert!(rules[1].2.contains(&"connbytes".to_string()));
        assert_eq!(rules[2].0, "mangle");
        assert_eq!(rules[2].1, "netChain");
        assert!(rules[2].2.ends_with(&svec(&["--queue-balance", "4:7"])));
    }

    #[test]
    fn test_acl_rules_end_with_default_drop() {
        let acls = vec![IpRule {
            address: "192.30.253.0/24".to_string(),
            port: "80".to_string(),
            protocol: "tcp".to_string(),
        }];
        let app = app_acl_rules("appChain", &acls);
        assert_eq!(app.len(), 2);
        assert!(app[0].2.ends_with(&svec(&["-j", "ACCEPT"])));
        assert!(app[1].2.ends_with(&svec(&["-j", "DROP"])));

        let net = net_acl_rules("netChain", &acls);
        assert_eq!(net.len(), 2);
        assert!(net[0].2.contains(&"-s".to_string()));
        assert!(net[1].2.ends_with(&svec(&["-j", "DROP"])));
    }
}
