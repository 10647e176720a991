//! NAT programming for the guest subnet.
//!
//! Enables IPv4 forwarding, detects the external interface from the default
//! route, and installs masquerade plus forwarding rules. nftables is
//! preferred (one owned table, deleted whole on teardown); when the `nft`
//! binary is unavailable an equivalent fixed list of iptables rules is
//! installed instead, removed one by one ignoring "not exists".

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{NetworkError, NetworkResult};

const NFT_TABLE: &str = "hyperfleet";
const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Which rule engine ended up programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatBackend {
    Nftables,
    Iptables,
}

#[derive(Debug)]
pub struct NatManager {
    subnet: String,
    external_iface: String,
    backend: NatBackend,
}

/// Parse the external interface out of `/proc/net/route` content: the entry
/// with an all-zero destination is the default route.
pub fn parse_default_route(route_table: &str) -> Option<String> {
    for line in route_table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        if destination == "00000000" {
            return Some(iface.to_string());
        }
    }
    None
}

/// nft command lines (minus the leading binary) for setup.
pub fn nft_setup_commands(subnet: &str, external_iface: &str) -> Vec<Vec<String>> {
    let table = format!("ip {}", NFT_TABLE);
    vec![
        split(&format!("add table {}", table)),
        vec![
            "add".into(),
            "chain".into(),
            "ip".into(),
            NFT_TABLE.into(),
            "postrouting".into(),
            "{ type nat hook postrouting priority srcnat; policy accept; }".into(),
        ],
        split(&format!(
            "add rule {} postrouting ip saddr {} oifname {} masquerade",
            table, subnet, external_iface
        )),
        vec![
            "add".into(),
            "chain".into(),
            "ip".into(),
            NFT_TABLE.into(),
            "forward".into(),
            "{ type filter hook forward priority filter; policy accept; }".into(),
        ],
        split(&format!(
            "add rule {} forward ct state established,related accept",
            table
        )),
        split(&format!(
            "add rule {} forward ip saddr {} oifname {} accept",
            table, subnet, external_iface
        )),
        split(&format!(
            "add rule {} forward ip daddr {} iifname {} accept",
            table, subnet, external_iface
        )),
    ]
}

/// The iptables fallback rule set, as argument lists minus the binary.
pub fn iptables_rules(subnet: &str, external_iface: &str) -> Vec<Vec<String>> {
    vec![
        split(&format!(
            "-t nat -A POSTROUTING -s {} -o {} -j MASQUERADE",
            subnet, external_iface
        )),
        split("-A FORWARD -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT"),
        split(&format!(
            "-A FORWARD -s {} -o {} -j ACCEPT",
            subnet, external_iface
        )),
        split(&format!(
            "-A FORWARD -d {} -i {} -j ACCEPT",
            subnet, external_iface
        )),
    ]
}

fn split(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

async fn run(binary: &str, args: &[String]) -> NetworkResult<()> {
    debug!(binary, ?args, "Programming NAT rule");
    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| NetworkError::Nat(format!("failed to run {}: {}", binary, e)))?;

    if !output.status.success() {
        return Err(NetworkError::Nat(format!(
            "{} {} failed: {}",
            binary,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

impl NatManager {
    /// Enable forwarding, detect the external interface and program rules.
    pub async fn init(subnet: String) -> NetworkResult<Self> {
        std::fs::write(IP_FORWARD_PATH, "1")
            .map_err(|e| NetworkError::Nat(format!("enabling ip_forward: {}", e)))?;

        let route_table = std::fs::read_to_string("/proc/net/route")
            .map_err(|e| NetworkError::Nat(format!("reading route table: {}", e)))?;
        let external_iface = parse_default_route(&route_table)
            .ok_or_else(|| NetworkError::Nat("no default route found".into()))?;

        info!(subnet = %subnet, external = %external_iface, "Programming NAT");

        // Prefer nftables; fall back to iptables when nft is unusable
        let backend = match Self::setup_nft(&subnet, &external_iface).await {
            Ok(()) => NatBackend::Nftables,
            Err(e) => {
                warn!(error = %e, "nftables setup failed, falling back to iptables");
                Self::setup_iptables(&subnet, &external_iface).await?;
                NatBackend::Iptables
            }
        };

        Ok(Self {
            subnet,
            external_iface,
            backend,
        })
    }

    async fn setup_nft(subnet: &str, external_iface: &str) -> NetworkResult<()> {
        // Remove any half-programmed table from a previous run first
        run("nft", &split(&format!("delete table ip {}", NFT_TABLE)))
            .await
            .ok();

        for command in nft_setup_commands(subnet, external_iface) {
            run("nft", &command).await?;
        }
        Ok(())
    }

    async fn setup_iptables(subnet: &str, external_iface: &str) -> NetworkResult<()> {
        for rule in iptables_rules(subnet, external_iface) {
            run("iptables", &rule).await?;
        }
        Ok(())
    }

    pub fn backend(&self) -> NatBackend {
        self.backend
    }

    pub fn external_interface(&self) -> &str {
        &self.external_iface
    }

    /// Remove everything this manager installed. Idempotent: missing rules
    /// and a missing table are fine.
    pub async fn teardown(&self) {
        match self.backend {
            NatBackend::Nftables => {
                run("nft", &split(&format!("delete table ip {}", NFT_TABLE)))
                    .await
                    .ok();
            }
            NatBackend::Iptables => {
                for rule in iptables_rules(&self.subnet, &self.external_iface) {
                    // -A becomes -D; "does not exist" errors are ignored
                    let delete: Vec<String> = rule
                        .iter()
                        .map(|a| if a == "-A" { "-D".to_string() } else { a.clone() })
                        .collect();
                    run("iptables", &delete).await.ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_route() {
        let table = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
                     eth0\t00000000\t010010AC\t0003\t0\t0\t0\t00000000\n\
                     eth0\t000010AC\t00000000\t0001\t0\t0\t0\t00F0FFFF\n";
        assert_eq!(parse_default_route(table), Some("eth0".to_string()));
    }

    #[test]
    fn test_parse_default_route_prefers_default() {
        let table = "Iface\tDestination\tGateway\n\
                     docker0\t000011AC\t00000000\n\
                     wlan0\t00000000\t0100A8C0\n";
        assert_eq!(parse_default_route(table), Some("wlan0".to_string()));
        assert_eq!(parse_default_route("Iface\tDestination\n"), None);
    }

    #[test]
    fn test_nft_commands_shape() {
        let commands = nft_setup_commands("172.16.0.0/24", "eth0");
        assert_eq!(commands.len(), 7);
        assert_eq!(commands[0], vec!["add", "table", "ip", "hyperfleet"]);

        let masquerade = commands[2].join(" ");
        assert!(masquerade.contains("ip saddr 172.16.0.0/24"));
        assert!(masquerade.contains("oifname eth0"));
        assert!(masquerade.ends_with("masquerade"));

        let established = commands[4].join(" ");
        assert!(established.contains("ct state established,related accept"));
    }

    #[test]
    fn test_iptables_rules_shape() {
        let rules = iptables_rules("172.16.0.0/24", "eth0");
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0].join(" "),
            "-t nat -A POSTROUTING -s 172.16.0.0/24 -o eth0 -j MASQUERADE"
        );
        assert!(rules[1].join(" ").contains("ESTABLISHED,RELATED"));
        assert!(rules[2].join(" ").contains("-o eth0"));
        assert!(rules[3].join(" ").contains("-i eth0"));
    }
}
