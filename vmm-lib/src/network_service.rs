// SPDX-License-Identifier: GPL-2.0-only

use crate::config::NetworkConfig;
use crate::tool::{self, ToolError};
use crate::vm::Protocol;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// Errors from network service operations.
#[derive(Debug)]
pub enum NetworkError {
    /// Subnet or gateway in the configuration cannot be used
    InvalidConfig(String),
    /// The ordinal maps to an address outside the usable subnet range
    AddressSpaceExhausted { index: usize, subnet: String },
    /// A host networking tool failed
    Tool(ToolError),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::InvalidConfig(e) => write!(f, "invalid network config: {e}"),
            NetworkError::AddressSpaceExhausted { index, subnet } => {
                write!(f, "no address for VM #{index}: subnet {subnet} is exhausted")
            }
            NetworkError::Tool(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<ToolError> for NetworkError {
    fn from(e: ToolError) -> Self {
        NetworkError::Tool(e)
    }
}

/// A firewall rule the manager owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FirewallRule {
    /// Source-NAT guest traffic leaving through the uplink.
    Masquerade { subnet: String, out_interface: String },
    /// Allow bridge -> uplink forwarding.
    ForwardOut { bridge: String, out_interface: String },
    /// Allow established return traffic uplink -> bridge.
    ForwardReturn { bridge: String, in_interface: String },
    /// Destination-NAT a host port to a guest.
    PortForward {
        host_port: u16,
        guest_port: u16,
        guest_ip: Ipv4Addr,
        protocol: Protocol,
    },
}

impl FirewallRule {
    /// `(table, chain, rule spec)` in iptables syntax.
    pub fn iptables_spec(&self) -> (&'static str, &'static str, Vec<String>) {
        let s = |v: &str| v.to_string();
        match self {
            FirewallRule::Masquerade { subnet, out_interface } => (
                "nat",
                "POSTROUTING",
                vec![s("-s"), subnet.clone(), s("-o"), out_interface.clone(), s("-j"), s("MASQUERADE")],
            ),
            FirewallRule::ForwardOut { bridge, out_interface } => (
                "filter",
                "FORWARD",
                vec![s("-i"), bridge.clone(), s("-o"), out_interface.clone(), s("-j"), s("ACCEPT")],
            ),
            FirewallRule::ForwardReturn { bridge, in_interface } => (
                "filter",
                "FORWARD",
                vec![
                    s("-i"),
                    in_interface.clone(),
                    s("-o"),
                    bridge.clone(),
                    s("-m"),
                    s("conntrack"),
                    s("--ctstate"),
                    s("RELATED,ESTABLISHED"),
                    s("-j"),
                    s("ACCEPT"),
                ],
            ),
            FirewallRule::PortForward {
                host_port,
                guest_port,
                guest_ip,
                protocol,
            } => (
                "nat",
                "PREROUTING",
                vec![
                    s("-p"),
                    s(protocol.as_str()),
                    s("--dport"),
                    host_port.to_string(),
                    s("-j"),
                    s("DNAT"),
                    s("--to-destination"),
                    format!("{guest_ip}:{guest_port}"),
                ],
            ),
        }
    }
}

/// Host network device and firewall operations.
///
/// The shell implementation drives `ip`, `sysctl`, and `iptables`; tests use
/// an in-process fake.
pub trait NetworkDeviceController: Send + Sync {
    fn link_exists(&self, name: &str) -> Result<bool, NetworkError>;
    /// Create a bridge and assign `address` (CIDR notation) to it.
    fn create_bridge(&self, name: &str, address: &str) -> Result<(), NetworkError>;
    fn create_tap(&self, name: &str) -> Result<(), NetworkError>;
    fn set_master(&self, name: &str, bridge: &str) -> Result<(), NetworkError>;
    fn set_up(&self, name: &str) -> Result<(), NetworkError>;
    fn delete_link(&self, name: &str) -> Result<(), NetworkError>;
    fn enable_ip_forwarding(&self) -> Result<(), NetworkError>;
    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool, NetworkError>;
    fn append_rule(&self, rule: &FirewallRule) -> Result<(), NetworkError>;
    fn delete_rule(&self, rule: &FirewallRule) -> Result<(), NetworkError>;
}

/// `ip` / `sysctl` / `iptables` backed controller. Requires CAP_NET_ADMIN.
#[derive(Debug, Default, Clone)]
pub struct IpCommandController;

impl NetworkDeviceController for IpCommandController {
    fn link_exists(&self, name: &str) -> Result<bool, NetworkError> {
        Ok(tool::probe("ip", ["link", "show", name])?)
    }

    fn create_bridge(&self, name: &str, address: &str) -> Result<(), NetworkError> {
        tool::run("ip", ["link", "add", "name", name, "type", "bridge"])?;
        if let Err(e) = tool::run("ip", ["addr", "add", address, "dev", name]) {
            // Address already assigned
            if !e.mentions("File exists") {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn create_tap(&self, name: &str) -> Result<(), NetworkError> {
        tool::run("ip", ["tuntap", "add", "dev", name, "mode", "tap"])?;
        Ok(())
    }

    fn set_master(&self, name: &str, bridge: &str) -> Result<(), NetworkError> {
        tool::run("ip", ["link", "set", name, "master", bridge])?;
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<(), NetworkError> {
        tool::run("ip", ["link", "set", name, "up"])?;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<(), NetworkError> {
        if let Err(e) = tool::run("ip", ["link", "delete", name]) {
            if !e.mentions("Cannot find device") {
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<(), NetworkError> {
        tool::run("sysctl", ["-w", "net.ipv4.ip_forward=1"])?;
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool, NetworkError> {
        let (table, chain, spec) = rule.iptables_spec();
        let mut args = vec!["-t".to_string(), table.to_string(), "-C".to_string(), chain.to_string()];
        args.extend(spec);
        Ok(tool::probe("iptables", &args)?)
    }

    fn append_rule(&self, rule: &FirewallRule) -> Result<(), NetworkError> {
        let (table, chain, spec) = rule.iptables_spec();
        let mut args = vec!["-t".to_string(), table.to_string(), "-A".to_string(), chain.to_string()];
        args.extend(spec);
        tool::run("iptables", &args)?;
        Ok(())
    }

    fn delete_rule(&self, rule: &FirewallRule) -> Result<(), NetworkError> {
        let (table, chain, spec) = rule.iptables_spec();
        let mut args = vec!["-t".to_string(), table.to_string(), "-D".to_string(), chain.to_string()];
        args.extend(spec);
        tool::run("iptables", &args)?;
        Ok(())
    }
}

/// Owns the bridge, per-VM tap interfaces, address allocation, NAT, and
/// port forwarding.
///
/// Bridge and firewall mutation is serialized through one lock per service;
/// share a single instance per process.
pub struct NetworkService {
    controller: Arc<dyn NetworkDeviceController>,
    config: NetworkConfig,
    network: Ipv4Network,
    gateway: Ipv4Addr,
    host_lock: Mutex<()>,
}

impl NetworkService {
    pub fn new(
        controller: Arc<dyn NetworkDeviceController>,
        config: NetworkConfig,
    ) -> Result<Self, NetworkError> {
        let parsed: Ipv4Network = config
            .subnet
            .parse()
            .map_err(|e| NetworkError::InvalidConfig(format!("subnet '{}': {e}", config.subnet)))?;
        // Normalize 172.16.5.0/16 to 172.16.0.0/16
        let network = Ipv4Network::new(parsed.network(), parsed.prefix())
            .map_err(|e| NetworkError::InvalidConfig(e.to_string()))?;
        let gateway: Ipv4Addr = config
            .gateway
            .parse()
            .map_err(|e| NetworkError::InvalidConfig(format!("gateway '{}': {e}", config.gateway)))?;
        if !network.contains(gateway) {
            return Err(NetworkError::InvalidConfig(format!(
                "gateway {gateway} is outside subnet {network}"
            )));
        }
        Ok(NetworkService {
            controller,
            config,
            network,
            gateway,
            host_lock: Mutex::new(()),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.network.mask()
    }

    fn lock_host(&self) -> std::sync::MutexGuard<'_, ()> {
        // A panic while holding the lock leaves no partial state worth refusing
        self.host_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// NAT and forwarding rules that must always be present.
    pub fn nat_rules(&self) -> Vec<FirewallRule> {
        vec![
            FirewallRule::Masquerade {
                subnet: self.network.to_string(),
                out_interface: self.config.host_interface.clone(),
            },
            FirewallRule::ForwardOut {
                bridge: self.config.bridge_name.clone(),
                out_interface: self.config.host_interface.clone(),
            },
            FirewallRule::ForwardReturn {
                bridge: self.config.bridge_name.clone(),
                in_interface: self.config.host_interface.clone(),
            },
        ]
    }

    /// Create the bridge if missing, then re-assert forwarding and NAT.
    ///
    /// Forwarding and firewall state can be flushed behind our back, so they
    /// are checked on every call; rules are only appended when absent.
    pub fn ensure_bridge(&self) -> Result<(), NetworkError> {
        let _guard = self.lock_host();
        let bridge = &self.config.bridge_name;

        if !self.controller.link_exists(bridge)? {
            let address = format!("{}/{}", self.gateway, self.network.prefix());
            tracing::info!(bridge = %bridge, address = %address, "creating bridge");
            self.controller.create_bridge(bridge, &address)?;
        }
        self.controller.set_up(bridge)?;
        self.controller.enable_ip_forwarding()?;

        for rule in self.nat_rules() {
            if !self.controller.rule_exists(&rule)? {
                tracing::debug!(rule = ?rule, "adding firewall rule");
                self.controller.append_rule(&rule)?;
            }
        }
        Ok(())
    }

    /// Create a tap interface attached to the bridge and bring it up.
    ///
    /// An existing interface is left as is. If attaching or bringing up
    /// fails, the freshly created interface is removed before returning.
    pub fn create_interface(&self, name: &str) -> Result<(), NetworkError> {
        if self.controller.link_exists(name)? {
            return Ok(());
        }
        self.controller.create_tap(name)?;

        let configured = self
            .controller
            .set_master(name, &self.config.bridge_name)
            .and_then(|_| self.controller.set_up(name));
        if let Err(e) = configured {
            if let Err(cleanup) = self.controller.delete_link(name) {
                tracing::warn!(tap = %name, error = %cleanup, "failed to remove half-configured tap");
            }
            return Err(e);
        }
        tracing::info!(tap = %name, bridge = %self.config.bridge_name, "created tap interface");
        Ok(())
    }

    pub fn delete_interface(&self, name: &str) -> Result<(), NetworkError> {
        if !self.controller.link_exists(name)? {
            return Ok(());
        }
        self.controller.delete_link(name)
    }

    /// Address for the VM at ordinal `index`: subnet base + 2 + index.
    ///
    /// A pure function of `index`. Offsets 0 and 1 are the network and
    /// gateway addresses; the broadcast address is never handed out.
    pub fn allocate_address(&self, index: usize) -> Result<Ipv4Addr, NetworkError> {
        let exhausted = || NetworkError::AddressSpaceExhausted {
            index,
            subnet: self.network.to_string(),
        };
        let offset = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(2))
            .ok_or_else(exhausted)?;
        let base = u32::from(self.network.network());
        let candidate = base.checked_add(offset).map(Ipv4Addr::from).ok_or_else(exhausted)?;
        if !self.network.contains(candidate) || candidate == self.network.broadcast() {
            return Err(exhausted());
        }
        Ok(candidate)
    }

    /// Append a DNAT rule. No duplicate detection: the VM record's
    /// port-forward list is the source of truth.
    pub fn add_port_forward(
        &self,
        host_port: u16,
        guest_port: u16,
        guest_ip: Ipv4Addr,
        protocol: Protocol,
    ) -> Result<(), NetworkError> {
        let _guard = self.lock_host();
        let rule = FirewallRule::PortForward {
            host_port,
            guest_port,
            guest_ip,
            protocol,
        };
        self.controller.append_rule(&rule)
    }

    pub fn remove_port_forward(
        &self,
        host_port: u16,
        guest_port: u16,
        guest_ip: Ipv4Addr,
        protocol: Protocol,
    ) -> Result<(), NetworkError> {
        let _guard = self.lock_host();
        let rule = FirewallRule::PortForward {
            host_port,
            guest_port,
            guest_ip,
            protocol,
        };
        self.controller.delete_rule(&rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeNetworkController;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            bridge_name: "testbr0".to_string(),
            subnet: "192.168.100.0/24".to_string(),
            gateway: "192.168.100.1".to_string(),
            host_interface: "eth9".to_string(),
            dns_servers: vec!["1.1.1.1".to_string()],
        }
    }

    fn test_service() -> (Arc<FakeNetworkController>, NetworkService) {
        let fake = Arc::new(FakeNetworkController::default());
        let service = NetworkService::new(fake.clone(), test_config()).unwrap();
        (fake, service)
    }

    #[test]
    fn allocate_address_starts_at_offset_two() {
        let (_, service) = test_service();
        assert_eq!(service.allocate_address(0).unwrap(), Ipv4Addr::new(192, 168, 100, 2));
        assert_eq!(service.allocate_address(1).unwrap(), Ipv4Addr::new(192, 168, 100, 3));
    }

    #[test]
    fn allocate_address_is_pure_in_index() {
        let (_, service) = test_service();
        let later = service.allocate_address(7).unwrap();
        let _ = service.allocate_address(0).unwrap();
        assert_eq!(service.allocate_address(7).unwrap(), later);
    }

    #[test]
    fn allocate_address_rejects_overflow() {
        let (_, service) = test_service();
        // .254 is the last usable host in a /24
        assert_eq!(service.allocate_address(252).unwrap(), Ipv4Addr::new(192, 168, 100, 254));
        assert!(matches!(
            service.allocate_address(253),
            Err(NetworkError::AddressSpaceExhausted { index: 253, .. })
        ));
        assert!(service.allocate_address(usize::MAX).is_err());
    }

    #[test]
    fn new_rejects_gateway_outside_subnet() {
        let mut config = test_config();
        config.gateway = "10.0.0.1".to_string();
        let fake = Arc::new(FakeNetworkController::default());
        assert!(matches!(
            NetworkService::new(fake, config),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn ensure_bridge_creates_once_and_never_duplicates_rules() {
        let (fake, service) = test_service();
        service.ensure_bridge().unwrap();
        service.ensure_bridge().unwrap();
        service.ensure_bridge().unwrap();

        assert_eq!(fake.bridges_created(), 1);
        assert_eq!(fake.bridge_address("testbr0").as_deref(), Some("192.168.100.1/24"));
        assert_eq!(fake.rules().len(), 3);
        assert_eq!(fake.forwarding_enabled_count(), 3);
    }

    #[test]
    fn ensure_bridge_restores_flushed_rules() {
        let (fake, service) = test_service();
        service.ensure_bridge().unwrap();
        fake.flush_rules();
        service.ensure_bridge().unwrap();
        assert_eq!(fake.rules().len(), 3);
        assert_eq!(fake.bridges_created(), 1);
    }

    #[test]
    fn concurrent_ensure_bridge_does_not_duplicate_rules() {
        let (fake, service) = test_service();
        let service = Arc::new(service);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                std::thread::spawn(move || service.ensure_bridge().unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fake.rules().len(), 3);
        assert_eq!(fake.bridges_created(), 1);
    }

    #[test]
    fn create_interface_attaches_and_brings_up() {
        let (fake, service) = test_service();
        service.create_interface("vmm-abcdef").unwrap();
        assert!(fake.link("vmm-abcdef").is_some_and(|l| l.up && l.master.as_deref() == Some("testbr0")));
        // Second call is a no-op
        service.create_interface("vmm-abcdef").unwrap();
        assert_eq!(fake.taps_created(), 1);
    }

    #[test]
    fn create_interface_rolls_back_on_failure() {
        let (fake, service) = test_service();
        fake.fail_on("set_master");
        assert!(service.create_interface("vmm-broken").is_err());
        assert!(fake.link("vmm-broken").is_none());
    }

    #[test]
    fn delete_interface_is_idempotent() {
        let (fake, service) = test_service();
        service.create_interface("vmm-111111").unwrap();
        service.delete_interface("vmm-111111").unwrap();
        service.delete_interface("vmm-111111").unwrap();
        assert!(fake.link("vmm-111111").is_none());
    }

    #[test]
    fn port_forwards_are_not_deduplicated() {
        let (fake, service) = test_service();
        let ip = Ipv4Addr::new(192, 168, 100, 2);
        service.add_port_forward(8080, 80, ip, Protocol::Tcp).unwrap();
        service.add_port_forward(8080, 80, ip, Protocol::Tcp).unwrap();
        assert_eq!(fake.rules().len(), 2);
        service.remove_port_forward(8080, 80, ip, Protocol::Tcp).unwrap();
        assert_eq!(fake.rules().len(), 1);
    }

    #[test]
    fn iptables_spec_for_port_forward() {
        let rule = FirewallRule::PortForward {
            host_port: 2222,
            guest_port: 22,
            guest_ip: Ipv4Addr::new(172, 16, 0, 5),
            protocol: Protocol::Udp,
        };
        let (table, chain, spec) = rule.iptables_spec();
        assert_eq!(table, "nat");
        assert_eq!(chain, "PREROUTING");
        assert_eq!(
            spec.join(" "),
            "-p udp --dport 2222 -j DNAT --to-destination 172.16.0.5:22"
        );
    }

    #[test]
    fn nat_rules_use_uplink_and_subnet() {
        let (_, service) = test_service();
        let rules = service.nat_rules();
        let (_, chain, spec) = rules[0].iptables_spec();
        assert_eq!(chain, "POSTROUTING");
        assert_eq!(spec.join(" "), "-s 192.168.100.0/24 -o eth9 -j MASQUERADE");
        let (_, _, spec) = rules[2].iptables_spec();
        assert!(spec.join(" ").contains("RELATED,ESTABLISHED"));
    }
}
