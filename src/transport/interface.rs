use crate::{Error, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, warn};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Loopback,
    Other,
}

impl InterfaceType {
    /// Preference when picking the outbound interface. Higher wins.
    fn priority(self) -> u8 {
        match self {
            InterfaceType::Ethernet => 80,
            InterfaceType::Wifi => 60,
            InterfaceType::Other => 20,
            InterfaceType::Loopback => 1,
        }
    }
}

/// One local network interface with an assigned address.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: IpAddr,
    pub interface_type: InterfaceType,
}

impl NetworkInterface {
    fn classify(name: &str, ip: &IpAddr) -> InterfaceType {
        let lower = name.to_lowercase();
        let is_loopback = match ip {
            IpAddr::V4(addr) => addr.is_loopback(),
            IpAddr::V6(addr) => addr.is_loopback(),
        };
        if is_loopback || lower == "lo" {
            InterfaceType::Loopback
        } else if lower.starts_with("wl") || lower.contains("wifi") || lower.contains("wlan") {
            InterfaceType::Wifi
        } else if lower.starts_with("en") || lower.starts_with("eth") {
            InterfaceType::Ethernet
        } else {
            InterfaceType::Other
        }
    }
}

/// Enumerate all local interfaces that carry a usable address, sorted by
/// preference (wired before wireless before anything else).
pub fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    let mut interfaces = Vec::new();

    for iface in get_if_addrs().map_err(Error::Io)? {
        let ip = match iface.addr {
            IfAddr::V4(ref addr) => IpAddr::V4(addr.ip),
            IfAddr::V6(ref addr) => IpAddr::V6(addr.ip),
        };
        if ip.is_unspecified() || ip.is_multicast() {
            continue;
        }

        let interface_type = NetworkInterface::classify(&iface.name, &ip);
        debug!(
            "Discovered interface {} ({:?}) at {}",
            iface.name, interface_type, ip
        );
        interfaces.push(NetworkInterface {
            name: iface.name,
            ip,
            interface_type,
        });
    }

    interfaces.sort_by(|a, b| {
        b.interface_type
            .priority()
            .cmp(&a.interface_type.priority())
    });
    Ok(interfaces)
}

/// Resolve the address this peer should identify itself by: the first
/// connected, non-loopback interface. IPv4 is preferred since LAN broadcast
/// discovery runs over IPv4.
pub fn resolve_local_ip() -> Result<IpAddr> {
    let interfaces = discover_interfaces()?;

    let best = interfaces
        .iter()
        .filter(|i| i.interface_type != InterfaceType::Loopback)
        .find(|i| i.ip.is_ipv4())
        .or_else(|| {
            interfaces
                .iter()
                .find(|i| i.interface_type != InterfaceType::Loopback)
        });

    if let Some(iface) = best {
        return Ok(iface.ip);
    }

    // Fall back to the OS routing table before giving up.
    match local_ip() {
        Ok(ip) => Ok(ip),
        Err(e) => {
            warn!("No usable network interface found: {}", e);
            Err(Error::NoNetworkInterface)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_interface_names() {
        let v4: IpAddr = "192.168.1.10".parse().unwrap();
        assert_eq!(
            NetworkInterface::classify("eth0", &v4),
            InterfaceType::Ethernet
        );
        assert_eq!(
            NetworkInterface::classify("wlan0", &v4),
            InterfaceType::Wifi
        );
        let lo: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            NetworkInterface::classify("lo", &lo),
            InterfaceType::Loopback
        );
    }

    #[test]
    fn loopback_never_wins_priority() {
        assert!(InterfaceType::Ethernet.priority() > InterfaceType::Loopback.priority());
        assert!(InterfaceType::Other.priority() > InterfaceType::Loopback.priority());
    }
}
