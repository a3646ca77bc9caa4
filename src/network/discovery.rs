//! Local address discovery
//!
//! Presence messages carry the sender's own IPv4 address, so the directory
//! must know which address peers can reach it on before it announces itself.

use std::net::{IpAddr, Ipv4Addr, UdpSocket as StdUdpSocket};

use crate::config::PresenceConfig;
use crate::error::NetworkError;

/// Resolve the address this device advertises.
///
/// Order: configured override, multicast-capable non-loopback interface
/// addresses (private LAN ranges first), then the address of the default
/// outbound route.
pub fn resolve_local_address(config: &PresenceConfig) -> Result<Ipv4Addr, NetworkError> {
    if let Some(address) = config.advertise_address {
        return Ok(address);
    }

    if let Some(address) = get_interface_addresses().into_iter().next() {
        return Ok(address);
    }

    route_address().ok_or_else(|| {
        NetworkError::AddressResolution(
            "no multicast-capable IPv4 interface and no default route".to_string(),
        )
    })
}

/// Usable IPv4 interface addresses, best candidate first
pub fn get_interface_addresses() -> Vec<Ipv4Addr> {
    #[cfg(target_os = "windows")]
    let mut addresses = get_windows_interfaces();

    #[cfg(not(target_os = "windows"))]
    let mut addresses = get_unix_interfaces();

    addresses.retain(|ip| is_usable(*ip));
    addresses.dedup();
    // Stable sort keeps interface order within the same score
    addresses.sort_by_key(|ip| std::cmp::Reverse(ip_priority_score(ip)));
    addresses
}

fn is_usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified() && !ip.is_multicast() && !ip.is_broadcast()
}

/// Score IP addresses for priority (higher = better for LAN)
fn ip_priority_score(ip: &Ipv4Addr) -> u8 {
    let octets = ip.octets();
    // 192.168.x.x - most common home/office LAN
    if octets[0] == 192 && octets[1] == 168 {
        return 100;
    }
    // 10.x.x.x - common corporate LAN
    if octets[0] == 10 {
        return 90;
    }
    // 172.16-31.x.x - less common private range
    if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        return 80;
    }
    // 169.254.x.x - link-local (fallback)
    if ip.is_link_local() {
        return 10;
    }
    50
}

/// Address the OS would use for outbound traffic. No packet is sent.
fn route_address() -> Option<Ipv4Addr> {
    let socket = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    for target in ["8.8.8.8:53", "1.1.1.1:53", "192.168.0.1:9"] {
        if socket.connect(target).is_err() {
            continue;
        }
        if let Ok(local) = socket.local_addr() {
            if let IpAddr::V4(ip) = local.ip() {
                if is_usable(ip) {
                    return Some(ip);
                }
            }
        }
    }
    None
}

#[cfg(target_os = "windows")]
fn get_windows_interfaces() -> Vec<Ipv4Addr> {
    use std::process::Command;

    let mut addresses = Vec::new();

    if let Ok(output) = Command::new("ipconfig").output() {
        if let Ok(text) = String::from_utf8(output.stdout) {
            for line in text.lines() {
                let line = line.trim();
                if line.contains("IPv4") || line.contains("IP Address") {
                    if let Some(addr_str) = line.split(':').nth(1) {
                        if let Ok(addr) = addr_str.trim().parse::<Ipv4Addr>() {
                            addresses.push(addr);
                        }
                    }
                }
            }
        }
    }

    addresses
}

#[cfg(not(target_os = "windows"))]
fn get_unix_interfaces() -> Vec<Ipv4Addr> {
    use std::process::Command;

    // ip (Linux) first, ifconfig (macOS, older Linux) otherwise
    let listing = Command::new("ip")
        .args(["addr", "show"])
        .output()
        .or_else(|_| Command::new("ifconfig").output());

    match listing {
        Ok(output) => parse_interface_listing(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            tracing::debug!("Interface listing unavailable: {}", e);
            Vec::new()
        }
    }
}

/// Extract IPv4 addresses of multicast-capable interfaces from `ip addr show`
/// or `ifconfig` output.
///
/// Interface header lines start in column 0 and carry the flag list
/// (`<BROADCAST,MULTICAST,UP>`); address lines are indented.
fn parse_interface_listing(text: &str) -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    let mut multicast = false;

    for line in text.lines() {
        if !line.starts_with(char::is_whitespace) {
            multicast = line.contains("MULTICAST") && !line.contains("LOOPBACK");
            continue;
        }
        if !multicast {
            continue;
        }

        let mut parts = line.split_whitespace();
        if parts.next() != Some("inet") {
            continue;
        }
        // "inet 192.168.0.5/24" (ip) or "inet 192.168.0.5 netmask" (ifconfig)
        // or "inet addr:192.168.0.5" (old net-tools)
        if let Some(addr_part) = parts.next() {
            let addr_str = addr_part.trim_start_matches("addr:");
            let addr_str = addr_str.split('/').next().unwrap_or(addr_str);
            if let Ok(addr) = addr_str.parse::<Ipv4Addr>() {
                addresses.push(addr);
            }
        }
    }

    addresses
}
