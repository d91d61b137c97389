use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use tether_core::config::ServerConfig;

/// Environment variable overriding the advertised port.
pub const PORT_ENV: &str = "PORT";

/// Port to advertise: a valid `PORT` value wins over the configured port.
pub fn resolve_port(env_value: Option<&str>, configured: u16) -> u16 {
    env_value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|port| *port != 0)
        .unwrap_or(configured)
}

/// Port to advertise, reading `PORT` from the live environment.
pub fn current_port(configured: u16) -> u16 {
    resolve_port(std::env::var(PORT_ENV).ok().as_deref(), configured)
}

/// Address to advertise.
///
/// Uses the configured address when set. Otherwise the first non-loopback
/// IPv4 address of a local interface, falling back to what the hostname
/// resolves to. Discovery runs on the blocking pool.
pub async fn resolve_address(server: &ServerConfig) -> IpAddr {
    if let Some(address) = server.advertise_address {
        return address;
    }

    match tokio::task::spawn_blocking(|| choose_address(interface_addresses(), hostname_addresses))
        .await
    {
        Ok(address) => address,
        Err(e) => {
            tracing::warn!("Address discovery failed: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn interface_addresses() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().map(|i| i.ip()).collect(),
        Err(e) => {
            tracing::warn!("Failed to list network interfaces: {}", e);
            Vec::new()
        }
    }
}

fn hostname_addresses() -> Vec<IpAddr> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());

    match (hostname.as_str(), 0).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            tracing::warn!("Failed to resolve hostname {}: {}", hostname, e);
            Vec::new()
        }
    }
}

/// Interface addresses win; the hostname is only looked up when no
/// interface carries a routable IPv4 address.
fn choose_address(interfaces: Vec<IpAddr>, hostname: impl FnOnce() -> Vec<IpAddr>) -> IpAddr {
    if let Some(address) = routable_ipv4(&interfaces) {
        return address;
    }

    let mut candidates = hostname();
    candidates.extend(interfaces);
    pick_address(&candidates)
}

fn routable_ipv4(candidates: &[IpAddr]) -> Option<IpAddr> {
    candidates
        .iter()
        .find(|ip| ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified())
        .copied()
}

fn pick_address(candidates: &[IpAddr]) -> IpAddr {
    routable_ipv4(candidates)
        .or_else(|| candidates.iter().find(|ip| !ip.is_loopback()).copied())
        .or_else(|| candidates.first().copied())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
