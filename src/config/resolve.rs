//! Host/port list parsing and address binding (C10, binding half).
//!
//! `*` expands to every local non-multicast, non-link-local interface
//! address via `if-addrs`; a name is resolved via `hickory-resolver`; a
//! literal IP is used as-is. Ports align positionally with hosts, the last
//! port token is reused if there are more hosts than port tokens, and a
//! port token may itself be a colon-separated list expanding to multiple
//! bindings per host.

use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;

/// Expands `hosts`/`ports` into the concrete set of socket addresses to
/// bind, per §4.10's positional alignment and colon-expansion rules.
pub async fn resolve_bind_addresses(hosts: &[String], ports: &[String]) -> Result<Vec<SocketAddr>> {
    if hosts.is_empty() {
        return Err(anyhow!("hosts must not be empty"));
    }
    if ports.is_empty() {
        return Err(anyhow!("ports must not be empty"));
    }

    let mut addrs = Vec::new();
    for (i, host) in hosts.iter().enumerate() {
        let port_token = ports.get(i).unwrap_or_else(|| ports.last().unwrap());
        let port_list = parse_port_list(port_token)?;
        let ips = resolve_host(host).await?;
        for ip in &ips {
            for &port in &port_list {
                addrs.push(SocketAddr::new(*ip, port));
            }
        }
    }
    Ok(addrs)
}

fn parse_port_list(token: &str) -> Result<Vec<u16>> {
    token
        .split(':')
        .map(|p| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| anyhow!("invalid port '{p}': {e}"))
        })
        .collect()
}

async fn resolve_host(host: &str) -> Result<Vec<IpAddr>> {
    if host.trim().is_empty() {
        return Err(anyhow!("empty host token"));
    }
    if host == "*" {
        return Ok(local_interface_addresses()?);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let resolver = Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
        .with_options(ResolverOpts::default())
        .build();
    let response = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| anyhow!("failed to resolve host '{host}': {e}"))?;
    let ips: Vec<IpAddr> = response.iter().collect();
    if ips.is_empty() {
        return Err(anyhow!("host '{host}' resolved to no addresses"));
    }
    Ok(ips)
}

/// Every local address that isn't multicast or link-local, IPv4 and IPv6
/// alike, loopback/private/global all included.
fn local_interface_addresses() -> Result<Vec<IpAddr>> {
    let ifaces = if_addrs::get_if_addrs()
        .map_err(|e| anyhow!("failed to enumerate local interfaces: {e}"))?;
    let addrs: Vec<IpAddr> = ifaces
        .into_iter()
        .map(|iface| iface.ip())
        .filter(|ip| !is_multicast(ip) && !is_link_local(ip))
        .collect();
    if addrs.is_empty() {
        return Err(anyhow!("no usable local interface addresses found"));
    }
    Ok(addrs)
}

fn is_multicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_list_splits_on_colon() {
        assert_eq!(parse_port_list("2525").unwrap(), vec![2525]);
        assert_eq!(parse_port_list("2525:3535").unwrap(), vec![2525, 3535]);
    }

    #[test]
    fn parse_port_list_rejects_garbage() {
        assert!(parse_port_list("not-a-port").is_err());
    }

    #[tokio::test]
    async fn literal_ip_passes_through() {
        let addrs = resolve_bind_addresses(&["127.0.0.1".to_string()], &["2525".to_string()])
            .await
            .unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:2525".parse().unwrap()]);
    }

    #[tokio::test]
    async fn reuses_last_port_token_for_extra_hosts() {
        let addrs = resolve_bind_addresses(
            &["127.0.0.1".to_string(), "::1".to_string()],
            &["2525".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a.port() == 2525));
    }

    #[tokio::test]
    async fn colon_port_list_expands_per_host() {
        let addrs = resolve_bind_addresses(&["127.0.0.1".to_string()], &["2525:3535".to_string()])
            .await
            .unwrap();
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn empty_host_token_is_rejected() {
        let result =
            resolve_bind_addresses(&["".to_string()], &["2525".to_string()]).await;
        assert!(result.is_err());
    }
}
