//! Relay endpoint.

use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Default upstream of a relay: the local end of a tunnel.
pub const DEFAULT_PROXY_HOSTNAME: &str = "127.0.0.1";

/// Remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    SocketAddr(SocketAddr),
    DomainName(String, u16),
}

/// A `local:remote` port couple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPairError(String);

impl Display for PortPairError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid port mapping: {}", self.0)
    }
}

impl std::error::Error for PortPairError {}

impl PortPair {
    pub const fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

impl FromStr for PortPair {
    type Err = PortPairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, remote) = s
            .split_once(':')
            .ok_or_else(|| PortPairError(format!("`{}` (expected `local:remote`)", s)))?;

        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| PortPairError(format!("`{}` is not a valid port in `{}`", v, s)))
        };

        Ok(Self {
            local: parse(local)?,
            remote: parse(remote)?,
        })
    }
}

/// One relay allocation: a named service reachable on `local_ip:local_port`,
/// relayed to `proxy_hostname:proxy_port`.
///
/// `local_ip` and `proxy_port` are filled by the [`Proxy`](crate::Proxy)
/// when the forward is added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyForward {
    pub name: String,
    pub hostname: Option<String>,
    pub proxy_hostname: Option<String>,
    pub local_port: Option<u16>,
    pub forward_port: u16,
    pub local_ip: Option<Ipv4Addr>,
    pub proxy_port: Option<u16>,
}

impl ProxyForward {
    pub fn new(
        name: impl Into<String>,
        hostname: Option<String>,
        proxy_hostname: Option<String>,
        local_port: Option<u16>,
        forward_port: u16,
    ) -> Self {
        let hostname = hostname.filter(|h| !h.is_empty());
        let proxy_hostname = proxy_hostname.filter(|h| !h.is_empty());

        // an explicit upstream is dialed on the forward port directly,
        // no relay port gets allocated for it
        let proxy_port = proxy_hostname.as_ref().map(|_| forward_port);

        Self {
            name: name.into(),
            hostname,
            proxy_hostname,
            local_port,
            forward_port,
            local_ip: None,
            proxy_port,
        }
    }

    /// Name the service is published under, falls back to the forward name.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }

    /// Host the relay dials.
    pub fn proxy_hostname(&self) -> &str {
        self.proxy_hostname.as_deref().unwrap_or(DEFAULT_PROXY_HOSTNAME)
    }

    /// `proxy_port:forward_port`, the ports a tunnel backend has to serve.
    pub fn proxied_ports(&self) -> Option<PortPair> {
        self.proxy_port.map(|p| PortPair::new(p, self.forward_port))
    }

    pub fn upstream(&self) -> Option<RemoteAddr> {
        let port = self.proxy_port?;
        let host = self.proxy_hostname();
        Some(match host.parse::<std::net::IpAddr>() {
            Ok(ip) => RemoteAddr::SocketAddr(SocketAddr::new(ip, port)),
            Err(_) => RemoteAddr::DomainName(host.to_string(), port),
        })
    }
}

// display impl below

impl Display for RemoteAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use RemoteAddr::*;
        match self {
            SocketAddr(addr) => write!(f, "{}", addr),
            DomainName(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl Display for PortPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl Display for ProxyForward {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hostname())?;
        if let (Some(ip), Some(port)) = (self.local_ip, self.local_port) {
            write!(f, " ({}:{})", ip, port)?;
        }
        if let Some(upstream) = self.upstream() {
            write!(f, " -> {}", upstream)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_pair() {
        let pair: PortPair = "8080:80".parse().unwrap();
        assert_eq!(pair, PortPair::new(8080, 80));
        assert_eq!(pair.to_string(), "8080:80");
    }

    #[test]
    fn reject_malformed_port_pair() {
        assert!("8080".parse::<PortPair>().is_err());
        assert!("8080:http".parse::<PortPair>().is_err());
        assert!("70000:80".parse::<PortPair>().is_err());
    }

    #[test]
    fn hostname_falls_back_to_name() {
        let pf = ProxyForward::new("api", None, None, Some(8080), 8080);
        assert_eq!(pf.hostname(), "api");
        assert_eq!(pf.proxy_hostname(), "127.0.0.1");
        assert_eq!(pf.proxy_port, None);

        let pf = ProxyForward::new("api", Some("api.svc.local".into()), None, Some(8080), 8080);
        assert_eq!(pf.hostname(), "api.svc.local");
    }

    #[test]
    fn proxy_hostname_presets_proxy_port() {
        let pf = ProxyForward::new("db", None, Some("db.internal".into()), Some(5432), 6432);
        assert_eq!(pf.proxy_port, Some(6432));
        assert_eq!(pf.proxied_ports(), Some(PortPair::new(6432, 6432)));
        assert_eq!(pf.upstream(), Some(RemoteAddr::DomainName("db.internal".into(), 6432)));
    }

    #[test]
    fn empty_overrides_are_ignored() {
        let pf = ProxyForward::new("api", Some(String::new()), Some(String::new()), None, 80);
        assert_eq!(pf.hostname, None);
        assert_eq!(pf.proxy_hostname, None);
        assert_eq!(pf.proxy_port, None);
    }
}
