use axum::http::Request;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::LimiterConfig;

// Table key for one client. Clients whose address can't be parsed all share
// the `Unknown` bucket instead of bypassing the limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKey {
    Ip(IpAddr),
    Unknown,
}

impl AddressKey {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return AddressKey::from_ip(ip);
        }
        // tolerate "ip:port" and "[v6]:port" forms
        match raw.parse::<SocketAddr>() {
            Ok(addr) => AddressKey::from_ip(addr.ip()),
            Err(_) => AddressKey::Unknown,
        }
    }

    // ::ffff:a.b.c.d and a.b.c.d are the same client
    pub fn from_ip(ip: IpAddr) -> Self {
        AddressKey::Ip(ip.to_canonical())
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, AddressKey::Unknown)
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKey::Ip(ip) => write!(f, "{}", ip),
            AddressKey::Unknown => f.write_str("unknown"),
        }
    }
}

// Client address of a request: the trusted proxy header in proxy mode,
// the transport peer otherwise. No peer means the `Unknown` bucket.
pub fn resolve<B>(
    request: &Request<B>,
    peer: Option<SocketAddr>,
    config: &LimiterConfig,
) -> AddressKey {
    if !config.proxy {
        return peer.map_or(AddressKey::Unknown, |addr| AddressKey::from_ip(addr.ip()));
    }

    request
        .headers()
        .get(&config.proxy_header)
        .and_then(|value| value.to_str().ok())
        // X-Forwarded-For style lists name the original client first
        .and_then(|value| value.split(',').next())
        .map(AddressKey::parse)
        .unwrap_or(AddressKey::Unknown)
}
