use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Context, Result};

/// Compares address family, address bytes, and port. IPv6 flow and scope
/// information is deliberately ignored.
pub fn addr_equal(a: &SocketAddr, b: &SocketAddr) -> bool {
    match (a, b) {
        (SocketAddr::V4(a), SocketAddr::V4(b)) => a.ip() == b.ip() && a.port() == b.port(),
        (SocketAddr::V6(a), SocketAddr::V6(b)) => a.ip() == b.ip() && a.port() == b.port(),
        _ => false,
    }
}

pub fn port(sa: &SocketAddr) -> u16 {
    sa.port()
}

/// Matches datagram source addresses against a configured peer block:
/// either an exact IP or an `ip/prefix` range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatcher {
    ip: IpAddr,
    prefix: u8,
}

impl HostMatcher {
    pub fn parse(spec: &str) -> Result<Self> {
        let (ip_part, prefix_part) = match spec.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (spec, None),
        };

        let ip: IpAddr = ip_part
            .parse()
            .with_context(|| format!("invalid host address {ip_part:?}"))?;
        let max_prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_part {
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max_prefix)
                .ok_or_else(|| anyhow!("invalid prefix length {raw:?} for {ip}"))?,
            None => max_prefix,
        };
        Ok(Self {
            ip: mask_ip(ip, prefix),
            prefix,
        })
    }

    pub fn matches(&self, candidate: IpAddr) -> bool {
        match (self.ip, candidate) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask_ip(candidate, self.prefix) == self.ip
            }
            _ => false,
        }
    }
}

fn mask_ip(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            IpAddr::V6((bits & mask).into())
        }
    }
}
