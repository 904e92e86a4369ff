//! Flow-source classification for DNS chain preservation.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

/// Where a query came from, and therefore where it must be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrigin {
    /// The query originated from another resolver (source port 53) or a
    /// VPN resolver range. It is forwarded back to that resolver and
    /// never fails over to the public upstream list.
    ChainResolver(SocketAddr),
    /// An ordinary client; the configured upstream list applies.
    Standard,
}

impl QueryOrigin {
    pub fn enforces_original_resolver(&self) -> bool {
        matches!(self, QueryOrigin::ChainResolver(_))
    }
}

/// Classify a flow by its source endpoint.
pub fn classify(
    src: SocketAddr,
    vpn_resolvers: &[IpNet],
    chain_preservation: bool,
) -> QueryOrigin {
    if !chain_preservation {
        return QueryOrigin::Standard;
    }

    if src.port() == 53 {
        return QueryOrigin::ChainResolver(SocketAddr::new(src.ip(), 53));
    }

    if contains(vpn_resolvers, src.ip()) {
        return QueryOrigin::ChainResolver(SocketAddr::new(src.ip(), 53));
    }

    QueryOrigin::Standard
}

fn contains(networks: &[IpNet], ip: IpAddr) -> bool {
    networks.iter().any(|net| net.contains(&ip))
}
