//! IPv4 address allocation inside the harness networks

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::Error;

/// Parse a CIDR string such as `172.24.0.0/24`, normalising to the network address
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, Error> {
    cidr.parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| Error::config(format!("invalid CIDR {:?}: {}", cidr, e)))
}

/// Return the n-th address of `network` (the network address is the 0th)
pub fn nth_ip_in_network(network: &Ipv4Net, n: u32) -> Result<Ipv4Addr, Error> {
    let base = u32::from(network.network());
    let ip = base
        .checked_add(n)
        .map(Ipv4Addr::from)
        .filter(|ip| network.contains(ip))
        .ok_or_else(|| {
            Error::config(format!("network {} is too small for address #{}", network, n))
        })?;

    Ok(ip)
}

/// Gateway, control-plane and node addresses carved out of one network.
///
/// The gateway takes the first address, the control plane the second, and
/// the remaining nodes follow in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressPlan {
    /// Network the addresses belong to
    pub network: Ipv4Net,
    /// Bridge / gateway address
    pub gateway: Ipv4Addr,
    /// Node addresses, starting at the second host address
    pub nodes: Vec<Ipv4Addr>,
}

impl AddressPlan {
    /// Allocate a gateway plus `count` node addresses
    pub fn allocate(network: Ipv4Net, count: usize) -> Result<Self, Error> {
        let gateway = nth_ip_in_network(&network, 1)?;
        let nodes = (0..count)
            .map(|i| nth_ip_in_network(&network, i as u32 + 2))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            network,
            gateway,
            nodes,
        })
    }
}
