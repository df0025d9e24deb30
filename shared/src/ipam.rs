//! Non-overlapping `/24` subnet allocation within a cluster CIDR.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::error::Error;

/// Width of every machine subnet. Fixed: smaller risks host-count limits
/// per machine, larger wastes the cluster CIDR.
pub const MACHINE_SUBNET_PREFIX: u8 = 24;

/// Returns the lowest `/24` within `cidr` that does not overlap any of
/// `allocated`, walking the CIDR in 256-address steps.
pub fn allocate_subnet(cidr: Ipv4Net, allocated: &[Ipv4Net]) -> Result<Ipv4Net, Error> {
    let network_start = u32::from(cidr.network());
    let network_end = u32::from(cidr.broadcast());

    let mut candidate_start = network_start;
    while candidate_start <= network_end {
        let candidate_end = candidate_start.saturating_add(255);
        if candidate_end > network_end {
            break;
        }

        let candidate = Ipv4Net::new(Ipv4Addr::from(candidate_start), MACHINE_SUBNET_PREFIX)
            .map_err(|e| Error::InvalidCidr(cidr.to_string(), e.into()))?;

        if !allocated.iter().any(|existing| overlaps(&candidate, existing)) {
            return Ok(candidate);
        }

        candidate_start = candidate_start.saturating_add(256);
    }

    Err(Error::SubnetsExhausted(cidr))
}

/// Whether two IPv4 networks share any address.
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    let (a_start, a_end) = (u32::from(a.network()), u32::from(a.broadcast()));
    let (b_start, b_end) = (u32::from(b.network()), u32::from(b.broadcast()));
    a_start <= b_end && b_start <= a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_first_subnet_in_empty_cidr() {
        let cidr = net("10.210.0.0/16");
        let subnet = allocate_subnet(cidr, &[]).unwrap();
        assert_eq!(subnet, net("10.210.0.0/24"));
    }

    #[test]
    fn skips_allocated_subnets() {
        let cidr = net("10.210.0.0/16");
        let allocated = vec![net("10.210.0.0/24"), net("10.210.1.0/24")];
        let subnet = allocate_subnet(cidr, &allocated).unwrap();
        assert_eq!(subnet, net("10.210.2.0/24"));
    }

    #[test]
    fn fails_when_cidr_is_full() {
        let cidr = net("10.210.0.0/24");
        let allocated = vec![net("10.210.0.0/24")];
        let err = allocate_subnet(cidr, &allocated).unwrap_err();
        assert!(matches!(err, Error::SubnetsExhausted(_)));
    }

    #[test]
    fn disjoint_subnets_do_not_overlap() {
        assert!(!overlaps(&net("10.210.0.0/24"), &net("10.210.1.0/24")));
    }

    #[test]
    fn identical_subnets_overlap() {
        assert!(overlaps(&net("10.210.0.0/24"), &net("10.210.0.0/24")));
    }
}
