//! Deterministic derivation of a machine's management address from its
//! WireGuard public key, so that any peer can compute another peer's
//! address from the key alone, without coordination.

use std::net::Ipv6Addr;

use wireguard_control::Key;

/// IPv6 ULA prefix every management address is drawn from.
pub const MANAGEMENT_PREFIX: [u8; 2] = [0xfd, 0xcc];

/// Derives the management IPv6 address for a WireGuard public key.
///
/// The address is `fdcc:` followed by the first 14 bytes of the key. This
/// is a pure function of its input and must never be cached across keys:
/// callers that hold on to a stale public key will compute a stale (but
/// still internally consistent) address, which is the caller's bug, not
/// this function's.
pub fn derive_management_ip(public_key: &Key) -> Ipv6Addr {
    let key_bytes = public_key.as_bytes();
    let mut octets = [0u8; 16];
    octets[0] = MANAGEMENT_PREFIX[0];
    octets[1] = MANAGEMENT_PREFIX[1];
    octets[2..16].copy_from_slice(&key_bytes[0..14]);
    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireguard_control::KeyPair;

    #[test]
    fn management_ip_has_expected_prefix() {
        let keypair = KeyPair::generate();
        let ip = derive_management_ip(&keypair.public);
        let octets = ip.octets();
        assert_eq!(octets[0], 0xfd);
        assert_eq!(octets[1], 0xcc);
        assert_eq!(&octets[2..16], &keypair.public.as_bytes()[0..14]);
    }

    #[test]
    fn derivation_is_pure() {
        let keypair = KeyPair::generate();
        let a = derive_management_ip(&keypair.public);
        let b = derive_management_ip(&keypair.public);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_keys_yield_distinct_addresses() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(derive_management_ip(&a.public), derive_management_ip(&b.public));
    }
}
