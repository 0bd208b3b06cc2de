//! Local interface discovery, used by the listener factories to validate
//! configured addresses and to pick reply and link addresses.

use std::net::Ipv6Addr;

use nix::ifaddrs::getifaddrs;
use protocol::is_global_unicast;

use crate::listeners::SetupError;

/// Resolves an interface name to its index.
pub fn interface_index(name: &str) -> Result<u32, SetupError> {
    nix::net::if_::if_nametoindex(name)
        .map_err(|_| SetupError::UnknownInterface(name.to_owned()))
}

/// All IPv6 addresses currently assigned to the named interface, in the
/// order the kernel reports them.
pub fn addresses_on(name: &str) -> Result<Vec<Ipv6Addr>, SetupError> {
    let mut addresses = Vec::new();
    for entry in getifaddrs().map_err(std::io::Error::from)? {
        if entry.interface_name != name {
            continue;
        }
        if let Some(address) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in6()) {
            addresses.push(address.ip());
        }
    }
    Ok(addresses)
}

/// The first link-local address on the interface, if any.
pub fn first_link_local(name: &str) -> Result<Option<Ipv6Addr>, SetupError> {
    Ok(addresses_on(name)?
        .into_iter()
        .find(|address| (address.segments()[0] & 0xffc0) == 0xfe80))
}

/// The first global unicast address on the interface, if any.
pub fn first_global_unicast(name: &str) -> Result<Option<Ipv6Addr>, SetupError> {
    Ok(addresses_on(name)?
        .into_iter()
        .find(|address| is_global_unicast(*address)))
}

/// The interface carrying the given address, if any.
pub fn interface_for_address(address: Ipv6Addr) -> Result<Option<String>, SetupError> {
    for entry in getifaddrs().map_err(std::io::Error::from)? {
        if let Some(assigned) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in6()) {
            if assigned.ip() == address {
                return Ok(Some(entry.interface_name));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{addresses_on, interface_for_address, interface_index};
    use std::net::Ipv6Addr;

    #[test]
    fn unknown_interfaces_are_reported() {
        assert!(interface_index("no-such-interface0").is_err());
    }

    #[test]
    fn loopback_carries_localhost() {
        // Every system this runs on has a loopback interface with ::1.
        let found = interface_for_address(Ipv6Addr::LOCALHOST).unwrap();
        if let Some(name) = found {
            let addresses = addresses_on(&name).unwrap();
            assert!(addresses.contains(&Ipv6Addr::LOCALHOST));
        }
    }
}
