use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use ipnet::Ipv6Net;

use crate::types::Error;

// Non-routable v6 space that std does not classify on stable.
static V6_BOGONS: LazyLock<Vec<Ipv6Net>> = LazyLock::new(|| {
	[
		"::/128",          // unspecified
		"::1/128",         // loopback
		"::ffff:0:0/96",   // v4-mapped, classified via the embedded v4
		"100::/64",        // discard-only
		"2001:db8::/32",   // documentation
		"fc00::/7",        // unique local
		"fe80::/10",       // link local
		"ff00::/8",        // multicast
	]
	.into_iter()
	.map(|n| n.parse().expect("static network list"))
	.collect()
});

/// Parse an IP address in the forms operators actually feed us: zone ids
/// (`fe80::1%eth0`) are stripped, and the result is the canonical textual
/// form (lowercase, collapsed v6) by virtue of going through `IpAddr`.
pub fn parse_ip(s: &str) -> Result<IpAddr, Error> {
	let bare = s.split('%').next().unwrap_or(s).trim();
	bare
		.parse::<IpAddr>()
		.map_err(|_| Error::InvalidInput(format!("invalid ip address {s:?}")))
}

pub fn is_public(ip: &IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => is_public_v4(v4),
		IpAddr::V6(v6) => {
			if let Some(mapped) = v6.to_ipv4_mapped() {
				return is_public_v4(&mapped);
			}
			!V6_BOGONS.iter().any(|net| net.contains(v6))
		},
	}
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
	if ip.is_unspecified()
		|| ip.is_loopback()
		|| ip.is_private()
		|| ip.is_link_local()
		|| ip.is_broadcast()
		|| ip.is_documentation()
		|| ip.is_multicast()
	{
		return false;
	}
	let o = ip.octets();
	// Shared address space (RFC 6598), benchmarking (RFC 2544), class E.
	if o[0] == 100 && (o[1] & 0xc0) == 64 {
		return false;
	}
	if o[0] == 198 && (o[1] & 0xfe) == 18 {
		return false;
	}
	if o[0] == 192 && o[1] == 0 && o[2] == 0 {
		return false;
	}
	if o[0] >= 240 {
		return false;
	}
	true
}

/// DNS results and `/alias` updates must point at something routable.
pub fn ensure_public(ip: &IpAddr) -> Result<(), Error> {
	if is_public(ip) {
		Ok(())
	} else {
		Err(Error::InvalidInput(format!("{ip} is not publicly routable")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_zone_ids_and_canonicalizes() {
		assert_eq!(
			parse_ip("fe80::1%eth0").unwrap(),
			"fe80::1".parse::<IpAddr>().unwrap()
		);
		assert_eq!(
			parse_ip("2001:0DB8:0000:0000:0000:0000:0000:0001")
				.unwrap()
				.to_string(),
			"2001:db8::1"
		);
		assert!(parse_ip("not-an-ip").is_err());
	}

	#[test]
	fn public_v4() {
		for good in ["1.2.3.4", "8.8.8.8", "203.0.112.9"] {
			assert!(is_public(&good.parse().unwrap()), "{good}");
		}
		for bad in [
			"10.0.0.1",
			"192.168.1.1",
			"172.16.0.1",
			"127.0.0.1",
			"169.254.10.10",
			"100.64.0.1",
			"198.18.0.1",
			"192.0.0.8",
			"224.0.0.1",
			"255.255.255.255",
			"0.0.0.0",
		] {
			assert!(!is_public(&bad.parse().unwrap()), "{bad}");
		}
	}

	#[test]
	fn public_v6() {
		for good in ["2607:f8b0::1", "2a00:1450::5"] {
			assert!(is_public(&good.parse().unwrap()), "{good}");
		}
		for bad in [
			"::1",
			"::",
			"fe80::1",
			"fc00::1",
			"fd12:3456::1",
			"ff02::1",
			"2001:db8::1",
			"::ffff:10.0.0.1",
		] {
			assert!(!is_public(&bad.parse().unwrap()), "{bad}");
		}
		// A v4-mapped public address is still public.
		assert!(is_public(&"::ffff:8.8.8.8".parse().unwrap()));
	}
}
