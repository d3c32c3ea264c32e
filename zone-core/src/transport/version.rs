//! Protocol version compatibility (spec §9 "legacy protocol paths").
//!
//! Version cutoffs live here, in one place, as configuration rather
//! than scattered `if version < X` checks through the channel code.
//! Delete a cutoff's branch entirely once the minimum supported
//! version rises past it.

use std::cmp::Ordering;
use std::str::FromStr;

/// A client/gateway-reported semantic version, parsed leniently (no
/// pre-release/build metadata support — the wire only ever sends
/// `MAJOR.MINOR.PATCH`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for ProtocolVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts.next().ok_or(())?.parse().map_err(|_| ())?;
        let minor = parts.next().unwrap_or("0").parse().map_err(|_| ())?;
        let patch = parts.next().unwrap_or("0").parse().map_err(|_| ())?;
        Ok(Self { major, minor, patch })
    }
}

/// Gateways below this version only understand the legacy
/// `allow_access`/`request_connection` messages instead of
/// `authorize_flow`/`flow_authorized`.
pub const GATEWAY_RENDEZVOUS_MIN_VERSION: ProtocolVersion = ProtocolVersion::new(1, 4, 0);

/// Clients below this version can't handle an in-place resource site
/// change and need delete-then-create (the `toggle` case in §4.4).
pub const CLIENT_IN_PLACE_SITE_UPDATE_MIN_VERSION: ProtocolVersion = ProtocolVersion::new(1, 3, 0);

/// Clients below this version have no notion of an `internet` resource
/// and must never see one in their connectable set.
pub const CLIENT_INTERNET_RESOURCE_MIN_VERSION: ProtocolVersion = ProtocolVersion::new(1, 3, 0);

#[must_use]
pub fn gateway_supports_rendezvous(version: ProtocolVersion) -> bool {
    version >= GATEWAY_RENDEZVOUS_MIN_VERSION
}

#[must_use]
pub fn client_supports_in_place_site_update(version: ProtocolVersion) -> bool {
    version >= CLIENT_IN_PLACE_SITE_UPDATE_MIN_VERSION
}

#[must_use]
pub fn client_supports_internet_resource(version: ProtocolVersion) -> bool {
    version >= CLIENT_INTERNET_RESOURCE_MIN_VERSION
}

#[must_use]
pub fn compare(a: ProtocolVersion, b: ProtocolVersion) -> Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor_patch() {
        assert_eq!("1.4.2".parse(), Ok(ProtocolVersion::new(1, 4, 2)));
    }

    #[test]
    fn parses_partial_versions_with_zero_default() {
        assert_eq!("2".parse(), Ok(ProtocolVersion::new(2, 0, 0)));
    }

    #[test]
    fn gateway_below_cutoff_uses_legacy_path() {
        assert!(!gateway_supports_rendezvous(ProtocolVersion::new(1, 3, 9)));
        assert!(gateway_supports_rendezvous(ProtocolVersion::new(1, 4, 0)));
    }
}
