//! Resource address parsing and validation (spec §8 boundary behaviors).
//!
//! A resource address is either a hostname (for `dns` resources), a bare
//! IPv4/IPv6 literal, a bracketed IPv6 literal, or a CIDR block. Addresses
//! must never carry an embedded port and bracket pairs must be balanced.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must not embed a port number: {0}")]
    EmbeddedPort(String),
    #[error("mismatched brackets in address: {0}")]
    MismatchedBrackets(String),
    #[error("address is neither a valid hostname, ip, nor cidr: {0}")]
    Unparseable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedAddress<'a> {
    Hostname(&'a str),
    Ip(IpAddr),
    Cidr(IpNet),
}

/// Validate and classify a resource address string.
///
/// Rejects `"example.com:8080"`, `"[2001:db8::1]:8080"`, `"[fe00::/1"`,
/// `"fe00::]/1"`. Accepts `"2001:db8::1"`, full expanded IPv6, and
/// bracketed IPv6 literals like `"[2001:db8::1]"`.
pub fn parse_address(raw: &str) -> Result<ParsedAddress<'_>, AddressError> {
    let trimmed = raw.trim();

    let has_brackets = trimmed.contains('[') || trimmed.contains(']');
    let wrapped = trimmed.starts_with('[') && trimmed.ends_with(']');
    if has_brackets && !wrapped {
        return Err(AddressError::MismatchedBrackets(trimmed.to_string()));
    }
    let open = wrapped;

    let unbracketed = if wrapped {
        let inner = &trimmed[1..trimmed.len() - 1];
        if inner.contains('[') || inner.contains(']') {
            return Err(AddressError::MismatchedBrackets(trimmed.to_string()));
        }
        inner
    } else {
        trimmed
    };

    // A bracketed literal followed by ":<port>" is the one case a naive
    // bracket-strip would miss, since the port sits outside the brackets.
    if wrapped && trimmed.len() > unbracketed.len() + 2 {
        return Err(AddressError::EmbeddedPort(trimmed.to_string()));
    }

    if let Ok(ip) = IpAddr::from_str(unbracketed) {
        return Ok(ParsedAddress::Ip(ip));
    }

    if let Ok(net) = IpNet::from_str(unbracketed) {
        return Ok(ParsedAddress::Cidr(net));
    }

    // Not an IP/CIDR: reject embedded ports on hostnames (e.g. "example.com:8080")
    // and bracket-damaged hostnames, then accept as a DNS name.
    if unbracketed.contains(':') && !open {
        return Err(AddressError::EmbeddedPort(trimmed.to_string()));
    }
    if unbracketed.is_empty() || open {
        return Err(AddressError::Unparseable(trimmed.to_string()));
    }

    Ok(ParsedAddress::Hostname(unbracketed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_hostname_with_port() {
        assert_eq!(
            parse_address("example.com:8080"),
            Err(AddressError::EmbeddedPort("example.com:8080".to_string()))
        );
    }

    #[test]
    fn rejects_bracketed_ipv6_with_port() {
        assert!(parse_address("[2001:db8::1]:8080").is_err());
    }

    #[test]
    fn rejects_unbalanced_open_bracket() {
        assert_eq!(
            parse_address("[fe00::/1"),
            Err(AddressError::MismatchedBrackets("[fe00::/1".to_string()))
        );
    }

    #[test]
    fn rejects_unbalanced_close_bracket() {
        assert_eq!(
            parse_address("fe00::]/1"),
            Err(AddressError::MismatchedBrackets("fe00::]/1".to_string()))
        );
    }

    #[test]
    fn accepts_bare_ipv6() {
        assert_eq!(
            parse_address("2001:db8::1"),
            Ok(ParsedAddress::Ip("2001:db8::1".parse().unwrap()))
        );
    }

    #[test]
    fn accepts_full_expanded_ipv6() {
        let addr = "2001:0db8:85a3:0000:0000:8a2e:0370:7334";
        assert!(matches!(parse_address(addr), Ok(ParsedAddress::Ip(_))));
    }

    #[test]
    fn accepts_bracketed_ipv6() {
        assert!(matches!(
            parse_address("[2001:db8::1]"),
            Ok(ParsedAddress::Ip(_))
        ));
    }

    #[test]
    fn accepts_hostname() {
        assert_eq!(
            parse_address("internal.example"),
            Ok(ParsedAddress::Hostname("internal.example"))
        );
    }

    #[test]
    fn accepts_cidr() {
        assert!(matches!(
            parse_address("10.0.0.0/8"),
            Ok(ParsedAddress::Cidr(_))
        ));
    }
}
