//! Static sensitive-column table for the change-log sink (spec §4.2, §4.3 [ADDED]).
//!
//! Applied only to the audit copy of a row before it is written to
//! `audit_log`; hooks still see the original, unredacted row, since e.g.
//! `clients.public_key` is needed downstream for cache hydration and is
//! not itself secret material. The list is static, matching
//! [`crate::audit`]'s own "sensitive field" convention rather than being
//! something an operator configures per deployment.

use super::raw::RawRow;

const REDACTED: &str = "[redacted]";

fn sensitive_columns(table: &str) -> &'static [&'static str] {
    match table {
        "tokens" | "gateway_tokens" | "portal_sessions" => &["hash"],
        _ => &[],
    }
}

/// `relay_tokens` carries no `account_id` and is dropped entirely by the
/// sink before redaction is even considered (spec §4.2: "tables that do
/// not carry it... are ignored").
#[must_use]
pub fn is_ignored_table(table: &str) -> bool {
    table == "relay_tokens"
}

/// Replace every sensitive column's value with `"[redacted]"`, leaving
/// nulls and non-sensitive columns untouched.
#[must_use]
pub fn redact_row(table: &str, row: &RawRow) -> RawRow {
    let sensitive = sensitive_columns(table);
    if sensitive.is_empty() {
        return row.clone();
    }
    row.iter()
        .map(|(col, val)| {
            if sensitive.contains(&col.as_str()) && val.is_some() {
                (col.clone(), Some(REDACTED.to_string()))
            } else {
                (col.clone(), val.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Option<&str>)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(|s| s.to_string())))
            .collect()
    }

    #[test]
    fn redacts_token_hash_but_not_id() {
        let r = row(&[("id", Some("1")), ("hash", Some("secret"))]);
        let redacted = redact_row("tokens", &r);
        assert_eq!(redacted.get("hash").unwrap().as_deref(), Some("[redacted]"));
        assert_eq!(redacted.get("id").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn client_public_key_is_never_redacted() {
        let r = row(&[("public_key", Some("pubkey-bytes"))]);
        let redacted = redact_row("clients", &r);
        assert_eq!(redacted.get("public_key").unwrap().as_deref(), Some("pubkey-bytes"));
    }

    #[test]
    fn relay_tokens_is_ignored_entirely() {
        assert!(is_ignored_table("relay_tokens"));
        assert!(!is_ignored_table("clients"));
    }
}
