//! Pure policy condition evaluator (spec §4.6).
//!
//! No I/O, no caches, no clock reads beyond what's passed in — this is
//! the one component in the whole crate that's just a function, which is
//! what makes it trivial to reason about ("not a general rules engine").

use std::net::IpAddr;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use thiserror::Error;

use crate::domain::{AuthProviderId, Client, PolicyCondition};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("unknown condition property: {0}")]
    UnknownProperty(String),
    #[error("unknown operator {operator} for property {property}")]
    UnknownOperator { property: String, operator: String },
    #[error("malformed condition value: {0}")]
    MalformedValue(String),
}

/// Everything a condition might need to look at. Built once per
/// authorization attempt by the caller (client cache / gateway cache).
pub struct EvaluationContext<'a> {
    pub client: &'a Client,
    pub auth_provider_id: Option<AuthProviderId>,
    pub remote_ip: Option<IpAddr>,
    pub remote_ip_region: Option<String>,
    pub now: DateTime<Utc>,
    /// Expiration carried by the client's own auth token, if any (spec §3:
    /// a policy's effective expiration is `min(condition_expires_at,
    /// token_expires_at)`). `None` means the token itself is unbounded,
    /// not that there is no token.
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a single policy's conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// All conditions passed. `expires_at` is the earliest window-bound
    /// implied by any condition; `None` means unbounded.
    Ok { expires_at: Option<DateTime<Utc>> },
    /// At least one condition failed; lists every property that failed,
    /// deduplicated.
    Forbidden { violated_properties: Vec<String> },
}

/// Fold the client's token expiry into an already-evaluated `Decision`
/// (spec §3: effective expiration is `min(condition_expires_at,
/// token_expires_at)`). A `Forbidden` decision is untouched — an expired
/// token can only shorten a grant, never rescue a failed condition.
#[must_use]
pub fn fold_token_expiry(decision: Decision, token_expires_at: Option<DateTime<Utc>>) -> Decision {
    match decision {
        Decision::Ok { expires_at } => Decision::Ok {
            expires_at: super::longest_conforming::earliest(expires_at, token_expires_at),
        },
        forbidden => forbidden,
    }
}

/// A single condition's own outcome, before folding into a [`Decision`].
enum ConditionResult {
    Pass { expires_at: Option<DateTime<Utc>> },
    Fail,
}

/// Evaluate one policy's conditions against a context. An empty
/// condition list always passes with no expiration (spec §8 round-trip
/// law).
pub fn evaluate(
    conditions: &[PolicyCondition],
    ctx: &EvaluationContext<'_>,
) -> Result<Decision, EvaluationError> {
    let mut violated = Vec::new();
    // The tightest (earliest) window bound any passing condition implies.
    let mut tightest_expiry: Option<DateTime<Utc>> = None;
    let mut any_bound = false;

    for condition in conditions {
        match evaluate_condition(condition, ctx)? {
            ConditionResult::Pass { expires_at } => {
                if let Some(exp) = expires_at {
                    any_bound = true;
                    tightest_expiry = Some(match tightest_expiry {
                        Some(current) => current.min(exp),
                        None => exp,
                    });
                }
            }
            ConditionResult::Fail => {
                if !violated.contains(&condition.property) {
                    violated.push(condition.property.clone());
                }
            }
        }
    }

    if !violated.is_empty() {
        return Ok(Decision::Forbidden {
            violated_properties: violated,
        });
    }

    Ok(Decision::Ok {
        expires_at: if any_bound { tightest_expiry } else { None },
    })
}

fn evaluate_condition(
    condition: &PolicyCondition,
    ctx: &EvaluationContext<'_>,
) -> Result<ConditionResult, EvaluationError> {
    match condition.property.as_str() {
        "auth_provider_id" => evaluate_auth_provider(condition, ctx),
        "remote_ip" => evaluate_remote_ip(condition, ctx),
        "remote_ip_location_region" => evaluate_remote_ip_region(condition, ctx),
        "current_utc_datetime" => evaluate_current_datetime(condition, ctx),
        "client_verified" => evaluate_client_verified(condition, ctx),
        other => Err(EvaluationError::UnknownProperty(other.to_string())),
    }
}

fn evaluate_auth_provider(
    condition: &PolicyCondition,
    ctx: &EvaluationContext<'_>,
) -> Result<ConditionResult, EvaluationError> {
    let matches = ctx
        .auth_provider_id
        .map(|id| condition.values.iter().any(|v| v == &id.to_string()))
        .unwrap_or(false);

    match condition.operator.as_str() {
        "is_in" => Ok(bool_result(matches)),
        "is_not_in" => Ok(bool_result(!matches)),
        other => Err(EvaluationError::UnknownOperator {
            property: condition.property.clone(),
            operator: other.to_string(),
        }),
    }
}

fn evaluate_remote_ip(
    condition: &PolicyCondition,
    ctx: &EvaluationContext<'_>,
) -> Result<ConditionResult, EvaluationError> {
    let Some(ip) = ctx.remote_ip else {
        return Ok(ConditionResult::Fail);
    };

    let mut matched = false;
    for raw in &condition.values {
        if let Ok(net) = raw.parse::<ipnet::IpNet>() {
            if net.contains(&ip) {
                matched = true;
                break;
            }
        } else if let Ok(literal) = raw.parse::<IpAddr>() {
            if literal == ip {
                matched = true;
                break;
            }
        } else {
            return Err(EvaluationError::MalformedValue(raw.clone()));
        }
    }

    match condition.operator.as_str() {
        "is_in" => Ok(bool_result(matched)),
        "is_not_in" => Ok(bool_result(!matched)),
        other => Err(EvaluationError::UnknownOperator {
            property: condition.property.clone(),
            operator: other.to_string(),
        }),
    }
}

fn evaluate_remote_ip_region(
    condition: &PolicyCondition,
    ctx: &EvaluationContext<'_>,
) -> Result<ConditionResult, EvaluationError> {
    let matches = ctx
        .remote_ip_region
        .as_ref()
        .map(|region| condition.values.iter().any(|v| v == region))
        .unwrap_or(false);

    match condition.operator.as_str() {
        "is_in" => Ok(bool_result(matches)),
        "is_not_in" => Ok(bool_result(!matches)),
        other => Err(EvaluationError::UnknownOperator {
            property: condition.property.clone(),
            operator: other.to_string(),
        }),
    }
}

fn evaluate_client_verified(
    condition: &PolicyCondition,
    ctx: &EvaluationContext<'_>,
) -> Result<ConditionResult, EvaluationError> {
    let verified = ctx.client.is_verified();
    let expected = condition
        .values
        .first()
        .map(|v| v == "true")
        .unwrap_or(true);

    match condition.operator.as_str() {
        "is" => Ok(bool_result(verified == expected)),
        other => Err(EvaluationError::UnknownOperator {
            property: condition.property.clone(),
            operator: other.to_string(),
        }),
    }
}

/// A window is encoded `"Mon/09:00-17:00"` in UTC, one string per
/// applicable day. `current_utc_datetime` passes if `now` falls within
/// any window, and the pass carries `expires_at` = end of that window —
/// the one condition type that can itself bound the policy's expiration.
fn evaluate_current_datetime(
    condition: &PolicyCondition,
    ctx: &EvaluationContext<'_>,
) -> Result<ConditionResult, EvaluationError> {
    let today = ctx.now.weekday();
    let seconds_since_midnight = ctx.now.num_seconds_from_midnight();

    for raw in &condition.values {
        let (day_str, range) = raw
            .split_once('/')
            .ok_or_else(|| EvaluationError::MalformedValue(raw.clone()))?;
        let day = parse_weekday(day_str)
            .ok_or_else(|| EvaluationError::MalformedValue(raw.clone()))?;
        if day != today {
            continue;
        }
        let (start_str, end_str) = range
            .split_once('-')
            .ok_or_else(|| EvaluationError::MalformedValue(raw.clone()))?;
        let start = parse_time_of_day(start_str)
            .ok_or_else(|| EvaluationError::MalformedValue(raw.clone()))?;
        let end = parse_time_of_day(end_str)
            .ok_or_else(|| EvaluationError::MalformedValue(raw.clone()))?;

        if seconds_since_midnight >= start && seconds_since_midnight < end {
            let midnight = ctx
                .now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid");
            let window_end = midnight + chrono::Duration::seconds(i64::from(end));
            let expires_at = DateTime::<Utc>::from_naive_utc_and_offset(window_end, Utc);
            return Ok(ConditionResult::Pass {
                expires_at: Some(expires_at),
            });
        }
    }

    match condition.operator.as_str() {
        // On the negative path there is no active window, so there is
        // nothing to bound expiration with — the open question in spec
        // §9 is resolved by returning `None`, never erroring.
        "is_in" => Ok(ConditionResult::Fail),
        other => Err(EvaluationError::UnknownOperator {
            property: condition.property.clone(),
            operator: other.to_string(),
        }),
    }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s {
        "Mon" => Some(Weekday::Mon),
        "Tue" => Some(Weekday::Tue),
        "Wed" => Some(Weekday::Wed),
        "Thu" => Some(Weekday::Thu),
        "Fri" => Some(Weekday::Fri),
        "Sat" => Some(Weekday::Sat),
        "Sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Parse `"HH:MM"` into seconds-since-midnight.
fn parse_time_of_day(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 3600 + minutes * 60)
}

fn bool_result(value: bool) -> ConditionResult {
    if value {
        ConditionResult::Pass { expires_at: None }
    } else {
        ConditionResult::Fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActorId, AccountId, ClientId};
    use std::net::Ipv4Addr;
    use std::net::Ipv6Addr;
    use uuid::Uuid;

    fn client(verified: bool) -> Client {
        Client {
            id: ClientId::new(Uuid::nil()),
            account_id: AccountId::new(Uuid::nil()),
            actor_id: ActorId::new(Uuid::nil()),
            external_id: "ext".into(),
            public_key: "x".repeat(44),
            ipv4: Ipv4Addr::new(100, 64, 0, 1),
            ipv6: Ipv6Addr::LOCALHOST,
            last_seen_user_agent: None,
            last_seen_version: "1.4.0".into(),
            verified_at: verified.then(Utc::now),
            deleted_at: None,
        }
    }

    fn ctx(client: &Client, now: DateTime<Utc>) -> EvaluationContext<'_> {
        EvaluationContext {
            client,
            auth_provider_id: None,
            remote_ip: None,
            remote_ip_region: None,
            now,
            token_expires_at: None,
        }
    }

    #[test]
    fn fold_token_expiry_shortens_an_ok_decision() {
        let window_end = "2024-01-01T17:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let token_expiry = "2024-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let decision = Decision::Ok { expires_at: Some(window_end) };
        assert_eq!(
            fold_token_expiry(decision, Some(token_expiry)),
            Decision::Ok { expires_at: Some(token_expiry) }
        );
    }

    #[test]
    fn fold_token_expiry_leaves_forbidden_untouched() {
        let decision = Decision::Forbidden {
            violated_properties: vec!["client_verified".into()],
        };
        assert_eq!(
            fold_token_expiry(decision.clone(), Some(Utc::now())),
            decision
        );
    }

    #[test]
    fn empty_conditions_always_pass_unbounded() {
        let c = client(true);
        let decision = evaluate(&[], &ctx(&c, Utc::now())).unwrap();
        assert_eq!(decision, Decision::Ok { expires_at: None });
    }

    #[test]
    fn client_verified_condition_checks_flag() {
        let c = client(false);
        let condition = PolicyCondition {
            property: "client_verified".into(),
            operator: "is".into(),
            values: vec!["true".into()],
        };
        let decision = evaluate(&[condition], &ctx(&c, Utc::now())).unwrap();
        assert_eq!(
            decision,
            Decision::Forbidden {
                violated_properties: vec!["client_verified".into()]
            }
        );
    }

    #[test]
    fn unknown_property_is_an_error_not_a_denial() {
        let c = client(true);
        let condition = PolicyCondition {
            property: "nonexistent".into(),
            operator: "is".into(),
            values: vec![],
        };
        let err = evaluate(&[condition], &ctx(&c, Utc::now())).unwrap_err();
        assert_eq!(err, EvaluationError::UnknownProperty("nonexistent".into()));
    }

    #[test]
    fn time_window_outside_range_fails_without_expiry() {
        let c = client(true);
        let now = "2024-01-01T23:00:00Z".parse::<DateTime<Utc>>().unwrap(); // a Monday
        let condition = PolicyCondition {
            property: "current_utc_datetime".into(),
            operator: "is_in".into(),
            values: vec!["Mon/09:00-17:00".into()],
        };
        let decision = evaluate(&[condition], &ctx(&c, now)).unwrap();
        assert_eq!(
            decision,
            Decision::Forbidden {
                violated_properties: vec!["current_utc_datetime".into()]
            }
        );
    }

    #[test]
    fn time_window_inside_range_returns_window_end_as_expiry() {
        let c = client(true);
        let now = "2024-01-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap(); // a Monday
        let condition = PolicyCondition {
            property: "current_utc_datetime".into(),
            operator: "is_in".into(),
            values: vec!["Mon/09:00-17:00".into()],
        };
        let decision = evaluate(&[condition], &ctx(&c, now)).unwrap();
        match decision {
            Decision::Ok { expires_at } => {
                let expected = "2024-01-01T17:00:00Z".parse::<DateTime<Utc>>().unwrap();
                assert_eq!(expires_at, Some(expected));
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }
}
