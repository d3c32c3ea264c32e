//! Selecting the single policy that decides access to a resource (spec
//! §3 invariant 3, §4.6).

use chrono::{DateTime, Utc};

use crate::domain::{Policy, PolicyId};

use super::evaluator::Decision;

/// One policy's evaluated outcome, paired with its id so the winner can
/// be reported back to the caller.
pub struct Candidate<'a> {
    pub policy: &'a Policy,
    pub decision: Decision,
}

/// The winning policy plus its effective expiration, or every violated
/// property across every policy that was tried.
pub enum Outcome<'a> {
    Granted {
        policy_id: PolicyId,
        expires_at: Option<DateTime<Utc>>,
    },
    Forbidden {
        violated_properties: Vec<String>,
    },
    /// No policy in the input referenced the resource at all.
    NoPolicies,
}

/// Fold a set of per-policy decisions into the single access decision
/// for a (client, resource) pair. Ties broken by later `expires_at`,
/// treating `None` as +∞ (spec §3 invariant 3).
pub fn longest_conforming<'a>(candidates: impl IntoIterator<Item = Candidate<'a>>) -> Outcome<'a> {
    let mut winner: Option<(PolicyId, Option<DateTime<Utc>>)> = None;
    let mut violated = Vec::new();
    let mut saw_any = false;

    for candidate in candidates {
        saw_any = true;
        match candidate.decision {
            Decision::Ok { expires_at } => {
                let better = match &winner {
                    None => true,
                    Some((_, current_expiry)) => is_later(expires_at, *current_expiry),
                };
                if better {
                    winner = Some((candidate.policy.id, expires_at));
                }
            }
            Decision::Forbidden {
                violated_properties, ..
            } => {
                for property in violated_properties {
                    if !violated.contains(&property) {
                        violated.push(property);
                    }
                }
            }
        }
    }

    if let Some((policy_id, expires_at)) = winner {
        return Outcome::Granted {
            policy_id,
            expires_at,
        };
    }

    if !saw_any {
        return Outcome::NoPolicies;
    }

    Outcome::Forbidden {
        violated_properties: violated,
    }
}

/// `min(a, b)` treating `None` as +∞ (spec §3: a policy's effective
/// expiration is `min(condition_expires_at, token_expires_at)`).
#[must_use]
pub fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}

/// `None` (no expiration) is always later than any concrete timestamp.
fn is_later(candidate: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> bool {
    match (candidate, current) {
        (None, None) => false,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a > b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountId, ActorGroupId, ResourceId};
    use uuid::Uuid;

    fn policy(id: u8) -> Policy {
        Policy {
            id: PolicyId::new(Uuid::from_u128(id as u128)),
            account_id: AccountId::new(Uuid::nil()),
            actor_group_id: ActorGroupId::new(Uuid::nil()),
            resource_id: ResourceId::new(Uuid::nil()),
            conditions: vec![],
            disabled_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn later_expiry_wins_over_earlier() {
        let p1 = policy(1);
        let p2 = policy(2);
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::hours(1);

        let candidates = vec![
            Candidate {
                policy: &p1,
                decision: Decision::Ok {
                    expires_at: Some(t1),
                },
            },
            Candidate {
                policy: &p2,
                decision: Decision::Ok {
                    expires_at: Some(t2),
                },
            },
        ];

        match longest_conforming(candidates) {
            Outcome::Granted { policy_id, .. } => assert_eq!(policy_id, p2.id),
            _ => panic!("expected a grant"),
        }
    }

    #[test]
    fn unbounded_expiry_beats_any_concrete_one() {
        let p1 = policy(1);
        let p2 = policy(2);

        let candidates = vec![
            Candidate {
                policy: &p1,
                decision: Decision::Ok {
                    expires_at: Some(Utc::now()),
                },
            },
            Candidate {
                policy: &p2,
                decision: Decision::Ok { expires_at: None },
            },
        ];

        match longest_conforming(candidates) {
            Outcome::Granted { policy_id, expires_at } => {
                assert_eq!(policy_id, p2.id);
                assert_eq!(expires_at, None);
            }
            _ => panic!("expected a grant"),
        }
    }

    #[test]
    fn all_forbidden_aggregates_unique_violations() {
        let p1 = policy(1);
        let p2 = policy(2);

        let candidates = vec![
            Candidate {
                policy: &p1,
                decision: Decision::Forbidden {
                    violated_properties: vec!["client_verified".into()],
                },
            },
            Candidate {
                policy: &p2,
                decision: Decision::Forbidden {
                    violated_properties: vec![
                        "client_verified".into(),
                        "auth_provider_id".into(),
                    ],
                },
            },
        ];

        match longest_conforming(candidates) {
            Outcome::Forbidden { violated_properties } => {
                assert_eq!(violated_properties.len(), 2);
            }
            _ => panic!("expected forbidden"),
        }
    }

    #[test]
    fn earliest_treats_none_as_unbounded() {
        let t = Utc::now();
        assert_eq!(earliest(None, None), None);
        assert_eq!(earliest(Some(t), None), Some(t));
        assert_eq!(earliest(None, Some(t)), Some(t));
    }

    #[test]
    fn earliest_picks_the_sooner_timestamp() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::hours(1);
        assert_eq!(earliest(Some(t1), Some(t2)), Some(t1));
        assert_eq!(earliest(Some(t2), Some(t1)), Some(t1));
    }

    #[test]
    fn no_candidates_is_distinguished_from_forbidden() {
        let candidates: Vec<Candidate<'_>> = vec![];
        assert!(matches!(longest_conforming(candidates), Outcome::NoPolicies));
    }
}
