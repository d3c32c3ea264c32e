//! L3: pure policy evaluation and the longest-conforming-policy rule.

pub mod evaluator;
pub mod longest_conforming;

pub use evaluator::{evaluate, fold_token_expiry, Decision, EvaluationContext, EvaluationError};
pub use longest_conforming::{earliest, longest_conforming, Candidate, Outcome};
