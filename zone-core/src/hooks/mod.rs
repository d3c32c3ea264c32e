//! L2: per-table WAL event hooks (spec §4.3).
//!
//! `decode` turns a raw WAL row into its typed domain entity; `dispatch`
//! maps one decoded change to the `(Topic, DomainEvent)` pairs it produces,
//! including the handful of cascades that need a database round trip
//! rather than a pure in-memory projection — those are consumed by
//! [`cascade::CascadeWorker`], never performed inline in `dispatch`, so a
//! slow cascade delete never holds up the primary change propagation.

pub mod decode;
pub mod dispatch;

#[cfg(feature = "database")]
pub mod cascade;

pub use dispatch::{dispatch as dispatch_change, DispatchOutcome};
