//! L0: the in-process pub/sub fabric every other component is built on.

pub mod broker;
pub mod message;
pub mod topic;

pub use broker::{Mailbox, PubSub, SubscriberId};
pub use message::{Change, ChangeOp, DomainEvent};
pub use topic::Topic;
