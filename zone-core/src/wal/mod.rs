//! WAL ingestion: logical replication consumer, relation metadata cache,
//! and the change-log sink that durably records every row write (spec §4.1, §4.2).

pub mod raw;
pub mod redact;
pub mod relation;

#[cfg(feature = "replication")]
pub mod decode;
#[cfg(feature = "replication")]
pub mod consumer;
#[cfg(feature = "replication")]
pub mod sink;

pub use raw::{RawChange, RawOp, RawRow, RowParseError};
pub use relation::{ColumnInfo, RelationInfo, RelationRegistry};

#[cfg(feature = "replication")]
pub use consumer::{FlushCursor, WalConsumer};
#[cfg(feature = "replication")]
pub use decode::MessageDecoder;
#[cfg(feature = "replication")]
pub use sink::ChangeLogSink;
