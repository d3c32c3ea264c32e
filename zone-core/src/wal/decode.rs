//! Turns `pgoutput` messages into [`RawChange`]s (spec §4.1).
//!
//! One [`MessageDecoder`] lives for the life of one replication
//! connection. It owns the [`RelationRegistry`] and the current
//! transaction's `subject` (set by a preceding `LogicalMessage`, cleared
//! on `Commit`), and turns each `Insert`/`Update`/`Delete` into a
//! [`RawChange`] tagged with the relation's table name.

use bytes::Bytes;
use postgres_protocol::message::backend::{
    DeleteBody, InsertBody, LogicalReplicationMessage, RelationBody, Tuple, TupleData, UpdateBody,
};

use super::raw::{RawChange, RawOp, RawRow};
use super::relation::{ColumnInfo, RelationInfo, RelationRegistry};

#[derive(Default)]
pub struct MessageDecoder {
    relations: RelationRegistry,
    pending_subject: Option<serde_json::Value>,
}

impl MessageDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per reconnect, before the first message is processed.
    pub fn reset(&mut self) {
        self.relations.clear();
        self.pending_subject = None;
    }

    /// Decode one `pgoutput` message. Returns `Some(RawChange)` for
    /// `Insert`/`Update`/`Delete`; every other message either updates
    /// internal state (`Relation`, `Begin`, `Commit`, a `subject`
    /// `LogicalMessage`) or is a no-op (`Origin`, `Type`, `Truncate`,
    /// any other `LogicalMessage`).
    pub fn decode(
        &mut self,
        message: &LogicalReplicationMessage,
        lsn: u64,
    ) -> Result<Option<RawChange>, crate::error::Error> {
        match message {
            LogicalReplicationMessage::Begin(_) => {
                self.pending_subject = None;
                Ok(None)
            }
            LogicalReplicationMessage::Commit(_) => {
                self.pending_subject = None;
                Ok(None)
            }
            LogicalReplicationMessage::Relation(body) => {
                self.handle_relation(body)?;
                Ok(None)
            }
            LogicalReplicationMessage::Insert(body) => self.handle_insert(body, lsn),
            LogicalReplicationMessage::Update(body) => self.handle_update(body, lsn),
            LogicalReplicationMessage::Delete(body) => self.handle_delete(body, lsn),
            LogicalReplicationMessage::Message(body) => {
                if body.prefix().unwrap_or_default() == "subject" {
                    self.pending_subject = serde_json::from_slice(body.data()).ok();
                }
                Ok(None)
            }
            // Origin/Type/Truncate carry no row data this core acts on.
            _ => Ok(None),
        }
    }

    fn handle_relation(&mut self, body: &RelationBody) -> Result<(), crate::error::Error> {
        let namespace = body
            .namespace()
            .map_err(|e| crate::error::Error::Replication(format!("relation namespace: {e}")))?
            .to_string();
        let name = body
            .name()
            .map_err(|e| crate::error::Error::Replication(format!("relation name: {e}")))?
            .to_string();

        let mut columns = Vec::with_capacity(body.columns().len());
        for col in body.columns() {
            columns.push(ColumnInfo {
                name: col
                    .name()
                    .map_err(|e| crate::error::Error::Replication(format!("column name: {e}")))?
                    .to_string(),
                type_oid: col.type_id() as u32,
                is_key: col.flags() & 1 == 1,
            });
        }

        self.relations.insert(
            body.rel_id() as u32,
            RelationInfo { namespace, name, columns },
        );
        Ok(())
    }

    fn handle_insert(
        &mut self,
        body: &InsertBody,
        lsn: u64,
    ) -> Result<Option<RawChange>, crate::error::Error> {
        let rel_id = body.rel_id() as u32;
        let relation = self.relation(rel_id)?;
        let new = decode_tuple(relation, body.tuple())?;

        Ok(Some(RawChange {
            lsn,
            op: RawOp::Insert,
            table: relation.name.clone(),
            old: None,
            new: Some(new),
            txn_subject: self.pending_subject.clone(),
        }))
    }

    fn handle_update(
        &mut self,
        body: &UpdateBody,
        lsn: u64,
    ) -> Result<Option<RawChange>, crate::error::Error> {
        let rel_id = body.rel_id() as u32;
        let relation = self.relation(rel_id)?;
        let new = decode_tuple(relation, body.new_tuple())?;
        let old = match body.old_tuple().or_else(|| body.key_tuple()) {
            Some(tuple) => Some(decode_tuple(relation, tuple)?),
            None => None,
        };

        Ok(Some(RawChange {
            lsn,
            op: RawOp::Update,
            table: relation.name.clone(),
            old,
            new: Some(new),
            txn_subject: self.pending_subject.clone(),
        }))
    }

    fn handle_delete(
        &mut self,
        body: &DeleteBody,
        lsn: u64,
    ) -> Result<Option<RawChange>, crate::error::Error> {
        let rel_id = body.rel_id() as u32;
        let relation = self.relation(rel_id)?;
        let old = match body.old_tuple().or_else(|| body.key_tuple()) {
            Some(tuple) => decode_tuple(relation, tuple)?,
            None => {
                return Err(crate::error::Error::ProtocolViolation(format!(
                    "delete on {} carried no old/key tuple",
                    relation.name
                )))
            }
        };

        Ok(Some(RawChange {
            lsn,
            op: RawOp::Delete,
            table: relation.name.clone(),
            old: Some(old),
            new: None,
            txn_subject: self.pending_subject.clone(),
        }))
    }

    fn relation(&self, rel_id: u32) -> Result<&RelationInfo, crate::error::Error> {
        self.relations.get(rel_id).ok_or_else(|| {
            crate::error::Error::Invariant(format!(
                "insert/update/delete referenced unknown relation id {rel_id}; missing Relation message"
            ))
        })
    }
}

/// `pgoutput` sends column values as text unless the column is unchanged
/// TOAST (only possible for `old`/`key` tuples on wide columns this core
/// never stores, so treated as a decode error rather than silently
/// dropped — a wrong dropped column would corrupt the cache).
fn decode_tuple(relation: &RelationInfo, tuple: &Tuple) -> Result<RawRow, crate::error::Error> {
    let data = tuple.tuple_data();
    if data.len() != relation.columns.len() {
        return Err(crate::error::Error::ProtocolViolation(format!(
            "{}: tuple has {} columns, relation metadata has {}",
            relation.name,
            data.len(),
            relation.columns.len()
        )));
    }

    let mut row = RawRow::with_capacity(data.len());
    for (column, value) in relation.columns.iter().zip(data) {
        let text = match value {
            TupleData::Null => None,
            TupleData::UnchangedToast => {
                return Err(crate::error::Error::Invariant(format!(
                    "{}.{}: unexpected unchanged-toast column in replica identity",
                    relation.name, column.name
                )))
            }
            TupleData::Text(bytes) => Some(decode_text(bytes)?),
        };
        row.insert(column.name.clone(), text);
    }
    Ok(row)
}

fn decode_text(bytes: &Bytes) -> Result<String, crate::error::Error> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| crate::error::Error::ProtocolViolation(format!("non-utf8 column value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_relation_is_an_invariant_error() {
        let decoder = MessageDecoder::new();
        let err = decoder.relation(9999).unwrap_err();
        assert!(matches!(err, crate::error::Error::Invariant(_)));
    }

    #[test]
    fn reset_clears_relations_and_subject() {
        let mut decoder = MessageDecoder::new();
        decoder.relations.insert(
            1,
            RelationInfo {
                namespace: "public".into(),
                name: "accounts".into(),
                columns: vec![],
            },
        );
        decoder.pending_subject = Some(serde_json::json!({"actor": "admin"}));
        decoder.reset();
        assert!(decoder.relations.get(1).is_none());
        assert!(decoder.pending_subject.is_none());
    }
}
