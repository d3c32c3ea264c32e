//! Relation-id to table/column metadata cache (spec §4.1).
//!
//! `pgoutput` sends a `Relation` message once per table per connection
//! (and again after `ALTER TABLE`); every following `Insert`/`Update`/
//! `Delete` for that relation id refers back to it by id alone. Postgres
//! is free to reuse relation ids across a reconnect for a *different*
//! table, so the registry is cleared whenever the replication stream
//! restarts.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    /// Part of the replica identity (primary key, usually).
    pub is_key: bool,
}

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rel_id: u32, info: RelationInfo) {
        self.relations.insert(rel_id, info);
    }

    #[must_use]
    pub fn get(&self, rel_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&rel_id)
    }

    /// Called on every reconnect (spec §4.1: "cache is cleared on
    /// reconnect, since Postgres may reissue different relation ids").
    pub fn clear(&mut self) {
        self.relations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_roundtrips_through_insert() {
        let mut registry = RelationRegistry::new();
        registry.insert(
            16412,
            RelationInfo {
                namespace: "public".into(),
                name: "accounts".into(),
                columns: vec![ColumnInfo {
                    name: "id".into(),
                    type_oid: 2950,
                    is_key: true,
                }],
            },
        );
        assert_eq!(registry.get(16412).unwrap().name, "accounts");
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn clear_drops_all_entries() {
        let mut registry = RelationRegistry::new();
        registry.insert(
            1,
            RelationInfo {
                namespace: "public".into(),
                name: "t".into(),
                columns: vec![],
            },
        );
        registry.clear();
        assert!(registry.get(1).is_none());
    }
}
