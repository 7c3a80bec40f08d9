//! Staging table naming and descriptors.
//!
//! A staging table only ever lives inside one staged mutation. Its name mixes
//! an operation prefix, a random disambiguator and the target table's name so
//! concurrent callers loading into the same target do not clash. Nothing here
//! detects a clash; a duplicate name surfaces when the create statement runs.

use std::ops::Range;

use rand::Rng;

use crate::database::postgres::table::{make_delete_table, Table};

/// Range the random disambiguator is drawn from.
pub const STAGING_RANDOM_RANGE: Range<u32> = 0..100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingKind {
    Upsert,
    Delete,
}

impl StagingKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            StagingKind::Upsert => "tmp_bulk_upsert",
            StagingKind::Delete => "tmp_bulk_delete",
        }
    }
}

pub fn generate_staging_name(base_name: &str, prefix: &str) -> String {
    let random = rand::rng().random_range(STAGING_RANDOM_RANGE);
    format!("{}_{}_{}", prefix, random, base_name)
}

/// Temporary table a batch is loaded into before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTable {
    kind: StagingKind,
    table: Table,
}

impl StagingTable {
    /// Full column copy of `target` under a fresh name.
    pub fn for_upsert(target: &Table) -> Self {
        let name = generate_staging_name(target.name(), StagingKind::Upsert.prefix());
        StagingTable { kind: StagingKind::Upsert, table: target.renamed(name) }
    }

    /// Key-only copy of `target` under a fresh name.
    pub fn for_delete(target: &Table) -> Self {
        let prefix = generate_staging_name("", StagingKind::Delete.prefix());
        StagingTable { kind: StagingKind::Delete, table: make_delete_table(target, &prefix) }
    }

    pub fn new(kind: StagingKind, target: &Table) -> Self {
        match kind {
            StagingKind::Upsert => Self::for_upsert(target),
            StagingKind::Delete => Self::for_delete(target),
        }
    }

    pub fn kind(&self) -> StagingKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.table.name()
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn column_names(&self) -> Vec<String> {
        self.table.column_names()
    }

    /// A batch may repeat a key, so the staging copy has no key constraint;
    /// reconciliation keeps the last staged row per key.
    pub fn create_statement(&self) -> String {
        self.table.create_unkeyed_temporary_statement()
    }

    pub fn drop_statement(&self) -> String {
        self.table.drop_temporary_statement()
    }
}
