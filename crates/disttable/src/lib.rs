//! Converts collections of a Postgres-backed document store into tables
//! distributed by Citus, keeping the original table name usable through a
//! view with an insert trigger.
mod catalog;
mod errors;
mod ledger;
mod metrics;
mod migrator;
pub mod sql;
mod state;
mod store;

#[cfg(test)]
mod tests;

use std::fmt;

use serde::Serialize;

pub use crate::{
    catalog::{
        CatalogEntry,
        CatalogReader,
    },
    errors::DistributionError,
    ledger::{
        InMemoryLedger,
        MigrationLedger,
        MigrationRecord,
        PostgresLedger,
    },
    migrator::{
        DistributionReport,
        TableDistributor,
        SENTINEL_PREFIX,
    },
    state::{
        MigrationState,
        MigrationStep,
    },
    store::{
        connect,
        sql_state,
        DocumentStore,
        RelationalStore,
        StatementFailure,
        TextRow,
    },
};

/// A collection of the document store. The database doubles as the Postgres
/// schema holding the collection's table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
}

impl CollectionRef {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Names the migrator relies on. The defaults match FerretDB's Postgres
/// backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributionOptions {
    /// Per-schema table mapping collections to tables and indexes.
    pub catalog_table: String,
    /// Appended to the table name to form the backing table.
    pub backing_suffix: String,
    /// Surrogate key and distribution column.
    pub key_column: String,
    /// JSONB column holding the document.
    pub payload_column: String,
    /// Document field the surrogate key is derived from.
    pub id_field: String,
    /// Per-schema table holding the migration records.
    pub ledger_table: String,
}

impl Default for DistributionOptions {
    fn default() -> Self {
        Self {
            catalog_table: "_ferretdb_database_metadata".to_owned(),
            backing_suffix: "_back".to_owned(),
            key_column: "_id".to_owned(),
            payload_column: "_jsonb".to_owned(),
            id_field: "_id".to_owned(),
            ledger_table: "_disttable_migrations".to_owned(),
        }
    }
}
