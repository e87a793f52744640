use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_postgres::error::SqlState;

use crate::{
    sql::{
        self,
        PgIdent,
    },
    state::MigrationState,
    store::{
        sql_state,
        RelationalStore,
    },
    CollectionRef,
};

/// Progress marker for one collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub collection: String,
    pub table: String,
    pub index: String,
    /// `pg_get_indexdef` output captured before the index was dropped.
    pub index_definition: Option<String>,
    pub state: MigrationState,
    pub last_error: Option<String>,
}

impl MigrationRecord {
    pub fn new(collection: &CollectionRef, table: String, index: String) -> Self {
        Self {
            collection: collection.collection.clone(),
            table,
            index,
            index_definition: None,
            state: MigrationState::NotMigrated,
            last_error: None,
        }
    }
}

#[async_trait]
pub trait MigrationLedger: Send + Sync {
    async fn load(&self, collection: &CollectionRef) -> anyhow::Result<Option<MigrationRecord>>;

    async fn save(&self, collection: &CollectionRef, record: &MigrationRecord)
        -> anyhow::Result<()>;

    async fn clear(&self, collection: &CollectionRef) -> anyhow::Result<()>;
}

/// Keeps records for the lifetime of the process only.
#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<BTreeMap<(String, String), MigrationRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ledger_key(collection: &CollectionRef) -> (String, String) {
    (collection.database.clone(), collection.collection.clone())
}

#[async_trait]
impl MigrationLedger for InMemoryLedger {
    async fn load(&self, collection: &CollectionRef) -> anyhow::Result<Option<MigrationRecord>> {
        Ok(self.records.lock().get(&ledger_key(collection)).cloned())
    }

    async fn save(
        &self,
        collection: &CollectionRef,
        record: &MigrationRecord,
    ) -> anyhow::Result<()> {
        self.records
            .lock()
            .insert(ledger_key(collection), record.clone());
        Ok(())
    }

    async fn clear(&self, collection: &CollectionRef) -> anyhow::Result<()> {
        self.records.lock().remove(&ledger_key(collection));
        Ok(())
    }
}

/// Stores records in a table next to the collection tables, one table per
/// schema. The table is created on first write.
pub struct PostgresLedger<'a> {
    store: &'a dyn RelationalStore,
    table: PgIdent,
}

impl<'a> PostgresLedger<'a> {
    pub fn new(store: &'a dyn RelationalStore, table: &str) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            table: PgIdent::new(table)?,
        })
    }

    fn render(&self, template: &str, collection: &CollectionRef) -> anyhow::Result<String> {
        let schema = PgIdent::schema(&collection.database)?;
        Ok(sql::render(
            template,
            &[
                ("schema", schema.escaped()),
                ("ledger", self.table.escaped()),
            ],
        ))
    }

    async fn upsert(
        &self,
        collection: &CollectionRef,
        record: &MigrationRecord,
    ) -> anyhow::Result<u64> {
        let statement = self.render(sql::UPSERT_LEDGER_RECORD, collection)?;
        let state: &'static str = record.state.into();
        self.store
            .execute(
                &statement,
                &[
                    record.collection.as_str(),
                    record.table.as_str(),
                    record.index.as_str(),
                    record.index_definition.as_deref().unwrap_or(""),
                    state,
                    record.last_error.as_deref().unwrap_or(""),
                ],
            )
            .await
    }
}

#[async_trait]
impl MigrationLedger for PostgresLedger<'_> {
    async fn load(&self, collection: &CollectionRef) -> anyhow::Result<Option<MigrationRecord>> {
        let statement = self.render(sql::SELECT_LEDGER_RECORD, collection)?;
        let row = match self
            .store
            .query_row(&statement, &[collection.collection.as_str()])
            .await
        {
            Ok(row) => row,
            // Nothing was ever recorded in this schema.
            Err(e) if sql_state(&e) == Some(SqlState::UNDEFINED_TABLE) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(row) = row else {
            return Ok(None);
        };
        let required = |idx: usize, column: &str| {
            row.get(idx)
                .map(str::to_owned)
                .with_context(|| format!("ledger column {column} is NULL"))
        };
        let state = required(3, "state")?;
        Ok(Some(MigrationRecord {
            collection: collection.collection.clone(),
            table: required(0, "table_name")?,
            index: required(1, "index_name")?,
            index_definition: row.get(2).map(str::to_owned),
            state: state
                .parse()
                .with_context(|| format!("unknown migration state {state:?}"))?,
            last_error: row.get(4).map(str::to_owned),
        }))
    }

    async fn save(
        &self,
        collection: &CollectionRef,
        record: &MigrationRecord,
    ) -> anyhow::Result<()> {
        match self.upsert(collection, record).await {
            Ok(_) => Ok(()),
            Err(e) if sql_state(&e) == Some(SqlState::UNDEFINED_TABLE) => {
                tracing::info!(
                    "Creating migration ledger {}.{}",
                    collection.database,
                    self.table
                );
                let create = self.render(sql::CREATE_LEDGER, collection)?;
                self.store.execute(&create, &[]).await?;
                self.upsert(collection, record).await?;
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    async fn clear(&self, collection: &CollectionRef) -> anyhow::Result<()> {
        let statement = self.render(sql::DELETE_LEDGER_RECORD, collection)?;
        match self
            .store
            .execute(&statement, &[collection.collection.as_str()])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if sql_state(&e) == Some(SqlState::UNDEFINED_TABLE) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
