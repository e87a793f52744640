//! The forward path, its reverse and the repair operation.
//!
//! Every step is one or two statements followed by a ledger update, so a
//! run that fails halfway can be resumed with [`TableDistributor::distribute`]
//! or undone with [`TableDistributor::rollback`]. Nothing here retries or
//! compensates on its own.
use serde::Serialize;
use serde_json::{
    Map,
    Value as JsonValue,
};
use uuid::Uuid;

use crate::{
    catalog::CatalogReader,
    errors::DistributionError,
    ledger::{
        MigrationLedger,
        MigrationRecord,
    },
    metrics,
    sql::{
        self,
        InvalidIdentifier,
        PgIdent,
        Statement,
        TableNames,
    },
    state::{
        MigrationState,
        MigrationStep,
    },
    store::{
        DocumentStore,
        RelationalStore,
    },
    CollectionRef,
    DistributionOptions,
};

pub const SENTINEL_PREFIX: &str = "disttable-sentinel-";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DistributionReport {
    pub table: String,
    pub backing_table: String,
    /// Set when the run continued a previously interrupted one.
    pub resumed_from: Option<MigrationState>,
    pub steps_applied: Vec<MigrationStep>,
}

/// Names and captured state needed to render any step for one collection.
pub(crate) struct Plan {
    names: TableNames,
    /// Unknown on the reverse path, which never touches the index.
    index: Option<PgIdent>,
    index_definition: Option<String>,
}

impl Plan {
    pub(crate) fn new(
        schema: &PgIdent,
        record: &MigrationRecord,
        options: &DistributionOptions,
    ) -> Result<Self, InvalidIdentifier> {
        Ok(Self {
            names: TableNames::new(schema, &record.table, options)?,
            index: Some(PgIdent::new(&record.index)?),
            index_definition: record.index_definition.clone(),
        })
    }

    pub(crate) fn statements(&self, step: MigrationStep) -> Vec<Statement> {
        let names = &self.names;
        let render = |template: &str| Statement::new(names.render(template));
        match step {
            MigrationStep::ResolveCatalog => vec![],
            MigrationStep::DropIndex => self
                .index
                .iter()
                .map(|index| {
                    let bindings = [("index", index.escaped())];
                    Statement::new(names.render_with(sql::DROP_INDEX, &bindings))
                })
                .collect(),
            MigrationStep::RenameTable => vec![render(sql::RENAME_TABLE)],
            MigrationStep::AddKeyColumn => vec![render(sql::ADD_KEY_COLUMN)],
            // Rows written before the migration carry their key only in the
            // payload.
            MigrationStep::PromoteKey => vec![
                render(sql::DERIVE_EXISTING_KEYS),
                render(sql::ADD_PRIMARY_KEY),
            ],
            MigrationStep::DistributeTable => vec![Statement::with_params(
                sql::DISTRIBUTE_TABLE.to_owned(),
                [names.qualified_back(), names.key_column.raw().to_owned()],
            )],
            MigrationStep::CreateView => vec![render(sql::CREATE_VIEW)],
            MigrationStep::CreateInsertTrigger => vec![
                render(sql::CREATE_TRIGGER_FUNCTION),
                render(sql::CREATE_TRIGGER),
            ],

            MigrationStep::DropBackingTable => vec![
                render(sql::DROP_BACKING_TABLE_CASCADE),
                render(sql::DROP_TRIGGER_FUNCTION),
            ],

            MigrationStep::RemoveInsertTrigger => vec![
                render(sql::DROP_TRIGGER),
                render(sql::DROP_TRIGGER_FUNCTION),
            ],
            MigrationStep::DropView => vec![render(sql::DROP_VIEW)],
            MigrationStep::UndistributeTable => vec![Statement::with_params(
                sql::UNDISTRIBUTE_TABLE.to_owned(),
                [names.qualified_back()],
            )],
            MigrationStep::DropPrimaryKey => vec![render(sql::DROP_PRIMARY_KEY)],
            MigrationStep::DropKeyColumn => vec![render(sql::DROP_KEY_COLUMN)],
            MigrationStep::RestoreTableName => vec![render(sql::RESTORE_TABLE_NAME)],
            MigrationStep::RestoreIndex => self
                .index_definition
                .iter()
                .map(|definition| Statement::new(definition.clone()))
                .collect(),
        }
    }
}

/// Migrates collections of one document store to distributed tables.
///
/// Both stores are borrowed; the caller serializes operations on the same
/// collection.
pub struct TableDistributor<'a> {
    store: &'a dyn RelationalStore,
    ledger: &'a dyn MigrationLedger,
    options: DistributionOptions,
}

impl<'a> TableDistributor<'a> {
    pub fn new(store: &'a dyn RelationalStore, ledger: &'a dyn MigrationLedger) -> Self {
        Self {
            store,
            ledger,
            options: DistributionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DistributionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DistributionOptions {
        &self.options
    }

    /// Runs the forward path, or continues it from the state recorded in the
    /// ledger.
    pub async fn distribute(
        &self,
        documents: &dyn DocumentStore,
        collection: &CollectionRef,
    ) -> Result<DistributionReport, DistributionError> {
        let result = self.distribute_inner(documents, collection).await;
        metrics::log_operation("distribute", result.is_ok());
        result
    }

    /// Drops the backing table together with the view and trigger that depend
    /// on it. Documents stored in the collection are lost.
    ///
    /// The migration record is cleared as well, also when the collection or
    /// its backing table turns out not to exist.
    pub async fn drop_distribution(
        &self,
        collection: &CollectionRef,
    ) -> Result<(), DistributionError> {
        let result = self.drop_distribution_inner(collection).await;
        metrics::log_operation("drop_distribution", result.is_ok());
        result
    }

    /// Undoes every applied forward step, newest first, and returns the state
    /// the collection ends up in.
    pub async fn rollback(
        &self,
        collection: &CollectionRef,
    ) -> Result<MigrationState, DistributionError> {
        let result = self.rollback_inner(collection).await;
        metrics::log_operation("rollback", result.is_ok());
        result
    }

    pub async fn status(
        &self,
        collection: &CollectionRef,
    ) -> Result<Option<MigrationRecord>, DistributionError> {
        self.load_record(collection).await
    }

    async fn distribute_inner(
        &self,
        documents: &dyn DocumentStore,
        collection: &CollectionRef,
    ) -> Result<DistributionReport, DistributionError> {
        let schema = PgIdent::schema(&collection.database)?;
        let (mut record, resumed_from) = match self.load_record(collection).await? {
            Some(record) if record.state == MigrationState::Done => {
                return Err(DistributionError::AlreadyDistributed {
                    collection: collection.to_string(),
                });
            },
            Some(record) if record.state != MigrationState::NotMigrated => {
                tracing::info!(
                    "Resuming distribution of {collection} from {}",
                    record.state
                );
                let state = record.state;
                (record, Some(state))
            },
            // A record that never got past the first step is started over:
            // the original table is untouched.
            _ => (self.prepare(documents, collection, &schema).await?, None),
        };
        let plan = Plan::new(&schema, &record, &self.options)?;

        let mut steps_applied = vec![];
        while let Some((step, next)) = record.state.forward_step() {
            if let Err(e) = self.apply(step, collection, &plan).await {
                record.last_error = Some(e.to_string());
                self.save_failure(collection, &record).await;
                return Err(e);
            }
            record.state = next;
            record.last_error = None;
            self.save_record(collection, &record).await?;
            steps_applied.push(step);
        }
        tracing::info!(
            "Distributed {collection} as {}",
            plan.names.qualified_back()
        );
        Ok(DistributionReport {
            table: record.table,
            backing_table: plan.names.back.raw().to_owned(),
            resumed_from,
            steps_applied,
        })
    }

    /// Makes sure the document store has created the catalog entry and table,
    /// then resolves them.
    async fn prepare(
        &self,
        documents: &dyn DocumentStore,
        collection: &CollectionRef,
        schema: &PgIdent,
    ) -> Result<MigrationRecord, DistributionError> {
        self.touch_collection(documents, collection).await?;

        let timer = metrics::step_timer(MigrationStep::ResolveCatalog);
        let entry = self.catalog()?.resolve(collection, schema).await?;
        let catalog_error = |source: anyhow::Error| DistributionError::CatalogRead {
            collection: collection.to_string(),
            source,
        };
        let index = entry
            .primary_index
            .ok_or_else(|| catalog_error(anyhow::anyhow!("catalog entry lists no index")))?;
        let mut record = MigrationRecord::new(collection, entry.table, index);
        // Rejects over-long derived names before anything is changed.
        Plan::new(schema, &record, &self.options)?;
        let qualified_index = PgIdent::new(&record.index)?.qualified(schema);
        record.index_definition = self
            .store
            .query_row(sql::SELECT_INDEX_DEFINITION, &[qualified_index.as_str()])
            .await
            .map_err(catalog_error)?
            .and_then(|row| row.get(0).map(str::to_owned));
        if record.index_definition.is_none() {
            tracing::warn!("Index {qualified_index} not found, rollback will not recreate it");
        }
        let elapsed = timer.finish();
        tracing::info!(
            "Resolved {collection} to {}.{} in {elapsed:?}",
            schema,
            record.table
        );
        Ok(record)
    }

    /// The document store creates the catalog entry and table lazily on
    /// first write.
    async fn touch_collection(
        &self,
        documents: &dyn DocumentStore,
        collection: &CollectionRef,
    ) -> Result<(), DistributionError> {
        let mut sentinel = Map::new();
        sentinel.insert(
            self.options.id_field.clone(),
            JsonValue::String(format!("{SENTINEL_PREFIX}{}", Uuid::new_v4())),
        );
        let sentinel = JsonValue::Object(sentinel);
        documents
            .insert_one(collection, sentinel.clone())
            .await
            .map_err(|source| DistributionError::DocumentStore {
                collection: collection.to_string(),
                source,
            })?;
        if let Err(e) = documents.delete_one(collection, sentinel).await {
            tracing::warn!("Failed to delete sentinel document from {collection}: {e:#}");
        }
        Ok(())
    }

    async fn drop_distribution_inner(
        &self,
        collection: &CollectionRef,
    ) -> Result<(), DistributionError> {
        let result = self.drop_backing_table(collection).await;
        if result.as_ref().is_err_and(|e| !e.is_not_found()) {
            return result;
        }
        // With no backing table left, a record of a partial run is stale.
        if result.is_err() {
            tracing::debug!("No backing table for {collection}, clearing its migration record");
        }
        self.ledger
            .clear(collection)
            .await
            .map_err(|source| ledger_error(collection, source))?;
        result
    }

    async fn drop_backing_table(&self, collection: &CollectionRef) -> Result<(), DistributionError> {
        let schema = PgIdent::schema(&collection.database)?;
        let timer = metrics::step_timer(MigrationStep::ResolveCatalog);
        let entry = self.catalog()?.resolve(collection, &schema).await?;
        timer.finish();
        let plan = Plan {
            names: TableNames::new(&schema, &entry.table, &self.options)?,
            index: None,
            index_definition: None,
        };
        self.apply(MigrationStep::DropBackingTable, collection, &plan)
            .await
    }

    async fn rollback_inner(
        &self,
        collection: &CollectionRef,
    ) -> Result<MigrationState, DistributionError> {
        let Some(mut record) = self.load_record(collection).await? else {
            return Ok(MigrationState::NotMigrated);
        };
        let schema = PgIdent::schema(&collection.database)?;
        let plan = Plan::new(&schema, &record, &self.options)?;
        while let Some((step, previous)) = record.state.rollback_step() {
            if step == MigrationStep::RestoreIndex && plan.index_definition.is_none() {
                tracing::warn!(
                    "No definition recorded for index {} of {collection}, skipping",
                    record.index
                );
            }
            if let Err(e) = self.apply(step, collection, &plan).await {
                record.last_error = Some(e.to_string());
                self.save_failure(collection, &record).await;
                return Err(e);
            }
            record.state = previous;
            record.last_error = None;
            if previous != MigrationState::NotMigrated {
                self.save_record(collection, &record).await?;
            }
        }
        self.ledger
            .clear(collection)
            .await
            .map_err(|source| ledger_error(collection, source))?;
        tracing::info!("Rolled back {collection}");
        Ok(record.state)
    }

    /// Executes the statements of one step in order, stopping at the first
    /// failure.
    async fn apply(
        &self,
        step: MigrationStep,
        collection: &CollectionRef,
        plan: &Plan,
    ) -> Result<(), DistributionError> {
        let timer = metrics::step_timer(step);
        for statement in plan.statements(step) {
            let params: Vec<&str> = statement.params.iter().map(String::as_str).collect();
            if let Err(source) = self.store.execute(&statement.text, &params).await {
                let err = DistributionError::from_step(step, collection.to_string(), source);
                if err.is_not_found() {
                    timer.finish_with("not_found");
                }
                return Err(err);
            }
        }
        let elapsed = timer.finish();
        tracing::info!(
            "{step} on {}.{} finished in {elapsed:?}",
            plan.names.schema,
            plan.names.table
        );
        Ok(())
    }

    fn catalog(&self) -> Result<CatalogReader<'a>, DistributionError> {
        CatalogReader::new(self.store, &self.options.catalog_table)
    }

    async fn load_record(
        &self,
        collection: &CollectionRef,
    ) -> Result<Option<MigrationRecord>, DistributionError> {
        self.ledger
            .load(collection)
            .await
            .map_err(|source| ledger_error(collection, source))
    }

    async fn save_record(
        &self,
        collection: &CollectionRef,
        record: &MigrationRecord,
    ) -> Result<(), DistributionError> {
        self.ledger
            .save(collection, record)
            .await
            .map_err(|source| ledger_error(collection, source))
    }

    /// Records a failed step. The step's error is what the caller sees, so a
    /// ledger failure here is only logged.
    async fn save_failure(&self, collection: &CollectionRef, record: &MigrationRecord) {
        if let Err(e) = self.ledger.save(collection, record).await {
            tracing::error!(
                "Failed to record {} failure for {collection}: {e:#}",
                record.state
            );
        }
    }
}

fn ledger_error(collection: &CollectionRef, source: anyhow::Error) -> DistributionError {
    DistributionError::Ledger {
        collection: collection.to_string(),
        source,
    }
}
