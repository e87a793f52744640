use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{
    json,
    Value as JsonValue,
};
use strum::IntoEnumIterator;
use tokio_postgres::error::SqlState;

use crate::{
    sql::{
        self,
        PgIdent,
        Statement,
    },
    CollectionRef,
    DistributionError,
    DocumentStore,
    InMemoryLedger,
    MigrationLedger,
    MigrationRecord,
    MigrationState,
    MigrationStep,
    PostgresLedger,
    RelationalStore,
    StatementFailure,
    TableDistributor,
    TextRow,
    SENTINEL_PREFIX,
};

const DATABASE: &str = "ferretdb";
const TABLE: &str = "orders_c8e9a2f1";
const INDEX: &str = "orders_c8e9a2f1_id_";
const CATALOG: &str = "_ferretdb_database_metadata";

fn orders() -> CollectionRef {
    CollectionRef::new(DATABASE, "orders")
}

fn index_definition() -> String {
    format!(
        "CREATE UNIQUE INDEX {INDEX} ON {DATABASE}.{TABLE} USING btree (((_jsonb -> '_id'::text)))"
    )
}

/// Relational store that records every statement it is asked to execute and
/// answers catalog lookups from memory.
#[derive(Default)]
struct FakeStore {
    executed: Mutex<Vec<Statement>>,
    catalog: Mutex<BTreeMap<String, TextRow>>,
    index_definition: Mutex<Option<String>>,
    faults: Mutex<Vec<(&'static str, SqlState)>>,
}

impl FakeStore {
    fn with_collection(collection: &str, table: &str, index: Option<&str>) -> Self {
        let store = Self::default();
        store
            .catalog
            .lock()
            .insert(collection.to_owned(), TextRow::from([Some(table), index]));
        if index.is_some() {
            *store.index_definition.lock() = Some(index_definition());
        }
        store
    }

    fn orders() -> Self {
        Self::with_collection("orders", TABLE, Some(INDEX))
    }

    /// Fails every statement containing `needle` with `code`.
    fn fail_on(&self, needle: &'static str, code: SqlState) {
        self.faults.lock().push((needle, code));
    }

    fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    fn take_executed(&self) -> Vec<Statement> {
        std::mem::take(&mut *self.executed.lock())
    }

    fn take_texts(&self) -> Vec<String> {
        self.take_executed().into_iter().map(|s| s.text).collect()
    }

    fn check_faults(&self, statement: &str) -> anyhow::Result<()> {
        let faults = self.faults.lock();
        if let Some((_, code)) = faults.iter().find(|(needle, _)| statement.contains(needle)) {
            anyhow::bail!(StatementFailure::new(code.clone(), "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for FakeStore {
    async fn execute(&self, statement: &str, params: &[&str]) -> anyhow::Result<u64> {
        self.executed.lock().push(Statement {
            text: statement.to_owned(),
            params: params.iter().map(|p| p.to_string()).collect(),
        });
        self.check_faults(statement)?;
        Ok(0)
    }

    async fn query_row(
        &self,
        statement: &str,
        params: &[&str],
    ) -> anyhow::Result<Option<TextRow>> {
        self.check_faults(statement)?;
        if statement.contains("pg_get_indexdef") {
            return Ok(Some(TextRow(vec![self.index_definition.lock().clone()])));
        }
        if statement.contains(CATALOG) {
            return Ok(self.catalog.lock().get(params[0]).cloned());
        }
        anyhow::bail!("unexpected query: {statement}")
    }
}

#[derive(Default)]
struct FakeDocuments {
    inserted: Mutex<Vec<(CollectionRef, JsonValue)>>,
    deleted: Mutex<Vec<JsonValue>>,
    fail_insert: bool,
    fail_delete: bool,
}

#[async_trait]
impl DocumentStore for FakeDocuments {
    async fn insert_one(
        &self,
        collection: &CollectionRef,
        document: JsonValue,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!self.fail_insert, "insert rejected");
        self.inserted.lock().push((collection.clone(), document));
        Ok(())
    }

    async fn delete_one(
        &self,
        _collection: &CollectionRef,
        filter: JsonValue,
    ) -> anyhow::Result<u64> {
        anyhow::ensure!(!self.fail_delete, "delete rejected");
        self.deleted.lock().push(filter);
        Ok(1)
    }

    async fn drop_collection(&self, _collection: &CollectionRef) -> anyhow::Result<()> {
        Ok(())
    }
}

struct BrokenLedger;

#[async_trait]
impl MigrationLedger for BrokenLedger {
    async fn load(&self, _collection: &CollectionRef) -> anyhow::Result<Option<MigrationRecord>> {
        anyhow::bail!("ledger offline")
    }

    async fn save(
        &self,
        _collection: &CollectionRef,
        _record: &MigrationRecord,
    ) -> anyhow::Result<()> {
        anyhow::bail!("ledger offline")
    }

    async fn clear(&self, _collection: &CollectionRef) -> anyhow::Result<()> {
        anyhow::bail!("ledger offline")
    }
}

fn all_forward_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep::DropIndex,
        MigrationStep::RenameTable,
        MigrationStep::AddKeyColumn,
        MigrationStep::PromoteKey,
        MigrationStep::DistributeTable,
        MigrationStep::CreateView,
        MigrationStep::CreateInsertTrigger,
    ]
}

#[tokio::test]
async fn test_distribute_orders() -> anyhow::Result<()> {
    cmd_util::env::config_test();
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments::default();

    let report = TableDistributor::new(&store, &ledger)
        .distribute(&documents, &orders())
        .await?;
    assert_eq!(report.table, TABLE);
    assert_eq!(report.backing_table, "orders_c8e9a2f1_back");
    assert_eq!(report.resumed_from, None);
    assert_eq!(report.steps_applied, all_forward_steps());

    let executed = store.take_executed();
    let texts: Vec<&str> = executed.iter().map(|s| s.text.as_str()).collect();
    assert_eq!(texts.len(), 9);
    assert_eq!(
        texts[..7].to_vec(),
        vec![
            r#"DROP INDEX "ferretdb"."orders_c8e9a2f1_id_""#,
            r#"ALTER TABLE "ferretdb"."orders_c8e9a2f1" RENAME TO "orders_c8e9a2f1_back""#,
            r#"ALTER TABLE "ferretdb"."orders_c8e9a2f1_back" ADD COLUMN IF NOT EXISTS "_id" TEXT"#,
            r#"UPDATE "ferretdb"."orders_c8e9a2f1_back" SET "_id" = "_jsonb"->>'_id' WHERE "_id" IS NULL"#,
            r#"ALTER TABLE "ferretdb"."orders_c8e9a2f1_back" ADD CONSTRAINT "orders_c8e9a2f1_back_pkey" PRIMARY KEY ("_id")"#,
            r"SELECT create_distributed_table($1::text::regclass, $2::text)",
            r#"CREATE OR REPLACE VIEW "ferretdb"."orders_c8e9a2f1" AS SELECT * FROM "ferretdb"."orders_c8e9a2f1_back""#,
        ]
    );
    assert_eq!(
        executed[5].params,
        vec![r#""ferretdb"."orders_c8e9a2f1_back""#, "_id"]
    );

    let function = texts[7];
    assert!(function.contains(
        r#"CREATE OR REPLACE FUNCTION "ferretdb"."func_tg_insert__orders_c8e9a2f1"() RETURNS TRIGGER AS $view_insert_row$"#
    ));
    assert!(function.contains(r#"INSERT INTO "ferretdb"."orders_c8e9a2f1_back" ("_id", "_jsonb")"#));
    assert!(function.contains(r#"SELECT NEW."_jsonb"->>'_id', NEW."_jsonb";"#));
    assert!(function.contains("RETURN NULL;"));
    assert!(function.contains("$view_insert_row$ LANGUAGE plpgsql"));
    assert_eq!(
        texts[8],
        r#"CREATE OR REPLACE TRIGGER "tg_insert__orders_c8e9a2f1" INSTEAD OF INSERT ON "ferretdb"."orders_c8e9a2f1" FOR EACH ROW EXECUTE FUNCTION "ferretdb"."func_tg_insert__orders_c8e9a2f1"()"#
    );

    let record = ledger.load(&orders()).await?.expect("record saved");
    assert_eq!(record.state, MigrationState::Done);
    assert_eq!(record.last_error, None);
    assert_eq!(record.table, TABLE);
    assert_eq!(record.index, INDEX);
    assert_eq!(record.index_definition, Some(index_definition()));
    Ok(())
}

#[tokio::test]
async fn test_sentinel_is_inserted_and_deleted() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments::default();
    TableDistributor::new(&store, &ledger)
        .distribute(&documents, &orders())
        .await?;

    let inserted = documents.inserted.lock().clone();
    assert_eq!(inserted.len(), 1);
    let (collection, sentinel) = &inserted[0];
    assert_eq!(collection, &orders());
    let id = sentinel["_id"].as_str().expect("sentinel id is a string");
    assert!(id.starts_with(SENTINEL_PREFIX), "{id}");
    assert_eq!(documents.deleted.lock().clone(), vec![sentinel.clone()]);
    Ok(())
}

#[tokio::test]
async fn test_sentinel_delete_failure_is_ignored() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments {
        fail_delete: true,
        ..Default::default()
    };
    let report = TableDistributor::new(&store, &ledger)
        .distribute(&documents, &orders())
        .await?;
    assert_eq!(report.steps_applied.len(), 7);
    Ok(())
}

#[tokio::test]
async fn test_sentinel_insert_failure_aborts() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments {
        fail_insert: true,
        ..Default::default()
    };
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&documents, &orders())
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::DocumentStore { .. }), "{err:?}");
    assert!(store.take_executed().is_empty());
    assert_eq!(ledger.load(&orders()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_early_failures_never_reach_distribution() -> anyhow::Result<()> {
    let cases = [
        ("DROP INDEX", MigrationStep::DropIndex, MigrationState::NotMigrated),
        ("RENAME TO", MigrationStep::RenameTable, MigrationState::IndexDropped),
    ];
    for (needle, step, state) in cases {
        let store = FakeStore::orders();
        store.fail_on(needle, SqlState::INSUFFICIENT_PRIVILEGE);
        let ledger = InMemoryLedger::new();

        let err = TableDistributor::new(&store, &ledger)
            .distribute(&FakeDocuments::default(), &orders())
            .await
            .unwrap_err();
        assert!(
            matches!(err, DistributionError::DdlExecution { .. }),
            "{err:?}"
        );
        assert_eq!(err.step(), Some(step));

        let texts = store.take_texts();
        assert!(texts.last().is_some_and(|t| t.contains(needle)), "{texts:?}");
        assert!(
            !texts.iter().any(|t| t.contains("create_distributed_table")),
            "{texts:?}"
        );

        let record = ledger.load(&orders()).await?.expect("failure recorded");
        assert_eq!(record.state, state);
        let last_error = record.last_error.expect("last error recorded");
        assert!(last_error.contains("injected failure"), "{last_error}");
    }
    Ok(())
}

#[tokio::test]
async fn test_duplicate_keys_are_a_constraint_violation() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    store.fail_on("ADD CONSTRAINT", SqlState::UNIQUE_VIOLATION);
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments::default();
    let distributor = TableDistributor::new(&store, &ledger);

    let err = distributor
        .distribute(&documents, &orders())
        .await
        .unwrap_err();
    assert!(
        matches!(err, DistributionError::ConstraintViolation { .. }),
        "{err:?}"
    );
    assert_eq!(err.step(), Some(MigrationStep::PromoteKey));
    let record = ledger.load(&orders()).await?.expect("failure recorded");
    assert_eq!(record.state, MigrationState::KeyColumnAdded);

    // The column is not added twice once the duplicates are fixed.
    store.clear_faults();
    store.take_executed();
    let report = distributor.distribute(&documents, &orders()).await?;
    assert_eq!(report.resumed_from, Some(MigrationState::KeyColumnAdded));
    assert_eq!(report.steps_applied, all_forward_steps()[3..].to_vec());
    let texts = store.take_texts();
    assert!(texts[0].starts_with("UPDATE "), "{texts:?}");
    assert!(!texts.iter().any(|t| t.contains("ADD COLUMN")), "{texts:?}");
    Ok(())
}

#[tokio::test]
async fn test_resume_after_distribution_failure() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    store.fail_on("create_distributed_table", SqlState::INTERNAL_ERROR);
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments::default();
    let distributor = TableDistributor::new(&store, &ledger);

    let err = distributor
        .distribute(&documents, &orders())
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some(MigrationStep::DistributeTable));
    let texts = store.take_texts();
    assert!(!texts.iter().any(|t| t.contains("VIEW")), "{texts:?}");
    let record = ledger.load(&orders()).await?.expect("failure recorded");
    assert_eq!(record.state, MigrationState::Keyed);
    assert!(record.last_error.is_some());
    assert!(record.state.is_partial());

    store.clear_faults();
    let report = distributor.distribute(&documents, &orders()).await?;
    assert_eq!(report.resumed_from, Some(MigrationState::Keyed));
    assert_eq!(
        report.steps_applied,
        vec![
            MigrationStep::DistributeTable,
            MigrationStep::CreateView,
            MigrationStep::CreateInsertTrigger,
        ]
    );
    let texts = store.take_texts();
    assert!(texts[0].contains("create_distributed_table"), "{texts:?}");
    // The original table name no longer resolves, so no sentinel is written
    // when resuming.
    assert_eq!(documents.inserted.lock().len(), 1);

    let record = ledger.load(&orders()).await?.expect("record saved");
    assert_eq!(record.state, MigrationState::Done);
    assert_eq!(record.last_error, None);
    Ok(())
}

#[tokio::test]
async fn test_distribute_twice_fails() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments::default();
    let distributor = TableDistributor::new(&store, &ledger);
    distributor.distribute(&documents, &orders()).await?;
    store.take_executed();

    let err = distributor
        .distribute(&documents, &orders())
        .await
        .unwrap_err();
    assert!(
        matches!(err, DistributionError::AlreadyDistributed { .. }),
        "{err:?}"
    );
    assert!(store.take_executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_distribute_unknown_collection() -> anyhow::Result<()> {
    let store = FakeStore::default();
    let ledger = InMemoryLedger::new();
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert!(store.take_executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_catalog_errors() -> anyhow::Result<()> {
    let ledger = InMemoryLedger::new();

    let store = FakeStore::orders();
    store.fail_on(CATALOG, SqlState::UNDEFINED_TABLE);
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    let store = FakeStore::orders();
    store.fail_on(CATALOG, SqlState::INVALID_SCHEMA_NAME);
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");

    let store = FakeStore::orders();
    store.fail_on(CATALOG, SqlState::CONNECTION_FAILURE);
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::CatalogRead { .. }), "{err:?}");
    assert_eq!(err.step(), Some(MigrationStep::ResolveCatalog));

    let store = FakeStore::with_collection("orders", TABLE, None);
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::CatalogRead { .. }), "{err:?}");

    let store = FakeStore::with_collection("orders", "orders\0", Some(INDEX));
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::CatalogRead { .. }), "{err:?}");

    assert!(store.take_executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_long_table_name_is_rejected() -> anyhow::Result<()> {
    // Fits on its own, but not with the `_back` suffix.
    let table = "t".repeat(60);
    let store = FakeStore::with_collection("orders", &table, Some(INDEX));
    let ledger = InMemoryLedger::new();
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert!(
        matches!(err, DistributionError::InvalidIdentifier(_)),
        "{err:?}"
    );
    assert!(store.take_executed().is_empty());
    assert_eq!(ledger.load(&orders()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_reserved_schema_is_rejected() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let documents = FakeDocuments::default();
    let err = TableDistributor::new(&store, &ledger)
        .distribute(&documents, &CollectionRef::new("pg_catalog", "orders"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, DistributionError::InvalidIdentifier(_)),
        "{err:?}"
    );
    assert!(documents.inserted.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_ledger_failure_aborts_before_any_change() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let documents = FakeDocuments::default();
    let err = TableDistributor::new(&store, &BrokenLedger)
        .distribute(&documents, &orders())
        .await
        .unwrap_err();
    assert!(matches!(err, DistributionError::Ledger { .. }), "{err:?}");
    assert!(documents.inserted.lock().is_empty());
    assert!(store.take_executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_drop_distribution_without_catalog_entry() -> anyhow::Result<()> {
    let store = FakeStore::default();
    let ledger = InMemoryLedger::new();
    let err = TableDistributor::new(&store, &ledger)
        .drop_distribution(&orders())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert!(store.take_executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_drop_distribution_without_backing_table() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    store.fail_on("DROP TABLE", SqlState::UNDEFINED_TABLE);
    let ledger = InMemoryLedger::new();
    let err = TableDistributor::new(&store, &ledger)
        .drop_distribution(&orders())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn test_drop_without_backing_table_restarts_partial_run() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let distributor = TableDistributor::new(&store, &ledger);

    store.fail_on("RENAME TO", SqlState::LOCK_NOT_AVAILABLE);
    let err = distributor
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some(MigrationStep::RenameTable));
    let record = distributor.status(&orders()).await?;
    assert_eq!(record.map(|r| r.state), Some(MigrationState::IndexDropped));

    store.clear_faults();
    store.fail_on("DROP TABLE", SqlState::UNDEFINED_TABLE);
    let err = distributor.drop_distribution(&orders()).await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert_eq!(distributor.status(&orders()).await?, None);

    store.clear_faults();
    store.take_executed();
    let documents = FakeDocuments::default();
    let report = distributor.distribute(&documents, &orders()).await?;
    assert_eq!(report.resumed_from, None);
    assert_eq!(report.steps_applied, all_forward_steps());
    assert_eq!(documents.inserted.lock().len(), 1);
    let texts = store.take_texts();
    assert_eq!(
        texts.first().map(String::as_str),
        Some(r#"DROP INDEX "ferretdb"."orders_c8e9a2f1_id_""#)
    );
    Ok(())
}

#[tokio::test]
async fn test_drop_without_catalog_entry_clears_record() -> anyhow::Result<()> {
    let store = FakeStore::default();
    let ledger = InMemoryLedger::new();
    let mut record = MigrationRecord::new(&orders(), TABLE.to_owned(), INDEX.to_owned());
    record.state = MigrationState::Renamed;
    ledger.save(&orders(), &record).await?;

    let err = TableDistributor::new(&store, &ledger)
        .drop_distribution(&orders())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
    assert_eq!(ledger.load(&orders()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_schema_with_placeholder_characters() -> anyhow::Result<()> {
    let shop = CollectionRef::new("shop@index", "orders");
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    TableDistributor::new(&store, &ledger)
        .distribute(&FakeDocuments::default(), &shop)
        .await?;
    let texts = store.take_texts();
    assert_eq!(
        texts[..2].to_vec(),
        vec![
            r#"DROP INDEX "shop@index"."orders_c8e9a2f1_id_""#,
            r#"ALTER TABLE "shop@index"."orders_c8e9a2f1" RENAME TO "orders_c8e9a2f1_back""#,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_drop_distribution() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let distributor = TableDistributor::new(&store, &ledger);
    distributor
        .distribute(&FakeDocuments::default(), &orders())
        .await?;
    store.take_executed();

    distributor.drop_distribution(&orders()).await?;
    assert_eq!(
        store.take_texts(),
        vec![
            r#"DROP TABLE "ferretdb"."orders_c8e9a2f1_back" CASCADE"#,
            r#"DROP FUNCTION IF EXISTS "ferretdb"."func_tg_insert__orders_c8e9a2f1"()"#,
        ]
    );
    assert_eq!(distributor.status(&orders()).await?, None);
    Ok(())
}

fn rollback_texts() -> Vec<String> {
    vec![
        r#"DROP TRIGGER IF EXISTS "tg_insert__orders_c8e9a2f1" ON "ferretdb"."orders_c8e9a2f1""#.to_owned(),
        r#"DROP FUNCTION IF EXISTS "ferretdb"."func_tg_insert__orders_c8e9a2f1"()"#.to_owned(),
        r#"DROP VIEW IF EXISTS "ferretdb"."orders_c8e9a2f1""#.to_owned(),
        r"SELECT undistribute_table($1::text::regclass)".to_owned(),
        r#"ALTER TABLE "ferretdb"."orders_c8e9a2f1_back" DROP CONSTRAINT IF EXISTS "orders_c8e9a2f1_back_pkey""#.to_owned(),
        r#"ALTER TABLE "ferretdb"."orders_c8e9a2f1_back" DROP COLUMN IF EXISTS "_id""#.to_owned(),
        r#"ALTER TABLE "ferretdb"."orders_c8e9a2f1_back" RENAME TO "orders_c8e9a2f1""#.to_owned(),
        index_definition(),
    ]
}

#[tokio::test]
async fn test_rollback_from_done() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let distributor = TableDistributor::new(&store, &ledger);
    distributor
        .distribute(&FakeDocuments::default(), &orders())
        .await?;
    store.take_executed();

    let state = distributor.rollback(&orders()).await?;
    assert_eq!(state, MigrationState::NotMigrated);
    let executed = store.take_executed();
    assert_eq!(
        executed.iter().map(|s| s.text.clone()).collect::<Vec<_>>(),
        rollback_texts()
    );
    assert_eq!(
        executed[3].params,
        vec![r#""ferretdb"."orders_c8e9a2f1_back""#]
    );
    assert_eq!(distributor.status(&orders()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_rollback_partial_run() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    store.fail_on("create_distributed_table", SqlState::INTERNAL_ERROR);
    let ledger = InMemoryLedger::new();
    let distributor = TableDistributor::new(&store, &ledger);
    distributor
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    store.take_executed();

    assert_eq!(
        distributor.rollback(&orders()).await?,
        MigrationState::NotMigrated
    );
    assert_eq!(store.take_texts(), rollback_texts()[4..].to_vec());
    assert_eq!(distributor.status(&orders()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_rollback_failure_is_resumable() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let distributor = TableDistributor::new(&store, &ledger);
    distributor
        .distribute(&FakeDocuments::default(), &orders())
        .await?;
    store.take_executed();

    store.fail_on("undistribute_table", SqlState::OBJECT_IN_USE);
    let err = distributor.rollback(&orders()).await.unwrap_err();
    assert_eq!(err.step(), Some(MigrationStep::UndistributeTable));
    let record = distributor.status(&orders()).await?.expect("record kept");
    assert_eq!(record.state, MigrationState::Distributed);
    assert!(record.last_error.is_some());
    store.take_executed();

    store.clear_faults();
    distributor.rollback(&orders()).await?;
    assert_eq!(store.take_texts(), rollback_texts()[3..].to_vec());
    Ok(())
}

#[tokio::test]
async fn test_rollback_without_record() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    let ledger = InMemoryLedger::new();
    let state = TableDistributor::new(&store, &ledger)
        .rollback(&orders())
        .await?;
    assert_eq!(state, MigrationState::NotMigrated);
    assert!(store.take_executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rollback_skips_unknown_index_definition() -> anyhow::Result<()> {
    let store = FakeStore::orders();
    *store.index_definition.lock() = None;
    store.fail_on("RENAME TO", SqlState::LOCK_NOT_AVAILABLE);
    let ledger = InMemoryLedger::new();
    let distributor = TableDistributor::new(&store, &ledger);
    distributor
        .distribute(&FakeDocuments::default(), &orders())
        .await
        .unwrap_err();
    store.take_executed();

    assert_eq!(
        distributor.rollback(&orders()).await?,
        MigrationState::NotMigrated
    );
    assert!(store.take_executed().is_empty());
    assert_eq!(distributor.status(&orders()).await?, None);
    Ok(())
}

/// Emulates the ledger table, including it not existing yet.
#[derive(Default)]
struct LedgerTableStore {
    created: Mutex<bool>,
    rows: Mutex<BTreeMap<String, TextRow>>,
    statements: Mutex<Vec<String>>,
}

impl LedgerTableStore {
    fn check_created(&self) -> anyhow::Result<()> {
        if !*self.created.lock() {
            anyhow::bail!(StatementFailure::new(
                SqlState::UNDEFINED_TABLE,
                "relation does not exist"
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for LedgerTableStore {
    async fn execute(&self, statement: &str, params: &[&str]) -> anyhow::Result<u64> {
        self.statements.lock().push(statement.to_owned());
        if statement.contains("CREATE TABLE IF NOT EXISTS") {
            *self.created.lock() = true;
            return Ok(0);
        }
        self.check_created()?;
        if statement.contains("INSERT INTO") {
            let nullable = |p: &str| (!p.is_empty()).then(|| p.to_owned());
            let row = TextRow(vec![
                Some(params[1].to_owned()),
                Some(params[2].to_owned()),
                nullable(params[3]),
                Some(params[4].to_owned()),
                nullable(params[5]),
            ]);
            self.rows.lock().insert(params[0].to_owned(), row);
            return Ok(1);
        }
        if statement.contains("DELETE FROM") {
            return Ok(self.rows.lock().remove(params[0]).map_or(0, |_| 1));
        }
        anyhow::bail!("unexpected statement: {statement}")
    }

    async fn query_row(
        &self,
        _statement: &str,
        params: &[&str],
    ) -> anyhow::Result<Option<TextRow>> {
        self.check_created()?;
        Ok(self.rows.lock().get(params[0]).cloned())
    }
}

#[tokio::test]
async fn test_postgres_ledger_creates_table_on_first_save() -> anyhow::Result<()> {
    let store = LedgerTableStore::default();
    let ledger = PostgresLedger::new(&store, "_disttable_migrations")?;
    assert_eq!(ledger.load(&orders()).await?, None);
    // Nothing to delete yet.
    ledger.clear(&orders()).await?;

    let mut record = MigrationRecord::new(&orders(), TABLE.to_owned(), INDEX.to_owned());
    record.state = MigrationState::KeyColumnAdded;
    record.last_error = Some("duplicate key".to_owned());
    ledger.save(&orders(), &record).await?;

    let statements = std::mem::take(&mut *store.statements.lock());
    assert_eq!(statements.len(), 4);
    assert!(statements[1].contains("INSERT INTO"), "{statements:?}");
    assert!(
        statements[2].contains(r#"CREATE TABLE IF NOT EXISTS "ferretdb"."_disttable_migrations""#),
        "{statements:?}"
    );
    assert!(statements[3].contains("INSERT INTO"), "{statements:?}");

    assert_eq!(ledger.load(&orders()).await?, Some(record.clone()));
    record.state = MigrationState::Keyed;
    record.last_error = None;
    ledger.save(&orders(), &record).await?;
    assert_eq!(ledger.load(&orders()).await?, Some(record));

    ledger.clear(&orders()).await?;
    assert_eq!(ledger.load(&orders()).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_in_memory_ledger_is_keyed_by_database() -> anyhow::Result<()> {
    let ledger = InMemoryLedger::new();
    let record = MigrationRecord::new(&orders(), TABLE.to_owned(), INDEX.to_owned());
    ledger.save(&orders(), &record).await?;
    let other = CollectionRef::new("other", "orders");
    assert_eq!(ledger.load(&other).await?, None);
    assert_eq!(ledger.load(&orders()).await?, Some(record));
    Ok(())
}

#[test]
fn test_render_placeholders() {
    assert_eq!(
        sql::render(
            "ALTER TABLE @schema.@table RENAME TO @back",
            &[("schema", "s"), ("table", "t"), ("back", "t_back")]
        ),
        "ALTER TABLE s.t RENAME TO t_back"
    );
    // Unknown placeholders and lone `@` are kept as is.
    assert_eq!(sql::render("SELECT @x, '@'", &[]), "SELECT @x, '@'");
    // Substituted values are not scanned again.
    assert_eq!(
        sql::render("@a @b", &[("a", "@b"), ("b", "x")]),
        "@b x"
    );
    // The longest name wins.
    assert_eq!(
        sql::render(
            "@trigger @trigger_function",
            &[("trigger", "t"), ("trigger_function", "f")]
        ),
        "t f"
    );
}

#[test]
fn test_identifiers() {
    assert_eq!(
        PgIdent::new("orders").map(|i| i.escaped().to_owned()),
        Ok(r#""orders""#.to_owned())
    );
    assert_eq!(
        PgIdent::new(r#"we"ird"#).map(|i| i.escaped().to_owned()),
        Ok(r#""we""ird""#.to_owned())
    );
    assert!(PgIdent::new("").is_err());
    assert!(PgIdent::new("a\0b").is_err());
    assert!(PgIdent::new(&"x".repeat(63)).is_ok());
    assert!(PgIdent::new(&"x".repeat(64)).is_err());
    assert!(PgIdent::schema("pg_temp").is_err());
    assert!(PgIdent::schema("ferretdb").is_ok());
}

#[test]
fn test_state_chain() {
    let mut state = MigrationState::NotMigrated;
    let mut steps = vec![];
    while let Some((step, next)) = state.forward_step() {
        assert!(next > state);
        // Every forward step can be undone back to where it started.
        assert_eq!(next.rollback_step().map(|(_, previous)| previous), Some(state));
        steps.push(step);
        state = next;
    }
    assert_eq!(state, MigrationState::Done);
    assert_eq!(steps, all_forward_steps());
    assert_eq!(MigrationState::NotMigrated.rollback_step(), None);
}

#[test]
fn test_state_names_round_trip_through_ledger_text() -> anyhow::Result<()> {
    for state in MigrationState::iter() {
        let text: &'static str = state.into();
        assert_eq!(text.parse::<MigrationState>()?, state);
    }
    assert_eq!(
        "key_column_added".parse::<MigrationState>()?,
        MigrationState::KeyColumnAdded
    );
    assert_eq!(
        serde_json::to_value(MigrationState::ViewReady)?,
        json!("view_ready")
    );
    Ok(())
}

#[test]
fn test_statement_failure_carries_sql_state() {
    let err = anyhow::Error::new(StatementFailure::new(SqlState::UNDEFINED_TABLE, "gone"))
        .context("dropping backing table");
    assert_eq!(crate::sql_state(&err), Some(SqlState::UNDEFINED_TABLE));
    assert_eq!(crate::sql_state(&anyhow::anyhow!("plain")), None);
}

/// Runs against a Citus coordinator, e.g.
/// `DISTTABLE_ITEST_PG_URL=postgres://postgres@localhost:5432/postgres`.
mod itest {
    use std::env;

    use uuid::Uuid;

    use super::FakeDocuments;
    use crate::{
        connect,
        CollectionRef,
        InMemoryLedger,
        TableDistributor,
    };

    #[tokio::test]
    #[ignore]
    async fn test_orders_on_citus() -> anyhow::Result<()> {
        let Ok(url) = env::var("DISTTABLE_ITEST_PG_URL") else {
            return Ok(());
        };
        let client = connect(&url).await?;
        let schema = format!("disttable_itest_{}", Uuid::new_v4().simple());
        // The layout FerretDB creates for a collection with one document.
        client
            .batch_execute(&format!(
                r#"
                CREATE SCHEMA "{schema}";
                CREATE TABLE "{schema}"._ferretdb_database_metadata (_jsonb jsonb);
                CREATE TABLE "{schema}".orders_1 (_jsonb jsonb);
                CREATE UNIQUE INDEX orders_1_id_ ON "{schema}".orders_1 ((_jsonb->'_id'));
                INSERT INTO "{schema}"._ferretdb_database_metadata VALUES
                    ('{{"_id": "orders", "table": "orders_1", "indexes": [{{"pgindex": "orders_1_id_"}}]}}');
                INSERT INTO "{schema}".orders_1 VALUES ('{{"_id": "o1", "amount": 5}}');
                "#
            ))
            .await?;

        let collection = CollectionRef::new(schema.clone(), "orders");
        let ledger = InMemoryLedger::new();
        let distributor = TableDistributor::new(&client, &ledger);
        distributor
            .distribute(&FakeDocuments::default(), &collection)
            .await?;

        client
            .batch_execute(&format!(
                r#"INSERT INTO "{schema}".orders_1 (_jsonb) VALUES ('{{"_id": "o2", "amount": 7}}')"#
            ))
            .await?;
        let keys: Vec<String> = client
            .query(
                &format!(r#"SELECT _id FROM "{schema}".orders_1_back ORDER BY _id"#),
                &[],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();
        assert_eq!(keys, vec!["o1", "o2"]);
        let through_view: i64 = client
            .query_one(&format!(r#"SELECT count(*) FROM "{schema}".orders_1"#), &[])
            .await?
            .get(0);
        assert_eq!(through_view, 2);

        distributor.drop_distribution(&collection).await?;
        let err = distributor
            .drop_distribution(&collection)
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{err:?}");

        client
            .batch_execute(&format!(r#"DROP SCHEMA "{schema}" CASCADE"#))
            .await?;
        Ok(())
    }
}
