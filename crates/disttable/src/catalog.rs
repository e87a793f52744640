use anyhow::Context;
use tokio_postgres::error::SqlState;

use crate::{
    errors::DistributionError,
    sql::{
        self,
        PgIdent,
    },
    store::{
        sql_state,
        RelationalStore,
    },
    CollectionRef,
};

/// What the document store's metadata table says about one collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Physical table holding the collection's documents.
    pub table: String,
    /// The first index listed for the collection. FerretDB always lists the
    /// `_id_` index first.
    pub primary_index: Option<String>,
}

pub struct CatalogReader<'a> {
    store: &'a dyn RelationalStore,
    catalog_table: PgIdent,
}

impl<'a> CatalogReader<'a> {
    pub fn new(
        store: &'a dyn RelationalStore,
        catalog_table: &str,
    ) -> Result<Self, DistributionError> {
        Ok(Self {
            store,
            catalog_table: PgIdent::new(catalog_table)?,
        })
    }

    pub async fn resolve(
        &self,
        collection: &CollectionRef,
        schema: &PgIdent,
    ) -> Result<CatalogEntry, DistributionError> {
        let statement = sql::render(
            sql::SELECT_CATALOG_ENTRY,
            &[
                ("schema", schema.escaped()),
                ("catalog", self.catalog_table.escaped()),
            ],
        );
        let not_found = || DistributionError::NotFound {
            collection: collection.to_string(),
        };
        let row = match self
            .store
            .query_row(&statement, &[collection.collection.as_str()])
            .await
        {
            Ok(row) => row,
            Err(e) if is_missing_relation(&e) => return Err(not_found()),
            Err(source) => {
                return Err(DistributionError::CatalogRead {
                    collection: collection.to_string(),
                    source,
                });
            },
        };
        let row = row.ok_or_else(not_found)?;
        decode_entry(row.get(0), row.get(1)).map_err(|source| DistributionError::CatalogRead {
            collection: collection.to_string(),
            source,
        })
    }
}

fn decode_entry(table: Option<&str>, index: Option<&str>) -> anyhow::Result<CatalogEntry> {
    let table = table.context("catalog entry has no table")?;
    PgIdent::new(table).context("catalog table name")?;
    if let Some(index) = index {
        PgIdent::new(index).context("catalog index name")?;
    }
    Ok(CatalogEntry {
        table: table.to_owned(),
        primary_index: index.map(str::to_owned),
    })
}

fn is_missing_relation(e: &anyhow::Error) -> bool {
    sql_state(e)
        .is_some_and(|s| s == SqlState::UNDEFINED_TABLE || s == SqlState::INVALID_SCHEMA_NAME)
}
