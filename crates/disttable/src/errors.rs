use tokio_postgres::error::SqlState;

use crate::{
    sql::InvalidIdentifier,
    state::MigrationStep,
    store::sql_state,
};

#[derive(thiserror::Error, Debug)]
pub enum DistributionError {
    /// The catalog has no entry for the collection, or the relation the entry
    /// points to does not exist. Ignorable on the reverse path.
    #[error("collection {collection} does not exist")]
    NotFound { collection: String },

    #[error("failed to read catalog entry for {collection}: {source:#}")]
    CatalogRead {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{step} failed for {collection}: {source:#}")]
    DdlExecution {
        step: MigrationStep,
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot promote the surrogate key of {collection}: {source:#}")]
    ConstraintViolation {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("collection {collection} is already distributed")]
    AlreadyDistributed { collection: String },

    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),

    #[error("document store rejected the sentinel write for {collection}: {source:#}")]
    DocumentStore {
        collection: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("migration ledger unavailable for {collection}: {source:#}")]
    Ledger {
        collection: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DistributionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DistributionError::NotFound { .. })
    }

    /// The step that failed, for errors raised while executing statements.
    pub fn step(&self) -> Option<MigrationStep> {
        match self {
            DistributionError::DdlExecution { step, .. } => Some(*step),
            DistributionError::ConstraintViolation { .. } => Some(MigrationStep::PromoteKey),
            DistributionError::CatalogRead { .. } => Some(MigrationStep::ResolveCatalog),
            _ => None,
        }
    }

    /// Classifies a statement failure of `step`.
    pub(crate) fn from_step(step: MigrationStep, collection: String, source: anyhow::Error) -> Self {
        let state = sql_state(&source);
        match (step, state) {
            (MigrationStep::PromoteKey, Some(s))
                if s == SqlState::NOT_NULL_VIOLATION || s == SqlState::UNIQUE_VIOLATION =>
            {
                DistributionError::ConstraintViolation { collection, source }
            },
            (MigrationStep::DropBackingTable, Some(s)) if s == SqlState::UNDEFINED_TABLE => {
                DistributionError::NotFound { collection }
            },
            _ => DistributionError::DdlExecution {
                step,
                collection,
                source,
            },
        }
    }
}
