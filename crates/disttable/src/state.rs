use serde::{
    Deserialize,
    Serialize,
};

/// Persisted progress of one collection through the forward path. The order
/// of the variants is the order in which the states are reached.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationState {
    NotMigrated,
    IndexDropped,
    Renamed,
    KeyColumnAdded,
    Keyed,
    Distributed,
    ViewReady,
    Done,
}

impl MigrationState {
    /// The forward step that moves a collection out of this state, and the
    /// state it reaches.
    pub fn forward_step(self) -> Option<(MigrationStep, MigrationState)> {
        let next = match self {
            MigrationState::NotMigrated => (MigrationStep::DropIndex, MigrationState::IndexDropped),
            MigrationState::IndexDropped => (MigrationStep::RenameTable, MigrationState::Renamed),
            MigrationState::Renamed => (MigrationStep::AddKeyColumn, MigrationState::KeyColumnAdded),
            MigrationState::KeyColumnAdded => (MigrationStep::PromoteKey, MigrationState::Keyed),
            MigrationState::Keyed => (MigrationStep::DistributeTable, MigrationState::Distributed),
            MigrationState::Distributed => (MigrationStep::CreateView, MigrationState::ViewReady),
            MigrationState::ViewReady => (MigrationStep::CreateInsertTrigger, MigrationState::Done),
            MigrationState::Done => return None,
        };
        Some(next)
    }

    /// The repair step that undoes the forward step which produced this
    /// state, and the state it returns to.
    pub fn rollback_step(self) -> Option<(MigrationStep, MigrationState)> {
        let previous = match self {
            MigrationState::NotMigrated => return None,
            MigrationState::IndexDropped => (MigrationStep::RestoreIndex, MigrationState::NotMigrated),
            MigrationState::Renamed => (MigrationStep::RestoreTableName, MigrationState::IndexDropped),
            MigrationState::KeyColumnAdded => (MigrationStep::DropKeyColumn, MigrationState::Renamed),
            MigrationState::Keyed => (MigrationStep::DropPrimaryKey, MigrationState::KeyColumnAdded),
            MigrationState::Distributed => (MigrationStep::UndistributeTable, MigrationState::Keyed),
            MigrationState::ViewReady => (MigrationStep::DropView, MigrationState::Distributed),
            MigrationState::Done => (MigrationStep::RemoveInsertTrigger, MigrationState::ViewReady),
        };
        Some(previous)
    }

    /// Whether the original table name no longer resolves to a plain table,
    /// i.e. the collection is unusable until the run is resumed or repaired.
    pub fn is_partial(self) -> bool {
        !matches!(self, MigrationState::NotMigrated | MigrationState::Done)
    }
}

/// One unit of work of the forward path, the reverse path or the repair
/// operation. Errors are annotated with the step that produced them.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationStep {
    ResolveCatalog,
    DropIndex,
    RenameTable,
    AddKeyColumn,
    PromoteKey,
    DistributeTable,
    CreateView,
    CreateInsertTrigger,

    DropBackingTable,

    RemoveInsertTrigger,
    DropView,
    UndistributeTable,
    DropPrimaryKey,
    DropKeyColumn,
    RestoreTableName,
    RestoreIndex,
}
