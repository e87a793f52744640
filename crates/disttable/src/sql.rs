//! Statement templates for the distribution protocol.
//!
//! Templates reference identifiers through `@name` placeholders which are
//! substituted with quoted identifiers (or, for `@id_field`, an escaped
//! literal) by [`render`]. Collection identifiers and other user data are
//! never substituted: they are bound as `$n` parameters.
use std::fmt;

use postgres_protocol::escape::{
    escape_identifier,
    escape_literal,
};

use crate::DistributionOptions;

/// Postgres truncates identifiers to `NAMEDATALEN - 1` bytes. Derived names
/// (`<table>_back`, `func_tg_insert__<table>`) are rejected rather than
/// silently truncated into each other.
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub const TRIGGER_PREFIX: &str = "tg_insert__";
pub const TRIGGER_FUNCTION_PREFIX: &str = "func_tg_insert__";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid identifier {name:?}: {reason}")]
pub struct InvalidIdentifier {
    pub name: String,
    pub reason: &'static str,
}

/// An identifier that has been validated and escaped for use in statement
/// text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgIdent {
    raw: String,
    escaped: String,
}

impl PgIdent {
    pub fn new(raw: &str) -> Result<Self, InvalidIdentifier> {
        let invalid = |reason| InvalidIdentifier {
            name: raw.to_owned(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("identifier is empty"));
        }
        if raw.contains('\0') {
            return Err(invalid("identifier contains a NUL byte"));
        }
        if raw.len() > MAX_IDENTIFIER_LEN {
            return Err(invalid("identifier is longer than 63 bytes"));
        }
        Ok(Self {
            escaped: escape_identifier(raw),
            raw: raw.to_owned(),
        })
    }

    /// Schemas additionally may not live in the reserved `pg_` namespace.
    pub fn schema(raw: &str) -> Result<Self, InvalidIdentifier> {
        if raw.starts_with("pg_") {
            return Err(InvalidIdentifier {
                name: raw.to_owned(),
                reason: "schema names starting with pg_ are reserved",
            });
        }
        Self::new(raw)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn escaped(&self) -> &str {
        &self.escaped
    }

    /// `"schema"."name"`, the text form accepted by `regclass` casts.
    pub fn qualified(&self, schema: &PgIdent) -> String {
        format!("{}.{}", schema.escaped, self.escaped)
    }
}

impl fmt::Display for PgIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Replaces every `@name` placeholder in `template` with the matching
/// binding. Unknown placeholders are left untouched, substituted values are
/// never rescanned.
pub fn render(template: &str, bindings: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut rest = template;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_lowercase() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        match bindings.iter().find(|(key, _)| *key == name) {
            Some((_, value)) if !name.is_empty() => out.push_str(value),
            _ => {
                out.push('@');
                out.push_str(name);
            },
        }
        rest = &after[name_len..];
    }
    out.push_str(rest);
    out
}

/// Rendered statement text with its text parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<String>,
}

impl Statement {
    pub fn new(text: String) -> Self {
        Self {
            text,
            params: Vec::new(),
        }
    }

    pub fn with_params<const N: usize>(text: String, params: [String; N]) -> Self {
        Self {
            text,
            params: params.into(),
        }
    }
}

/// Every name the forward and reverse paths touch for one collection table.
#[derive(Clone, Debug)]
pub struct TableNames {
    pub schema: PgIdent,
    pub table: PgIdent,
    pub back: PgIdent,
    pub primary_key: PgIdent,
    pub trigger: PgIdent,
    pub trigger_function: PgIdent,
    pub key_column: PgIdent,
    pub payload_column: PgIdent,
    id_field: String,
}

impl TableNames {
    pub fn new(
        schema: &PgIdent,
        table: &str,
        options: &DistributionOptions,
    ) -> Result<Self, InvalidIdentifier> {
        let back = format!("{table}{}", options.backing_suffix);
        Ok(Self {
            schema: schema.clone(),
            table: PgIdent::new(table)?,
            primary_key: PgIdent::new(&format!("{back}_pkey"))?,
            back: PgIdent::new(&back)?,
            trigger: PgIdent::new(&format!("{TRIGGER_PREFIX}{table}"))?,
            trigger_function: PgIdent::new(&format!("{TRIGGER_FUNCTION_PREFIX}{table}"))?,
            key_column: PgIdent::new(&options.key_column)?,
            payload_column: PgIdent::new(&options.payload_column)?,
            id_field: escape_literal(&options.id_field),
        })
    }

    /// Text form of the backing table for `regclass` parameters.
    pub fn qualified_back(&self) -> String {
        self.back.qualified(&self.schema)
    }

    pub fn render(&self, template: &str) -> String {
        self.render_with(template, &[])
    }

    /// Renders `template` with the table's names plus `extra` bindings in a
    /// single pass.
    pub fn render_with(&self, template: &str, extra: &[(&str, &str)]) -> String {
        let mut bindings = vec![
            ("schema", self.schema.escaped()),
            ("table", self.table.escaped()),
            ("back", self.back.escaped()),
            ("pkey", self.primary_key.escaped()),
            ("trigger", self.trigger.escaped()),
            ("trigger_function", self.trigger_function.escaped()),
            ("key_column", self.key_column.escaped()),
            ("payload_column", self.payload_column.escaped()),
            ("id_field", self.id_field.as_str()),
        ];
        bindings.extend_from_slice(extra);
        render(template, &bindings)
    }
}

// Catalog. The metadata table layout is owned by the document store: one
// `_jsonb` document per collection with `_id`, `table` and `indexes`.
pub const SELECT_CATALOG_ENTRY: &str = r"SELECT _jsonb->>'table', _jsonb->'indexes'->0->>'pgindex' FROM @schema.@catalog WHERE _jsonb->>'_id' = $1";

pub const SELECT_INDEX_DEFINITION: &str = r"SELECT pg_get_indexdef(to_regclass($1::text)::oid)";

// Forward path.
pub const DROP_INDEX: &str = r"DROP INDEX @schema.@index";

pub const RENAME_TABLE: &str = r"ALTER TABLE @schema.@table RENAME TO @back";

pub const ADD_KEY_COLUMN: &str = r"ALTER TABLE @schema.@back ADD COLUMN IF NOT EXISTS @key_column TEXT";

pub const DERIVE_EXISTING_KEYS: &str = r"UPDATE @schema.@back SET @key_column = @payload_column->>@id_field WHERE @key_column IS NULL";

pub const ADD_PRIMARY_KEY: &str =
    r"ALTER TABLE @schema.@back ADD CONSTRAINT @pkey PRIMARY KEY (@key_column)";

pub const DISTRIBUTE_TABLE: &str = r"SELECT create_distributed_table($1::text::regclass, $2::text)";

pub const CREATE_VIEW: &str =
    r"CREATE OR REPLACE VIEW @schema.@table AS SELECT * FROM @schema.@back";

pub const CREATE_TRIGGER_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION @schema.@trigger_function() RETURNS TRIGGER AS $view_insert_row$
BEGIN
    INSERT INTO @schema.@back (@key_column, @payload_column)
    SELECT NEW.@payload_column->>@id_field, NEW.@payload_column;

    RETURN NULL;
END;
$view_insert_row$ LANGUAGE plpgsql
"#;

pub const CREATE_TRIGGER: &str = r"CREATE OR REPLACE TRIGGER @trigger INSTEAD OF INSERT ON @schema.@table FOR EACH ROW EXECUTE FUNCTION @schema.@trigger_function()";

// Reverse path.
pub const DROP_BACKING_TABLE_CASCADE: &str = r"DROP TABLE @schema.@back CASCADE";

pub const DROP_TRIGGER_FUNCTION: &str = r"DROP FUNCTION IF EXISTS @schema.@trigger_function()";

// Repair, undoing forward steps in reverse order.
pub const DROP_TRIGGER: &str = r"DROP TRIGGER IF EXISTS @trigger ON @schema.@table";

pub const DROP_VIEW: &str = r"DROP VIEW IF EXISTS @schema.@table";

pub const UNDISTRIBUTE_TABLE: &str = r"SELECT undistribute_table($1::text::regclass)";

pub const DROP_PRIMARY_KEY: &str = r"ALTER TABLE @schema.@back DROP CONSTRAINT IF EXISTS @pkey";

pub const DROP_KEY_COLUMN: &str = r"ALTER TABLE @schema.@back DROP COLUMN IF EXISTS @key_column";

pub const RESTORE_TABLE_NAME: &str = r"ALTER TABLE @schema.@back RENAME TO @table";

// Migration ledger. Optional columns are bound as '' and stored as NULL.
pub const CREATE_LEDGER: &str = r#"
CREATE TABLE IF NOT EXISTS @schema.@ledger (
    collection TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    index_name TEXT NOT NULL,
    index_definition TEXT,
    state TEXT NOT NULL,
    last_error TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

pub const SELECT_LEDGER_RECORD: &str = r"SELECT table_name, index_name, index_definition, state, last_error FROM @schema.@ledger WHERE collection = $1";

pub const UPSERT_LEDGER_RECORD: &str = r#"
INSERT INTO @schema.@ledger
    (collection, table_name, index_name, index_definition, state, last_error, updated_at)
    VALUES ($1, $2, $3, NULLIF($4, ''), $5, NULLIF($6, ''), now())
    ON CONFLICT (collection) DO UPDATE
    SET table_name = EXCLUDED.table_name,
        index_name = EXCLUDED.index_name,
        index_definition = EXCLUDED.index_definition,
        state = EXCLUDED.state,
        last_error = EXCLUDED.last_error,
        updated_at = EXCLUDED.updated_at
"#;

pub const DELETE_LEDGER_RECORD: &str = r"DELETE FROM @schema.@ledger WHERE collection = $1";
