use std::{
    fs,
    path::Path,
};

use anyhow::Context;
use serde_json::{
    Map,
    Value as JsonValue,
};

pub type JsonObject = Map<String, JsonValue>;

pub fn load(path: &Path, count: usize) -> anyhow::Result<Vec<JsonObject>> {
    let bytes =
        fs::read(path).with_context(|| format!("fail to read records {}", path.display()))?;
    parse(&bytes, count).with_context(|| format!("invalid dataset {}", path.display()))
}

/// Decodes a JSON array of objects and keeps the first `count` of them.
pub fn parse(bytes: &[u8], count: usize) -> anyhow::Result<Vec<JsonObject>> {
    let mut records: Vec<JsonObject> =
        serde_json::from_slice(bytes).context("fail to decode dataset into a list of objects")?;
    anyhow::ensure!(
        records.len() >= count,
        "dataset has {} records, {count} are needed",
        records.len()
    );
    records.truncate(count);
    Ok(records)
}
