//! Seams to the two stores the migrator talks to. Both are owned by the
//! caller; nothing here opens, pools or closes connections on its own except
//! the [`connect`] convenience used by the command line tools.
use std::{
    env,
    fs,
    path::Path,
    sync::{
        Arc,
        LazyLock,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use cmd_util::env::env_config;
use futures::{
    select_biased,
    Future,
    FutureExt,
};
use rustls::{
    ClientConfig,
    KeyLogFile,
    RootCertStore,
};
use rustls_pki_types::{
    pem::PemObject,
    CertificateDer,
};
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tokio_postgres::{
    error::SqlState,
    types::ToSql,
    Row,
};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::CollectionRef;

// Distribution copies the whole table into shards, so the default is generous.
static STATEMENT_TIMEOUT: LazyLock<u64> =
    LazyLock::new(|| env_config("DISTTABLE_STATEMENT_TIMEOUT_SECONDS", 600));

/// Bounds a single statement by `DISTTABLE_STATEMENT_TIMEOUT_SECONDS`.
pub(crate) async fn with_timeout<R, E, Fut: Future<Output = Result<R, E>>>(
    f: Fut,
) -> anyhow::Result<R>
where
    E: Into<anyhow::Error>,
{
    select_biased! {
        r = f.fuse() => r.map_err(Into::into),
        _ = sleep(Duration::from_secs(*STATEMENT_TIMEOUT)).fuse() => {
            Err(anyhow::anyhow!("Postgres statement timeout after {}s", *STATEMENT_TIMEOUT))
        },
    }
}

/// One result row with every column decoded as (nullable) text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextRow(pub Vec<Option<String>>);

impl TextRow {
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).and_then(|c| c.as_deref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[Option<&str>; N]> for TextRow {
    fn from(columns: [Option<&str>; N]) -> Self {
        Self(columns.into_iter().map(|c| c.map(str::to_owned)).collect())
    }
}

/// Statement execution against the relational store. Every parameter is
/// bound as text; statements cast where they need another type.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn execute(&self, statement: &str, params: &[&str]) -> anyhow::Result<u64>;

    async fn query_row(&self, statement: &str, params: &[&str])
        -> anyhow::Result<Option<TextRow>>;
}

/// The document store's collection API, used to materialize the catalog
/// entry before migrating and by the benchmark loop.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, collection: &CollectionRef, document: JsonValue)
        -> anyhow::Result<()>;

    /// Returns the number of deleted documents.
    async fn delete_one(&self, collection: &CollectionRef, filter: JsonValue)
        -> anyhow::Result<u64>;

    async fn drop_collection(&self, collection: &CollectionRef) -> anyhow::Result<()>;
}

/// Driver-independent statement error for [`RelationalStore`]
/// implementations that do not surface `tokio_postgres::Error`.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{message} (SQLSTATE {})", code.code())]
pub struct StatementFailure {
    pub code: SqlState,
    pub message: String,
}

impl StatementFailure {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Finds the SQLSTATE anywhere in an error chain.
pub fn sql_state(err: &anyhow::Error) -> Option<SqlState> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<tokio_postgres::Error>() {
            return e.code().cloned();
        }
        cause
            .downcast_ref::<StatementFailure>()
            .map(|e| e.code.clone())
    })
}

fn text_params<'a>(params: &'a [&'a str]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn decode_text_row(row: &Row) -> anyhow::Result<TextRow> {
    let columns = (0..row.len())
        .map(|i| {
            row.try_get::<_, Option<String>>(i)
                .with_context(|| format!("column {i} is not text"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(TextRow(columns))
}

#[async_trait]
impl RelationalStore for tokio_postgres::Client {
    async fn execute(&self, statement: &str, params: &[&str]) -> anyhow::Result<u64> {
        tracing::debug!("execute: {statement}");
        let params = text_params(params);
        with_timeout(tokio_postgres::Client::execute(self, statement, &params)).await
    }

    async fn query_row(
        &self,
        statement: &str,
        params: &[&str],
    ) -> anyhow::Result<Option<TextRow>> {
        tracing::debug!("query: {statement}");
        let params = text_params(params);
        let row = with_timeout(self.query_opt(statement, &params)).await?;
        row.as_ref().map(decode_text_row).transpose()
    }
}

fn tls_config() -> anyhow::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    anyhow::ensure!(
        native_certs.errors.is_empty(),
        "failed to load native certs: {:?}",
        native_certs.errors
    );
    for cert in native_certs.certs {
        roots.add(cert)?;
    }
    if let Some(ca_file_path) = env::var_os("PG_CA_FILE").filter(|p| !p.is_empty()) {
        let ca_file_path = Path::new(&ca_file_path);
        let ca_file_content = fs::read(ca_file_path)
            .with_context(|| format!("Failed to read CA file: {}", ca_file_path.display()))?;
        for ca_cert in CertificateDer::pem_slice_iter(&ca_file_content) {
            roots.add(ca_cert.with_context(|| {
                format!("Failed to parse CA file as PEM: {}", ca_file_path.display())
            })?)?;
        }
    }
    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
    if let Ok(path) = env::var("SSLKEYLOGFILE") {
        tracing::warn!("SSLKEYLOGFILE is set, TLS secrets will be logged to {path}");
        config.key_log = Arc::new(KeyLogFile::new());
    }
    Ok(config)
}

/// Opens a single connection. TLS is negotiated according to the url's
/// `sslmode`; the connection task is spawned onto the current runtime.
pub async fn connect(url: &str) -> anyhow::Result<tokio_postgres::Client> {
    let config: tokio_postgres::Config = url.parse().context("invalid postgres connection url")?;
    let connector = MakeRustlsConnect::new(tls_config()?);
    let (client, connection) = config
        .connect(connector)
        .await
        .context("failed to connect to postgres")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("postgres connection closed with error: {e}");
        }
    });
    Ok(client)
}
