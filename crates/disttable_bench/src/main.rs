use std::{
    io::Write,
    time::Instant,
};

use anyhow::Context;
use chrono::{
    Local,
    Utc,
};
use clap::Parser;
use cmd_util::env::{
    config_service,
    config_tool,
};
use disttable::{
    CollectionRef,
    DistributionOptions,
    DocumentStore,
    MigrationState,
    PostgresLedger,
    TableDistributor,
};
use mongodb::bson::Document;

use crate::{
    config::{
        BenchConfig,
        Command,
        Config,
    },
    documents::MongoDocumentStore,
    stats::BatchStats,
};

mod config;
mod dataset;
mod documents;
mod metrics;
mod push;
mod stats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let _guard = match config.command {
        Command::Insert(_) => config_service(),
        _ => config_tool(),
    };
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let collection = CollectionRef::new(config.database, config.collection);
    let mongo_url = config.mongo_url.as_deref();

    let client = disttable::connect(&config.pg_url).await?;
    let options = DistributionOptions::default();
    let ledger = PostgresLedger::new(&client, &options.ledger_table)?;
    let distributor = TableDistributor::new(&client, &ledger).with_options(options);

    match config.command {
        Command::Insert(args) => {
            let bench = BenchConfig::new(args)?;
            let documents = connect_documents(mongo_url).await?;
            run_insert(&bench, &collection, &documents, &distributor).await?;
        },
        Command::Distribute => {
            let documents = connect_documents(mongo_url).await?;
            let report = distributor.distribute(&documents, &collection).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
        Command::DropDistribution { ignore_missing } => {
            match distributor.drop_distribution(&collection).await {
                Ok(()) => tracing::info!("Dropped distribution of {collection}"),
                Err(e) if ignore_missing && e.is_not_found() => tracing::warn!("{e}"),
                Err(e) => return Err(e.into()),
            }
        },
        Command::Rollback => {
            let state = distributor.rollback(&collection).await?;
            println!("{state}");
        },
        Command::Status => {
            let status = match distributor.status(&collection).await? {
                Some(record) => serde_json::to_value(record)?,
                None => serde_json::json!({
                    "collection": collection.collection,
                    "state": MigrationState::NotMigrated,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        },
    }
    Ok(())
}

async fn connect_documents(url: Option<&str>) -> anyhow::Result<MongoDocumentStore> {
    let url = url.context("--mongo-url or MONGO_DBCONN is required for this command")?;
    MongoDocumentStore::connect(url).await
}

async fn run_insert(
    config: &BenchConfig,
    collection: &CollectionRef,
    documents: &MongoDocumentStore,
    distributor: &TableDistributor<'_>,
) -> anyhow::Result<()> {
    let records = dataset::load(&config.dataset, config.documents_per_iteration())?;
    let records = documents::to_documents(&records)?;
    metrics::log_run_config(config);

    for i in 0..config.iterations {
        run_iteration(config, collection, documents, distributor, &records)
            .await
            .with_context(|| format!("fail on iteration #{i}"))?;
    }
    metrics::log_finished_at(Utc::now().timestamp());

    let run_ts = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
    match &config.push_gateway {
        Some(gateway) => {
            let url = push::push_url(gateway, &run_ts, &config.grouping)?;
            push::push_metrics(&reqwest::Client::new(), url).await?;
            println!(
                "metrics are available on: {}",
                push::dashboard_url(&config.grafana_url, &run_ts)?
            );
        },
        None => tracing::info!("No push gateway configured, metrics of run {run_ts} are dropped"),
    }
    Ok(())
}

async fn run_iteration(
    config: &BenchConfig,
    collection: &CollectionRef,
    documents: &MongoDocumentStore,
    distributor: &TableDistributor<'_>,
    records: &[Document],
) -> anyhow::Result<()> {
    if config.dist {
        match distributor.drop_distribution(collection).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => tracing::debug!("Nothing to drop: {e}"),
            Err(e) => return Err(e.into()),
        }
    }
    documents.drop_collection(collection).await?;
    if config.dist {
        let report = distributor.distribute(documents, collection).await?;
        tracing::info!("Distributed {collection} into {}", report.backing_table);
    }

    let mut stats = BatchStats::default();
    let mut stdout = std::io::stdout();
    for (n, batch) in records.chunks(config.batch_size).enumerate() {
        write!(stdout, ".")?;
        stdout.flush()?;
        let start = n * config.batch_size;
        let timer = Instant::now();
        documents
            .insert_many(collection, batch)
            .await
            .with_context(|| {
                format!("fail to insert records from {start}:{}", start + batch.len())
            })?;
        let elapsed = timer.elapsed();
        metrics::log_insert_batch(config.dist, elapsed);
        stats.record(elapsed);
    }
    writeln!(stdout)?;
    writeln!(stdout, "{stats}")?;
    Ok(())
}
