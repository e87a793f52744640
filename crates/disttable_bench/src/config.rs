use std::path::PathBuf;

use clap::{
    Args,
    Parser,
    Subcommand,
};
use cmd_util::keyvalue::parse_key_value;
use reqwest::Url;

#[derive(Parser, Debug)]
#[clap(about = "Insert benchmark for FerretDB collections on plain and distributed tables")]
pub struct Config {
    /// Postgres connection url of the Citus coordinator backing FerretDB
    #[clap(long, env = "PG_DBCONN")]
    pub pg_url: String,
    /// MongoDB connection url of the FerretDB instance, needed by `insert`
    /// and `distribute`
    #[clap(long, env = "MONGO_DBCONN")]
    pub mongo_url: Option<String>,
    #[clap(long, default_value = "ferretdb")]
    pub database: String,
    #[clap(long, default_value = "test-collection")]
    pub collection: String,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Recreate the collection and insert the dataset in batches, once per
    /// iteration
    Insert(InsertArgs),
    /// Distribute the collection, resuming an interrupted run
    Distribute,
    /// Drop the distributed backing table, the view and the trigger
    DropDistribution {
        /// Succeed when the collection or its backing table does not exist
        #[clap(long)]
        ignore_missing: bool,
    },
    /// Undo the applied steps of a (partial) distribution
    Rollback,
    /// Print the migration record as JSON
    Status,
}

#[derive(Args, Debug, Clone)]
pub struct InsertArgs {
    /// Distribute the collection before inserting
    #[clap(long)]
    pub dist: bool,
    /// Documents per insert_many call
    #[clap(long, default_value_t = 25)]
    pub batch_size: usize,
    /// Batches inserted per iteration
    #[clap(long, default_value_t = 20)]
    pub batches: usize,
    /// Times the collection is set up from scratch and filled
    #[clap(long, default_value_t = 5)]
    pub iterations: usize,
    /// JSON array of documents, e.g. the algolia movies dataset
    #[clap(long, default_value = "data/records.json")]
    pub dataset: PathBuf,
    /// Prometheus push gateway, e.g. http://localhost:9191/
    #[clap(long, env = "DISTTABLE_PUSH_GATEWAY")]
    pub push_gateway: Option<Url>,
    /// Extra grouping labels for the pushed metrics
    #[clap(long = "grouping", value_parser = parse_key_value::<String, String, (String, String)>)]
    pub grouping: Vec<(String, String)>,
    /// Grafana instance hosting the benchmark dashboard
    #[clap(long, default_value = "http://localhost:3000")]
    pub grafana_url: Url,
}

/// Everything the insert benchmark needs, resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub dist: bool,
    pub batch_size: usize,
    pub batches: usize,
    pub iterations: usize,
    pub dataset: PathBuf,
    pub push_gateway: Option<Url>,
    pub grouping: Vec<(String, String)>,
    pub grafana_url: Url,
}

impl BenchConfig {
    pub fn new(args: InsertArgs) -> anyhow::Result<Self> {
        anyhow::ensure!(args.batch_size > 0, "--batch-size must be positive");
        anyhow::ensure!(args.batches > 0, "--batches must be positive");
        anyhow::ensure!(args.iterations > 0, "--iterations must be positive");
        if let Some((key, _)) = args.grouping.iter().find(|(key, _)| key == "run_ts") {
            anyhow::bail!("grouping label {key} is set by the benchmark");
        }
        Ok(Self {
            dist: args.dist,
            batch_size: args.batch_size,
            batches: args.batches,
            iterations: args.iterations,
            dataset: args.dataset,
            push_gateway: args.push_gateway,
            grouping: args.grouping,
            grafana_url: args.grafana_url,
        })
    }

    pub fn documents_per_iteration(&self) -> usize {
        self.batch_size * self.batches
    }
}
