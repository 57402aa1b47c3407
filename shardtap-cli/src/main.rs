mod config;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use config::Config;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use shardtap_core::{
    BulkSink, BulkSource, RecordSchema, Row, ShardedTable, SinkMode, StoreClient, TableSink,
    TableSource, item_count, shard_index, shard_name,
};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "shardtap")]
#[command(about = "Bulk access to sharded tables in a rate-limited attribute store")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "shardtap.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every shard of the table
    Create,
    /// Delete every shard of the table
    Drop,
    /// Show the shards found in the store
    Shards,
    /// Count matching items across all shards
    Count {
        /// Select predicate, overriding the configured query
        #[arg(short, long)]
        query: Option<String>,
        /// Stop counting each shard at this many items
        #[arg(short, long)]
        limit: Option<u64>,
    },
    /// Print matching rows as JSON lines
    Scan {
        #[arg(short, long)]
        query: Option<String>,
        /// Maximum rows across all shards
        #[arg(short, long)]
        limit: Option<u64>,
    },
    /// Write JSON lines rows into the table
    Load {
        /// Input file, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,
        /// Drop and recreate the table before loading
        #[arg(long)]
        replace: bool,
    },
    /// Print the stored attributes of one item
    Get { item: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardtap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, cfg).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands, mut cfg: Config) -> anyhow::Result<()> {
    let client = Arc::new(StoreClient::from_config(&cfg.store)?);

    match command {
        Commands::Create => {
            table(&client, &cfg)?.create().await?;
        }
        Commands::Drop => {
            let deleted = table(&client, &cfg)?.drop_table().await?;
            tracing::info!("Deleted {} domains", deleted);
        }
        Commands::Shards => {
            let table = table(&client, &cfg)?;
            let count = table.discover_shard_count().await?;
            if count == 0 {
                println!("table {} has no shards", table.name());
            } else {
                for name in shardtap_core::shard_names(table.name(), count) {
                    println!("{}", name);
                }
            }
        }
        Commands::Count { query, limit } => {
            if query.is_some() {
                cfg.table.query = query;
            }
            let total = count(&client, &cfg, limit).await?;
            println!("{}", total);
        }
        Commands::Scan { query, limit } => {
            if query.is_some() {
                cfg.table.query = query;
            }
            if limit.is_some() {
                cfg.table.row_limit = limit;
            }
            scan(&client, &cfg).await?;
        }
        Commands::Load { input, replace } => {
            let mode = if replace {
                SinkMode::Replace
            } else {
                SinkMode::Update
            };
            load(&client, &cfg, &input, mode).await?;
        }
        Commands::Get { item } => {
            let index = shard_index(&item, cfg.table.shard_count);
            let shard = shard_name(&cfg.table.domain, index + 1, cfg.table.shard_count);
            let attributes = client.get_attributes(&shard, &item, None, true).await?;
            println!("{}", serde_json::to_string(&attributes)?);
        }
    }

    Ok(())
}

fn table(client: &Arc<StoreClient>, cfg: &Config) -> anyhow::Result<ShardedTable> {
    Ok(ShardedTable::new(client.clone(), cfg.table.clone())?)
}

async fn count(client: &Arc<StoreClient>, cfg: &Config, limit: Option<u64>) -> anyhow::Result<u64> {
    let table = table(client, cfg)?;
    let shard_count = table.discover_shard_count().await?;
    if shard_count == 0 {
        bail!("table {} has no shards", table.name());
    }

    let query = cfg.table.query();
    let concurrency = cfg.table.max_workers.min(shard_count as usize);
    let total = futures_util::stream::iter(shardtap_core::shard_names(table.name(), shard_count))
        .map(|shard| async move { item_count(client, &shard, query, limit).await })
        .buffer_unordered(concurrency)
        .try_fold(0u64, |total, count| async move { Ok(total + count) })
        .await?;
    Ok(total)
}

async fn scan(client: &Arc<StoreClient>, cfg: &Config) -> anyhow::Result<()> {
    let table = table(client, cfg)?;
    let schema = RecordSchema::from_table(&cfg.table);

    let mut rows = 0u64;
    for split in table.plan_reads().await? {
        let mut source = TableSource::open(&table, &split);
        while let Some(record) = source.next_record().await? {
            println!("{}", row_to_json(&schema.to_row(&record)));
            rows += 1;
        }
    }

    tracing::info!("Scanned {} rows from {}", rows, table.name());
    Ok(())
}

async fn load(client: &Arc<StoreClient>, cfg: &Config, input: &str, mode: SinkMode) -> anyhow::Result<()> {
    let table = table(client, cfg)?;
    let schema = RecordSchema::from_table(&cfg.table);
    let mut lines = open_input(input).await?.lines();
    let mut sink = TableSink::open(&table, mode).await?;

    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .with_context(|| format!("line {} is not valid JSON", line_number))?;
        let row = json_to_row(value).with_context(|| format!("line {}", line_number))?;
        sink.accept(schema.to_record(&row)?).await?;
    }

    sink.close().await?;
    tracing::info!("Loaded {} rows into {}", sink.written(), table.name());
    Ok(())
}

async fn open_input(input: &str) -> anyhow::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("failed to open {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

fn json_to_row(value: Value) -> anyhow::Result<Row> {
    let Value::Object(fields) = value else {
        bail!("expected a JSON object");
    };

    Ok(fields
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Null => None,
                Value::String(text) => Some(text),
                other => Some(other.to_string()),
            };
            (key, value)
        })
        .collect())
}

fn row_to_json(row: &Row) -> Value {
    let fields: Map<String, Value> = row
        .iter()
        .map(|(key, value)| {
            let value = value.clone().map(Value::String).unwrap_or(Value::Null);
            (key.clone(), value)
        })
        .collect();
    Value::Object(fields)
}
