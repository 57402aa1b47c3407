use crate::client::StoreClient;
use crate::reader::{ShardScanner, item_count};
use crate::shard::{parse_shard_name, shard_names, validate_shard_set};
use crate::writer::BatchWriter;
use crate::{Result, TableConfig, TapError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// What opening a table for writing does to existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkMode {
    /// Write into the existing shards, creating any that are missing.
    #[default]
    Update,
    /// Delete every shard first, then recreate them empty.
    Replace,
}

/// One unit of parallel read work: a single shard and its share of the row limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSplit {
    pub shard: String,
    pub item_limit: Option<u64>,
    /// Matching items counted while planning.
    pub estimated_items: u64,
}

/// A logical table spread over `shard_count` domains.
pub struct ShardedTable {
    client: Arc<StoreClient>,
    config: TableConfig,
}

impl ShardedTable {
    pub fn new(client: Arc<StoreClient>, config: TableConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn name(&self) -> &str {
        &self.config.domain
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<StoreClient> {
        &self.client
    }

    pub fn shard_names(&self) -> Vec<String> {
        shard_names(&self.config.domain, self.config.shard_count)
    }

    pub async fn create(&self) -> Result<()> {
        for shard in self.shard_names() {
            self.client.create_domain(&shard).await?;
        }
        tracing::info!(
            "created table {} with {} shards",
            self.config.domain,
            self.config.shard_count
        );
        Ok(())
    }

    /// Delete every shard of this table, whatever count it was created with.
    /// Returns the number of domains deleted.
    pub async fn drop_table(&self) -> Result<usize> {
        let mut deleted = 0;
        for domain in self.client.list_all_domains().await? {
            let owned = parse_shard_name(&domain)
                .is_some_and(|shard| shard.base == self.config.domain);
            if owned {
                self.client.delete_domain(&domain).await?;
                deleted += 1;
            }
        }
        tracing::info!("dropped {} shards of table {}", deleted, self.config.domain);
        Ok(deleted)
    }

    /// Whether every configured shard exists.
    pub async fn exists(&self) -> Result<bool> {
        let existing: HashSet<String> = self.client.list_all_domains().await?.into_iter().collect();
        Ok(self
            .shard_names()
            .iter()
            .all(|shard| existing.contains(shard)))
    }

    /// Most recent metadata timestamp across the shards.
    pub async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for shard in self.shard_names() {
            let timestamp = self.client.domain_metadata(&shard).await?.timestamp();
            latest = latest.max(timestamp);
        }
        Ok(latest)
    }

    /// Shard count recorded in the store's domain names, 0 if none exist.
    pub async fn discover_shard_count(&self) -> Result<u32> {
        let domains = self.client.list_all_domains().await?;
        validate_shard_set(&domains, &self.config.domain)
    }

    /// Prepare the shards for writing and return a writer over them.
    pub async fn open_writer(&self, mode: SinkMode) -> Result<BatchWriter> {
        if mode == SinkMode::Replace {
            self.drop_table().await?;
        }
        self.create().await?;
        BatchWriter::from_table(self.client.clone(), &self.config)
    }

    /// Split the table into per-shard reads.
    ///
    /// With a row limit, each shard in turn is offered an even share of what
    /// is left. Shards that hold fewer matches than their share only use what
    /// they have, and the rest carries over to later shards. Shards with no
    /// matches, or no budget left, produce no split.
    pub async fn plan_reads(&self) -> Result<Vec<ReadSplit>> {
        let shard_count = self.discover_shard_count().await?;
        if shard_count == 0 {
            return Err(TapError::InvalidRequest(format!(
                "table {} has no shards",
                self.config.domain
            )));
        }
        if shard_count != self.config.shard_count {
            tracing::warn!(
                "table {} is configured with {} shards but the store has {}",
                self.config.domain,
                self.config.shard_count,
                shard_count
            );
        }

        let query = self.config.query();
        let mut remaining = self.config.row_limit;
        let mut splits = Vec::new();

        for (position, shard) in shard_names(&self.config.domain, shard_count)
            .into_iter()
            .enumerate()
        {
            let shards_left = u64::from(shard_count) - position as u64;
            let share = remaining.map(|remaining| remaining / shards_left);
            if share == Some(0) {
                continue;
            }

            let matches = item_count(&self.client, &shard, query, share).await?;
            if matches == 0 {
                continue;
            }

            let item_limit = share.map(|share| share.min(matches));
            if let (Some(left), Some(used)) = (remaining.as_mut(), item_limit) {
                *left -= used;
            }
            tracing::debug!("planned read of {} with limit {:?}", shard, item_limit);

            splits.push(ReadSplit {
                shard,
                item_limit,
                estimated_items: matches,
            });
        }

        Ok(splits)
    }

    pub fn scanner(&self, split: &ReadSplit) -> ShardScanner {
        ShardScanner::new(
            self.client.clone(),
            &split.shard,
            self.config.query(),
            split.item_limit,
        )
    }
}
