//! Batched, concurrent writes into the shards of one table.
//!
//! Items are routed to a per-shard pending queue. A queue that reaches the
//! batch size is handed to a bounded pool of background tasks as one
//! `BatchPutAttributes` call. Those tasks never report errors directly;
//! failures land in a [`FailureQueue`] and are surfaced, oldest first and at
//! most once each, by the next call into the writer.

use crate::client::{AttributeMap, BatchItem, StoreClient};
use crate::shard::{ITEM_HASH_ATTRIBUTE, item_hash, shard_index, shard_names};
use crate::{MAX_BATCH_SIZE, Result, TableConfig, TapError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const DEFAULT_FAILURE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Items per flush, at most the store's own batch limit.
    pub batch_size: usize,
    /// Flush tasks allowed in flight across all shards.
    pub max_workers: usize,
    /// Captured failures kept for reporting; later ones are dropped.
    pub failure_capacity: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            max_workers: crate::config::DEFAULT_MAX_THREADS,
            failure_capacity: DEFAULT_FAILURE_CAPACITY,
        }
    }
}

impl WriterOptions {
    pub fn from_table(config: &TableConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_workers: config.max_workers,
            ..Self::default()
        }
    }
}

/// Bounded FIFO of failures captured on background tasks.
#[derive(Debug)]
pub struct FailureQueue {
    failures: Mutex<VecDeque<TapError>>,
    capacity: usize,
}

impl FailureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, error: TapError) {
        let mut failures = self.failures.lock();
        if failures.len() >= self.capacity {
            tracing::warn!("failure queue full, dropping: {}", error);
            return;
        }
        failures.push_back(error);
    }

    pub fn pop_oldest(&self) -> Option<TapError> {
        self.failures.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Insertion-ordered pending items of one shard. Re-adding an item that is
/// still pending replaces its attributes and keeps its position.
#[derive(Debug, Default)]
struct PendingQueue {
    order: Vec<String>,
    entries: HashMap<String, AttributeMap>,
}

impl PendingQueue {
    fn push(&mut self, item_id: &str, attributes: AttributeMap) {
        if self.entries.insert(item_id.to_string(), attributes).is_none() {
            self.order.push(item_id.to_string());
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn take(&mut self) -> Vec<BatchItem> {
        let mut entries = std::mem::take(&mut self.entries);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|item_id| {
                let attributes = entries.remove(&item_id)?;
                Some(BatchItem::replacing(item_id, attributes))
            })
            .collect()
    }
}

pub struct BatchWriter {
    client: Arc<StoreClient>,
    shards: Vec<String>,
    queues: Vec<PendingQueue>,
    batch_size: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    failures: Arc<FailureQueue>,
    dispatched: usize,
    closed: bool,
}

impl BatchWriter {
    pub fn new(
        client: Arc<StoreClient>,
        base: &str,
        shard_count: u32,
        options: WriterOptions,
    ) -> Result<Self> {
        if shard_count == 0 {
            return Err(TapError::Config("shard_count must be at least 1".to_string()));
        }
        if options.batch_size == 0 || options.batch_size > MAX_BATCH_SIZE {
            return Err(TapError::Config(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, options.batch_size
            )));
        }
        if options.max_workers == 0 {
            return Err(TapError::Config("max_workers must be at least 1".to_string()));
        }
        if options.max_workers > client.pool_capacity() {
            tracing::warn!(
                "{} write workers share a connection pool sized for {}",
                options.max_workers,
                client.pool_capacity()
            );
        }

        let shards = shard_names(base, shard_count);
        let queues = shards.iter().map(|_| PendingQueue::default()).collect();

        Ok(Self {
            client,
            shards,
            queues,
            batch_size: options.batch_size,
            permits: Arc::new(Semaphore::new(options.max_workers)),
            tasks: JoinSet::new(),
            failures: Arc::new(FailureQueue::new(options.failure_capacity)),
            dispatched: 0,
            closed: false,
        })
    }

    pub fn from_table(client: Arc<StoreClient>, config: &TableConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            client,
            &config.domain,
            config.shard_count,
            WriterOptions::from_table(config),
        )
    }

    pub fn shard_names(&self) -> &[String] {
        &self.shards
    }

    /// Items waiting in the queue of the zero-based shard `shard`.
    pub fn pending_len(&self, shard: usize) -> usize {
        self.queues.get(shard).map(PendingQueue::len).unwrap_or(0)
    }

    /// Batches handed to the worker pool so far.
    pub fn dispatched_batches(&self) -> usize {
        self.dispatched
    }

    /// Captured failures not yet reported.
    pub fn pending_failures(&self) -> usize {
        self.failures.len()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue one item. Waits for a free worker when this fills a batch.
    pub async fn enqueue(&mut self, item_id: &str, mut attributes: AttributeMap) -> Result<()> {
        self.checkpoint()?;
        if self.closed {
            return Err(TapError::WriterClosed);
        }

        let shard = shard_index(item_id, self.shards.len() as u32) as usize;
        attributes.insert(ITEM_HASH_ATTRIBUTE.to_string(), vec![item_hash(item_id)]);
        self.queues[shard].push(item_id, attributes);

        if self.queues[shard].len() >= self.batch_size {
            self.dispatch(shard).await?;
        }
        Ok(())
    }

    /// Hand every non-empty queue to the worker pool.
    pub async fn flush_all(&mut self) -> Result<()> {
        self.checkpoint()?;
        self.dispatch_all().await
    }

    /// Wait for dispatched batches to finish. Tasks still running at the
    /// deadline are aborted and reported as a shutdown timeout.
    pub async fn drain(&mut self, timeout: Duration) -> Result<()> {
        let tasks = &mut self.tasks;
        let failures = &self.failures;
        let joined = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(error) = joined {
                    failures.push(TapError::Internal(format!("flush task failed: {}", error)));
                }
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!(
                "hard termination of {} flush tasks after {:?}",
                self.tasks.len(),
                timeout
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            self.failures.push(TapError::ShutdownTimeout { timeout });
        }

        self.checkpoint()
    }

    /// Stop accepting items, flush what is pending and wait for it. A second
    /// call reports the next captured failure, if any.
    pub async fn close(&mut self, timeout: Duration) -> Result<()> {
        if self.closed {
            return self.checkpoint();
        }
        self.closed = true;
        self.dispatch_all().await?;
        self.drain(timeout).await
    }

    fn checkpoint(&self) -> Result<()> {
        match self.failures.pop_oldest() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn dispatch_all(&mut self) -> Result<()> {
        for shard in 0..self.queues.len() {
            self.dispatch(shard).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, shard: usize) -> Result<()> {
        if self.queues[shard].is_empty() {
            return Ok(());
        }

        // Items stay queued until a worker is free, so a caller that gives up
        // waiting loses nothing.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TapError::WriterClosed)?;
        let items = self.queues[shard].take();

        // Reap finished tasks so the set does not grow with every batch.
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(error) = joined {
                self.failures
                    .push(TapError::Internal(format!("flush task failed: {}", error)));
            }
        }

        let client = self.client.clone();
        let failures = self.failures.clone();
        let domain = self.shards[shard].clone();
        tracing::debug!("dispatching {} items to {}", items.len(), domain);

        self.tasks.spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            match client.batch_put_attributes(&domain, &items).await {
                Ok(()) => {
                    tracing::trace!(
                        "wrote {} items to {} in {}ms",
                        items.len(),
                        domain,
                        started.elapsed().as_millis()
                    );
                }
                Err(error) => {
                    tracing::warn!("async write of {} items to {} failed: {}", items.len(), domain, error);
                    failures.push(TapError::AsyncWrite {
                        shard: domain,
                        items: items.len(),
                        source: Box::new(error),
                    });
                }
            }
        });

        self.dispatched += 1;
        Ok(())
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        let pending: usize = self.queues.iter().map(PendingQueue::len).sum();
        if pending > 0 {
            tracing::warn!("writer dropped with {} unflushed items", pending);
        }
    }
}
