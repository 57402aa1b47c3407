//! Shardtap Core - sharded table access over a rate-limited attribute store
//!
//! Bulk jobs read and write one logical table that is physically spread over
//! a fixed number of store domains:
//! - signature version 2 request signing (HMAC-SHA1)
//! - adaptive retry with exponential backoff for throttling
//! - Jenkins one-at-a-time hash routing of item names to shards
//! - bounded concurrent batch writes with deferred failure reporting
//! - paginated, optionally limited shard scans

pub mod bulk;
pub mod client;
pub mod config;
pub mod error;
pub mod reader;
pub mod shard;
pub mod signer;
pub mod table;
pub mod transport;
pub mod writer;
pub mod xml;

#[cfg(test)]
mod testing;

pub use bulk::{BulkSink, BulkSource, Record, RecordSchema, Row, TableSink, TableSource};
pub use client::{
    API_VERSION, AttributeMap, AttributeSelector, BatchItem, CallMetadata, DomainMetadata,
    DomainPage, ExpectedCondition, ItemRecord, PutRequest, SelectPage, StoreClient,
};
pub use config::{MAX_BATCH_SIZE, RetryConfig, StoreConfig, TableConfig};
pub use error::{ErrorClass, Result, TapError, is_retryable_status};
pub use reader::{MAX_SELECT_LIMIT, ShardScanner, item_count};
pub use shard::{
    ITEM_HASH_ATTRIBUTE, ShardName, item_hash, jenkins_hash, parse_shard_name, shard_index,
    shard_name, shard_names, validate_shard_set,
};
pub use signer::{HttpMethod, RequestSigner};
pub use table::{ReadSplit, ShardedTable, SinkMode};
pub use transport::{
    ExchangeError, HttpExchange, HttpRequest, HttpResponse, HttpTransport, ReqwestExchange,
    RetryPolicy, RetryingTransport,
};
pub use writer::{BatchWriter, FailureQueue, WriterOptions};
pub use xml::{ResponseDocument, XmlElement};
