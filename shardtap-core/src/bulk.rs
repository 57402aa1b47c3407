//! Record-level interfaces for batch jobs.
//!
//! A job sees a table as a sink it pushes records into and, per read split,
//! a source it pulls records from. Rows are plain field-to-value maps; the
//! [`RecordSchema`] decides which field names the item and which fields
//! become attributes.

use crate::client::{AttributeMap, ItemRecord};
use crate::reader::ShardScanner;
use crate::table::{ReadSplit, ShardedTable, SinkMode};
use crate::writer::BatchWriter;
use crate::{Result, TableConfig, TapError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Field name to value; `None` stands for a null field.
pub type Row = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub attributes: AttributeMap,
}

impl From<ItemRecord> for Record {
    fn from(item: ItemRecord) -> Self {
        Self {
            id: item.name,
            attributes: item.attributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub item_field: String,
    pub fields: Vec<String>,
}

impl RecordSchema {
    pub fn new(item_field: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            item_field: item_field.into(),
            fields,
        }
    }

    pub fn from_table(config: &TableConfig) -> Self {
        Self::new(config.item_field.clone(), config.fields.clone())
    }

    /// Null fields are left out of the record.
    pub fn to_record(&self, row: &Row) -> Result<Record> {
        let id = row
            .get(&self.item_field)
            .cloned()
            .flatten()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                TapError::InvalidRequest(format!(
                    "row has no value for the item field {}",
                    self.item_field
                ))
            })?;

        let attributes = self
            .fields
            .iter()
            .filter(|field| **field != self.item_field)
            .filter_map(|field| {
                let value = row.get(field).cloned().flatten()?;
                Some((field.clone(), vec![value]))
            })
            .collect();

        Ok(Record { id, attributes })
    }

    /// Multi-valued attributes contribute their first value.
    pub fn to_row(&self, record: &Record) -> Row {
        let mut row = Row::new();
        row.insert(self.item_field.clone(), Some(record.id.clone()));
        for field in &self.fields {
            if *field == self.item_field {
                continue;
            }
            let value = record
                .attributes
                .get(field)
                .and_then(|values| values.first())
                .cloned();
            row.insert(field.clone(), value);
        }
        row
    }
}

#[async_trait]
pub trait BulkSink: Send {
    async fn accept(&mut self, record: Record) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait BulkSource: Send {
    async fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Writes records into a sharded table through a [`BatchWriter`].
pub struct TableSink {
    writer: BatchWriter,
    close_timeout: Duration,
    written: u64,
}

impl TableSink {
    pub fn new(writer: BatchWriter, close_timeout: Duration) -> Self {
        Self {
            writer,
            close_timeout,
            written: 0,
        }
    }

    pub async fn open(table: &ShardedTable, mode: SinkMode) -> Result<Self> {
        let writer = table.open_writer(mode).await?;
        Ok(Self::new(writer, table.config().close_timeout()))
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }
}

#[async_trait]
impl BulkSink for TableSink {
    async fn accept(&mut self, record: Record) -> Result<()> {
        self.writer.enqueue(&record.id, record.attributes).await?;
        self.written += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush_all().await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.close(self.close_timeout).await
    }
}

/// Reads the records of one read split.
pub struct TableSource {
    scanner: ShardScanner,
}

impl TableSource {
    pub fn new(scanner: ShardScanner) -> Self {
        Self { scanner }
    }

    pub fn open(table: &ShardedTable, split: &ReadSplit) -> Self {
        Self::new(table.scanner(split))
    }

    pub fn shard(&self) -> &str {
        self.scanner.shard()
    }
}

#[async_trait]
impl BulkSource for TableSource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.scanner.next_item().await?.map(Record::from))
    }
}
