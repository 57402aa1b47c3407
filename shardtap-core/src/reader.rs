use crate::client::{ItemRecord, SelectPage, StoreClient};
use crate::{Result, TapError};
use futures_util::Stream;
use std::collections::VecDeque;
use std::sync::Arc;

/// Largest `limit` the store accepts in a select expression.
pub const MAX_SELECT_LIMIT: u64 = 2500;

/// One pass over the items of a shard, optionally filtered and limited.
///
/// The scan follows continuation tokens until the store reports no more
/// results or the item limit is reached. It cannot be restarted; build a new
/// scanner to read the shard again.
pub struct ShardScanner {
    client: Arc<StoreClient>,
    shard: String,
    expression: String,
    item_limit: Option<u64>,
    consistent_read: bool,
    returned: u64,
    next_token: Option<String>,
    buffer: VecDeque<ItemRecord>,
    pages: usize,
    exhausted: bool,
}

impl ShardScanner {
    pub fn new(
        client: Arc<StoreClient>,
        shard: &str,
        predicate: Option<&str>,
        item_limit: Option<u64>,
    ) -> Self {
        Self {
            client,
            shard: shard.to_string(),
            expression: select_expression("*", shard, predicate, item_limit),
            item_limit,
            consistent_read: false,
            returned: 0,
            next_token: None,
            buffer: VecDeque::new(),
            pages: 0,
            exhausted: item_limit == Some(0),
        }
    }

    pub fn with_consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Items handed out so far, counting those still buffered.
    pub fn returned(&self) -> u64 {
        self.returned
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// The next page of results, or `None` once the scan is over. Pages may
    /// be empty while the store still reports more results.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ItemRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .client
            .select(
                &self.expression,
                self.next_token.as_deref(),
                self.consistent_read,
            )
            .await?;
        self.pages += 1;

        let mut items = page.items;
        if let Some(limit) = self.item_limit {
            let remaining = limit.saturating_sub(self.returned);
            if items.len() as u64 > remaining {
                items.truncate(remaining as usize);
            }
        }
        self.returned += items.len() as u64;
        self.next_token = page.next_token;

        let limit_reached = self
            .item_limit
            .is_some_and(|limit| self.returned >= limit);
        if self.next_token.is_none() || limit_reached {
            self.exhausted = true;
        }

        tracing::trace!(
            "page {} of {} returned {} items, {} so far",
            self.pages,
            self.shard,
            items.len(),
            self.returned
        );
        Ok(Some(items))
    }

    pub async fn next_item(&mut self) -> Result<Option<ItemRecord>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            match self.next_page().await? {
                Some(items) => self.buffer.extend(items),
                None => return Ok(None),
            }
        }
    }

    /// The remaining items as a stream. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ItemRecord>> + Send {
        futures_util::stream::unfold(self, |mut scanner| async move {
            match scanner.next_item().await {
                Ok(Some(item)) => Some((Ok(item), scanner)),
                Ok(None) => None,
                Err(error) => {
                    scanner.exhausted = true;
                    scanner.buffer.clear();
                    Some((Err(error), scanner))
                }
            }
        })
    }
}

/// Count the items of `domain` matching `predicate`, stopping at `limit`.
///
/// The store may split a count across several pages; their counts are summed.
pub async fn item_count(
    client: &StoreClient,
    domain: &str,
    predicate: Option<&str>,
    limit: Option<u64>,
) -> Result<u64> {
    if limit == Some(0) {
        return Ok(0);
    }

    let expression = select_expression("count(*)", domain, predicate, limit);
    let mut total = 0u64;
    let mut token: Option<String> = None;

    loop {
        let page = client.select(&expression, token.as_deref(), false).await?;
        total += page_count(&page)?;
        token = page.next_token;

        let limit_reached = limit.is_some_and(|limit| total >= limit);
        if token.is_none() || limit_reached {
            break;
        }
    }

    Ok(limit.map_or(total, |limit| total.min(limit)))
}

fn page_count(page: &SelectPage) -> Result<u64> {
    page.items
        .first()
        .and_then(|item| item.attributes.get("Count"))
        .and_then(|values| values.first())
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| TapError::Xml("count response without a Count value".to_string()))
}

fn select_expression(
    output: &str,
    domain: &str,
    predicate: Option<&str>,
    limit: Option<u64>,
) -> String {
    let mut expression = format!("select {} from `{}`", output, domain);
    if let Some(predicate) = predicate.map(str::trim).filter(|value| !value.is_empty()) {
        expression.push_str(" where ");
        expression.push_str(predicate);
    }
    if let Some(limit) = limit {
        expression.push_str(&format!(" limit {}", limit.min(MAX_SELECT_LIMIT)));
    }
    expression
}
