use crate::error::{ATTRIBUTE_DOES_NOT_EXIST, CONDITIONAL_CHECK_FAILED, NO_STORE_ERROR_CODE};
use crate::signer::{HttpMethod, RequestSigner, SIGNATURE_METHOD, SIGNATURE_VERSION, encode_params};
use crate::transport::{HttpTransport, RetryingTransport};
use crate::xml::{ResponseDocument, XmlElement};
use crate::{MAX_BATCH_SIZE, Result, StoreConfig, TapError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

pub const API_VERSION: &str = "2009-04-15";

/// Attribute name to its values, in the order they were stored.
pub type AttributeMap = BTreeMap<String, Vec<String>>;

/// Precondition for a conditional put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedCondition {
    pub name: String,
    pub value: Option<String>,
    pub exists: bool,
}

impl ExpectedCondition {
    /// The attribute must currently hold `value`.
    pub fn equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            exists: true,
        }
    }

    /// The attribute must not exist yet.
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            exists: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub attributes: AttributeMap,
    /// Attribute names whose stored values are replaced rather than extended.
    pub replace: BTreeSet<String>,
    pub expected: Option<ExpectedCondition>,
}

impl PutRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn replace(mut self, name: impl Into<String>) -> Self {
        self.replace.insert(name.into());
        self
    }

    pub fn replace_all(mut self) -> Self {
        self.replace.extend(self.attributes.keys().cloned());
        self
    }

    pub fn expect(mut self, condition: ExpectedCondition) -> Self {
        self.expected = Some(condition);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub name: String,
    pub attributes: AttributeMap,
    pub replace: BTreeSet<String>,
}

impl BatchItem {
    /// An item whose every attribute overwrites what is stored.
    pub fn replacing(name: impl Into<String>, attributes: AttributeMap) -> Self {
        let replace = attributes.keys().cloned().collect();
        Self {
            name: name.into(),
            attributes,
            replace,
        }
    }
}

/// Names an attribute, or one value of it, to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSelector {
    pub name: String,
    pub value: Option<String>,
}

impl AttributeSelector {
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub name: String,
    pub attributes: AttributeMap,
}

#[derive(Debug, Clone, Default)]
pub struct SelectPage {
    pub items: Vec<ItemRecord>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DomainPage {
    pub domains: Vec<String>,
    pub next_token: Option<String>,
}

const METADATA_FIELDS: [&str; 7] = [
    "Timestamp",
    "ItemCount",
    "AttributeValueCount",
    "AttributeNameCount",
    "ItemNamesSizeBytes",
    "AttributeValuesSizeBytes",
    "AttributeNamesSizeBytes",
];

#[derive(Debug, Clone, Default)]
pub struct DomainMetadata {
    values: BTreeMap<String, String>,
}

impl DomainMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// When the metadata was last computed by the store.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let seconds = self.number("Timestamp")?;
        DateTime::from_timestamp(i64::try_from(seconds).ok()?, 0)
    }

    pub fn item_count(&self) -> Option<u64> {
        self.number("ItemCount")
    }

    pub fn attribute_value_count(&self) -> Option<u64> {
        self.number("AttributeValueCount")
    }

    pub fn attribute_name_count(&self) -> Option<u64> {
        self.number("AttributeNameCount")
    }

    pub fn item_names_size_bytes(&self) -> Option<u64> {
        self.number("ItemNamesSizeBytes")
    }

    pub fn attribute_values_size_bytes(&self) -> Option<u64> {
        self.number("AttributeValuesSizeBytes")
    }

    pub fn attribute_names_size_bytes(&self) -> Option<u64> {
        self.number("AttributeNamesSizeBytes")
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.get(key)?.trim().parse().ok()
    }
}

/// Response metadata of the most recent call on a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    pub request_id: Option<String>,
    pub box_usage: Option<String>,
    pub next_token: Option<String>,
}

/// Typed operations against the attribute store.
///
/// Every call is signed and sent through the shared transport. The client is
/// cheap to share behind an `Arc`; only the last-call diagnostics are
/// guarded, and they describe whichever call finished most recently.
pub struct StoreClient {
    transport: Arc<dyn HttpTransport>,
    signer: RequestSigner,
    access_key_id: String,
    endpoint: String,
    host: String,
    pool_capacity: usize,
    last_call: Mutex<CallMetadata>,
}

impl StoreClient {
    pub fn new(config: &StoreConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let host = endpoint_host(&endpoint)?;

        Ok(Self {
            transport,
            signer: RequestSigner::new(&config.secret_access_key),
            access_key_id: config.access_key_id.clone(),
            endpoint,
            host,
            pool_capacity: config.max_connections,
            last_call: Mutex::new(CallMetadata::default()),
        })
    }

    /// Client over a retrying reqwest transport built from `config`.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let transport = RetryingTransport::from_config(config)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Connections the underlying pool is sized for.
    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    pub fn last_call(&self) -> CallMetadata {
        self.last_call.lock().clone()
    }

    pub fn last_request_id(&self) -> Option<String> {
        self.last_call.lock().request_id.clone()
    }

    pub fn last_box_usage(&self) -> Option<String> {
        self.last_call.lock().box_usage.clone()
    }

    pub fn last_next_token(&self) -> Option<String> {
        self.last_call.lock().next_token.clone()
    }

    pub async fn create_domain(&self, name: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), name.to_string());
        self.call(HttpMethod::Get, "CreateDomain", params, false)
            .await?;
        Ok(())
    }

    pub async fn delete_domain(&self, name: &str) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), name.to_string());
        self.call(HttpMethod::Get, "DeleteDomain", params, false)
            .await?;
        Ok(())
    }

    pub async fn list_domains(
        &self,
        max_count: Option<u32>,
        next_token: Option<&str>,
    ) -> Result<DomainPage> {
        let mut params = BTreeMap::new();
        if let Some(max_count) = max_count {
            params.insert("MaxNumberOfDomains".to_string(), max_count.to_string());
        }
        if let Some(token) = next_token {
            params.insert("NextToken".to_string(), token.to_string());
        }

        let doc = self
            .call(HttpMethod::Get, "ListDomains", params, false)
            .await?;
        Ok(DomainPage {
            domains: doc.extract_all("DomainName"),
            next_token: doc.extract_first("NextToken"),
        })
    }

    /// Every domain of the account, following continuation tokens.
    pub async fn list_all_domains(&self) -> Result<Vec<String>> {
        let mut domains = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.list_domains(None, token.as_deref()).await?;
            domains.extend(page.domains);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(domains),
            }
        }
    }

    pub async fn domain_metadata(&self, name: &str) -> Result<DomainMetadata> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), name.to_string());

        let doc = self
            .call(HttpMethod::Get, "DomainMetadata", params, false)
            .await?;
        let values = METADATA_FIELDS
            .iter()
            .filter_map(|field| {
                doc.extract_first(field)
                    .map(|value| (field.to_string(), value))
            })
            .collect();
        Ok(DomainMetadata { values })
    }

    pub async fn put_attributes(
        &self,
        domain: &str,
        item: &str,
        request: &PutRequest,
    ) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), domain.to_string());
        params.insert("ItemName".to_string(), item.to_string());
        encode_attributes("", &request.attributes, &request.replace, &mut params);

        if let Some(expected) = &request.expected {
            params.insert("Expected.1.Name".to_string(), expected.name.clone());
            if let Some(value) = &expected.value {
                params.insert("Expected.1.Value".to_string(), value.clone());
            }
            params.insert("Expected.1.Exists".to_string(), expected.exists.to_string());
        }

        self.call(
            HttpMethod::Post,
            "PutAttributes",
            params,
            request.expected.is_some(),
        )
        .await?;
        Ok(())
    }

    pub async fn batch_put_attributes(&self, domain: &str, items: &[BatchItem]) -> Result<()> {
        if items.len() > MAX_BATCH_SIZE {
            return Err(TapError::InvalidRequest(format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                MAX_BATCH_SIZE
            )));
        }

        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), domain.to_string());
        for (position, item) in items.iter().enumerate() {
            let prefix = format!("Item.{}.", position);
            params.insert(format!("{}ItemName", prefix), item.name.clone());
            encode_attributes(&prefix, &item.attributes, &item.replace, &mut params);
        }

        self.call(HttpMethod::Post, "BatchPutAttributes", params, false)
            .await?;
        Ok(())
    }

    /// Delete the selected attributes, or the whole item when `selectors` is `None`.
    pub async fn delete_attributes(
        &self,
        domain: &str,
        item: &str,
        selectors: Option<&[AttributeSelector]>,
    ) -> Result<()> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), domain.to_string());
        params.insert("ItemName".to_string(), item.to_string());

        for (position, selector) in selectors.unwrap_or_default().iter().enumerate() {
            params.insert(format!("Attribute.{}.Name", position), selector.name.clone());
            if let Some(value) = &selector.value {
                params.insert(format!("Attribute.{}.Value", position), value.clone());
            }
        }

        self.call(HttpMethod::Get, "DeleteAttributes", params, false)
            .await?;
        Ok(())
    }

    /// Attributes of `item`. A missing item yields an empty map, since the
    /// store cannot tell it apart from an item not yet replicated.
    pub async fn get_attributes(
        &self,
        domain: &str,
        item: &str,
        attribute_name: Option<&str>,
        consistent_read: bool,
    ) -> Result<AttributeMap> {
        let mut params = BTreeMap::new();
        params.insert("DomainName".to_string(), domain.to_string());
        params.insert("ItemName".to_string(), item.to_string());
        if let Some(name) = attribute_name {
            params.insert("AttributeName".to_string(), name.to_string());
        }
        if consistent_read {
            params.insert("ConsistentRead".to_string(), "true".to_string());
        }

        let doc = self
            .call(HttpMethod::Get, "GetAttributes", params, false)
            .await?;
        Ok(collect_attributes(doc.elements("Attribute")))
    }

    pub async fn get_attribute(
        &self,
        domain: &str,
        item: &str,
        attribute_name: &str,
        consistent_read: bool,
    ) -> Result<Option<Vec<String>>> {
        let mut attributes = self
            .get_attributes(domain, item, Some(attribute_name), consistent_read)
            .await?;
        Ok(attributes.remove(attribute_name))
    }

    pub async fn select(
        &self,
        expression: &str,
        next_token: Option<&str>,
        consistent_read: bool,
    ) -> Result<SelectPage> {
        let mut params = BTreeMap::new();
        params.insert("SelectExpression".to_string(), expression.to_string());
        if let Some(token) = next_token {
            params.insert("NextToken".to_string(), token.to_string());
        }
        if consistent_read {
            params.insert("ConsistentRead".to_string(), "true".to_string());
        }

        let doc = self.call(HttpMethod::Get, "Select", params, false).await?;
        let items = doc
            .elements("Item")
            .into_iter()
            .map(|item| ItemRecord {
                name: item.child_text("Name").unwrap_or_default().to_string(),
                attributes: collect_attributes(item.children("Attribute")),
            })
            .collect();

        Ok(SelectPage {
            items,
            next_token: doc.extract_first("NextToken"),
        })
    }

    async fn call(
        &self,
        method: HttpMethod,
        action: &str,
        fields: BTreeMap<String, String>,
        conditional: bool,
    ) -> Result<ResponseDocument> {
        let params = self.signed_params(method, action, fields)?;
        let started = Instant::now();

        let outcome = match method {
            HttpMethod::Get => {
                let url = format!("{}/?{}", self.endpoint, encode_params(&params));
                self.transport.get(&url).await
            }
            HttpMethod::Post => {
                let url = format!("{}/", self.endpoint);
                self.transport.post(&url, &params).await
            }
        };

        tracing::trace!(
            "{} completed in {}ms",
            action,
            started.elapsed().as_millis()
        );

        match outcome {
            Ok(body) => {
                let doc = ResponseDocument::parse(&body)?;
                *self.last_call.lock() = CallMetadata {
                    request_id: doc.extract_first("RequestId"),
                    box_usage: doc.extract_first("BoxUsage"),
                    next_token: doc.extract_first("NextToken"),
                };
                Ok(doc)
            }
            Err(TapError::Http { status, body }) => {
                Err(self.decode_error(action, status, &body, conditional))
            }
            Err(error) => Err(error),
        }
    }

    fn signed_params(
        &self,
        method: HttpMethod,
        action: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut params = fields;
        params.insert("AWSAccessKeyId".to_string(), self.access_key_id.clone());
        params.insert("Action".to_string(), action.to_string());
        params.insert("SignatureVersion".to_string(), SIGNATURE_VERSION.to_string());
        params.insert("SignatureMethod".to_string(), SIGNATURE_METHOD.to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert("Timestamp".to_string(), timestamp(Utc::now()));

        let signature = self.signer.sign(method, &self.host, &params)?;
        params.insert("Signature".to_string(), signature);
        Ok(params)
    }

    fn decode_error(&self, action: &str, status: u16, body: &str, conditional: bool) -> TapError {
        // Bodies that are not XML at all still produce a classified error.
        let doc = ResponseDocument::parse(body).unwrap_or_default();
        let code = doc
            .extract_first("Code")
            .unwrap_or_else(|| NO_STORE_ERROR_CODE.to_string());
        let message = doc
            .extract_first("Message")
            .unwrap_or_else(|| body.trim().to_string());

        *self.last_call.lock() = CallMetadata {
            request_id: doc
                .extract_first("RequestID")
                .or_else(|| doc.extract_first("RequestId")),
            box_usage: doc.extract_first("BoxUsage"),
            next_token: None,
        };

        tracing::debug!("{} failed with {} ({}): {}", action, code, status, message);

        if code == CONDITIONAL_CHECK_FAILED || (conditional && code == ATTRIBUTE_DOES_NOT_EXIST) {
            TapError::ConditionalCheckFailed { code, message }
        } else {
            TapError::Store {
                status,
                code,
                message,
            }
        }
    }
}

fn encode_attributes(
    prefix: &str,
    attributes: &AttributeMap,
    replace: &BTreeSet<String>,
    params: &mut BTreeMap<String, String>,
) {
    let mut position = 0usize;
    for (name, values) in attributes {
        for value in values {
            params.insert(format!("{}Attribute.{}.Name", prefix, position), name.clone());
            params.insert(format!("{}Attribute.{}.Value", prefix, position), value.clone());
            if replace.contains(name) {
                params.insert(
                    format!("{}Attribute.{}.Replace", prefix, position),
                    "true".to_string(),
                );
            }
            position += 1;
        }
    }
}

fn collect_attributes<'a>(elements: impl IntoIterator<Item = &'a XmlElement>) -> AttributeMap {
    let mut attributes = AttributeMap::new();
    for element in elements {
        let Some(name) = element.child_text("Name") else {
            continue;
        };
        let value = element.child_text("Value").unwrap_or_default();
        attributes
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }
    attributes
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn endpoint_host(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|error| TapError::Config(format!("invalid endpoint {}: {}", endpoint, error)))?;
    let host = url
        .host_str()
        .ok_or_else(|| TapError::Config(format!("endpoint {} has no host", endpoint)))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
