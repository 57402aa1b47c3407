//! In-memory store used by the unit tests.
//!
//! `StoreEmulator` plugs in where the retrying transport normally sits. It
//! checks every request signature, keeps domains and items in memory and
//! answers with the same XML shapes the real service produces, including
//! paginated selects, conditional puts and error bodies. Tests can inject
//! failures and latency per action.

use crate::client::AttributeMap;
use crate::signer::{HttpMethod, RequestSigner};
use crate::transport::HttpTransport;
use crate::{Result, StoreConfig, TapError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) const TEST_ENDPOINT: &str = "https://sdb.test.local";
const TEST_HOST: &str = "sdb.test.local";
const TEST_SECRET: &str = "test-secret";
const BOX_USAGE: &str = "0.0000219907";
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 2500;

pub(crate) fn test_config() -> StoreConfig {
    let mut config = StoreConfig::new("AKIDTEST", TEST_SECRET);
    config.endpoint = TEST_ENDPOINT.to_string();
    config
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub action: String,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedBatch {
    pub domain: String,
    pub items: Vec<String>,
}

#[derive(Debug)]
struct Fault {
    status: u16,
    code: Option<String>,
    message: String,
}

impl Fault {
    fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    fn no_such_domain(domain: &str) -> Self {
        Self::new(400, "NoSuchDomain", format!("The specified domain does not exist: {}", domain))
    }

    fn invalid_query(expression: &str) -> Self {
        Self::new(400, "InvalidQueryExpression", format!("The specified query expression syntax is not valid: {}", expression))
    }
}

struct InjectedFailure {
    action: String,
    status: u16,
    code: Option<String>,
    remaining: usize,
}

#[derive(Default)]
struct Domain {
    items: BTreeMap<String, AttributeMap>,
    timestamp: i64,
}

struct EmulatorState {
    domains: BTreeMap<String, Domain>,
    calls: Vec<RecordedCall>,
    batches: Vec<RecordedBatch>,
    failures: VecDeque<InjectedFailure>,
    latency: Option<Duration>,
    page_size: usize,
    count_page_size: usize,
    request_seq: u64,
}

pub(crate) struct StoreEmulator {
    signer: RequestSigner,
    state: Mutex<EmulatorState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StoreEmulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signer: RequestSigner::new(TEST_SECRET),
            state: Mutex::new(EmulatorState {
                domains: BTreeMap::new(),
                calls: Vec::new(),
                batches: Vec::new(),
                failures: VecDeque::new(),
                latency: None,
                page_size: MAX_PAGE_SIZE,
                count_page_size: usize::MAX,
                request_seq: 0,
            }),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Fail the next call of `action` with `status`. Without a code the
    /// error body is plain text.
    pub fn fail_next(&self, action: &str, status: u16, code: Option<&str>) {
        self.fail_times(action, status, code, 1);
    }

    pub fn fail_always(&self, action: &str, status: u16, code: Option<&str>) {
        self.fail_times(action, status, code, usize::MAX);
    }

    fn fail_times(&self, action: &str, status: u16, code: Option<&str>, times: usize) {
        self.state.lock().failures.push_back(InjectedFailure {
            action: action.to_string(),
            status,
            code: code.map(str::to_string),
            remaining: times,
        });
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Cap on items per select page, like the service's response size limit.
    pub fn set_page_size(&self, size: usize) {
        self.state.lock().page_size = size;
    }

    /// Cap on items counted per `count(*)` page.
    pub fn set_count_page_size(&self, size: usize) {
        self.state.lock().count_page_size = size;
    }

    pub fn set_timestamp(&self, domain: &str, seconds: i64) {
        if let Some(domain) = self.state.lock().domains.get_mut(domain) {
            domain.timestamp = seconds;
        }
    }

    pub fn insert_item(&self, domain: &str, item: &str, attributes: AttributeMap) {
        self.state
            .lock()
            .domains
            .entry(domain.to_string())
            .or_default()
            .items
            .insert(item.to_string(), attributes);
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.state.lock().domains.keys().cloned().collect()
    }

    pub fn items(&self, domain: &str) -> BTreeMap<String, AttributeMap> {
        self.state
            .lock()
            .domains
            .get(domain)
            .map(|domain| domain.items.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.action == action)
            .count()
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.state.lock().batches.clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn handle(&self, method: HttpMethod, params: BTreeMap<String, String>) -> Result<String> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let outcome = self.dispatch(method, params);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        outcome.map_err(|fault| {
            let request_id = self.next_request_id();
            let body = match fault.code {
                Some(code) => error_body(&code, &fault.message, &request_id),
                None => fault.message,
            };
            TapError::Http {
                status: fault.status,
                body,
            }
        })
    }

    fn next_request_id(&self) -> String {
        let mut state = self.state.lock();
        state.request_seq += 1;
        format!("req-{:06}", state.request_seq)
    }

    fn dispatch(
        &self,
        method: HttpMethod,
        mut params: BTreeMap<String, String>,
    ) -> std::result::Result<String, Fault> {
        let signature = params.remove("Signature").unwrap_or_default();
        let expected = self
            .signer
            .sign(method, TEST_HOST, &params)
            .map_err(|error| Fault::new(500, "InternalError", error.to_string()))?;
        if signature != expected {
            return Err(Fault::new(
                403,
                "SignatureDoesNotMatch",
                "The request signature we calculated does not match the signature you provided",
            ));
        }

        let action = params.get("Action").cloned().unwrap_or_default();
        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            action: action.clone(),
            params: params.clone(),
        });

        if let Some(fault) = take_injected_failure(&mut state.failures, &action) {
            return Err(fault);
        }

        let result = match action.as_str() {
            "CreateDomain" => {
                let name = required(&params, "DomainName")?;
                state
                    .domains
                    .entry(name.to_string())
                    .or_insert_with(|| Domain {
                        items: BTreeMap::new(),
                        timestamp: chrono::Utc::now().timestamp(),
                    });
                String::new()
            }
            "DeleteDomain" => {
                state.domains.remove(required(&params, "DomainName")?);
                String::new()
            }
            "ListDomains" => list_domains(&state, &params)?,
            "DomainMetadata" => domain_metadata(&state, &params)?,
            "PutAttributes" => {
                let domain = domain_mut(&mut state, &params)?;
                put_attributes(domain, &params)?;
                String::new()
            }
            "BatchPutAttributes" => {
                let name = required(&params, "DomainName")?.to_string();
                let items = batch_put_attributes(domain_mut(&mut state, &params)?, &params)?;
                state.batches.push(RecordedBatch { domain: name, items });
                String::new()
            }
            "DeleteAttributes" => {
                delete_attributes(domain_mut(&mut state, &params)?, &params)?;
                String::new()
            }
            "GetAttributes" => get_attributes(&state, &params)?,
            "Select" => select(&state, &params)?,
            other => {
                return Err(Fault::new(400, "InvalidAction", format!("The action {} is not valid", other)));
            }
        };

        state.request_seq += 1;
        let request_id = format!("req-{:06}", state.request_seq);
        Ok(response_body(&action, &result, &request_id))
    }
}

#[async_trait]
impl HttpTransport for StoreEmulator {
    async fn get(&self, url: &str) -> Result<String> {
        let query = url.split_once('?').map(|(_, query)| query).unwrap_or_default();
        let params = decode_query(query)
            .ok_or_else(|| TapError::InvalidRequest(format!("undecodable query: {}", query)))?;
        self.handle(HttpMethod::Get, params).await
    }

    async fn post(&self, _url: &str, params: &BTreeMap<String, String>) -> Result<String> {
        self.handle(HttpMethod::Post, params.clone()).await
    }
}

fn take_injected_failure(failures: &mut VecDeque<InjectedFailure>, action: &str) -> Option<Fault> {
    let position = failures.iter().position(|failure| failure.action == action)?;
    let failure = &mut failures[position];
    failure.remaining = failure.remaining.saturating_sub(1);

    let fault = Fault {
        status: failure.status,
        code: failure.code.clone(),
        message: match &failure.code {
            Some(code) => format!("injected {} failure", code),
            None => "Service Unavailable".to_string(),
        },
    };
    if failure.remaining == 0 {
        failures.remove(position);
    }
    Some(fault)
}

fn required<'a>(params: &'a BTreeMap<String, String>, key: &str) -> std::result::Result<&'a str, Fault> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Fault::new(400, "MissingParameter", format!("The request must contain the parameter {}", key)))
}

fn domain_mut<'a>(
    state: &'a mut EmulatorState,
    params: &BTreeMap<String, String>,
) -> std::result::Result<&'a mut Domain, Fault> {
    let name = required(params, "DomainName")?;
    state
        .domains
        .get_mut(name)
        .ok_or_else(|| Fault::no_such_domain(name))
}

fn domain<'a>(
    state: &'a EmulatorState,
    name: &str,
) -> std::result::Result<&'a Domain, Fault> {
    state.domains.get(name).ok_or_else(|| Fault::no_such_domain(name))
}

fn offset_from_token(params: &BTreeMap<String, String>) -> std::result::Result<usize, Fault> {
    match params.get("NextToken") {
        None => Ok(0),
        Some(token) => token
            .strip_prefix("offset:")
            .and_then(|offset| offset.parse().ok())
            .ok_or_else(|| Fault::new(400, "InvalidNextToken", "The specified next token is not valid")),
    }
}

fn list_domains(state: &EmulatorState, params: &BTreeMap<String, String>) -> std::result::Result<String, Fault> {
    let max = match params.get("MaxNumberOfDomains") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| Fault::new(400, "InvalidParameterValue", "MaxNumberOfDomains must be a number"))?,
        None => DEFAULT_PAGE_SIZE,
    };
    let offset = offset_from_token(params)?;

    let names: Vec<&String> = state.domains.keys().collect();
    let end = (offset + max).min(names.len());
    let mut body = String::new();
    for name in names.iter().take(end).skip(offset) {
        body.push_str(&format!("<DomainName>{}</DomainName>", escape(name)));
    }
    if end < names.len() {
        body.push_str(&format!("<NextToken>offset:{}</NextToken>", end));
    }
    Ok(body)
}

fn domain_metadata(state: &EmulatorState, params: &BTreeMap<String, String>) -> std::result::Result<String, Fault> {
    let domain = domain(state, required(params, "DomainName")?)?;

    let mut names = BTreeSet::new();
    let mut value_count = 0usize;
    let mut value_bytes = 0usize;
    let mut item_name_bytes = 0usize;
    for (item, attributes) in &domain.items {
        item_name_bytes += item.len();
        for (name, values) in attributes {
            names.insert(name.as_str());
            value_count += values.len();
            value_bytes += values.iter().map(String::len).sum::<usize>();
        }
    }
    let name_bytes: usize = names.iter().map(|name| name.len()).sum();

    Ok(format!(
        "<ItemCount>{}</ItemCount><ItemNamesSizeBytes>{}</ItemNamesSizeBytes>\
         <AttributeNameCount>{}</AttributeNameCount><AttributeNamesSizeBytes>{}</AttributeNamesSizeBytes>\
         <AttributeValueCount>{}</AttributeValueCount><AttributeValuesSizeBytes>{}</AttributeValuesSizeBytes>\
         <Timestamp>{}</Timestamp>",
        domain.items.len(),
        item_name_bytes,
        names.len(),
        name_bytes,
        value_count,
        value_bytes,
        domain.timestamp
    ))
}

/// `(name, value, replace)` triples under `prefix`, in numeric position order.
fn attribute_entries(
    params: &BTreeMap<String, String>,
    prefix: &str,
) -> Vec<(String, Option<String>, bool)> {
    let mut positions: Vec<usize> = params
        .keys()
        .filter_map(|key| {
            key.strip_prefix(prefix)?
                .strip_prefix("Attribute.")?
                .strip_suffix(".Name")?
                .parse()
                .ok()
        })
        .collect();
    positions.sort_unstable();

    positions
        .into_iter()
        .filter_map(|position| {
            let base = format!("{}Attribute.{}.", prefix, position);
            let name = params.get(&format!("{}Name", base))?.clone();
            let value = params.get(&format!("{}Value", base)).cloned();
            let replace = params.get(&format!("{}Replace", base)).map(String::as_str) == Some("true");
            Some((name, value, replace))
        })
        .collect()
}

fn apply_put(item: &mut AttributeMap, entries: Vec<(String, Option<String>, bool)>) {
    for (name, _, replace) in &entries {
        if *replace {
            item.remove(name);
        }
    }
    for (name, value, _) in entries {
        let values = item.entry(name).or_default();
        let value = value.unwrap_or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }
}

fn put_attributes(domain: &mut Domain, params: &BTreeMap<String, String>) -> std::result::Result<(), Fault> {
    let item_name = required(params, "ItemName")?.to_string();
    let current = domain.items.get(&item_name);

    if let Some(name) = params.get("Expected.1.Name") {
        let exists = params.get("Expected.1.Exists").map(String::as_str) != Some("false");
        let stored = current.and_then(|attributes| attributes.get(name));
        match (exists, stored) {
            (false, Some(_)) => {
                return Err(Fault::new(409, "ConditionalCheckFailed", format!("Conditional check failed. Attribute ({}) value exists", name)));
            }
            (true, None) => {
                return Err(Fault::new(404, "AttributeDoesNotExist", format!("Attribute ({}) does not exist", name)));
            }
            (true, Some(values)) => {
                let expected = params.get("Expected.1.Value");
                if values.first() != expected {
                    return Err(Fault::new(409, "ConditionalCheckFailed", format!("Conditional check failed. Attribute ({}) value is ({})", name, values.join(","))));
                }
            }
            (false, None) => {}
        }
    }

    let entries = attribute_entries(params, "");
    apply_put(domain.items.entry(item_name).or_default(), entries);
    domain.timestamp = chrono::Utc::now().timestamp();
    Ok(())
}

fn batch_put_attributes(
    domain: &mut Domain,
    params: &BTreeMap<String, String>,
) -> std::result::Result<Vec<String>, Fault> {
    let mut positions: Vec<usize> = params
        .keys()
        .filter_map(|key| key.strip_prefix("Item.")?.strip_suffix(".ItemName")?.parse().ok())
        .collect();
    positions.sort_unstable();

    if positions.len() > crate::MAX_BATCH_SIZE {
        return Err(Fault::new(400, "NumberSubmittedItemsExceeded", "Too many items in a single call"));
    }

    let mut names = Vec::with_capacity(positions.len());
    for position in positions {
        let prefix = format!("Item.{}.", position);
        let name = required(params, &format!("{}ItemName", prefix))?.to_string();
        let entries = attribute_entries(params, &prefix);
        apply_put(domain.items.entry(name.clone()).or_default(), entries);
        names.push(name);
    }
    domain.timestamp = chrono::Utc::now().timestamp();
    Ok(names)
}

fn delete_attributes(domain: &mut Domain, params: &BTreeMap<String, String>) -> std::result::Result<(), Fault> {
    let item_name = required(params, "ItemName")?;
    let entries = attribute_entries(params, "");

    if entries.is_empty() {
        domain.items.remove(item_name);
        return Ok(());
    }

    if let Some(item) = domain.items.get_mut(item_name) {
        for (name, value, _) in entries {
            match value {
                Some(value) => {
                    if let Some(values) = item.get_mut(&name) {
                        values.retain(|existing| *existing != value);
                        if values.is_empty() {
                            item.remove(&name);
                        }
                    }
                }
                None => {
                    item.remove(&name);
                }
            }
        }
        if item.is_empty() {
            domain.items.remove(item_name);
        }
    }
    Ok(())
}

fn get_attributes(state: &EmulatorState, params: &BTreeMap<String, String>) -> std::result::Result<String, Fault> {
    let domain = domain(state, required(params, "DomainName")?)?;
    let item_name = required(params, "ItemName")?;
    let filter = params.get("AttributeName");

    let mut body = String::new();
    if let Some(item) = domain.items.get(item_name) {
        for (name, values) in item {
            if filter.is_some_and(|wanted| wanted != name) {
                continue;
            }
            body.push_str(&attribute_xml(name, values));
        }
    }
    Ok(body)
}

struct SelectQuery {
    count: bool,
    domain: String,
    filter: Option<(String, String)>,
    limit: Option<usize>,
}

fn parse_select(expression: &str) -> std::result::Result<SelectQuery, Fault> {
    let invalid = || Fault::invalid_query(expression);

    let rest = expression.trim().strip_prefix("select ").ok_or_else(invalid)?;
    let (output, rest) = rest.split_once(" from `").ok_or_else(invalid)?;
    let count = match output.trim() {
        "*" => false,
        "count(*)" => true,
        _ => return Err(invalid()),
    };
    let (domain, rest) = rest.split_once('`').ok_or_else(invalid)?;
    let mut rest = rest.trim();

    let mut filter = None;
    if let Some(clause) = rest.strip_prefix("where ") {
        let clause = clause.trim_start().strip_prefix('`').ok_or_else(invalid)?;
        let (name, clause) = clause.split_once('`').ok_or_else(invalid)?;
        let clause = clause.trim_start().strip_prefix("= '").ok_or_else(invalid)?;
        let (value, clause) = clause.split_once('\'').ok_or_else(invalid)?;
        filter = Some((name.to_string(), value.to_string()));
        rest = clause.trim();
    }

    let mut limit = None;
    if let Some(clause) = rest.strip_prefix("limit ") {
        limit = Some(clause.trim().parse::<usize>().map_err(|_| invalid())?);
        rest = "";
    }

    if !rest.is_empty() {
        return Err(invalid());
    }
    if limit.is_some_and(|limit| limit == 0 || limit > MAX_PAGE_SIZE) {
        return Err(Fault::new(400, "InvalidParameterValue", "limit must be between 1 and 2500"));
    }

    Ok(SelectQuery {
        count,
        domain: domain.to_string(),
        filter,
        limit,
    })
}

fn select(state: &EmulatorState, params: &BTreeMap<String, String>) -> std::result::Result<String, Fault> {
    let query = parse_select(required(params, "SelectExpression")?)?;
    let domain = domain(state, &query.domain)?;
    let offset = offset_from_token(params)?;

    let matching: Vec<(&String, &AttributeMap)> = domain
        .items
        .iter()
        .filter(|(_, attributes)| match &query.filter {
            Some((name, value)) => attributes
                .get(name)
                .is_some_and(|values| values.contains(value)),
            None => true,
        })
        .collect();
    let remaining = matching.len().saturating_sub(offset);

    let mut body = String::new();
    let page = if query.count {
        let page = remaining
            .min(query.limit.unwrap_or(usize::MAX))
            .min(state.count_page_size);
        body.push_str(&format!(
            "<Item><Name>Domain</Name>{}</Item>",
            attribute_xml("Count", &[page.to_string()])
        ));
        page
    } else {
        let page = remaining
            .min(query.limit.unwrap_or(DEFAULT_PAGE_SIZE))
            .min(state.page_size);
        for (name, attributes) in matching.iter().skip(offset).take(page) {
            body.push_str(&format!("<Item><Name>{}</Name>", escape(name)));
            for (attribute, values) in attributes.iter() {
                body.push_str(&attribute_xml(attribute, values));
            }
            body.push_str("</Item>");
        }
        page
    };

    if offset + page < matching.len() {
        body.push_str(&format!("<NextToken>offset:{}</NextToken>", offset + page));
    }
    Ok(body)
}

fn attribute_xml(name: &str, values: &[String]) -> String {
    values
        .iter()
        .map(|value| {
            format!(
                "<Attribute><Name>{}</Name><Value>{}</Value></Attribute>",
                escape(name),
                escape(value)
            )
        })
        .collect()
}

fn response_body(action: &str, result: &str, request_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<{action}Response xmlns=\"http://sdb.amazonaws.com/doc/2009-04-15/\">\
         <{action}Result>{result}</{action}Result>\
         <ResponseMetadata><RequestId>{request_id}</RequestId><BoxUsage>{BOX_USAGE}</BoxUsage></ResponseMetadata>\
         </{action}Response>"
    )
}

fn error_body(code: &str, message: &str, request_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<Response><Errors><Error><Code>{}</Code><Message>{}</Message>\
         <BoxUsage>{}</BoxUsage></Error></Errors><RequestID>{}</RequestID></Response>",
        escape(code),
        escape(message),
        BOX_USAGE,
        request_id
    )
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn decode_query(query: &str) -> Option<BTreeMap<String, String>> {
    if query.is_empty() {
        return Some(BTreeMap::new());
    }
    query
        .split('&')
        .map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((decode_component(key)?, decode_component(value)?))
        })
        .collect()
}

fn decode_component(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut position = 0;
    while position < bytes.len() {
        if bytes[position] == b'%' {
            let hex = value.get(position + 1..position + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            position += 3;
        } else {
            decoded.push(bytes[position]);
            position += 1;
        }
    }
    String::from_utf8(decoded).ok()
}
