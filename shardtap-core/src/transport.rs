use crate::signer::{HttpMethod, encode_params};
use crate::{Result, StoreConfig, TapError, is_retryable_status};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Issues GET/POST calls against the store and returns the response body.
///
/// Implementations are shared by every shard worker of a table, so they must
/// tolerate many concurrent callers.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<String>;

    async fn post(&self, url: &str, params: &BTreeMap<String, String>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub form_body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Why a single exchange produced no HTTP response at all.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The connection could not be established; no request bytes were sent.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The connection dropped or timed out after the request may have been sent.
    #[error("no response: {0}")]
    NoResponse(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("{0}")]
    Other(String),
}

impl From<ExchangeError> for TapError {
    fn from(error: ExchangeError) -> Self {
        match error {
            ExchangeError::Connect(message) | ExchangeError::NoResponse(message) => {
                TapError::Transport(message)
            }
            ExchangeError::Tls(message) => TapError::Tls(message),
            ExchangeError::Other(message) => TapError::InvalidRequest(message),
        }
    }
}

/// One raw request/response round trip, without any retry policy.
#[async_trait]
pub trait HttpExchange: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, ExchangeError>;
}

pub struct ReqwestExchange {
    client: reqwest::Client,
}

impl ReqwestExchange {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        // Idle pool capacity must cover every concurrent caller, otherwise
        // callers end up opening and tearing down connections under load.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()
            .map_err(|error| TapError::Config(format!("failed to build http client: {}", error)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
    async fn execute(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, ExchangeError> {
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self
                .client
                .post(&request.url)
                .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                .body(request.form_body.clone().unwrap_or_default()),
        };

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| ExchangeError::NoResponse(error.to_string()))?;

        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> ExchangeError {
    // The URL carries the signature and user data, keep it out of both the
    // message and the TLS check.
    let error = error.without_url();
    let message = error.to_string();
    if is_tls_failure(std::error::Error::source(&error)) {
        ExchangeError::Tls(message)
    } else if error.is_connect() {
        ExchangeError::Connect(message)
    } else if error.is_timeout() || error.is_request() || error.is_body() {
        ExchangeError::NoResponse(message)
    } else {
        ExchangeError::Other(message)
    }
}

/// Handshake failures surface as connect errors, so only the underlying
/// cause chain tells them apart.
fn is_tls_failure(cause: Option<&(dyn std::error::Error + 'static)>) -> bool {
    let mut current = cause;
    while let Some(err) = current {
        let message = err.to_string().to_ascii_lowercase();
        if message.contains("certificate")
            || message.contains("handshake")
            || message.contains("tls")
            || message.contains("ssl")
        {
            return true;
        }
        current = err.source();
    }
    false
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed for throttling statuses (500, 503, 408).
    pub max_retries: u32,
    /// Retries allowed for failures that produced no response.
    pub max_connection_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra fraction added to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            max_connection_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(100),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// `min(4^attempt * base, max) * (1 + U(0, jitter))`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let target = self.base_delay.as_secs_f64() * 4f64.powi(exponent);
        let capped = target.min(self.max_delay.as_secs_f64());
        let spread = rand::thread_rng().r#gen::<f64>() * self.jitter.max(0.0);
        Duration::from_secs_f64(capped * (1.0 + spread))
    }
}

pub struct RetryingTransport {
    exchange: Arc<dyn HttpExchange>,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(exchange: Arc<dyn HttpExchange>, policy: RetryPolicy) -> Self {
        Self { exchange, policy }
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let exchange = ReqwestExchange::new(config)?;
        Ok(Self::new(Arc::new(exchange), config.retry.policy()))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn execute(&self, request: HttpRequest) -> Result<String> {
        let mut retries = 0u32;

        loop {
            let response = self.execute_with_connection_retries(&request).await?;
            if response.is_success() {
                return Ok(response.body);
            }

            if !is_retryable_status(response.status) || retries >= self.policy.max_retries {
                if response.status == 403 {
                    tracing::trace!(
                        "authentication failure for {} {}",
                        request.method.as_str(),
                        request.url
                    );
                }
                return Err(TapError::Http {
                    status: response.status,
                    body: response.body,
                });
            }

            retries += 1;
            let delay = self.policy.backoff_delay(retries);
            tracing::debug!(
                "retryable status {} detected, will retry in {}ms, attempt number: {}",
                response.status,
                delay.as_millis(),
                retries
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn execute_with_connection_retries(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut retries = 0u32;

        loop {
            let error = match self.exchange.execute(request).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let replayable = match &error {
                ExchangeError::Connect(_) => true,
                ExchangeError::NoResponse(_) => request.method.is_idempotent(),
                ExchangeError::Tls(_) | ExchangeError::Other(_) => false,
            };

            if !replayable || retries >= self.policy.max_connection_retries {
                return Err(error.into());
            }

            retries += 1;
            tracing::debug!(
                "connection failure on {} ({}), retry #{}",
                request.method.as_str(),
                error,
                retries
            );
        }
    }
}

#[async_trait]
impl HttpTransport for RetryingTransport {
    async fn get(&self, url: &str) -> Result<String> {
        self.execute(HttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            form_body: None,
        })
        .await
    }

    async fn post(&self, url: &str, params: &BTreeMap<String, String>) -> Result<String> {
        self.execute(HttpRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            form_body: Some(encode_params(params)),
        })
        .await
    }
}
