// src/lib.rs
//! OpenFeature-style flag evaluation over OFREP, plus a smoke-test runner
//! that checks a live flag server returns the values it is expected to.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ofrep_smoke::{api, EvaluationContext, OfrepProvider};
//! # async fn demo() -> Result<(), ofrep_smoke::FlagError> {
//! let provider = OfrepProvider::builder()
//!     .with_base_url("http://localhost:8080")
//!     .build()?;
//! api::set_provider(Arc::new(provider));
//!
//! let client = api::get_client();
//! let context = EvaluationContext::new().with_attribute("countryCode", "nl");
//! let enabled = client.get_boolean_value("FF-feature-y", false, &context).await;
//! # Ok(())
//! # }
//! ```
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
    RETRY_AFTER, USER_AGENT,
};
use reqwest::{StatusCode, Url};
use thiserror::Error;

pub mod api;
pub mod cache;
mod client;
pub mod context;
pub mod flag;
pub mod provider;
pub mod smoke;

pub use client::Client;
pub use context::EvaluationContext;
pub use flag::{ErrorCode, EvaluationDetails, FlagValue, Reason, ResolutionDetails};
pub use provider::{FeatureProvider, NoopProvider, ProviderMetadata};

use crate::cache::{Cache, MemoryCache};
use crate::flag::{BulkEntry, BulkEvaluationResponse, EvaluationFailure, EvaluationRequest, EvaluationSuccess};

const BASE_URL: &str = "http://localhost:8080";
const MAX_RETRIES: u32 = 0;
const CACHE_TTL_SECS: i64 = 60;
const DEFAULT_RETRY_AFTER_SECS: i64 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    /// The server answered with an OFREP error body.
    #[error("{code}: {details}")]
    Evaluation { code: ErrorCode, details: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Rate limited until {0}")]
    RateLimited(DateTime<Utc>),

    #[error("Provider not ready")]
    NotReady,

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl FlagError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FlagError::Evaluation { code, .. } => *code,
            FlagError::ParseError(_) => ErrorCode::ParseError,
            FlagError::TypeMismatch(_) => ErrorCode::TypeMismatch,
            FlagError::NotReady => ErrorCode::ProviderNotReady,
            _ => ErrorCode::General,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// One request per evaluated flag.
    Single,
    /// One bulk request per context, cached for the configured TTL.
    Bulk,
}

#[derive(Debug, Default)]
struct RateLimitState {
    retry_after: Option<DateTime<Utc>>,
}

pub struct OfrepProvider {
    base_url: Url,
    http_client: reqwest::Client,
    headers: HeaderMap,
    mode: EvaluationMode,
    cache: tokio::sync::RwLock<Box<dyn Cache + Send + Sync>>,
    cache_ttl: i64,
    max_retries: u32,
    retry_backoff: Duration,
    rate_limit: RwLock<RateLimitState>,
}

impl OfrepProvider {
    pub fn builder() -> OfrepProviderBuilder {
        OfrepProviderBuilder::new()
    }

    pub fn debug_info(&self) -> String {
        format!(
            "OfrepProvider {{ base_url: {}, mode: {:?}, max_retries: {}, cache_ttl: {} }}",
            self.base_url, self.mode, self.max_retries, self.cache_ttl
        )
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    /// Every flag the server evaluates for `context`, sorted by key.
    /// Flags the server failed to evaluate are left out.
    pub async fn list(
        &self,
        context: &EvaluationContext,
    ) -> Result<Vec<(String, ResolutionDetails)>, FlagError> {
        let mut cache = self.cache.write().await;
        if cache.should_refresh_cache(context).await {
            self.refetch(&mut **cache, context).await?;
        }

        let entries = cache
            .get_all()
            .await
            .map_err(|e| FlagError::CacheError(e.to_string()))?;

        let mut flags: Vec<(String, ResolutionDetails)> = entries
            .into_iter()
            .filter_map(|entry| match entry {
                BulkEntry::Success(success) => {
                    Some((success.key.clone(), ResolutionDetails::from(success)))
                }
                BulkEntry::Failure(_) => None,
            })
            .collect();
        flags.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(flags)
    }

    fn endpoint(&self, key: Option<&str>) -> Result<Url, FlagError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                FlagError::ConfigError(format!("{} cannot be used as a base URL", self.base_url))
            })?;
            segments
                .pop_if_empty()
                .extend(["ofrep", "v1", "evaluate", "flags"]);
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    fn check_rate_limit(&self) -> Result<(), FlagError> {
        let state = self.rate_limit.read().unwrap_or_else(PoisonError::into_inner);
        match state.retry_after {
            Some(until) if Utc::now() < until => Err(FlagError::RateLimited(until)),
            _ => Ok(()),
        }
    }

    fn enter_backoff(&self, headers: &HeaderMap) -> DateTime<Utc> {
        let now = Utc::now();
        let until = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, now))
            .unwrap_or_else(|| now + chrono::Duration::seconds(DEFAULT_RETRY_AFTER_SECS));

        warn!("Rate limited by {}, pausing evaluations until {}", self.base_url, until);

        let mut state = self.rate_limit.write().unwrap_or_else(PoisonError::into_inner);
        state.retry_after = Some(until);
        until
    }

    async fn post(
        &self,
        url: Url,
        context: &EvaluationContext,
        etag: Option<&str>,
    ) -> Result<reqwest::Response, FlagError> {
        self.check_rate_limit()?;

        let body = EvaluationRequest { context };
        let mut retry = 0;

        loop {
            let mut request = self
                .http_client
                .post(url.clone())
                .headers(self.headers.clone())
                .json(&body);
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }

            debug!("POST {}", url);
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if retry < self.max_retries => {
                    retry += 1;
                    warn!("Request to {} failed (attempt {}): {}", url, retry, e);
                    tokio::time::sleep(self.retry_backoff * retry).await;
                }
                Err(e) => return Err(FlagError::HttpError(e)),
            }
        }
    }

    async fn error_from_response(&self, key: Option<&str>, response: reqwest::Response) -> FlagError {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                FlagError::AuthError(format!("server answered {}", status))
            }
            StatusCode::TOO_MANY_REQUESTS => FlagError::RateLimited(self.enter_backoff(response.headers())),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                match (serde_json::from_str::<EvaluationFailure>(&body), key) {
                    (Ok(failure), _) => FlagError::Evaluation {
                        code: failure.error_code,
                        details: failure
                            .error_details
                            .unwrap_or_else(|| format!("server answered {}", status)),
                    },
                    (Err(_), Some(key)) if status == StatusCode::NOT_FOUND => FlagError::Evaluation {
                        code: ErrorCode::FlagNotFound,
                        details: format!("Flag '{}' was not found", key),
                    },
                    (Err(_), _) => FlagError::ApiError(format!("Unexpected status code: {}", status)),
                }
            }
            _ => FlagError::ApiError(format!("Unexpected status code: {}", status)),
        }
    }

    async fn evaluate_single(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails, FlagError> {
        let url = self.endpoint(Some(key))?;
        let response = self.post(url, context, None).await?;

        if !response.status().is_success() {
            return Err(self.error_from_response(Some(key), response).await);
        }

        let body = response.text().await?;
        let success: EvaluationSuccess = serde_json::from_str(&body)
            .map_err(|e| FlagError::ParseError(format!("flag '{}': {}", key, e)))?;

        Ok(success.into())
    }

    async fn evaluate_cached(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails, FlagError> {
        {
            let cache = self.cache.read().await;
            if !cache.should_refresh_cache(context).await {
                let entry = cache
                    .get(key)
                    .await
                    .map_err(|e| FlagError::CacheError(e.to_string()))?;
                return resolve_entry(key, entry);
            }
        }

        // Re-checked under the write lock: another caller may have refreshed already.
        let mut cache = self.cache.write().await;
        if cache.should_refresh_cache(context).await {
            self.refetch(&mut **cache, context).await?;
        }

        let entry = cache
            .get(key)
            .await
            .map_err(|e| FlagError::CacheError(e.to_string()))?;
        resolve_entry(key, entry)
    }

    async fn refetch(
        &self,
        cache: &mut (dyn Cache + Send + Sync),
        context: &EvaluationContext,
    ) -> Result<(), FlagError> {
        let url = self.endpoint(None)?;
        let etag = cache.etag_for(context).await;
        if etag.is_none() {
            // Nothing the server could revalidate: drop the previous set before fetching.
            cache
                .init()
                .await
                .map_err(|e| FlagError::CacheError(e.to_string()))?;
        }
        let response = self.post(url, context, etag.as_deref()).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("Bulk evaluation unchanged, keeping cached flags");
            return cache
                .extend(self.cache_ttl)
                .await
                .map_err(|e| FlagError::CacheError(e.to_string()));
        }

        if !response.status().is_success() {
            return Err(self.error_from_response(None, response).await);
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;
        let bulk: BulkEvaluationResponse =
            serde_json::from_str(&body).map_err(|e| FlagError::ParseError(e.to_string()))?;

        debug!("Caching {} evaluated flags", bulk.flags.len());
        cache
            .refresh(context, bulk.flags, etag, self.cache_ttl)
            .await
            .map_err(|e| FlagError::CacheError(e.to_string()))
    }
}

#[async_trait]
impl FeatureProvider for OfrepProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "OFREP Provider".to_string(),
        }
    }

    async fn resolve(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails, FlagError> {
        match self.mode {
            EvaluationMode::Single => self.evaluate_single(flag_key, context).await,
            EvaluationMode::Bulk => self.evaluate_cached(flag_key, context).await,
        }
    }
}

pub struct OfrepProviderBuilder {
    base_url: String,
    max_retries: u32,
    retry_backoff: Duration,
    timeout: Duration,
    token: Option<String>,
    headers: Vec<(String, String)>,
    mode: EvaluationMode,
    cache_ttl: i64,
}

impl OfrepProviderBuilder {
    fn new() -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            max_retries: MAX_RETRIES,
            retry_backoff: RETRY_BACKOFF,
            timeout: REQUEST_TIMEOUT,
            token: None,
            headers: Vec::new(),
            mode: EvaluationMode::Single,
            cache_ttl: CACHE_TTL_SECS,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Extra attempts after a transport failure. HTTP error statuses are never retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_bulk_evaluation(mut self) -> Self {
        self.mode = EvaluationMode::Bulk;
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl_secs: i64) -> Self {
        self.cache_ttl = cache_ttl_secs;
        self
    }

    pub fn build(self) -> Result<OfrepProvider, FlagError> {
        let base_url = Url::parse(&self.base_url)
            .map_err(|e| FlagError::ConfigError(format!("invalid base URL '{}': {}", self.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FlagError::ConfigError(format!(
                "{} cannot be used as a base URL",
                self.base_url
            )));
        }
        if crate::cache::refresh_deadline(self.cache_ttl).is_err() {
            return Err(FlagError::ConfigError(format!(
                "cache TTL of {} seconds is out of range",
                self.cache_ttl
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("ofrep-smoke/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| FlagError::ConfigError("token is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| FlagError::ConfigError(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| FlagError::ConfigError(format!("invalid value for header '{}'", name)))?;
            headers.insert(name, value);
        }

        let http_client = reqwest::Client::builder().timeout(self.timeout).build()?;

        Ok(OfrepProvider {
            base_url,
            http_client,
            headers,
            mode: self.mode,
            cache: tokio::sync::RwLock::new(Box::new(MemoryCache::new())),
            cache_ttl: self.cache_ttl,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
            rate_limit: RwLock::new(RateLimitState::default()),
        })
    }
}

fn resolve_entry(key: &str, entry: Option<BulkEntry>) -> Result<ResolutionDetails, FlagError> {
    match entry {
        Some(BulkEntry::Success(success)) => {
            let mut details = ResolutionDetails::from(success);
            details.reason = Reason::Cached;
            Ok(details)
        }
        Some(BulkEntry::Failure(failure)) => Err(FlagError::Evaluation {
            code: failure.error_code,
            details: failure
                .error_details
                .unwrap_or_else(|| format!("Flag '{}' could not be evaluated", key)),
        }),
        None => Err(FlagError::Evaluation {
            code: ErrorCode::FlagNotFound,
            details: format!("Flag '{}' was not found", key),
        }),
    }
}

/// `Retry-After` is either delay-seconds or an HTTP date.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        let delay = chrono::Duration::try_seconds(secs.max(0))?;
        return now.checked_add_signed(delay);
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
