//! HTTP client with a local response cache in front of the Flagsmith api.
//!
//! For a cacheable (GET) request:
//! 1. a fresh cached record is served without touching the network, unless
//!    the caller forces a refresh
//! 2. otherwise the request goes out with a `Cache-Control` directive and,
//!    when an expired record carries validators, as a conditional request
//! 3. a `304` revalidates the cached record, a `2xx` replaces it
//! 4. any failure may fall back to a cached record of any age if the caller
//!    accepts stale data
//!
//! Every successful response feeds its `x-flagsmith-document-updated-at`
//! header into the shared [`FreshnessTracker`].
use crate::{FlagsmithError, freshness::FreshnessTracker};
use bytes::Bytes;
use chrono::Utc;
use flagsmith_cache::{CacheKey, CacheRecord, SharedHttpCache, VaryKeys};
use flagsmith_config::{FlagsmithConfig, http::ENVIRONMENT_KEY_HEADER};
use reqwest::{
    Method, StatusCode,
    header::{self, HeaderMap},
};
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace, warn};
use url::Url;

pub const UPDATED_AT_HEADER: &str = "x-flagsmith-document-updated-at";
const JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Relative to the api base url, e.g. `identities/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    fn is_cacheable(&self) -> bool {
        self.method == Method::GET
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Skip the cache lookup and fetch fresh data. The result is still cached.
    pub force_refresh: bool,
    /// Serve an expired cached record when the request fails.
    pub accept_stale: bool,
}

/// Where a response body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    /// Unexpired cached record, no request made.
    Cache,
    /// Cached record confirmed by a `304 Not Modified`.
    Revalidated,
    /// Expired cached record served after a failed request.
    Stale,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FlagsmithError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn from_record(record: CacheRecord, source: ResponseSource) -> Self {
        Self {
            status: record.status_code,
            headers: record.headers,
            body: record.body,
            source,
        }
    }
}

pub struct CachingHttpClient {
    http: reqwest::Client,
    base_url: Url,
    environment_key: String,
    cache: Option<SharedHttpCache>,
    ttl: Duration,
    request_timeout: Duration,
    write_timeout: Duration,
    freshness: Arc<FreshnessTracker>,
}

impl CachingHttpClient {
    /// `cache` is `None` when caching is disabled.
    pub fn new(
        config: &FlagsmithConfig,
        http: reqwest::Client,
        cache: Option<SharedHttpCache>,
        freshness: Arc<FreshnessTracker>,
    ) -> Result<Self, FlagsmithError> {
        Ok(Self {
            http,
            base_url: config.api_url()?,
            environment_key: config.environment_key.clone(),
            cache,
            ttl: config.cache.ttl(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            freshness,
        })
    }

    pub fn cache(&self) -> Option<&SharedHttpCache> {
        self.cache.as_ref()
    }

    pub fn freshness(&self) -> &Arc<FreshnessTracker> {
        &self.freshness
    }

    /// Drop every cached response. Never fails.
    pub async fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all().await;
        }
    }

    pub fn url_for(&self, request: &RequestDescriptor) -> Result<Url, FlagsmithError> {
        let mut url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| FlagsmithError::InvalidArgument(format!("{}: {e}", request.path)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    /// Headers that identify the representation we ask for; the source of
    /// vary keys.
    fn request_headers(&self) -> VaryKeys {
        VaryKeys::from([
            (header::ACCEPT.as_str().to_string(), JSON.to_string()),
            (
                ENVIRONMENT_KEY_HEADER.to_ascii_lowercase(),
                self.environment_key.clone(),
            ),
        ])
    }

    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        options: RequestOptions,
    ) -> Result<ApiResponse, FlagsmithError> {
        let url = self.url_for(request)?;
        let cache = match &self.cache {
            Some(cache) if request.is_cacheable() => cache,
            _ => {
                let response = self.send(request, &url, None, HeaderMap::new()).await;
                return response.inspect(|r| self.observe_updated_at(&r.headers));
            }
        };

        let key = CacheKey::from_request(request.method.as_str(), &url);
        let request_headers = self.request_headers();
        let cached = if options.force_refresh {
            None
        } else {
            self.lookup(cache, &key, &request_headers).await
        };

        if let Some(record) = &cached {
            if record.is_fresh(Utc::now()) {
                debug!(key = %key, url = %url, "serving cached response");
                self.observe_updated_at(&record.headers);
                return Ok(ApiResponse::from_record(record.clone(), ResponseSource::Cache));
            }
        }

        let directive = if options.force_refresh {
            "no-cache".to_string()
        } else {
            format!("max-age={}", self.ttl.as_secs())
        };
        let conditional = cached.as_ref().map(conditional_headers).unwrap_or_default();

        let request_time = Utc::now();
        let result = self
            .send(request, &url, Some(&directive), conditional)
            .await;
        let response_time = Utc::now();

        match result {
            Ok(response) if response.status == StatusCode::NOT_MODIFIED.as_u16() => {
                if let Some(mut record) = cached {
                    debug!(key = %key, "cached response revalidated");
                    record.refresh(request_time, response_time, self.ttl);
                    merge_headers(&mut record.headers, &response.headers);
                    if let Err(err) = cache.store(&key, record.clone()).await {
                        warn!(key = %key, ?err, "failed to update revalidated cache entry");
                    }
                    self.observe_updated_at(&record.headers);
                    Ok(ApiResponse::from_record(record, ResponseSource::Revalidated))
                } else {
                    let err = FlagsmithError::Server {
                        status: response.status,
                        body: "not modified without a cached response".into(),
                    };
                    self.fallback(cache, &key, &request_headers, options, err).await
                }
            }
            Ok(response) => {
                self.observe_updated_at(&response.headers);
                if let Some(vary_keys) = vary_keys(&response.headers, &request_headers) {
                    let record = CacheRecord::new(
                        key.clone(),
                        url.as_str(),
                        response.status,
                        response.headers.clone(),
                        response.body.clone(),
                        request_time,
                        response_time,
                        self.ttl,
                        vary_keys,
                    );
                    // the fetch already succeeded; caching is best effort
                    if let Err(err) = cache.store(&key, record).await {
                        warn!(key = %key, ?err, "failed to cache response");
                    }
                }
                Ok(response)
            }
            Err(err) => self.fallback(cache, &key, &request_headers, options, err).await,
        }
    }

    async fn lookup(
        &self,
        cache: &SharedHttpCache,
        key: &CacheKey,
        request_headers: &VaryKeys,
    ) -> Option<CacheRecord> {
        match cache.find_all(key).await {
            Ok(records) => records
                .into_iter()
                .find(|r| matches_request(r, request_headers)),
            Err(err) => {
                warn!(key = %key, ?err, "cache lookup failed");
                None
            }
        }
    }

    async fn fallback(
        &self,
        cache: &SharedHttpCache,
        key: &CacheKey,
        request_headers: &VaryKeys,
        options: RequestOptions,
        err: FlagsmithError,
    ) -> Result<ApiResponse, FlagsmithError> {
        if !options.accept_stale || !err.is_transport_or_server() {
            return Err(err);
        }
        match self.lookup(cache, key, request_headers).await {
            Some(record) => {
                warn!(key = %key, error = %err, "request failed, serving stale cached response");
                self.observe_updated_at(&record.headers);
                Ok(ApiResponse::from_record(record, ResponseSource::Stale))
            }
            None => Err(err),
        }
    }

    /// One network round trip. Non-2xx statuses other than `304` are errors.
    async fn send(
        &self,
        request: &RequestDescriptor,
        url: &Url,
        cache_control: Option<&str>,
        extra_headers: HeaderMap,
    ) -> Result<ApiResponse, FlagsmithError> {
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .header(ENVIRONMENT_KEY_HEADER, &self.environment_key)
            .header(header::ACCEPT, JSON)
            .headers(extra_headers);
        if let Some(directive) = cache_control {
            builder = builder.header(header::CACHE_CONTROL, directive);
        }

        trace!(method = %request.method, url = %url, "sending request");
        let response = match &request.body {
            Some(body) => {
                let sending = builder.json(body).send();
                match tokio::time::timeout(self.write_timeout, sending).await {
                    Ok(response) => response,
                    Err(_) => return Err(FlagsmithError::Timeout(self.write_timeout)),
                }
            }
            None => builder.send().await,
        }
        .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(ApiResponse {
                status: status.as_u16(),
                headers,
                body,
                source: ResponseSource::Network,
            })
        } else {
            Err(FlagsmithError::Server {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> FlagsmithError {
        if err.is_timeout() {
            FlagsmithError::Timeout(self.request_timeout)
        } else {
            FlagsmithError::Network(err)
        }
    }

    fn observe_updated_at(&self, headers: &[(String, String)]) {
        if let Some(updated_at) = updated_at(headers) {
            if self.freshness.observe(updated_at) {
                trace!(updated_at, "freshness advanced by response");
            }
        }
    }
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn updated_at(headers: &[(String, String)]) -> Option<f64> {
    find_header(headers, UPDATED_AT_HEADER)?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Vary keys for a response, or `None` if it must not be cached.
fn vary_keys(
    response_headers: &[(String, String)],
    request_headers: &VaryKeys,
) -> Option<VaryKeys> {
    let mut keys = VaryKeys::new();
    for (name, value) in response_headers {
        if name.eq_ignore_ascii_case(header::CACHE_CONTROL.as_str())
            && value
                .split(',')
                .any(|d| d.trim().eq_ignore_ascii_case("no-store"))
        {
            return None;
        }
        if !name.eq_ignore_ascii_case(header::VARY.as_str()) {
            continue;
        }
        for field in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            if field == "*" {
                return None;
            }
            let field = field.to_ascii_lowercase();
            let sent = request_headers.get(&field).cloned().unwrap_or_default();
            keys.insert(field, sent);
        }
    }
    Some(keys)
}

/// A record applies to a request when every header it varies on was sent
/// with the same value.
fn matches_request(record: &CacheRecord, request_headers: &VaryKeys) -> bool {
    let projected: VaryKeys = record
        .vary_keys
        .keys()
        .map(|name| {
            let sent = request_headers.get(name).cloned().unwrap_or_default();
            (name.clone(), sent)
        })
        .collect();
    projected == record.vary_keys
}

fn conditional_headers(record: &CacheRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = record
        .header(header::ETAG.as_str())
        .and_then(|v| v.parse().ok())
    {
        headers.insert(header::IF_NONE_MATCH, value);
    }
    if let Some(value) = record
        .header(header::LAST_MODIFIED.as_str())
        .and_then(|v| v.parse().ok())
    {
        headers.insert(header::IF_MODIFIED_SINCE, value);
    }
    headers
}

/// Apply headers of a `304` on top of the stored ones.
fn merge_headers(stored: &mut Vec<(String, String)>, fresh: &[(String, String)]) {
    let fresh: Vec<_> = fresh
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()))
        .collect();
    stored.retain(|(k, _)| !fresh.iter().any(|(name, _)| name.eq_ignore_ascii_case(k)));
    stored.extend(fresh.into_iter().cloned());
}
