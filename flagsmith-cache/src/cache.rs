use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, fmt, time::Duration};
use url::Url;

/// Request header values a response varies on, keyed by lower-cased header
/// name. Ordered so encoding and comparison are deterministic.
pub type VaryKeys = BTreeMap<String, String>;

/// Stable identity of a cacheable request: hex md5 of the canonical
/// `METHOD url` string, with query parameters sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_request(method: &str, url: &Url) -> Self {
        let canonical = format!(
            "{} {}",
            method.to_ascii_uppercase(),
            canonical_url(url)
        );
        Self(format!("{:x}", md5::compute(canonical.as_bytes())))
    }

    /// Parse a key back from its hex form (e.g. a cache file name).
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 32
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// One cached HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub key: CacheKey,
    pub url: String,
    pub status_code: u16,
    /// Response headers in arrival order; names may repeat.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub vary_keys: VaryKeys,
}

impl CacheRecord {
    /// Build a record that expires `ttl` after `response_time`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: CacheKey,
        url: impl Into<String>,
        status_code: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        request_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
        ttl: Duration,
        vary_keys: VaryKeys,
    ) -> Self {
        Self {
            key,
            url: url.into(),
            status_code,
            headers,
            body,
            request_time,
            response_time,
            expires_at: expiry(response_time, ttl),
            vary_keys,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// First value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Restart the freshness window after a successful revalidation.
    pub fn refresh(
        &mut self,
        request_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
        ttl: Duration,
    ) {
        self.request_time = request_time;
        self.response_time = response_time;
        self.expires_at = expiry(response_time, ttl);
    }

    /// Make the record expired regardless of its ttl.
    pub fn force_stale(&mut self) {
        self.expires_at = self.response_time;
    }

    /// Approximate in-memory footprint, used for byte budgets.
    pub fn byte_size(&self) -> u64 {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        let vary: usize = self.vary_keys.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.key.as_str().len() + self.url.len() + headers + vary + self.body.len() + 32)
            as u64
    }
}

fn expiry(response_time: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    response_time
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// All records sharing one [`CacheKey`], at most one per distinct vary keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    pub records: Vec<CacheRecord>,
}

impl CacheEntry {
    pub fn new(records: Vec<CacheRecord>) -> Self {
        Self { records }
    }

    /// Insert, replacing a record with identical vary keys.
    pub fn upsert(&mut self, record: CacheRecord) {
        self.records.retain(|r| r.vary_keys != record.vary_keys);
        self.records.push(record);
    }

    pub fn find(&self, vary_keys: &VaryKeys) -> Option<&CacheRecord> {
        self.records.iter().find(|r| &r.vary_keys == vary_keys)
    }

    pub fn byte_size(&self) -> u64 {
        self.records.iter().map(CacheRecord::byte_size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
