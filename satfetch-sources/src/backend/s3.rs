//! S3-compatible object-store source.
//!
//! Talks to the public NOAA GOES buckets (or any S3-compatible mirror) with
//! path-style requests over reqwest. Requests go out unsigned unless
//! credentials are configured, in which case they carry a manual AWS
//! Signature V4 so no SDK dependency is needed.
//!
//! Resolution of a key: HEAD on the canonical object name first; when that
//! misses, list the hour prefix with ListObjectsV2 and pick the
//! lexicographically greatest file name matching the scan pattern.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, Response};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use satfetch_common::backend::{exact_object_key, filename_pattern, object_prefix, product_prefix};
use satfetch_common::error::{classify, not_found_after_search};
use satfetch_common::retry::retry;
use satfetch_common::{
    DomainError, ErrorContext, ErrorKind, FetchError, ImagerySource, LogicalKey, ProductType,
    RetryPolicy, Satellite, StatsTracker, TransportError,
};

use super::{record_download, stream_to_file};

type HmacSha256 = Hmac<Sha256>;

/// Attempts allowed for session setup.
const SESSION_ATTEMPTS: u32 = 3;
/// Per-attempt ceiling for session setup grows by this step: 10s, 20s, 30s.
const SESSION_CEILING_STEP: Duration = Duration::from_secs(10);
/// Upper bound on ListObjectsV2 pages read while resolving one key.
pub const MAX_LIST_PAGES: usize = 20;

pub fn default_endpoint(region: &str) -> String {
    format!("https://s3.{}.amazonaws.com", region)
}

#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Path-style endpoint; defaults to the regional AWS endpoint.
    pub endpoint: Option<String>,
    pub region: String,
    /// `None` means unsigned requests.
    pub credentials: Option<S3Credentials>,
    pub default_product: ProductType,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: crate::config::DEFAULT_S3_REGION.to_string(),
            credentials: None,
            default_product: ProductType::RadC,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl S3Config {
    pub fn endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint(&self.region))
            .trim_end_matches('/')
            .to_string()
    }
}

/// A client bound to one bucket whose reachability has been confirmed.
#[derive(Debug)]
struct Session {
    client: Client,
    bucket: String,
}

/// How a key resolved against the bucket.
#[derive(Debug)]
enum Resolution {
    Found(String),
    Missing(SearchSummary),
}

#[derive(Debug)]
struct SearchSummary {
    prefix: String,
    pattern: String,
    pages: usize,
    listed: usize,
}

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

pub struct ObjectStoreSource {
    name: String,
    config: S3Config,
    endpoint: String,
    sessions: Mutex<HashMap<Satellite, Arc<OnceCell<Arc<Session>>>>>,
    token: CancellationToken,
    stats: Arc<StatsTracker>,
}

impl ObjectStoreSource {
    pub fn new(name: impl Into<String>, config: S3Config) -> Self {
        let endpoint = config.endpoint();
        Self {
            name: name.into(),
            config,
            endpoint,
            sessions: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            stats: Arc::new(StatsTracker::new()),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    fn bucket_target(&self, bucket: &str) -> String {
        format!("{}/{}", self.endpoint, bucket)
    }

    /// Return the cached session for the key's bucket, creating it on first use.
    ///
    /// Concurrent first callers for one bucket wait on that bucket's cell; the
    /// map lock is only held to look the cell up. A failed setup leaves the
    /// cell empty so the next call tries again.
    async fn session(&self, key: &LogicalKey) -> Result<Arc<Session>, FetchError> {
        let cell = self
            .sessions
            .lock()
            .await
            .entry(key.satellite)
            .or_default()
            .clone();
        let session = cell
            .get_or_try_init(|| async { self.connect(key).await.map(Arc::new) })
            .await?;
        Ok(session.clone())
    }

    async fn connect(&self, key: &LogicalKey) -> Result<Session, FetchError> {
        let bucket = key.satellite.bucket();
        let target = self.bucket_target(bucket);
        let policy = RetryPolicy {
            max_retries: SESSION_ATTEMPTS - 1,
            ..self.config.retry.clone()
        };

        let this = self;
        let target_ref = target.as_str();
        let session = retry(&policy, &self.token, move |attempt| async move {
            let ceiling = SESSION_CEILING_STEP * (attempt + 1);
            let ctx = ErrorContext::new("connect to the bucket for", key, target_ref);
            debug!(
                source = %this.name,
                bucket,
                attempt = attempt + 1,
                ceiling_secs = ceiling.as_secs(),
                "Opening object store session"
            );
            let client = Client::builder()
                .connect_timeout(ceiling)
                .read_timeout(this.config.timeout)
                .build()
                .map_err(|e| classify(e.into(), &ctx))?;
            let session = Session {
                client,
                bucket: bucket.to_string(),
            };
            let path = format!("/{}", bucket);
            this.send(&session, Method::HEAD, &path, &[], Some(ceiling))
                .await
                .map_err(|e| classify(e, &ctx))?;
            Ok::<_, DomainError>(session)
        })
        .await?;

        info!(source = %self.name, bucket, "Object store session ready");
        Ok(session)
    }

    /// Build, sign if configured, send, and turn any non-success status into
    /// a [`TransportError::Status`] carrying the S3 error code.
    ///
    /// `total` caps the whole exchange. Object bodies are sent without one and
    /// rely on the client's idle read timeout instead.
    async fn send(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        total: Option<Duration>,
    ) -> Result<Response, TransportError> {
        let mut req = self.request(session, method, path, query);
        if let Some(total) = total {
            req = req.timeout(total);
        }
        let resp = req.send().await?;
        check_status(resp).await
    }

    fn request(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> RequestBuilder {
        let canonical_uri = format!("{}{}", url_path(&self.endpoint), encode_path(path));
        let canonical_query = canonical_query(query);
        let mut url = format!("{}{}", url_origin(&self.endpoint), canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        let mut req = session.client.request(method.clone(), &url);
        if let Some(creds) = &self.config.credentials {
            let now = Utc::now();
            let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
            let date = now.format("%Y%m%d").to_string();
            let empty_hash = body_hash(b"");

            let mut headers = BTreeMap::new();
            headers.insert("host".to_string(), url_host(&self.endpoint));
            headers.insert("x-amz-content-sha256".to_string(), empty_hash.clone());
            headers.insert("x-amz-date".to_string(), date_time.clone());

            let auth = sign(
                creds,
                &self.config.region,
                SigningRequest {
                    method: method.as_str(),
                    canonical_uri: &canonical_uri,
                    canonical_query: &canonical_query,
                    headers: &headers,
                    body_hash: &empty_hash,
                },
                &date_time,
                &date,
            );
            req = req
                .header("x-amz-date", date_time)
                .header("x-amz-content-sha256", empty_hash)
                .header("Authorization", auth);
        }
        req
    }

    async fn head_object(
        &self,
        session: &Session,
        key: &LogicalKey,
        object_key: &str,
        operation: &str,
    ) -> Result<Option<u64>, FetchError> {
        let target = format!("{}/{}", self.bucket_target(&session.bucket), object_key);
        let path = format!("/{}/{}", session.bucket, object_key);
        let (target, path) = (target.as_str(), path.as_str());
        retry(&self.config.retry, &self.token, move |_| async move {
            let ctx = ErrorContext::new(operation, key, target);
            let resp = self
                .send(session, Method::HEAD, path, &[], Some(self.config.timeout))
                .await
                .map_err(|e| classify(e, &ctx))?;
            Ok::<_, DomainError>(resp.content_length())
        })
        .await
    }

    async fn list_page(
        &self,
        session: &Session,
        key: &LogicalKey,
        prefix: &str,
        continuation: Option<&str>,
        operation: &str,
    ) -> Result<ListPage, FetchError> {
        let target = format!("{}?prefix={}", self.bucket_target(&session.bucket), prefix);
        let path = format!("/{}", session.bucket);
        let (target, path) = (target.as_str(), path.as_str());
        retry(&self.config.retry, &self.token, move |_| async move {
            let ctx = ErrorContext::new(operation, key, target);
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = continuation {
                query.push(("continuation-token", token));
            }
            let resp = self
                .send(session, Method::GET, path, &query, Some(self.config.timeout))
                .await
                .map_err(|e| classify(e, &ctx))?;
            let body = resp
                .text()
                .await
                .map_err(|e| classify(e.into(), &ctx))?;
            Ok::<_, DomainError>(parse_list_page(&body))
        })
        .await
    }

    /// Exact probe, then wildcard search under the hour prefix.
    async fn resolve(
        &self,
        session: &Session,
        key: &LogicalKey,
        operation: &str,
    ) -> Result<Resolution, FetchError> {
        let exact = exact_object_key(key);
        match self.head_object(session, key, &exact, operation).await {
            Ok(_) => {
                debug!(source = %self.name, object = %exact, "Exact object found");
                return Ok(Resolution::Found(exact));
            }
            Err(FetchError::Domain(e)) if e.kind() == ErrorKind::NotFound => {
                debug!(source = %self.name, object = %exact, "Exact object missing, searching prefix");
            }
            Err(e) => return Err(e),
        }

        let prefix = object_prefix(key);
        let pattern = filename_pattern(key);
        let target = format!("{}/{}", self.bucket_target(&session.bucket), prefix);
        let ctx = ErrorContext::new(operation, key, &target);
        let re = Regex::new(&pattern)
            .map_err(|e| classify(TransportError::Other(e.to_string()), &ctx))?;

        let mut pages = 0;
        let mut listed = 0;
        let mut best: Option<String> = None;
        let mut continuation: Option<String> = None;
        while pages < MAX_LIST_PAGES {
            let page = self
                .list_page(session, key, &prefix, continuation.as_deref(), operation)
                .await?;
            pages += 1;
            listed += page.keys.len();
            if let Some(candidate) = select_latest(&page.keys, &re) {
                if best.as_deref().map_or(true, |b| candidate > b) {
                    best = Some(candidate.to_string());
                }
            }
            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation = Some(token),
                _ => {
                    continuation = None;
                    break;
                }
            }
        }
        if continuation.is_some() {
            warn!(
                source = %self.name,
                prefix = %prefix,
                pages,
                "Listing truncated at page limit"
            );
        }

        Ok(match best {
            Some(found) => {
                debug!(source = %self.name, object = %found, pages, listed, "Wildcard match selected");
                Resolution::Found(found)
            }
            None => Resolution::Missing(SearchSummary {
                prefix,
                pattern,
                pages,
                listed,
            }),
        })
    }

    async fn fetch(
        &self,
        key: &LogicalKey,
        destination: &Path,
    ) -> Result<(PathBuf, u64), FetchError> {
        let session = self.session(key).await?;
        let object_key = match self.resolve(&session, key, "download").await? {
            Resolution::Found(object_key) => object_key,
            Resolution::Missing(search) => {
                let target = format!("{}/{}", self.bucket_target(&session.bucket), search.prefix);
                let ctx = ErrorContext::new("download", key, &target);
                return Err(not_found_after_search(
                    &ctx,
                    &search.prefix,
                    &search.pattern,
                    search.pages,
                    search.listed,
                )
                .into());
            }
        };

        let target = format!("{}/{}", self.bucket_target(&session.bucket), object_key);
        let path = format!("/{}/{}", session.bucket, object_key);
        let (target, path, session) = (target.as_str(), path.as_str(), session.as_ref());
        let bytes = retry(&self.config.retry, &self.token, move |_| async move {
            let ctx = ErrorContext::new("download", key, target);
            let resp = self
                .send(session, Method::GET, path, &[], None)
                .await
                .map_err(|e| classify(e, &ctx))?;
            stream_to_file(resp, destination)
                .await
                .map_err(|e| classify(e, &ctx))
        })
        .await?;

        info!(source = %self.name, object = %object_key, bytes, "Downloaded object");
        Ok((destination.to_path_buf(), bytes))
    }
}

#[async_trait]
impl ImagerySource for ObjectStoreSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &LogicalKey) -> Result<bool, FetchError> {
        let session = match self.session(key).await {
            Ok(session) => session,
            Err(FetchError::Domain(e)) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        match self.resolve(&session, key, "check").await? {
            Resolution::Found(_) => Ok(true),
            Resolution::Missing(search) => {
                debug!(
                    source = %self.name,
                    prefix = %search.prefix,
                    pages = search.pages,
                    "No matching object"
                );
                Ok(false)
            }
        }
    }

    async fn download(&self, key: &LogicalKey, destination: &Path) -> Result<PathBuf, FetchError> {
        let started = Instant::now();
        let result = self.fetch(key, destination).await;
        record_download(&self.stats, &self.name, started, &result);
        result.map(|(path, _)| path)
    }

    fn source_url(&self, timestamp: DateTime<Utc>, satellite: Satellite) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            satellite.bucket(),
            product_prefix(self.config.default_product, &timestamp)
        )
    }

    async fn close(&self) {
        let mut sessions = self.sessions.lock().await;
        if !sessions.is_empty() {
            debug!(source = %self.name, count = sessions.len(), "Closing object store sessions");
        }
        sessions.clear();
    }
}

/// Pass successful responses through; read the error document otherwise.
async fn check_status(resp: Response) -> Result<Response, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let code = tag_values(&body, "Code").into_iter().next();
    let message = tag_values(&body, "Message")
        .into_iter()
        .next()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    Err(TransportError::status(status.as_u16(), code, message))
}

/// Greatest key whose file-name component matches `re`.
fn select_latest<'a>(keys: &'a [String], re: &Regex) -> Option<&'a str> {
    keys.iter()
        .map(String::as_str)
        .filter(|k| re.is_match(k.rsplit('/').next().unwrap_or_default()))
        .max()
}

fn parse_list_page(xml: &str) -> ListPage {
    ListPage {
        keys: tag_values(xml, "Key"),
        is_truncated: tag_values(xml, "IsTruncated")
            .first()
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        next_token: tag_values(xml, "NextContinuationToken").into_iter().next(),
    }
}

/// Extract the unescaped text of every `<tag>…</tag>` element.
fn tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        remaining = &remaining[start + open.len()..];
        match remaining.find(&close) {
            Some(end) => {
                values.push(xml_unescape(&remaining[..end]));
                remaining = &remaining[end + close.len()..];
            }
            None => break,
        }
    }
    values
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Percent-encode each path segment, keeping separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sorted, fully encoded query string as required for signing.
fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

struct SigningRequest<'a> {
    method: &'a str,
    canonical_uri: &'a str,
    canonical_query: &'a str,
    headers: &'a BTreeMap<String, String>,
    body_hash: &'a str,
}

/// Compute the AWS Signature V4 `Authorization` header value.
fn sign(
    creds: &S3Credentials,
    region: &str,
    req: SigningRequest<'_>,
    date_time: &str,
    date: &str,
) -> String {
    let canonical_headers: String = req
        .headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers: String = req.headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method,
        req.canonical_uri,
        req.canonical_query,
        canonical_headers,
        signed_headers,
        req.body_hash
    );

    let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let credential_scope = format!("{}/{}/s3/aws4_request", date, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        date_time, credential_scope, cr_hash
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date, region);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn strip_scheme(url: &str) -> (&str, &str) {
    if let Some(rest) = url.strip_prefix("https://") {
        ("https://", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        ("http://", rest)
    } else {
        ("", url)
    }
}

/// Host part of a URL, with port if present.
pub(crate) fn url_host(url: &str) -> String {
    let (_, rest) = strip_scheme(url);
    rest.split('/').next().unwrap_or(rest).to_string()
}

/// Scheme and host of a URL.
fn url_origin(url: &str) -> String {
    let (scheme, _) = strip_scheme(url);
    format!("{}{}", scheme, url_host(url))
}

/// Path component of an endpoint URL without a trailing slash; empty for a bare host.
fn url_path(url: &str) -> String {
    let (_, rest) = strip_scheme(url);
    match rest.find('/') {
        Some(idx) => rest[idx..].trim_end_matches('/').to_string(),
        None => String::new(),
    }
}
