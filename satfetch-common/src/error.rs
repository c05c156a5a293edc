//! Error taxonomy for remote acquisition.
//!
//! Backends report raw [`TransportError`]s (HTTP status plus service error
//! code, timeouts, connection and DNS failures). [`classify`] turns those into
//! a [`DomainError`] carrying one of six [`ErrorKind`]s, a human message that
//! names the satellite and scan time, remediation tips, and a technical
//! section with the raw error, the path or URL attempted and the timestamp
//! decomposition.

use std::fmt;

use crate::key::LogicalKey;

/// Domain failure category. Ordering of the classification rules lives in [`classify_kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    NotFound,
    RateLimited,
    Network,
    ServerFault,
    Unknown,
}

impl ErrorKind {
    /// Whether a failed call may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Auth | Self::NotFound)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Auth => "authentication",
            Self::NotFound => "not found",
            Self::RateLimited => "rate limited",
            Self::Network => "network",
            Self::ServerFault => "server fault",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw failure as observed at the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status} [{}]: {message}", .code.as_deref().unwrap_or("-"))]
    Status {
        status: u16,
        /// Service error code, e.g. `NoSuchKey` or `SlowDown`.
        code: Option<String>,
        message: String,
    },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn status(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Status { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let chain = error_chain(&e);
        if e.is_timeout() {
            Self::Timeout(chain)
        } else if e.is_connect() {
            let lower = chain.to_ascii_lowercase();
            if lower.contains("dns") || lower.contains("lookup address") {
                Self::Dns(chain)
            } else {
                Self::Connect(chain)
            }
        } else if let Some(status) = e.status() {
            Self::status(status.as_u16(), None, chain)
        } else if e.is_request() || e.is_body() || e.is_decode() {
            Self::Connect(chain)
        } else {
            Self::Other(chain)
        }
    }
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut current = e.source();
    while let Some(inner) = current {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = inner.source();
    }
    out
}

const AUTH_CODES: &[&str] = &[
    "AccessDenied",
    "AllAccessDisabled",
    "AuthorizationHeaderMalformed",
    "ExpiredToken",
    "InvalidAccessKeyId",
    "InvalidToken",
    "SignatureDoesNotMatch",
];

const NOT_FOUND_CODES: &[&str] = &["NoSuchKey", "NoSuchBucket", "NotFound"];

const THROTTLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequests",
    "RateLimitExceeded",
];

const SERVER_CODES: &[&str] = &["InternalError", "ServiceUnavailable"];

fn code_in(code: Option<&str>, table: &[&str]) -> bool {
    code.is_some_and(|c| table.iter().any(|t| t.eq_ignore_ascii_case(c)))
}

/// Map a raw failure to its domain category, first matching rule wins:
/// credentials, absence, throttling, network, server, anything else.
pub fn classify_kind(raw: &TransportError) -> ErrorKind {
    match raw {
        TransportError::Status { status, code, .. } => {
            let code = code.as_deref();
            if matches!(status, 401 | 403) || code_in(code, AUTH_CODES) {
                ErrorKind::Auth
            } else if *status == 404 || code_in(code, NOT_FOUND_CODES) {
                ErrorKind::NotFound
            } else if *status == 429 || code_in(code, THROTTLE_CODES) {
                ErrorKind::RateLimited
            } else if *status == 408 {
                ErrorKind::Network
            } else if *status >= 500 || code_in(code, SERVER_CODES) {
                ErrorKind::ServerFault
            } else {
                ErrorKind::Unknown
            }
        }
        TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Dns(_) => {
            ErrorKind::Network
        }
        TransportError::Io(e) => match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorKind::Unknown
            }
            _ => ErrorKind::Network,
        },
        TransportError::Other(msg) => {
            let lower = msg.to_ascii_lowercase();
            if lower.contains("pool") || lower.contains("connection reset") {
                ErrorKind::Network
            } else {
                ErrorKind::Unknown
            }
        }
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    /// Verb for the message, e.g. `download` or `check`.
    pub operation: &'a str,
    pub key: &'a LogicalKey,
    /// Concrete object path or URL attempted.
    pub target: &'a str,
}

impl<'a> ErrorContext<'a> {
    pub fn new(operation: &'a str, key: &'a LogicalKey, target: &'a str) -> Self {
        Self {
            operation,
            key,
            target,
        }
    }
}

/// A classified, user-facing failure. Built once and never mutated.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    kind: ErrorKind,
    message: String,
    technical_details: String,
    remediation_tips: Vec<String>,
    #[source]
    cause: Option<TransportError>,
}

impl DomainError {
    /// Assemble an error from parts. Backends go through [`classify`] instead.
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        technical_details: impl Into<String>,
        remediation_tips: Vec<String>,
        cause: Option<TransportError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            technical_details: technical_details.into(),
            remediation_tips,
            cause,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn technical_details(&self) -> &str {
        &self.technical_details
    }

    pub fn remediation_tips(&self) -> &[String] {
        &self.remediation_tips
    }

    pub fn cause(&self) -> Option<&TransportError> {
        self.cause.as_ref()
    }

    /// The message cut to at most `max_chars` characters, with an ellipsis when cut.
    pub fn summary(&self, max_chars: usize) -> String {
        truncate_chars(&self.message, max_chars)
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Outcome of an operation that can also be cancelled.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl FetchError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Cancelled => None,
            Self::Domain(e) => Some(e.kind()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Classify a raw transport failure for the given operation.
pub fn classify(raw: TransportError, ctx: &ErrorContext<'_>) -> DomainError {
    classify_as(classify_kind(&raw), raw, ctx)
}

/// Like [`classify`] but with the category decided by the caller, for
/// backends whose status semantics differ from the general rules.
pub fn classify_as(kind: ErrorKind, raw: TransportError, ctx: &ErrorContext<'_>) -> DomainError {
    let mut details = base_details(ctx);
    details.push(format!("error: {raw}"));
    if let Some(code) = raw.code() {
        details.push(format!("error code: {code}"));
    }
    DomainError::new(
        kind,
        message_for(kind, ctx),
        details.join("\n"),
        tips_for(kind),
        Some(raw),
    )
}

/// NotFound raised after an exact probe missed and the wildcard search matched nothing.
pub fn not_found_after_search(
    ctx: &ErrorContext<'_>,
    prefix: &str,
    pattern: &str,
    pages_scanned: usize,
    candidates_seen: usize,
) -> DomainError {
    let mut details = base_details(ctx);
    details.push(format!("search prefix: {prefix}"));
    details.push(format!("pattern: {pattern}"));
    details.push(format!("pages scanned: {pages_scanned}"));
    details.push(format!("objects listed: {candidates_seen}"));
    DomainError::new(
        ErrorKind::NotFound,
        message_for(ErrorKind::NotFound, ctx),
        details.join("\n"),
        tips_for(ErrorKind::NotFound),
        None,
    )
}

fn base_details(ctx: &ErrorContext<'_>) -> Vec<String> {
    vec![
        format!("operation: {}", ctx.operation),
        format!("key: {}", ctx.key),
        format!("target: {}", ctx.target),
        format!("time: {}", ctx.key.time_components()),
    ]
}

fn message_for(kind: ErrorKind, ctx: &ErrorContext<'_>) -> String {
    let what = ctx.key.describe();
    let op = ctx.operation;
    match kind {
        ErrorKind::Auth => format!("Access was denied while trying to {op} {what}."),
        ErrorKind::NotFound => format!("No data found for {what}."),
        ErrorKind::RateLimited => {
            format!("Requests were throttled while trying to {op} {what}.")
        }
        ErrorKind::Network => {
            format!("A network problem interrupted the attempt to {op} {what}.")
        }
        ErrorKind::ServerFault => {
            format!("The remote service failed while trying to {op} {what}.")
        }
        ErrorKind::Unknown => {
            format!("An unexpected error occurred while trying to {op} {what}.")
        }
    }
}

fn tips_for(kind: ErrorKind) -> Vec<String> {
    let tips: &[&str] = match kind {
        ErrorKind::Auth => &[
            "The NOAA GOES buckets are public: check credentials are unset so requests go out unsigned",
            "If credentials are configured on purpose, verify the access key and that the system clock is correct",
        ],
        ErrorKind::NotFound => &[
            "Check the time falls on a scan slot for the sector (full disk every 10 min, CONUS every 5 min, mesoscale every minute)",
            "Very recent scans can take several minutes to be published",
            "Verify the satellite was operational on that date",
        ],
        ErrorKind::RateLimited => &[
            "Retry later, possible throttling by the remote service",
            "Reduce the number of concurrent downloads",
        ],
        ErrorKind::Network => &[
            "Check your internet connection and DNS settings",
            "Make sure outbound HTTPS is allowed by any proxy or firewall",
            "Retry with a longer timeout",
        ],
        ErrorKind::ServerFault => &[
            "The remote service reported an internal error, retry in a few minutes",
            "Check the AWS and NOAA service status pages",
        ],
        ErrorKind::Unknown => &[
            "Retry the operation",
            "Run with RUST_LOG=debug and inspect the technical details",
        ],
    };
    tips.iter().map(|t| t.to_string()).collect()
}
