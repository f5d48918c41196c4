use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::DEFAULT_MAX_RETRIES;
use crate::extract::PromptPayload;
use crate::mail::RawMessage;

pub mod gemini;
pub mod gmail_api;
pub mod google_auth;
pub mod sheets;
pub mod thread_archive;

pub use gemini::GeminiClient;
pub use gmail_api::GmailApiConnector;
pub use sheets::SheetsStore;

const REDACTED_BODY_MAX_CHARS: usize = 200;

const RATE_LIMIT_REASONS: &[&str] = &[
    "ratelimitexceeded",
    "userratelimitexceeded",
    "rate_limit_exceeded",
    "quotaexceeded",
];

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("{service} rejected the credentials (status {status}): {body}")]
    Unauthorized {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} request failed: status={status} body={body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned an unreadable response: {reason}")]
    Decode {
        service: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Config(String),
}

impl ConnectorError {
    /// Maps a non-success API status. 403 means the credentials lack access and
    /// is fatal unless Google reports it as a rate limit; 401 means the access
    /// token expired and is retried.
    pub fn from_status(
        service: &'static str,
        status: StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        if status == StatusCode::FORBIDDEN && !is_rate_limited(body) {
            return Self::credentials_rejected(service, status, body);
        }
        Self::Status {
            service,
            status: status.as_u16(),
            body: redact_response_body(body),
            retry_after,
        }
    }

    pub fn credentials_rejected(service: &'static str, status: StatusCode, body: &str) -> Self {
        Self::Unauthorized {
            service,
            status: status.as_u16(),
            body: redact_response_body(body),
        }
    }

    pub fn transport(service: &'static str, source: reqwest::Error) -> Self {
        Self::Transport { service, source }
    }

    pub fn decode(service: &'static str, reason: impl ToString) -> Self {
        Self::Decode {
            service,
            reason: reason.to_string(),
        }
    }

    /// Timeouts, connection failures, 401, 408, 429, rate-limited 403 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => {
                matches!(*status, 401 | 403 | 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Errors that must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::Config(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { status, .. } | Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's retries are spent. Backoff doubles from `initial_backoff` up to
/// `max_backoff`; a server-sent `Retry-After` replaces the computed wait.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0usize;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let wait = error.retry_after().unwrap_or(backoff);
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    "{what} failed: {error}; retrying in {wait:?}"
                );
                sleep(wait).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(error) => return Err(error),
        }
    }
}

/// Google reports per-user and per-project throttling as 403 with a reason of
/// `rateLimitExceeded` or `userRateLimitExceeded`, either in the legacy
/// `errors[]` list or in `details[]`.
fn is_rate_limited(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let error = value.get("error").unwrap_or(&value);

    let reasons = ["errors", "details"]
        .into_iter()
        .filter_map(|key| error.get(key).and_then(|list| list.as_array()))
        .flatten()
        .filter_map(|entry| entry.get("reason").and_then(|reason| reason.as_str()));

    reasons
        .chain(error.get("status").and_then(|status| status.as_str()))
        .any(|reason| {
            let reason = reason.to_ascii_lowercase();
            reason == "resource_exhausted" || RATE_LIMIT_REASONS.contains(&reason.as_str())
        })
}

pub(crate) fn http_client(
    service: &'static str,
    timeout: Duration,
) -> Result<Client, ConnectorError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| ConnectorError::transport(service, source))
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    let total = trimmed.chars().count();
    if total <= REDACTED_BODY_MAX_CHARS {
        trimmed.to_string()
    } else {
        let kept: String = trimmed.chars().take(REDACTED_BODY_MAX_CHARS).collect();
        format!("{kept}…[truncated {} bytes]", trimmed.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub label_type: String,
}

/// Read side of the mailbox.
#[async_trait(?Send)]
pub trait MailSource {
    async fn list_labels(&self) -> Result<Vec<Label>, ConnectorError>;

    /// Message stubs as `(message_id, thread_id)`, newest first as the
    /// provider returns them, at most `max` when given.
    async fn list_messages(
        &self,
        label_ids: &[String],
        query: Option<&str>,
        max: Option<usize>,
    ) -> Result<Vec<(String, String)>, ConnectorError>;

    async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>, ConnectorError>;
}

/// Write side of the mailbox: creating labels and applying them to messages.
#[async_trait(?Send)]
pub trait MailLabeler {
    async fn create_label(&self, name: &str) -> Result<Label, ConnectorError>;

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), ConnectorError>;
}

/// Text-to-structured-data model. Returns the raw answer text.
#[async_trait(?Send)]
pub trait LlmClient {
    async fn generate(&self, payload: &PromptPayload) -> Result<String, ConnectorError>;
}

/// Worksheet-like store with a header row.
#[async_trait(?Send)]
pub trait TabularStore {
    /// The first row, or `None` when the sheet is empty.
    async fn read_header(&self) -> Result<Option<Vec<String>>, ConnectorError>;

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), ConnectorError>;
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// A request as seen by [`spawn`]: request line plus raw body.
    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub request_line: String,
        pub headers: String,
        pub body: String,
    }

    /// Serves the canned `(status, body)` responses in order, one per
    /// connection, and records what it received.
    pub async fn spawn(
        responses: Vec<(u16, String)>,
    ) -> (String, Arc<Mutex<Vec<Recorded>>>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub server");
        let addr = listener.local_addr().expect("stub server address");
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);

        let handle = tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut stream).await;
                sink.lock().expect("lock recorded requests").push(request);

                let response = format!(
                    "HTTP/1.1 {status} STUB\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (format!("http://{addr}"), recorded, handle)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> Recorded {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let read = stream.read(&mut chunk).await.unwrap_or(0);
            if read == 0 {
                break buffer.len();
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = find(&buffer, b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);

        while buffer.len() < header_end + content_length {
            let read = stream.read(&mut chunk).await.unwrap_or(0);
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }

        let (request_line, headers) = head.split_once("\r\n").unwrap_or((head.as_str(), ""));
        Recorded {
            request_line: request_line.to_string(),
            headers: headers.to_string(),
            body: String::from_utf8_lossy(&buffer[header_end.min(buffer.len())..]).to_string(),
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}
