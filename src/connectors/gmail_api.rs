use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::GmailConfig;
use crate::connectors::google_auth::{RefreshTokenAuth, TokenSource};
use crate::connectors::{
    http_client, retry_after, with_retry, ConnectorError, Label, MailLabeler, MailSource,
    RetryPolicy,
};
use crate::mail::RawMessage;

const SERVICE: &str = "gmail api";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_PAGE_SIZE: usize = 500;

pub struct GmailApiConnector {
    client: Client,
    auth: Box<dyn TokenSource>,
    base_url: String,
    retry: RetryPolicy,
}

impl GmailApiConnector {
    pub fn new(
        credentials: GmailConfig,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = http_client(SERVICE, timeout)?;
        let auth = RefreshTokenAuth::new(client.clone(), credentials, retry.clone());
        Ok(Self::with_token_source(client, Box::new(auth), retry))
    }

    pub fn with_token_source(
        client: Client,
        auth: Box<dyn TokenSource>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            auth,
            base_url: GMAIL_API_BASE.to_string(),
            retry,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, ConnectorError> {
        Url::parse(&format!("{}/users/me/{path}", self.base_url))
            .map_err(|e| ConnectorError::Config(format!("invalid gmail api url: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ConnectorError> {
        self.request_json(Method::GET, url, None).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        payload: &Value,
    ) -> Result<T, ConnectorError> {
        self.request_json(Method::POST, url, Some(payload)).await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        payload: Option<&Value>,
    ) -> Result<T, ConnectorError> {
        let body = with_retry(&self.retry, "gmail api request", || {
            let method = method.clone();
            let url = url.clone();
            async move {
                let token = self.auth.access_token().await?;
                let result = self.fetch(&token, method, url, payload).await;
                if matches!(&result, Err(ConnectorError::Status { status: 401, .. })) {
                    self.auth.invalidate();
                }
                result
            }
        })
        .await?;

        serde_json::from_str(&body).map_err(|e| ConnectorError::decode(SERVICE, e))
    }

    async fn fetch(
        &self,
        token: &str,
        method: Method,
        url: Url,
        payload: Option<&Value>,
    ) -> Result<String, ConnectorError> {
        debug!(%method, %url, "gmail api request");
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("accept", "application/json");
        if let Some(payload) = payload {
            request = request.json(payload);
        }
        let response = request
            .send()
            .await
            .map_err(|source| ConnectorError::transport(SERVICE, source))?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|source| ConnectorError::transport(SERVICE, source))?;
        if !status.is_success() {
            return Err(ConnectorError::from_status(SERVICE, status, &body, wait));
        }

        Ok(body)
    }
}

#[async_trait(?Send)]
impl MailSource for GmailApiConnector {
    async fn list_labels(&self) -> Result<Vec<Label>, ConnectorError> {
        let list: GmailLabelList = self.get_json(self.endpoint("labels")?).await?;
        Ok(list.labels.into_iter().map(Label::from).collect())
    }

    async fn list_messages(
        &self,
        label_ids: &[String],
        query: Option<&str>,
        max: Option<usize>,
    ) -> Result<Vec<(String, String)>, ConnectorError> {
        let mut stubs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = max.map(|max| max.saturating_sub(stubs.len()));
            if remaining == Some(0) {
                break;
            }

            let mut url = self.endpoint("messages")?;
            {
                let mut pairs = url.query_pairs_mut();
                for label_id in label_ids {
                    pairs.append_pair("labelIds", label_id);
                }
                if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
                    pairs.append_pair("q", query);
                }
                let page_size = remaining.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
                pairs.append_pair("maxResults", &page_size.to_string());
                if let Some(token) = &page_token {
                    pairs.append_pair("pageToken", token);
                }
            }

            let page: GmailMessageList = self.get_json(url).await?;
            let batch = page.messages.unwrap_or_default();
            debug!(page_size = batch.len(), total = stubs.len() + batch.len(), "gmail message page");
            stubs.extend(batch.into_iter().map(|stub| (stub.id, stub.thread_id)));

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if let Some(max) = max {
            stubs.truncate(max);
        }
        info!(messages = stubs.len(), "listed gmail messages");
        Ok(stubs)
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>, ConnectorError> {
        let mut url = self.endpoint("threads")?;
        url.path_segments_mut()
            .map_err(|_| ConnectorError::Config("gmail api url cannot be a base".to_string()))?
            .push(thread_id);
        url.query_pairs_mut().append_pair("format", "full");

        let thread: GmailThread = self.get_json(url).await?;
        Ok(thread.messages)
    }
}

#[async_trait(?Send)]
impl MailLabeler for GmailApiConnector {
    async fn create_label(&self, name: &str) -> Result<Label, ConnectorError> {
        let payload = json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let created: GmailLabel = self.post_json(self.endpoint("labels")?, &payload).await?;
        info!(label = %created.name, id = %created.id, "created gmail label");
        Ok(created.into())
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), ConnectorError> {
        let mut url = self.endpoint("messages")?;
        url.path_segments_mut()
            .map_err(|_| ConnectorError::Config("gmail api url cannot be a base".to_string()))?
            .push(message_id)
            .push("modify");
        let payload = json!({ "addLabelIds": [label_id], "removeLabelIds": [] });

        let _: IgnoredAny = self.post_json(url, &payload).await?;
        Ok(())
    }
}

/// Finds a label by exact name, falling back to its id.
pub fn resolve_label_id<'a>(labels: &'a [Label], name: &str) -> Option<&'a str> {
    labels
        .iter()
        .find(|label| label.name == name)
        .or_else(|| labels.iter().find(|label| label.id == name))
        .map(|label| label.id.as_str())
}

/// Joins a free-form query with `after:`/`before:` terms (`YYYY/MM/DD`).
pub fn build_gmail_query(
    query: Option<&str>,
    after: Option<&str>,
    before: Option<&str>,
) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(query) = query.map(str::trim).filter(|q| !q.is_empty()) {
        parts.push(query.to_string());
    }
    if let Some(after) = after.map(str::trim).filter(|d| !d.is_empty()) {
        parts.push(format!("after:{after}"));
    }
    if let Some(before) = before.map(str::trim).filter(|d| !d.is_empty()) {
        parts.push(format!("before:{before}"));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Thread ids in order of first arrival.
pub fn unique_thread_ids(stubs: &[(String, String)]) -> Vec<String> {
    let mut seen = HashSet::new();
    stubs
        .iter()
        .map(|(_, thread_id)| thread_id)
        .filter(|thread_id| !thread_id.is_empty() && seen.insert(thread_id.as_str()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
}

impl From<GmailLabel> for Label {
    fn from(label: GmailLabel) -> Self {
        Label {
            id: label.id,
            name: label.name,
            label_type: label.label_type.unwrap_or_else(|| "user".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailThread {
    #[serde(default)]
    messages: Vec<RawMessage>,
}
