use serde::{Deserialize, Serialize};

// Gmail API `format=full` message shapes. Fields we never read are kept so a
// fetched message can be written back out unchanged for debugging.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: MessagePart,
    /// Milliseconds since the Unix epoch, as a decimal string.
    pub internal_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    pub size: Option<u64>,
    /// Base64url-encoded content, already transfer-decoded by Gmail.
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

impl RawMessage {
    /// Top-level header value; names compare case-insensitively, first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload.header(name)
    }
}

impl MessagePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    /// Lowercased media type without parameters, from `mimeType` or the
    /// part's own `Content-Type` header.
    pub fn media_type(&self) -> Option<String> {
        self.mime_type
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.header("Content-Type"))
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
    }

    pub fn is_attachment(&self) -> bool {
        self.filename
            .as_deref()
            .is_some_and(|filename| !filename.trim().is_empty())
    }
}
