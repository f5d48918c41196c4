use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

pub mod mime;
pub mod raw;
pub mod thread;

pub use mime::{normalize, MimeError};
pub use raw::RawMessage;
pub use thread::assemble;

/// A display name and address pair parsed from a `From`/`To` header value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: Option<String>,
}

impl Mailbox {
    /// Parses `Display Name <addr@example.com>`, a bare address, or a bare name.
    /// Only the first entry of a comma-separated list is kept.
    pub fn parse(raw: &str) -> Self {
        let entry = split_address_list(raw).into_iter().next().unwrap_or_default();
        let entry = entry.trim();
        if entry.is_empty() {
            return Self::default();
        }

        if let (Some(angle_start), Some(angle_end)) = (entry.rfind('<'), entry.rfind('>')) {
            if angle_start < angle_end {
                let address = entry[angle_start + 1..angle_end].trim();
                let name = entry[..angle_start].trim().trim_matches('"').trim();
                return Self {
                    name: non_empty(name),
                    address: non_empty(address),
                };
            }
        }

        if entry.contains('@') {
            return Self {
                name: None,
                address: Some(entry.to_string()),
            };
        }

        Self {
            name: Some(entry.trim_matches('"').to_string()),
            address: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.address.is_none()
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.address) {
            (Some(name), Some(address)) => write!(f, "{name} <{address}>"),
            (None, Some(address)) => write!(f, "{address}"),
            (Some(name), None) => write!(f, "{name}"),
            (None, None) => Ok(()),
        }
    }
}

impl From<String> for Mailbox {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Mailbox> for String {
    fn from(value: Mailbox) -> Self {
        value.to_string()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Splits a header address list on commas that are not inside a quoted display name.
pub fn split_address_list(raw: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    entries.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        entries.push(current.trim().to_string());
    }

    entries
}

/// Normalized projection of one email. The body is always plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub timestamp: DateTime<FixedOffset>,
    pub sender: Mailbox,
    pub recipient: Mailbox,
    pub subject: String,
    pub body: String,
}

/// Messages sharing one thread id, oldest first, unique by message id, never empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    id: String,
    messages: Vec<SimplifiedMessage>,
}

impl Thread {
    /// Returns `None` for an empty message list. Duplicate message ids keep their
    /// first occurrence; ordering is a stable sort on timestamp.
    pub fn new(id: impl Into<String>, messages: Vec<SimplifiedMessage>) -> Option<Self> {
        let mut seen = HashSet::new();
        let mut messages: Vec<SimplifiedMessage> = messages
            .into_iter()
            .filter(|message| message.id.is_empty() || seen.insert(message.id.clone()))
            .collect();
        if messages.is_empty() {
            return None;
        }

        messages.sort_by_key(|message| message.timestamp);
        Some(Self {
            id: id.into(),
            messages,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn messages(&self) -> &[SimplifiedMessage] {
        &self.messages
    }

    pub fn first(&self) -> &SimplifiedMessage {
        &self.messages[0]
    }

    pub fn latest(&self) -> &SimplifiedMessage {
        &self.messages[self.messages.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// First non-blank subject in chronological order.
    pub fn subject(&self) -> Option<&str> {
        self.messages
            .iter()
            .map(|message| message.subject.trim())
            .find(|subject| !subject.is_empty())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::message;
    use super::{split_address_list, Mailbox, Thread};

    #[test]
    fn mailbox_parses_common_header_shapes() {
        let mailbox = Mailbox::parse("Alex Smith <alex@example.com>");
        assert_eq!(mailbox.name.as_deref(), Some("Alex Smith"));
        assert_eq!(mailbox.address.as_deref(), Some("alex@example.com"));

        let quoted = Mailbox::parse("\"Smith, Alex\" <alex@example.com>, bob@example.com");
        assert_eq!(quoted.name.as_deref(), Some("Smith, Alex"));
        assert_eq!(quoted.address.as_deref(), Some("alex@example.com"));

        let bare = Mailbox::parse("plain@example.com");
        assert!(bare.name.is_none());
        assert_eq!(bare.address.as_deref(), Some("plain@example.com"));

        assert!(Mailbox::parse("   ").is_empty());
    }

    #[test]
    fn mailbox_serializes_as_header_string() {
        let mailbox = Mailbox::parse("Alex Smith <alex@example.com>");
        let json = serde_json::to_string(&mailbox).expect("serialize mailbox");
        assert_eq!(json, "\"Alex Smith <alex@example.com>\"");
        let back: Mailbox = serde_json::from_str(&json).expect("deserialize mailbox");
        assert_eq!(back, mailbox);
    }

    #[test]
    fn address_list_respects_quoted_commas() {
        let entries = split_address_list("team@example.com, \"Bob, Jr.\" <bob@example.com>,,");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], "\"Bob, Jr.\" <bob@example.com>");
    }

    #[test]
    fn thread_rejects_empty_and_orders_messages() {
        assert!(Thread::new("t-empty", Vec::new()).is_none());

        let thread = Thread::new(
            "t-1",
            vec![
                message("m-2", "t-1", "2025-08-08T12:00:00-03:00", "Re: Cotação"),
                message("m-1", "t-1", "2025-08-08T09:00:00-03:00", ""),
                message("m-2", "t-1", "2025-08-09T12:00:00-03:00", "dup"),
            ],
        )
        .expect("non-empty thread");

        assert_eq!(thread.len(), 2);
        assert_eq!(thread.first().id, "m-1");
        assert_eq!(thread.latest().id, "m-2");
        assert_eq!(thread.subject(), Some("Re: Cotação"));
    }
}
