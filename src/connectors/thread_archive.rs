use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::mail::{Mailbox, SimplifiedMessage, Thread};

pub const DEFAULT_LABEL: &str = "COMPLETE_DATA";

const NAME_PART_MAX_CHARS: usize = 120;
const UNKNOWN_SENDER: &str = "Unknown";
const NO_SUBJECT: &str = "Sem_assunto";
const UNDATED_PREFIX: &str = "00000000_0000";

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_\-.@]+").expect("valid filename regex"));
static REPEATED_UNDERSCORES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_+").expect("valid underscore regex"));
static FILENAME_TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{8})_(\d{4})__").expect("valid filename timestamp regex"));

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: invalid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
    #[error("invalid archive pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl ArchiveError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn invalid(path: &Path, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// A thread read back from a thread document.
#[derive(Debug, Clone)]
pub struct ArchivedThread {
    pub path: PathBuf,
    pub label: Option<String>,
    pub thread: Thread,
}

#[derive(Debug, Serialize)]
struct ThreadDocument<'a> {
    thread_id: &'a str,
    label: &'a str,
    message_count: usize,
    emails: Vec<DocumentEmail<'a>>,
}

#[derive(Debug, Serialize)]
struct DocumentEmail<'a> {
    id: &'a str,
    timestamp: String,
    sender: String,
    recipient: String,
    subject: &'a str,
    body: &'a str,
}

/// Resolves a file or directory argument to the thread documents it names,
/// sorted by path.
pub fn collect_thread_files(path: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    if path.is_file() {
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            return Ok(vec![path.to_path_buf()]);
        }
        return Err(ArchiveError::invalid(path, "expected a .json thread document"));
    }
    if !path.is_dir() {
        return Err(ArchiveError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
        ));
    }

    let pattern = format!(
        "{}/*.json",
        glob::Pattern::escape(&path.to_string_lossy()).trim_end_matches('/')
    );
    let mut files = Vec::new();
    for entry in glob::glob(&pattern)? {
        match entry {
            Ok(file) if file.is_file() => files.push(file),
            Ok(_) => {}
            Err(error) => warn!(%error, "skipping unreadable archive entry"),
        }
    }
    files.sort();
    Ok(files)
}

/// Reads one thread document. Accepts the `{ emails: [...] }` envelope and the
/// flat single-message shape.
pub fn load_thread_file(path: &Path, tz: Tz) -> Result<ArchivedThread, ArchiveError> {
    let raw = fs::read_to_string(path).map_err(|source| ArchiveError::io(path, source))?;
    let document: Value = serde_json::from_str(&raw).map_err(|source| ArchiveError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let Some(top) = document.as_object() else {
        return Err(ArchiveError::invalid(path, "thread document must be a JSON object"));
    };

    let thread_id = get_str(top, &["thread_id", "threadId"])
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let label = get_str(top, &["label"]);
    let fallback_timestamp = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| timestamp_from_filename(name, tz));

    let entries: Vec<&Map<String, Value>> = match top.get("emails") {
        Some(Value::Array(emails)) => emails.iter().filter_map(Value::as_object).collect(),
        Some(_) => return Err(ArchiveError::invalid(path, "\"emails\" must be an array")),
        None => vec![top],
    };

    let mut messages = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let raw_timestamp = field(entry, top, &["timestamp", "date"]);
        let timestamp = raw_timestamp
            .as_deref()
            .and_then(|value| parse_timestamp(value, tz))
            .or(fallback_timestamp);
        let Some(timestamp) = timestamp else {
            warn!(
                path = %path.display(),
                index,
                raw = raw_timestamp.as_deref().unwrap_or(""),
                "skipping message without a usable timestamp"
            );
            continue;
        };

        messages.push(SimplifiedMessage {
            id: get_str(entry, &["id", "message_id"])
                .unwrap_or_else(|| format!("{thread_id}#{index}")),
            thread_id: thread_id.clone(),
            timestamp,
            sender: Mailbox::parse(&field(entry, top, &["sender", "from"]).unwrap_or_default()),
            recipient: Mailbox::parse(
                &field(entry, top, &["recipient", "to"]).unwrap_or_default(),
            ),
            subject: field(entry, top, &["subject"]).unwrap_or_default(),
            body: field(entry, top, &["body", "text", "content"]).unwrap_or_default(),
        });
    }

    let thread = Thread::new(thread_id, messages)
        .ok_or_else(|| ArchiveError::invalid(path, "no message with a usable timestamp"))?;
    debug!(path = %path.display(), messages = thread.len(), "loaded thread document");

    Ok(ArchivedThread {
        path: path.to_path_buf(),
        label,
        thread,
    })
}

/// Writes `thread` into `dir` and returns the file path. Rewriting the same
/// thread replaces its file; a name collision with another thread gets the
/// thread id appended.
pub fn write_thread_document(
    dir: &Path,
    thread: &Thread,
    label: &str,
) -> Result<PathBuf, ArchiveError> {
    fs::create_dir_all(dir).map_err(|source| ArchiveError::io(dir, source))?;

    let stem = thread_file_stem(thread);
    let mut path = dir.join(format!("{stem}.json"));
    if path.exists() && stored_thread_id(&path).as_deref() != Some(thread.id()) {
        path = dir.join(format!("{stem}__{}.json", sanitize(thread.id())));
    }

    let document = ThreadDocument {
        thread_id: thread.id(),
        label,
        message_count: thread.len(),
        emails: thread
            .messages()
            .iter()
            .map(|message| DocumentEmail {
                id: &message.id,
                timestamp: message.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
                sender: message.sender.to_string(),
                recipient: message.recipient.to_string(),
                subject: &message.subject,
                body: &message.body,
            })
            .collect(),
    };
    let json = serde_json::to_string_pretty(&document).map_err(|source| ArchiveError::Json {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, json).map_err(|source| ArchiveError::io(&path, source))?;

    Ok(path)
}

/// `{YYYYMMDD_HHMM}__{sender}__{subject}` for the thread's first message.
pub fn thread_file_stem(thread: &Thread) -> String {
    let first = thread.first();
    let prefix = if first.timestamp.timestamp() == 0 {
        UNDATED_PREFIX.to_string()
    } else {
        first.timestamp.format("%Y%m%d_%H%M").to_string()
    };
    let subject = match first.subject.trim() {
        "" => NO_SUBJECT.to_string(),
        subject => sanitize(subject),
    };

    format!("{prefix}__{}__{subject}", sender_key(&first.sender))
}

fn sender_key(sender: &Mailbox) -> String {
    match (&sender.name, &sender.address) {
        (name, Some(address)) => format!(
            "{}_{}",
            sanitize(name.as_deref().unwrap_or(UNKNOWN_SENDER)),
            sanitize(address)
        ),
        (Some(name), None) => sanitize(name),
        (None, None) => UNKNOWN_SENDER.to_string(),
    }
}

fn sanitize(value: &str) -> String {
    let value = value.replace(' ', "_");
    let value = UNSAFE_FILENAME_CHARS.replace_all(&value, "_");
    let value = REPEATED_UNDERSCORES.replace_all(&value, "_");
    let truncated: String = value.chars().take(NAME_PART_MAX_CHARS).collect();
    truncated.trim_matches('_').to_string()
}

fn stored_thread_id(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let document: Value = serde_json::from_str(&raw).ok()?;
    document
        .get("thread_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// RFC 3339 / RFC 2822, or a naive local time in `tz`.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return Some(parsed);
    }

    NAIVE_TIMESTAMP_FORMATS.iter().find_map(|format| {
        let naive = NaiveDateTime::parse_from_str(raw, format).ok()?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|local| local.fixed_offset())
    })
}

/// Reads the `YYYYMMDD_HHMM__` prefix that `dump` puts on file names.
pub fn timestamp_from_filename(name: &str, tz: Tz) -> Option<DateTime<FixedOffset>> {
    let captures = FILENAME_TIMESTAMP.captures(name)?;
    let naive =
        NaiveDateTime::parse_from_str(&format!("{}{}", &captures[1], &captures[2]), "%Y%m%d%H%M")
            .ok()?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.fixed_offset())
}

fn get_str(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.clone()),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

fn field(entry: &Map<String, Value>, top: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    get_str(entry, keys).or_else(|| get_str(top, keys))
}
