use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::mail::raw::{MessagePart, RawMessage};
use crate::mail::{Mailbox, SimplifiedMessage};

const HTML_RENDER_WIDTH: usize = 1000;

static SCRIPT_STYLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>")
        .expect("compile script/style regex")
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^<>]*>").expect("compile tag regex"));

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("message {message_id} has no textual part")]
    NoTextualPart { message_id: String },
}

/// Projects a fetched message into its normalized form.
///
/// A message with no textual part gets an empty body; the condition is logged
/// and the pipeline keeps going.
pub fn normalize(raw: &RawMessage, tz: Tz) -> SimplifiedMessage {
    let body = match select_body(raw) {
        Ok(body) => body,
        Err(error) => {
            warn!(thread_id = %raw.thread_id, "{error}; using empty body");
            String::new()
        }
    };

    SimplifiedMessage {
        id: raw.id.clone(),
        thread_id: raw.thread_id.clone(),
        timestamp: message_timestamp(raw, tz),
        sender: raw.header("From").map(Mailbox::parse).unwrap_or_default(),
        recipient: raw.header("To").map(Mailbox::parse).unwrap_or_default(),
        subject: raw.header("Subject").unwrap_or_default().to_string(),
        body,
    }
}

/// Picks the first `text/plain` part in depth-first order, else the first
/// `text/html` part rendered to text.
pub fn select_body(raw: &RawMessage) -> Result<String, MimeError> {
    let mut plain = None;
    let mut html = None;
    collect_text_parts(&raw.id, &raw.payload, &mut plain, &mut html);

    if let Some(text) = plain {
        return Ok(text);
    }
    if let Some(markup) = html {
        return Ok(html_to_text(&markup));
    }
    Err(MimeError::NoTextualPart {
        message_id: raw.id.clone(),
    })
}

fn collect_text_parts(
    message_id: &str,
    part: &MessagePart,
    plain: &mut Option<String>,
    html: &mut Option<String>,
) {
    if plain.is_some() {
        return;
    }

    if !part.is_attachment() {
        let media_type = part.media_type().unwrap_or_default();
        let wanted = (media_type == "text/plain" && plain.is_none())
            || (media_type == "text/html" && html.is_none());

        if wanted {
            if let Some(data) = part
                .body
                .as_ref()
                .and_then(|body| body.data.as_deref())
                .filter(|data| !data.is_empty())
            {
                match decode_part_data(data) {
                    Ok(text) if media_type == "text/plain" => *plain = Some(text),
                    Ok(text) => *html = Some(text),
                    Err(error) => {
                        debug!(message_id, %media_type, "skipping undecodable part: {error}");
                    }
                }
            }
        }
    }

    for child in &part.parts {
        collect_text_parts(message_id, child, plain, html);
    }
}

/// Decodes Gmail's base64url body data, with or without padding.
pub fn decode_part_data(data: &str) -> Result<String, base64::DecodeError> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim().trim_end_matches('='))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Renders HTML to plain text with no residual markup: one non-blank line per
/// rendered line, whitespace runs collapsed.
pub fn html_to_text(html: &str) -> String {
    let stripped = SCRIPT_STYLE_RE.replace_all(html, "");
    let rendered =
        std::panic::catch_unwind(|| html2text::from_read(stripped.as_bytes(), HTML_RENDER_WIDTH))
            .unwrap_or_else(|_| {
                debug!("html2text panicked; falling back to tag stripping");
                stripped.to_string()
            });

    let without_tags = TAG_RE.replace_all(&rendered, " ");
    without_tags
        .replace(['<', '>'], " ")
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn message_timestamp(raw: &RawMessage, tz: Tz) -> DateTime<FixedOffset> {
    if let Some(instant) = raw
        .internal_date
        .as_deref()
        .and_then(|ms| ms.trim().parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    {
        return instant.with_timezone(&tz).fixed_offset();
    }

    if let Some(instant) = raw
        .header("Date")
        .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
    {
        return instant.with_timezone(&tz).fixed_offset();
    }

    warn!(
        message_id = %raw.id,
        "message has neither internalDate nor a parseable Date header; using the Unix epoch"
    );
    DateTime::<Utc>::default().with_timezone(&tz).fixed_offset()
}
