use std::fmt::{Display, Formatter};
use std::str::FromStr;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::mail::{SimplifiedMessage, Thread};

/// Explicit "not determinable" marker. A record never lacks a key; a field it
/// could not fill holds this value instead.
pub const UNKNOWN: &str = "";

pub const FIELD_COUNT: usize = 15;

/// Timestamp rendering used for backfilled records and prompt metadata.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

static REPLY_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:(?:re|res|fw|fwd|enc|tr)\s*:\s*)+").expect("compile reply prefix regex")
});
static PROPERTY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:hotel|pousada|resort)\b").expect("compile property regex")
});
static NOT_A_CITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:hotel|pousada|resort|r[ée]veillon|cota[çc][ãa]o|cota[çc][õo]es|or[çc]amento)\b",
    )
    .expect("compile city exclusion regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuoteField {
    Timestamp,
    Sender,
    Recipient,
    Subject,
    HotelName,
    HotelCity,
    StayDates,
    RoomsAvailable,
    RoomType,
    PricePerRoomType,
    RateType,
    Taxes,
    IncludedServices,
    PaymentPolicy,
    CancellationPolicy,
}

impl QuoteField {
    pub const ALL: [QuoteField; FIELD_COUNT] = [
        QuoteField::Timestamp,
        QuoteField::Sender,
        QuoteField::Recipient,
        QuoteField::Subject,
        QuoteField::HotelName,
        QuoteField::HotelCity,
        QuoteField::StayDates,
        QuoteField::RoomsAvailable,
        QuoteField::RoomType,
        QuoteField::PricePerRoomType,
        QuoteField::RateType,
        QuoteField::Taxes,
        QuoteField::IncludedServices,
        QuoteField::PaymentPolicy,
        QuoteField::CancellationPolicy,
    ];

    pub fn key(self) -> &'static str {
        match self {
            QuoteField::Timestamp => "email_basics_timestamp",
            QuoteField::Sender => "email_basics_sender",
            QuoteField::Recipient => "email_basics_recipient",
            QuoteField::Subject => "email_basics_subject",
            QuoteField::HotelName => "hotel_name",
            QuoteField::HotelCity => "hotel_city",
            QuoteField::StayDates => "stay_dates",
            QuoteField::RoomsAvailable => "rooms_available",
            QuoteField::RoomType => "room_type",
            QuoteField::PricePerRoomType => "price_per_room_type",
            QuoteField::RateType => "rate_type",
            QuoteField::Taxes => "taxes",
            QuoteField::IncludedServices => "included_services",
            QuoteField::PaymentPolicy => "payment_policy",
            QuoteField::CancellationPolicy => "cancellation_policy",
        }
    }

    /// What the model is told to put in the field.
    pub fn description(self) -> &'static str {
        match self {
            QuoteField::Timestamp => "when the quoting message was sent, as YYYY-MM-DD HH:MM",
            QuoteField::Sender => "who sent the quote (name and/or address), never the recipient",
            QuoteField::Recipient => "who received the quote",
            QuoteField::Subject => "the email subject",
            QuoteField::HotelName => "commercial name of the hotel or inn",
            QuoteField::HotelCity => "city where the hotel is located",
            QuoteField::StayDates => "check-in and check-out dates, ISO YYYY-MM-DD, as 'YYYY-MM-DD a YYYY-MM-DD'",
            QuoteField::RoomsAvailable => "number of rooms available, digits only when a single count is given",
            QuoteField::RoomType => "room type or configuration as written (e.g. 'Duplo luxo', twin, double)",
            QuoteField::PricePerRoomType => "nightly price per room type, keeping the currency as written",
            QuoteField::RateType => "whether the rate is NET or commissioned",
            QuoteField::Taxes => "taxes and fees (e.g. '5% ISS')",
            QuoteField::IncludedServices => "services included in the rate (breakfast, service fee)",
            QuoteField::PaymentPolicy => "payment terms and deadlines",
            QuoteField::CancellationPolicy => "cancellation terms and penalties",
        }
    }

    /// Fields that fall back to message metadata when the model leaves them blank.
    pub fn is_backfilled(self) -> bool {
        matches!(
            self,
            QuoteField::Timestamp | QuoteField::Sender | QuoteField::Recipient | QuoteField::Subject
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl Display for QuoteField {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for QuoteField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuoteField::ALL
            .into_iter()
            .find(|field| field.key() == s)
            .ok_or_else(|| format!("unknown field '{s}'"))
    }
}

/// One canonical output row: exactly one string per [`QuoteField`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteRecord {
    values: [String; FIELD_COUNT],
}

impl QuoteRecord {
    pub fn get(&self, field: QuoteField) -> &str {
        &self.values[field.index()]
    }

    pub fn set(&mut self, field: QuoteField, value: impl Into<String>) {
        self.values[field.index()] = value.into();
    }

    pub fn is_unknown(&self, field: QuoteField) -> bool {
        self.get(field) == UNKNOWN
    }

    pub fn iter(&self) -> impl Iterator<Item = (QuoteField, &str)> + '_ {
        QuoteField::ALL
            .into_iter()
            .map(move |field| (field, self.get(field)))
    }

    /// Values in the order of `header`.
    pub fn to_row(&self, header: &[QuoteField]) -> Vec<String> {
        header
            .iter()
            .map(|field| self.get(*field).to_string())
            .collect()
    }
}

impl Serialize for QuoteRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FIELD_COUNT))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.key(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for QuoteRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::<String, String>::deserialize(deserializer)?;
        let mut record = QuoteRecord::default();
        let mut found = 0;

        for (key, value) in raw {
            let field = key.parse::<QuoteField>().map_err(D::Error::custom)?;
            record.set(field, value);
            found += 1;
        }
        if found != FIELD_COUNT {
            return Err(D::Error::custom(format!(
                "expected {FIELD_COUNT} fields, found {found}"
            )));
        }

        Ok(record)
    }
}

/// A record read from an older or hand-edited output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LooseRecord {
    pub record: QuoteRecord,
    /// Canonical fields the line did not carry; they hold [`UNKNOWN`].
    pub missing: Vec<QuoteField>,
    /// Keys the line carried that are not canonical fields; they are dropped.
    pub extra: Vec<String>,
}

impl LooseRecord {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

impl QuoteRecord {
    /// Rebuilds a record from any JSON object, padding absent fields with
    /// [`UNKNOWN`] and stringifying non-string values.
    pub fn from_loose(fields: &Map<String, Value>) -> LooseRecord {
        let mut record = QuoteRecord::default();
        let mut missing = Vec::new();
        for field in QuoteField::ALL {
            match fields.get(field.key()) {
                Some(value) => record.set(field, render_value(value).unwrap_or_default()),
                None => missing.push(field),
            }
        }
        let extra = fields
            .keys()
            .filter(|key| key.parse::<QuoteField>().is_err())
            .cloned()
            .collect();

        LooseRecord {
            record,
            missing,
            extra,
        }
    }
}

/// One JSON object proposed by the model, before enforcement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteCandidate {
    fields: Map<String, Value>,
}

impl QuoteCandidate {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// The model's value for `field` as a string, or `None` when blank or null.
    /// Scalars are stringified; arrays are joined with `"; "`.
    pub fn value(&self, field: QuoteField) -> Option<String> {
        self.fields.get(field.key()).and_then(render_value)
    }

    /// Keys the model sent that are not canonical fields.
    pub fn extra_keys(&self) -> Vec<&str> {
        self.fields
            .keys()
            .filter(|key| key.parse::<QuoteField>().is_err())
            .map(String::as_str)
            .collect()
    }
}

fn render_value(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::Null => return None,
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(render_value)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(_) => value.to_string(),
    };

    if rendered.trim().is_empty() {
        None
    } else {
        Some(rendered)
    }
}

/// The model's answer, classified by how much structure could be recovered.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmResponse {
    /// The whole answer was a JSON object or array of objects.
    Structured(Vec<QuoteCandidate>),
    /// A JSON object or array was found inside prose or a code fence.
    Recovered(Vec<QuoteCandidate>),
    /// Nothing usable; carries the raw text for the review log.
    Malformed(String),
}

impl LlmResponse {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return LlmResponse::Malformed(raw.to_string());
        }

        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return match candidates_from_value(value) {
                Some(candidates) => LlmResponse::Structured(candidates),
                None => LlmResponse::Malformed(raw.to_string()),
            };
        }

        if let Some(candidates) = fenced_json(trimmed).and_then(|body| {
            serde_json::from_str::<Value>(body.trim())
                .ok()
                .and_then(candidates_from_value)
        }) {
            return LlmResponse::Recovered(candidates);
        }

        match first_embedded_json(trimmed) {
            Some(candidates) => LlmResponse::Recovered(candidates),
            None => LlmResponse::Malformed(raw.to_string()),
        }
    }

    pub fn candidates(&self) -> &[QuoteCandidate] {
        match self {
            LlmResponse::Structured(candidates) | LlmResponse::Recovered(candidates) => candidates,
            LlmResponse::Malformed(_) => &[],
        }
    }
}

fn candidates_from_value(value: Value) -> Option<Vec<QuoteCandidate>> {
    let candidates: Vec<QuoteCandidate> = match value {
        Value::Object(fields) => vec![QuoteCandidate::new(fields)],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(fields) => Some(QuoteCandidate::new(fields)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if candidates.is_empty() {
        None
    } else {
        Some(candidates)
    }
}

fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n').map_or(0, |index| index + 1);
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

/// Tries each `{` or `[` in order and returns the first balanced span that
/// parses into at least one candidate.
fn first_embedded_json(text: &str) -> Option<Vec<QuoteCandidate>> {
    text.char_indices()
        .filter(|(_, ch)| *ch == '{' || *ch == '[')
        .find_map(|(start, _)| {
            let tail = &text[start..];
            let end = find_json_end(tail)?;
            serde_json::from_str::<Value>(&tail[..end])
                .ok()
                .and_then(candidates_from_value)
        })
}

/// Byte offset just past the bracket that closes the one `s` starts with.
fn find_json_end(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Message metadata used to fill the four email fields the model left blank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backfill {
    pub timestamp: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
}

impl Backfill {
    pub fn from_message(message: &SimplifiedMessage) -> Self {
        Self {
            timestamp: message.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            sender: message.sender.to_string(),
            recipient: message.recipient.to_string(),
            subject: message.subject.trim().to_string(),
        }
    }

    /// Metadata of the thread's first message, with the subject taken from the
    /// first message that has one.
    pub fn from_thread(thread: &Thread) -> Self {
        Self {
            subject: thread.subject().unwrap_or(UNKNOWN).to_string(),
            ..Self::from_message(thread.first())
        }
    }

    fn get(&self, field: QuoteField) -> Option<&str> {
        let value = match field {
            QuoteField::Timestamp => &self.timestamp,
            QuoteField::Sender => &self.sender,
            QuoteField::Recipient => &self.recipient,
            QuoteField::Subject => &self.subject,
            _ => return None,
        };
        Some(value.as_str()).filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Clean,
    Recovered,
    NeedsReview,
}

impl Display for RecordStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecordStatus::Clean => "clean",
            RecordStatus::Recovered => "recovered",
            RecordStatus::NeedsReview => "needs_review",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcedRecord {
    pub record: QuoteRecord,
    pub status: RecordStatus,
}

/// Builds the record for the first candidate in `response`.
pub fn enforce(response: &LlmResponse, backfill: &Backfill) -> EnforcedRecord {
    let candidate = response.candidates().first();
    EnforcedRecord {
        record: fill_record(candidate, backfill),
        status: status_of(response),
    }
}

/// One record per candidate; a malformed response still yields one
/// metadata-only record.
pub fn enforce_all(response: &LlmResponse, backfill: &Backfill) -> Vec<EnforcedRecord> {
    let status = status_of(response);
    match response.candidates() {
        [] => vec![EnforcedRecord {
            record: fill_record(None, backfill),
            status,
        }],
        candidates => candidates
            .iter()
            .map(|candidate| EnforcedRecord {
                record: fill_record(Some(candidate), backfill),
                status,
            })
            .collect(),
    }
}

fn status_of(response: &LlmResponse) -> RecordStatus {
    match response {
        LlmResponse::Structured(_) => RecordStatus::Clean,
        LlmResponse::Recovered(_) => RecordStatus::Recovered,
        LlmResponse::Malformed(_) => RecordStatus::NeedsReview,
    }
}

fn fill_record(candidate: Option<&QuoteCandidate>, backfill: &Backfill) -> QuoteRecord {
    let mut record = QuoteRecord::default();
    for field in QuoteField::ALL {
        let value = candidate
            .and_then(|candidate| candidate.value(field))
            .or_else(|| backfill.get(field).map(str::to_string))
            .unwrap_or_else(|| UNKNOWN.to_string());
        record.set(field, value);
    }

    if record.get(QuoteField::HotelName).trim().chars().count() < 3 {
        let hints = SubjectHints::from_subject(record.get(QuoteField::Subject));
        if let Some(hotel) = hints.hotel.filter(|_| record.is_unknown(QuoteField::HotelName)) {
            record.set(QuoteField::HotelName, hotel);
        }
        if let Some(city) = hints.city.filter(|_| record.is_unknown(QuoteField::HotelCity)) {
            record.set(QuoteField::HotelCity, city);
        }
    }
    record
}

/// Hotel and city read from a pipe-delimited subject such as
/// `Paraty | Hotel Aconchego`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectHints {
    pub hotel: Option<String>,
    pub city: Option<String>,
}

impl SubjectHints {
    /// The hotel is the last segment naming a hotel, inn or resort; the city is
    /// the first segment that names neither a property nor the request itself.
    /// Subjects without a `|` give no hints.
    pub fn from_subject(subject: &str) -> Self {
        let subject = REPLY_PREFIX_RE.replace(subject, "");
        if !subject.contains('|') {
            return Self::default();
        }

        let segments: Vec<&str> = subject
            .split('|')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect();

        Self {
            hotel: segments
                .iter()
                .rev()
                .find(|segment| PROPERTY_RE.is_match(segment))
                .map(|segment| segment.to_string()),
            city: segments
                .iter()
                .find(|segment| !NOT_A_CITY_RE.is_match(segment))
                .map(|segment| segment.to_string()),
        }
    }
}
