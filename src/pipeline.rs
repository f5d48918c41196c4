use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectors::gmail_api::{build_gmail_query, resolve_label_id, unique_thread_ids};
use crate::connectors::thread_archive::{
    collect_thread_files, load_thread_file, write_thread_document, ArchiveError,
};
use crate::connectors::{ConnectorError, LlmClient, MailLabeler, MailSource, TabularStore};
use crate::extract::{
    build_thread_prompt, enforce_all, score_quote, Backfill, LlmResponse, QuoteField,
    QuoteRecord, RecordStatus,
};
use crate::mail::{assemble, normalize};
use crate::sink::jsonl::JsonlError;
use crate::sink::{read_jsonl, JsonlWriter, SinkError, SinkWriter, APPEND_CHUNK_ROWS};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("label '{0}' does not exist in the mailbox")]
    UnknownLabel(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Jsonl(#[from] JsonlError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// One line of the review log: an item that was flagged or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub run_id: String,
    pub thread_id: String,
    pub message_id: Option<String>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

/// Counters reported at the end of every command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub threads: usize,
    /// Messages inspected one by one; only `label` counts these.
    #[serde(skip_serializing_if = "is_zero")]
    pub messages: usize,
    pub written: usize,
    pub clean: usize,
    pub recovered: usize,
    pub needs_review: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    fn count(&mut self, status: RecordStatus) {
        self.written += 1;
        match status {
            RecordStatus::Clean => self.clean += 1,
            RecordStatus::Recovered => self.recovered += 1,
            RecordStatus::NeedsReview => self.needs_review += 1,
        }
    }
}

fn is_zero(count: &usize) -> bool {
    *count == 0
}

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub label: String,
    pub query: Option<String>,
    /// `YYYY/MM/DD`
    pub after: Option<String>,
    pub before: Option<String>,
    pub max: Option<usize>,
    pub out_dir: PathBuf,
}

/// Fetches every thread touched by the label/query and writes one thread
/// document per thread into `out_dir`.
pub async fn dump<M: MailSource>(
    source: &M,
    options: &DumpOptions,
    tz: Tz,
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::new(new_run_id());

    let labels = source.list_labels().await?;
    let label_id = resolve_label_id(&labels, &options.label)
        .ok_or_else(|| PipelineError::UnknownLabel(options.label.clone()))?
        .to_string();
    let query = build_gmail_query(
        options.query.as_deref(),
        options.after.as_deref(),
        options.before.as_deref(),
    );

    let stubs = source
        .list_messages(&[label_id], query.as_deref(), options.max)
        .await?;
    let thread_ids = unique_thread_ids(&stubs);
    info!(
        messages = stubs.len(),
        threads = thread_ids.len(),
        label = %options.label,
        "listed messages"
    );

    for thread_id in thread_ids {
        summary.threads += 1;
        let raw = match source.get_thread(&thread_id).await {
            Ok(raw) => raw,
            Err(error) if error.is_fatal() => return Err(error.into()),
            Err(error) => {
                warn!(%thread_id, "fetching thread failed: {error}");
                summary.failed += 1;
                continue;
            }
        };

        let threads = assemble(raw.iter().map(|message| normalize(message, tz)));
        if threads.is_empty() {
            debug!(%thread_id, "thread has no messages");
            summary.skipped += 1;
            continue;
        }
        for thread in threads.values() {
            let path = write_thread_document(&options.out_dir, thread, &options.label)?;
            debug!(thread_id = %thread.id(), path = %path.display(), "wrote thread document");
            summary.written += 1;
        }
    }

    Ok(summary)
}

#[derive(Debug, Clone, Default)]
pub struct LabelOptions {
    /// Label to apply; created when the mailbox has none by that name.
    pub label: String,
    pub query: Option<String>,
    pub max: Option<usize>,
    /// Score messages without touching the mailbox.
    pub dry_run: bool,
}

/// Scores every message in the threads matched by `query` and applies the
/// label to those that read as quotations. Messages already carrying the label
/// are counted as skipped.
pub async fn label<M: MailSource + MailLabeler>(
    source: &M,
    options: &LabelOptions,
    tz: Tz,
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::new(new_run_id());

    let labels = source.list_labels().await?;
    let label_id = match resolve_label_id(&labels, &options.label) {
        Some(id) => Some(id.to_string()),
        None if options.dry_run => None,
        None => Some(source.create_label(&options.label).await?.id),
    };

    let stubs = source
        .list_messages(&[], options.query.as_deref(), options.max)
        .await?;
    let thread_ids = unique_thread_ids(&stubs);
    info!(threads = thread_ids.len(), label = %options.label, "scanning threads for quotations");

    for thread_id in thread_ids {
        summary.threads += 1;
        let raw = match source.get_thread(&thread_id).await {
            Ok(raw) => raw,
            Err(error) if error.is_fatal() => return Err(error.into()),
            Err(error) => {
                warn!(%thread_id, "fetching thread failed: {error}");
                summary.failed += 1;
                continue;
            }
        };

        for message in &raw {
            summary.messages += 1;
            if label_id
                .as_ref()
                .is_some_and(|id| message.label_ids.contains(id))
            {
                summary.skipped += 1;
                continue;
            }

            let simplified = normalize(message, tz);
            let score = score_quote(&simplified.subject, &simplified.body);
            debug!(message_id = %message.id, score = score.total(), "scored message");
            if !score.is_quote() {
                continue;
            }

            match &label_id {
                Some(id) if !options.dry_run => match source.add_label(&message.id, id).await {
                    Ok(()) => summary.written += 1,
                    Err(error) if error.is_fatal() => return Err(error.into()),
                    Err(error) => {
                        warn!(message_id = %message.id, "labelling failed: {error}");
                        summary.failed += 1;
                    }
                },
                _ => {
                    info!(message_id = %message.id, subject = %simplified.subject, "would label");
                    summary.written += 1;
                }
            }
        }
    }

    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub output: PathBuf,
    pub review_log: PathBuf,
    pub limit: Option<usize>,
    /// Append to `output` instead of truncating it.
    pub append: bool,
}

/// Sends each thread document under `input` through the model and writes the
/// enforced records as JSONL. Flagged and failed items go to the review log.
pub async fn extract<L: LlmClient>(
    llm: &L,
    input: &Path,
    options: &ExtractOptions,
    tz: Tz,
) -> Result<RunSummary, PipelineError> {
    let run_id = new_run_id();
    let mut summary = RunSummary::new(run_id.clone());
    let mut files = collect_thread_files(input)?;
    if let Some(limit) = options.limit {
        files.truncate(limit);
    }

    let mut output = JsonlWriter::open(&options.output, options.append)?;
    let mut review = ReviewLog::open(&options.review_log, run_id)?;

    for path in files {
        let archived = match load_thread_file(&path, tz) {
            Ok(archived) => archived,
            Err(error) => {
                warn!("skipping thread document: {error}");
                summary.skipped += 1;
                let thread_id = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                review.record(&thread_id, None, error.to_string(), None)?;
                continue;
            }
        };
        let thread = archived.thread;
        let message_id = Some(thread.latest().id.clone());
        summary.threads += 1;

        let payload = build_thread_prompt(&thread);
        let raw = match llm.generate(&payload).await {
            Ok(raw) => raw,
            Err(error) if error.is_fatal() => return Err(error.into()),
            Err(error) => {
                warn!(thread_id = %thread.id(), "extraction failed: {error}");
                summary.failed += 1;
                review.record(thread.id(), message_id, format!("model call failed: {error}"), None)?;
                continue;
            }
        };

        let response = LlmResponse::parse(&raw);
        for candidate in response.candidates() {
            let extra = candidate.extra_keys();
            if !extra.is_empty() {
                debug!(thread_id = %thread.id(), ?extra, "ignoring keys outside the schema");
            }
        }

        let records = enforce_all(&response, &Backfill::from_thread(&thread));
        for enforced in &records {
            output.write(&enforced.record)?;
            summary.count(enforced.status);
        }

        let flag = match &response {
            LlmResponse::Structured(_) => None,
            LlmResponse::Recovered(_) => Some("JSON recovered from surrounding text"),
            LlmResponse::Malformed(_) => Some("no JSON in model answer; metadata only"),
        };
        if let Some(reason) = flag {
            warn!(thread_id = %thread.id(), "{reason}");
            review.record(thread.id(), message_id, reason.to_string(), Some(raw))?;
        }
    }

    info!(
        run_id = %summary.run_id,
        threads = summary.threads,
        written = summary.written,
        failed = summary.failed,
        "extraction finished"
    );
    Ok(summary)
}

/// Loads the records in `input` and appends them to the sink. Lines that are
/// not JSON objects are skipped; objects missing canonical keys are padded.
pub async fn push<S: TabularStore>(
    sink: &SinkWriter<S>,
    input: &Path,
    header: &[QuoteField],
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::new(new_run_id());
    let contents = read_jsonl::<Map<String, Value>>(input)?;
    summary.skipped = contents.skipped;

    let mut padded = 0usize;
    let records: Vec<QuoteRecord> = contents
        .items
        .iter()
        .enumerate()
        .map(|(index, fields)| {
            let loose = QuoteRecord::from_loose(fields);
            if !loose.is_exact() {
                padded += 1;
                let missing: Vec<&str> = loose.missing.iter().map(|field| field.key()).collect();
                warn!(
                    record = index + 1,
                    ?missing,
                    extra = ?loose.extra,
                    "record keys differ from the schema; normalizing"
                );
            }
            loose.record
        })
        .collect();
    if padded > 0 {
        summary
            .warnings
            .push(format!("{padded} records had missing or extra keys and were normalized"));
    }

    if records.is_empty() {
        info!(path = %input.display(), "no records to push");
        return Ok(summary);
    }
    push_records(sink, &records, header, &mut summary).await?;
    Ok(summary)
}

/// Appends `records` in chunks. A chunk that still fails after retries is
/// counted as failed and the rest continue; a permanent sink error stops the
/// run.
pub async fn push_records<S: TabularStore>(
    sink: &SinkWriter<S>,
    records: &[QuoteRecord],
    header: &[QuoteField],
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    for chunk in records.chunks(APPEND_CHUNK_ROWS) {
        match sink.append_all(chunk, header).await {
            Ok(outcome) => {
                summary.written += chunk.len();
                if let Some(drift) = outcome.drift() {
                    let warning = drift.to_string();
                    if !summary.warnings.contains(&warning) {
                        summary.warnings.push(warning);
                    }
                }
            }
            Err(error) if error.is_permanent() => return Err(error.into()),
            Err(error) => {
                warn!(rows = chunk.len(), "{error}");
                summary.failed += chunk.len();
            }
        }
    }

    Ok(())
}

struct ReviewLog {
    run_id: String,
    writer: JsonlWriter,
}

impl ReviewLog {
    fn open(path: &Path, run_id: String) -> Result<Self, JsonlError> {
        Ok(Self {
            run_id,
            writer: JsonlWriter::open(path, true)?,
        })
    }

    fn record(
        &mut self,
        thread_id: &str,
        message_id: Option<String>,
        reason: String,
        raw_response: Option<String>,
    ) -> Result<(), JsonlError> {
        self.writer.write(&ReviewEntry {
            run_id: self.run_id.clone(),
            thread_id: thread_id.to_string(),
            message_id,
            reason,
            raw_response,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use chrono_tz::America::Sao_Paulo;
    use reqwest::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    use super::{
        dump, extract, label, push, DumpOptions, ExtractOptions, LabelOptions, PipelineError,
        ReviewEntry,
    };
    use crate::connectors::thread_archive::{collect_thread_files, load_thread_file};
    use crate::connectors::{
        ConnectorError, Label, LlmClient, MailLabeler, MailSource, RetryPolicy, TabularStore,
    };
    use crate::extract::{PromptPayload, QuoteField, QuoteRecord};
    use crate::mail::RawMessage;
    use crate::sink::{read_jsonl, SinkWriter};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("quote-harvest-pipeline-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    struct FakeMailbox {
        threads: Vec<(String, Vec<RawMessage>)>,
    }

    #[async_trait(?Send)]
    impl MailSource for FakeMailbox {
        async fn list_labels(&self) -> Result<Vec<Label>, ConnectorError> {
            Ok(vec![Label {
                id: "Label_7".to_string(),
                name: "COTACOES".to_string(),
                label_type: "user".to_string(),
            }])
        }

        async fn list_messages(
            &self,
            label_ids: &[String],
            _query: Option<&str>,
            _max: Option<usize>,
        ) -> Result<Vec<(String, String)>, ConnectorError> {
            assert_eq!(label_ids, ["Label_7".to_string()]);
            Ok(self
                .threads
                .iter()
                .flat_map(|(thread_id, messages)| {
                    messages
                        .iter()
                        .map(|message| (message.id.clone(), thread_id.clone()))
                })
                .collect())
        }

        async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>, ConnectorError> {
            Ok(self
                .threads
                .iter()
                .find(|(id, _)| id == thread_id)
                .map(|(_, messages)| messages.clone())
                .unwrap_or_default())
        }
    }

    fn raw_message(id: &str, thread_id: &str, millis: i64, subject: &str, body: &str) -> RawMessage {
        serde_json::from_value(json!({
            "id": id,
            "threadId": thread_id,
            "internalDate": millis.to_string(),
            "payload": {
                "mimeType": "text/plain",
                "headers": [
                    { "name": "From", "value": "Hotel Sol <reservas@hotelsol.com.br>" },
                    { "name": "To", "value": "cotacoes@example.com" },
                    { "name": "Subject", "value": subject }
                ],
                "body": { "data": URL_SAFE_NO_PAD.encode(body) }
            }
        }))
        .expect("raw message")
    }

    #[derive(Default)]
    struct LabellingMailbox {
        labels: Vec<Label>,
        threads: Vec<(String, Vec<RawMessage>)>,
        created: RefCell<Vec<String>>,
        applied: RefCell<Vec<(String, String)>>,
    }

    #[async_trait(?Send)]
    impl MailSource for LabellingMailbox {
        async fn list_labels(&self) -> Result<Vec<Label>, ConnectorError> {
            Ok(self.labels.clone())
        }

        async fn list_messages(
            &self,
            label_ids: &[String],
            query: Option<&str>,
            _max: Option<usize>,
        ) -> Result<Vec<(String, String)>, ConnectorError> {
            assert!(label_ids.is_empty());
            assert_eq!(query, Some("newer_than:60d"));
            Ok(self
                .threads
                .iter()
                .flat_map(|(thread_id, messages)| {
                    messages
                        .iter()
                        .map(|message| (message.id.clone(), thread_id.clone()))
                })
                .collect())
        }

        async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>, ConnectorError> {
            Ok(self
                .threads
                .iter()
                .find(|(id, _)| id == thread_id)
                .map(|(_, messages)| messages.clone())
                .unwrap_or_default())
        }
    }

    #[async_trait(?Send)]
    impl MailLabeler for LabellingMailbox {
        async fn create_label(&self, name: &str) -> Result<Label, ConnectorError> {
            self.created.borrow_mut().push(name.to_string());
            Ok(Label {
                id: "Label_Q".to_string(),
                name: name.to_string(),
                label_type: "user".to_string(),
            })
        }

        async fn add_label(&self, message_id: &str, label_id: &str) -> Result<(), ConnectorError> {
            self.applied
                .borrow_mut()
                .push((message_id.to_string(), label_id.to_string()));
            Ok(())
        }
    }

    fn quote_threads() -> Vec<(String, Vec<RawMessage>)> {
        let mut labelled = raw_message(
            "m-3",
            "t-2",
            1_754_740_800_000,
            "Cotação Búzios",
            "Tarifa NET R$ 610,00 por diária, ISS 5%",
        );
        labelled.label_ids = vec!["INBOX".to_string(), "Label_Q".to_string()];

        vec![
            (
                "t-1".to_string(),
                vec![
                    raw_message(
                        "m-1",
                        "t-1",
                        1_754_654_400_000,
                        "Paraty | Hotel Sol",
                        "Duplo luxo R$ 508,20 por diária, check-in 24/11",
                    ),
                    raw_message("m-2", "t-1", 1_754_661_600_000, "Re: Paraty", "Obrigado, até logo."),
                ],
            ),
            ("t-2".to_string(), vec![labelled]),
        ]
    }

    #[tokio::test]
    async fn label_creates_the_label_and_tags_only_quotations() {
        let mailbox = LabellingMailbox {
            threads: quote_threads(),
            ..LabellingMailbox::default()
        };
        let options = LabelOptions {
            label: "QUOTES".to_string(),
            query: Some("newer_than:60d".to_string()),
            max: None,
            dry_run: false,
        };

        let summary = label(&mailbox, &options, Sao_Paulo).await.expect("label");
        assert_eq!(summary.threads, 2);
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(*mailbox.created.borrow(), vec!["QUOTES".to_string()]);
        assert_eq!(
            *mailbox.applied.borrow(),
            vec![("m-1".to_string(), "Label_Q".to_string())]
        );
    }

    #[tokio::test]
    async fn label_dry_run_leaves_the_mailbox_untouched() {
        let mailbox = LabellingMailbox {
            threads: quote_threads(),
            ..LabellingMailbox::default()
        };
        let options = LabelOptions {
            label: "QUOTES".to_string(),
            query: Some("newer_than:60d".to_string()),
            max: None,
            dry_run: true,
        };

        let summary = label(&mailbox, &options, Sao_Paulo).await.expect("dry run");
        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 0);
        assert!(mailbox.created.borrow().is_empty());
        assert!(mailbox.applied.borrow().is_empty());
    }

    struct ScriptedLlm {
        answers: RefCell<VecDeque<Result<String, ConnectorError>>>,
        prompts: RefCell<Vec<PromptPayload>>,
    }

    impl ScriptedLlm {
        fn new(answers: Vec<Result<String, ConnectorError>>) -> Self {
            Self {
                answers: RefCell::new(answers.into()),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    #[async_trait(?Send)]
    impl LlmClient for ScriptedLlm {
        async fn generate(&self, payload: &PromptPayload) -> Result<String, ConnectorError> {
            self.prompts.borrow_mut().push(payload.clone());
            self.answers
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok("{}".to_string()))
        }
    }

    fn extract_options(dir: &std::path::Path) -> ExtractOptions {
        ExtractOptions {
            output: dir.join("out/quotes.jsonl"),
            review_log: dir.join("out/review.jsonl"),
            limit: None,
            append: false,
        }
    }

    #[tokio::test]
    async fn dump_writes_one_document_per_thread() {
        let dir = temp_dir();
        let mailbox = FakeMailbox {
            threads: vec![
                (
                    "t-1".to_string(),
                    vec![
                        raw_message("m-1", "t-1", 1_754_654_400_000, "Cotação grupo", "Olá"),
                        raw_message("m-2", "t-1", 1_754_658_000_000, "Re: Cotação grupo", "Tarifa R$ 500"),
                    ],
                ),
                ("t-2".to_string(), vec![raw_message("m-3", "t-2", 1_754_661_600_000, "Tarifas", "x")]),
            ],
        };
        let options = DumpOptions {
            label: "COTACOES".to_string(),
            out_dir: dir.join("threads"),
            ..DumpOptions::default()
        };

        let summary = dump(&mailbox, &options, Sao_Paulo).await.expect("dump");
        assert_eq!(summary.threads, 2);
        assert_eq!(summary.written, 2);

        let files = collect_thread_files(&options.out_dir).expect("files");
        assert_eq!(files.len(), 2);
        let loaded = files
            .iter()
            .map(|path| load_thread_file(path, Sao_Paulo).expect("load"))
            .find(|archived| archived.thread.id() == "t-1")
            .expect("thread t-1");
        assert_eq!(loaded.thread.len(), 2);
        assert_eq!(loaded.label.as_deref(), Some("COTACOES"));

        let missing = DumpOptions {
            label: "NOPE".to_string(),
            ..options
        };
        assert!(matches!(
            dump(&mailbox, &missing, Sao_Paulo).await,
            Err(PipelineError::UnknownLabel(_))
        ));
        fs::remove_dir_all(dir).ok();
    }

    fn write_thread(dir: &std::path::Path, name: &str, thread_id: &str) {
        fs::write(
            dir.join(name),
            json!({
                "thread_id": thread_id,
                "emails": [{
                    "id": format!("{thread_id}-m1"),
                    "timestamp": "2025-08-08T09:00:00-03:00",
                    "sender": "Hotel Sol <reservas@hotelsol.com.br>",
                    "recipient": "cotacoes@example.com",
                    "subject": "Cotação",
                    "body": "Quarto duplo R$ 450"
                }]
            })
            .to_string(),
        )
        .expect("write thread");
    }

    #[tokio::test]
    async fn extract_writes_records_and_flags_review_items() {
        let dir = temp_dir();
        let threads = dir.join("threads");
        fs::create_dir_all(&threads).expect("threads dir");
        write_thread(&threads, "a.json", "t-a");
        write_thread(&threads, "b.json", "t-b");
        write_thread(&threads, "c.json", "t-c");
        write_thread(&threads, "d.json", "t-d");
        fs::write(threads.join("e.json"), "{ broken").expect("write broken");

        let llm = ScriptedLlm::new(vec![
            Ok(r#"[{"hotel_name":"Hotel Sol","room_type":"duplo"},{"hotel_name":"Hotel Sol","room_type":"triplo"}]"#.to_string()),
            Ok("Claro! Aqui está: {\"hotel_name\": \"Hotel Sol\"} Espero ter ajudado.".to_string()),
            Ok("Desculpe, não encontrei dados.".to_string()),
            Err(ConnectorError::from_status("gemini", StatusCode::SERVICE_UNAVAILABLE, "busy", None)),
        ]);
        let options = extract_options(&dir);

        let summary = extract(&llm, &threads, &options, Sao_Paulo)
            .await
            .expect("extract");
        assert_eq!(summary.threads, 4);
        assert_eq!(summary.written, 4);
        assert_eq!(summary.clean, 2);
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.needs_review, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);

        let records = read_jsonl::<QuoteRecord>(&options.output).expect("records");
        assert_eq!(records.items.len(), 4);
        assert_eq!(records.items[1].get(QuoteField::RoomType), "triplo");
        assert_eq!(records.items[3].get(QuoteField::HotelName), "");
        assert_eq!(records.items[3].get(QuoteField::Subject), "Cotação");

        let review = read_jsonl::<ReviewEntry>(&options.review_log).expect("review");
        assert_eq!(review.items.len(), 4);
        assert!(review.items.iter().all(|entry| entry.run_id == summary.run_id));
        assert_eq!(review.items[0].thread_id, "t-b");
        assert!(review.items[0].raw_response.as_deref().is_some_and(|raw| raw.contains("Claro")));
        assert_eq!(review.items[2].thread_id, "t-d");
        assert!(review.items[2].raw_response.is_none());
        assert_eq!(review.items[3].thread_id, "e");
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn rejected_model_credentials_abort_extraction() {
        let dir = temp_dir();
        let threads = dir.join("threads");
        fs::create_dir_all(&threads).expect("threads dir");
        write_thread(&threads, "a.json", "t-a");
        write_thread(&threads, "b.json", "t-b");

        let llm = ScriptedLlm::new(vec![Err(ConnectorError::credentials_rejected(
            "gemini",
            StatusCode::FORBIDDEN,
            "bad key",
        ))]);
        let err = extract(&llm, &threads, &extract_options(&dir), Sao_Paulo)
            .await
            .expect_err("fatal");
        assert!(matches!(err, PipelineError::Connector(ref e) if e.is_fatal()));
        assert_eq!(llm.prompts.borrow().len(), 1);
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn extract_honours_limit() {
        let dir = temp_dir();
        let threads = dir.join("threads");
        fs::create_dir_all(&threads).expect("threads dir");
        write_thread(&threads, "a.json", "t-a");
        write_thread(&threads, "b.json", "t-b");

        let llm = ScriptedLlm::new(Vec::new());
        let options = ExtractOptions {
            limit: Some(1),
            ..extract_options(&dir)
        };
        let summary = extract(&llm, &threads, &options, Sao_Paulo).await.expect("extract");
        assert_eq!(summary.threads, 1);
        assert!(llm.prompts.borrow()[0].user_prompt.contains("Quarto duplo R$ 450"));
        fs::remove_dir_all(dir).ok();
    }

    #[derive(Default)]
    struct MemoryStore {
        rows: RefCell<Vec<Vec<String>>>,
    }

    #[async_trait(?Send)]
    impl TabularStore for MemoryStore {
        async fn read_header(&self) -> Result<Option<Vec<String>>, ConnectorError> {
            Ok(Some(
                QuoteField::ALL.iter().map(|field| field.key().to_string()).collect(),
            ))
        }

        async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), ConnectorError> {
            self.rows.borrow_mut().extend_from_slice(rows);
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_skips_invalid_lines_and_pads_partial_records() {
        let dir = temp_dir();
        let input = dir.join("quotes.jsonl");
        let mut valid = QuoteRecord::default();
        valid.set(QuoteField::HotelName, "Hotel Sol");
        let line = serde_json::to_string(&valid).expect("serialize");
        fs::write(
            &input,
            format!("{line}\n{{\"hotel_name\":\"Pousada Lua\",\"Cidade\":\"Paraty\"}}\nnot json\n[1, 2]\n{line}\n"),
        )
        .expect("write input");

        let sink = SinkWriter::new(
            MemoryStore::default(),
            RetryPolicy {
                max_retries: 0,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
        );
        let summary = push(&sink, &input, &QuoteField::ALL).await.expect("push");
        assert_eq!(summary.written, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].starts_with("1 records"));

        let rows = sink.store().rows.borrow();
        assert_eq!(rows[0][4], "Hotel Sol");
        assert_eq!(rows[1].len(), 15);
        assert_eq!(rows[1][4], "Pousada Lua");
        assert_eq!(rows[1][5], "");
        drop(rows);
        fs::remove_dir_all(dir).ok();
    }
}
