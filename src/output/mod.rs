pub mod json;
pub mod table;

use anyhow::Result;
use serde::Serialize;

use crate::connectors::Label;
use crate::extract::{clean, PromptPayload};
use crate::mail::{SimplifiedMessage, Thread};
use crate::pipeline::RunSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

/// A message as `show` prints it: the stored body and what the cleaner keeps.
#[derive(Debug, Clone, Serialize)]
pub struct ShownMessage<'a> {
    #[serde(flatten)]
    pub message: &'a SimplifiedMessage,
    pub cleaned_body: String,
}

impl<'a> ShownMessage<'a> {
    pub fn new(message: &'a SimplifiedMessage) -> Self {
        Self {
            message,
            cleaned_body: clean(&message.body).into_inner(),
        }
    }
}

pub fn format_summary(format: OutputFormat, title: &str, summary: &RunSummary) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_summary(title, summary)),
        OutputFormat::Json => json::format_summary(summary),
    }
}

pub fn format_labels(format: OutputFormat, labels: &[Label]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_labels(labels)),
        OutputFormat::Json => json::format_labels(labels),
    }
}

pub fn format_thread(format: OutputFormat, thread: &Thread) -> Result<String> {
    let shown: Vec<ShownMessage<'_>> = thread.messages().iter().map(ShownMessage::new).collect();
    match format {
        OutputFormat::Table => Ok(table::format_thread(thread.id(), &shown)),
        OutputFormat::Json => json::format_thread(&shown),
    }
}

pub fn format_prompt(format: OutputFormat, payload: &PromptPayload) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_prompt(payload)),
        OutputFormat::Json => json::format_prompt(payload),
    }
}
