use anyhow::Result;

use crate::connectors::Label;
use crate::extract::PromptPayload;
use crate::output::ShownMessage;
use crate::pipeline::RunSummary;

pub fn format_summary(summary: &RunSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}

pub fn format_labels(labels: &[Label]) -> Result<String> {
    Ok(serde_json::to_string_pretty(labels)?)
}

pub fn format_thread(messages: &[ShownMessage<'_>]) -> Result<String> {
    Ok(serde_json::to_string_pretty(messages)?)
}

pub fn format_prompt(payload: &PromptPayload) -> Result<String> {
    Ok(serde_json::to_string_pretty(payload)?)
}
