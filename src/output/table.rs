use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::connectors::Label;
use crate::extract::PromptPayload;
use crate::output::ShownMessage;
use crate::pipeline::RunSummary;

const LABEL_NAME_WIDTH: usize = 40;
const LABEL_ID_WIDTH: usize = 24;

pub fn format_summary(title: &str, summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("{title}\n"));
    out.push_str(&format!("{}\n", "=".repeat(UnicodeWidthStr::width(title))));
    out.push_str(&format!("Run:          {}\n", summary.run_id));
    out.push_str(&format!("Threads:      {}\n", summary.threads));
    if summary.messages > 0 {
        out.push_str(&format!("Messages:     {}\n", summary.messages));
    }
    out.push_str(&format!("Written:      {}\n", summary.written));
    out.push_str(&format!("  clean:        {}\n", summary.clean));
    out.push_str(&format!("  recovered:    {}\n", summary.recovered));
    out.push_str(&format!("  needs review: {}\n", summary.needs_review));
    out.push_str(&format!("Failed:       {}\n", summary.failed));
    out.push_str(&format!("Skipped:      {}\n", summary.skipped));

    if !summary.warnings.is_empty() {
        out.push('\n');
        out.push_str("Warnings\n");
        out.push_str("--------\n");
        for warning in &summary.warnings {
            out.push_str(&format!("- {warning}\n"));
        }
    }

    out
}

pub fn format_labels(labels: &[Label]) -> String {
    if labels.is_empty() {
        return "No labels found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{}  {}  Type\n",
        pad_to_width("Name", LABEL_NAME_WIDTH),
        pad_to_width("ID", LABEL_ID_WIDTH)
    ));
    out.push_str(&format!(
        "{}  {}  {}\n",
        "-".repeat(LABEL_NAME_WIDTH),
        "-".repeat(LABEL_ID_WIDTH),
        "-".repeat(6)
    ));
    for label in labels {
        out.push_str(&format!(
            "{}  {}  {}\n",
            pad_to_width(&truncate_for_width(&label.name, LABEL_NAME_WIDTH), LABEL_NAME_WIDTH),
            pad_to_width(&truncate_for_width(&label.id, LABEL_ID_WIDTH), LABEL_ID_WIDTH),
            label.label_type.to_ascii_lowercase()
        ));
    }

    out
}

pub fn format_thread(thread_id: &str, messages: &[ShownMessage<'_>]) -> String {
    if messages.is_empty() {
        return "Thread has no messages.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("Thread: {thread_id} ({} messages)\n", messages.len()));
    for shown in messages {
        let message = shown.message;
        out.push('\n');
        out.push_str(&"-".repeat(80));
        out.push('\n');
        out.push_str(&format!("ID: {}\n", message.id));
        out.push_str(&format!("Date: {}\n", message.timestamp.to_rfc3339()));
        out.push_str(&format!("From: {}\n", or_placeholder(&message.sender.to_string(), "(unknown)")));
        out.push_str(&format!("To: {}\n", or_placeholder(&message.recipient.to_string(), "(unknown)")));
        out.push_str(&format!("Subject: {}\n", or_placeholder(&message.subject, "(no subject)")));
        out.push('\n');
        out.push_str("Cleaned body\n");
        out.push_str("------------\n");
        out.push_str(or_placeholder(&shown.cleaned_body, "(empty)"));
        out.push('\n');
    }
    out
}

pub fn format_prompt(payload: &PromptPayload) -> String {
    let mut out = String::new();
    out.push_str("System instruction\n");
    out.push_str("==================\n");
    out.push_str(&payload.system_instruction);
    out.push_str("\n\nUser prompt\n");
    out.push_str("===========\n");
    out.push_str(&payload.user_prompt);
    out.push('\n');
    out
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

fn pad_to_width(value: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(used)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
