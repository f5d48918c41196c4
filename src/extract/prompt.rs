use std::fmt::Write as _;

use indoc::formatdoc;
use serde::Serialize;

use crate::extract::clean::{clean, CleanedBody};
use crate::extract::schema::{QuoteField, TIMESTAMP_FORMAT};
use crate::mail::{SimplifiedMessage, Thread};

/// Everything the model receives for one extraction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptPayload {
    pub system_instruction: String,
    pub user_prompt: String,
}

pub fn system_instruction() -> String {
    let fields = QuoteField::ALL
        .iter()
        .map(|field| format!("- {}: {}", field.key(), field.description()))
        .collect::<Vec<_>>()
        .join("\n");

    formatdoc! {r#"
        You extract hotel quotation data from emails, most of them written in Brazilian Portuguese.
        You receive one or more messages of a single email thread, oldest first, each with its metadata and a cleaned body.
        Focus on the parts where a hotel or inn states availability, prices and policies.

        Fields, with these exact keys:
        {fields}

        Respond with JSON only:
        - a single object with exactly these keys when the quote covers one room type;
        - an array of such objects, one per room type, when several room types are quoted.
        Use the empty string "" for anything the emails do not state. Never invent values and never add keys.
        Copy values as written in the email, keeping currency and units.
        When messages contradict each other, prefer the most recent message."#}
}

/// Prompt for a single message whose body has already been cleaned.
pub fn build_prompt(message: &SimplifiedMessage, body: &CleanedBody) -> PromptPayload {
    PromptPayload {
        system_instruction: system_instruction(),
        user_prompt: user_prompt(&[(message, body)]),
    }
}

/// Prompt covering every message of `thread`, each body cleaned, oldest first.
pub fn build_thread_prompt(thread: &Thread) -> PromptPayload {
    let bodies: Vec<CleanedBody> = thread
        .messages()
        .iter()
        .map(|message| clean(&message.body))
        .collect();
    let blocks: Vec<(&SimplifiedMessage, &CleanedBody)> =
        thread.messages().iter().zip(bodies.iter()).collect();

    PromptPayload {
        system_instruction: system_instruction(),
        user_prompt: user_prompt(&blocks),
    }
}

fn user_prompt(blocks: &[(&SimplifiedMessage, &CleanedBody)]) -> String {
    let mut prompt = format!(
        "Extract the quotation fields from the {} message(s) below.\n",
        blocks.len()
    );

    for (index, (message, body)) in blocks.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n### Message {number}\nTimestamp: {timestamp}\nSender: {sender}\nRecipient: {recipient}\nSubject: {subject}\nBody:\n---\n{body}\n---\n",
            number = index + 1,
            timestamp = message.timestamp.format(TIMESTAMP_FORMAT),
            sender = message.sender,
            recipient = message.recipient,
            subject = message.subject.trim(),
            body = body,
        );
    }

    prompt
}
