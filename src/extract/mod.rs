pub mod clean;
pub mod prompt;
pub mod schema;
pub mod screen;

pub use clean::{clean, CleanedBody};
pub use prompt::{build_prompt, build_thread_prompt, PromptPayload};
pub use schema::{
    enforce, enforce_all, Backfill, EnforcedRecord, LlmResponse, LooseRecord, QuoteCandidate,
    QuoteField, QuoteRecord, RecordStatus, SubjectHints, FIELD_COUNT, UNKNOWN,
};
pub use screen::{looks_like_quote, score_quote, QuoteScore, QUOTE_THRESHOLD};
