use std::cell::{OnceCell, RefCell};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use thiserror::Error;
use tracing::{debug, warn};

use crate::connectors::{with_retry, ConnectorError, RetryPolicy, TabularStore};
use crate::extract::{QuoteField, QuoteRecord};

pub mod jsonl;

pub use jsonl::{read_jsonl, JsonlWriter};

/// Rows per `append_rows` call.
pub const APPEND_CHUNK_ROWS: usize = 200;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Access denied, missing spreadsheet and other failures a retry cannot fix.
    #[error("sink rejected the write: {0}")]
    Permanent(#[source] ConnectorError),

    /// Still failing after the retry budget was spent.
    #[error("sink unavailable after retries: {0}")]
    Transient(#[source] ConnectorError),
}

impl SinkError {
    fn from_connector(error: ConnectorError) -> Self {
        if error.is_transient() {
            Self::Transient(error)
        } else {
            Self::Permanent(error)
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// The store's header row did not match the expected column keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderDrift {
    pub expected: Vec<String>,
    /// `None` when the store has no header row at all.
    pub actual: Option<Vec<String>>,
}

impl Display for HeaderDrift {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.actual {
            None => write!(f, "sink has no header row; expected {} columns", self.expected.len()),
            Some(actual) => write!(
                f,
                "sink header has {} columns [{}], expected {} [{}]",
                actual.len(),
                actual.join(", "),
                self.expected.len(),
                self.expected.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    Warned(HeaderDrift),
}

impl AppendOutcome {
    pub fn drift(&self) -> Option<&HeaderDrift> {
        match self {
            AppendOutcome::Written => None,
            AppendOutcome::Warned(drift) => Some(drift),
        }
    }
}

/// Appends records to a [`TabularStore`] in a fixed column order.
///
/// The store's header is read once, on the first append, and compared to the
/// expected keys of each call. A mismatch is logged once per expected header and
/// reported in every outcome but never blocks the write.
pub struct SinkWriter<S> {
    store: S,
    retry: RetryPolicy,
    stored_header: OnceCell<Option<Vec<String>>>,
    warned: RefCell<HashSet<Vec<QuoteField>>>,
}

impl<S: TabularStore> SinkWriter<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            stored_header: OnceCell::new(),
            warned: RefCell::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn append(
        &self,
        record: &QuoteRecord,
        expected_header: &[QuoteField],
    ) -> Result<AppendOutcome, SinkError> {
        self.append_all(std::slice::from_ref(record), expected_header)
            .await
    }

    /// Writes `records` in chunks of [`APPEND_CHUNK_ROWS`]. The first error stops
    /// the batch; earlier chunks stay written.
    pub async fn append_all(
        &self,
        records: &[QuoteRecord],
        expected_header: &[QuoteField],
    ) -> Result<AppendOutcome, SinkError> {
        let drift = self.check_header(expected_header).await?;
        if records.is_empty() {
            return Ok(outcome(drift));
        }

        for chunk in records.chunks(APPEND_CHUNK_ROWS) {
            let rows: Vec<Vec<String>> = chunk
                .iter()
                .map(|record| record.to_row(expected_header))
                .collect();
            with_retry(&self.retry, "sink append", || self.store.append_rows(&rows))
                .await
                .map_err(SinkError::from_connector)?;
            debug!(rows = rows.len(), "appended chunk");
        }

        Ok(outcome(drift))
    }

    async fn check_header(
        &self,
        expected_header: &[QuoteField],
    ) -> Result<Option<HeaderDrift>, SinkError> {
        let actual = match self.stored_header.get() {
            Some(actual) => actual.clone(),
            None => {
                let actual =
                    with_retry(&self.retry, "sink header read", || self.store.read_header())
                        .await
                        .map_err(SinkError::from_connector)?;
                self.stored_header.get_or_init(|| actual).clone()
            }
        };

        let drift = compare_header(expected_header, actual);
        if let Some(drift) = &drift {
            if self.warned.borrow_mut().insert(expected_header.to_vec()) {
                warn!("{drift}; appending anyway");
            }
        }
        Ok(drift)
    }
}

fn outcome(drift: Option<HeaderDrift>) -> AppendOutcome {
    match drift {
        Some(drift) => AppendOutcome::Warned(drift),
        None => AppendOutcome::Written,
    }
}

/// Trailing empty cells are ignored; anything else must match key for key.
pub fn compare_header(expected: &[QuoteField], actual: Option<Vec<String>>) -> Option<HeaderDrift> {
    let expected: Vec<String> = expected.iter().map(|field| field.key().to_string()).collect();
    let actual = actual.map(|mut row| {
        while row.last().is_some_and(|cell| cell.trim().is_empty()) {
            row.pop();
        }
        row
    });

    let matches = actual.as_ref().is_some_and(|row| {
        row.len() == expected.len()
            && row
                .iter()
                .zip(&expected)
                .all(|(cell, key)| cell.trim() == key)
    });
    if matches {
        None
    } else {
        Some(HeaderDrift {
            expected,
            actual: actual.filter(|row| !row.is_empty()),
        })
    }
}
