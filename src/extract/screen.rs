use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Minimum score for a message to count as a quotation.
pub const QUOTE_THRESHOLD: i32 = 3;

/// Keyword hits stop adding to the score past this many.
const MAX_KEYWORD_POINTS: usize = 3;

/// Already folded to lowercase ASCII, matched on word boundaries.
const KEYWORDS: &[&str] = &[
    "cotacao",
    "orcamento",
    "quote",
    "quotation",
    "proposal",
    "tarifa",
    "tarifas",
    "diaria",
    "diarias",
    "disponibilidade",
    "sgl",
    "dbl",
    "twin",
    "triplo",
    "standard",
    "luxo",
    "superior",
    "iss",
    "net",
    "comissionada",
    "nao reembolsavel",
    "formas de pagamento",
    "pre pagamento",
    "bloqueio",
    "apartamentos",
    "categoria",
    "frente mar",
    "vista",
    "cafe da manha",
];

static KEYWORD_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    KEYWORDS
        .iter()
        .map(|keyword| {
            Regex::new(&format!(r"\b{}\b", regex::escape(keyword))).expect("compile keyword regex")
        })
        .collect()
});
static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:r\$\s?|\bbrl\s?|\busd\s?|\$\s?)\d{1,3}(?:[.,]\d{3})*(?:[.,]\d{2})?")
        .expect("compile currency regex")
});
static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,2}\s?%").expect("compile percent regex"));
static DATE_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:check[-\s]?in|check[-\s]?out|diarias?|noites?|jan|fev|mar|abr|mai|jun|jul|ago|set|out|nov|dez|[0-3]?\d/[0-1]?\d(?:/\d{2,4})?)\b",
    )
    .expect("compile date hint regex")
});

/// Evidence that a message carries a hotel quotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuoteScore {
    pub currency: bool,
    pub percent: bool,
    pub date_hint: bool,
    pub keywords: usize,
    /// Three or more question marks and no price: a request, not an answer.
    pub question_penalty: bool,
}

impl QuoteScore {
    pub fn total(&self) -> i32 {
        let mut total = 0;
        if self.currency {
            total += 2;
        }
        if self.percent {
            total += 1;
        }
        if self.date_hint {
            total += 1;
        }
        total += self.keywords.min(MAX_KEYWORD_POINTS) as i32;
        if self.question_penalty {
            total -= 1;
        }
        total
    }

    pub fn is_quote(&self) -> bool {
        self.total() >= QUOTE_THRESHOLD
    }
}

/// Scores `subject` and `body` for prices, percentages, stay dates and
/// quotation vocabulary. Accents and case are ignored.
pub fn score_quote(subject: &str, body: &str) -> QuoteScore {
    let text = fold(&format!("{subject}\n{body}"));
    let currency = CURRENCY_RE.is_match(&text);

    QuoteScore {
        currency,
        percent: PERCENT_RE.is_match(&text),
        date_hint: DATE_HINT_RE.is_match(&text),
        keywords: KEYWORD_RES.iter().filter(|re| re.is_match(&text)).count(),
        question_penalty: !currency && body.matches('?').count() >= 3,
    }
}

pub fn looks_like_quote(subject: &str, body: &str) -> bool {
    score_quote(subject, body).is_quote()
}

/// Lowercases and strips combining marks, so `Cotação` reads `cotacao`.
fn fold(text: &str) -> String {
    text.to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}
