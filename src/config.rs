use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::connectors::RetryPolicy;
use crate::extract::{QuoteField, FIELD_COUNT};

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Sao_Paulo;
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_WORKSHEET: &str = "quotes";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub service_account_key: PathBuf,
}

/// Process-wide settings, built once at startup and passed down by reference.
///
/// Section getters fail lazily so a command only needs the variables of the
/// services it actually talks to.
#[derive(Debug, Clone)]
pub struct Config {
    pub timezone: Tz,
    pub header: Vec<QuoteField>,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    gmail_client_id: Option<String>,
    gmail_client_secret: Option<String>,
    gmail_refresh_token: Option<String>,
    gmail_token_url: Option<String>,
    gemini_api_key: Option<String>,
    gemini_model: Option<String>,
    gemini_api_base: Option<String>,
    sheet_id: Option<String>,
    sheet_worksheet: Option<String>,
    service_account_key: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let timezone = match get("QUOTES_TIMEZONE") {
            Some(raw) => Tz::from_str(&raw).map_err(|e| ConfigError::Invalid {
                key: "QUOTES_TIMEZONE",
                reason: e.to_string(),
            })?,
            None => DEFAULT_TIMEZONE,
        };

        let header = match get("QUOTES_HEADER_FIELDS") {
            Some(raw) => parse_header_fields(&raw)?,
            None => QuoteField::ALL.to_vec(),
        };

        let max_retries = match get("QUOTES_MAX_RETRIES") {
            Some(raw) => raw.parse::<usize>().map_err(|e| ConfigError::Invalid {
                key: "QUOTES_MAX_RETRIES",
                reason: e.to_string(),
            })?,
            None => DEFAULT_MAX_RETRIES,
        };

        let timeout_secs = match get("QUOTES_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: "QUOTES_REQUEST_TIMEOUT_SECS",
                reason: e.to_string(),
            })?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "QUOTES_REQUEST_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let service_account_key = get("GOOGLE_SERVICE_ACCOUNT_KEY")
            .map(PathBuf::from)
            .or_else(default_service_account_key_path);

        Ok(Self {
            timezone,
            header,
            retry: RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            },
            request_timeout: Duration::from_secs(timeout_secs),
            gmail_client_id: get("GMAIL_CLIENT_ID"),
            gmail_client_secret: get("GMAIL_CLIENT_SECRET"),
            gmail_refresh_token: get("GMAIL_REFRESH_TOKEN"),
            gmail_token_url: get("GMAIL_TOKEN_URL"),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL_NAME"),
            gemini_api_base: get("GEMINI_API_BASE"),
            sheet_id: get("SHEET_ID"),
            sheet_worksheet: get("SHEET_WORKSHEET"),
            service_account_key,
        })
    }

    pub fn gmail(&self) -> Result<GmailConfig, ConfigError> {
        Ok(GmailConfig {
            client_id: required(&self.gmail_client_id, "GMAIL_CLIENT_ID")?,
            client_secret: required(&self.gmail_client_secret, "GMAIL_CLIENT_SECRET")?,
            refresh_token: required(&self.gmail_refresh_token, "GMAIL_REFRESH_TOKEN")?,
            token_url: self
                .gmail_token_url
                .clone()
                .unwrap_or_else(|| DEFAULT_GOOGLE_TOKEN_URL.to_string()),
        })
    }

    pub fn gemini(&self) -> Result<GeminiConfig, ConfigError> {
        Ok(GeminiConfig {
            api_key: required(&self.gemini_api_key, "GEMINI_API_KEY")?,
            model: self
                .gemini_model
                .clone()
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            api_base: self
                .gemini_api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
        })
    }

    pub fn sheets(&self) -> Result<SheetsConfig, ConfigError> {
        Ok(SheetsConfig {
            spreadsheet_id: required(&self.sheet_id, "SHEET_ID")?,
            worksheet: self
                .sheet_worksheet
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKSHEET.to_string()),
            service_account_key: self
                .service_account_key
                .clone()
                .ok_or(ConfigError::Missing("GOOGLE_SERVICE_ACCOUNT_KEY"))?,
        })
    }
}

fn required(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value.clone().ok_or(ConfigError::Missing(key))
}

fn default_service_account_key_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".quote-harvest").join("service-account.json"))
}

/// Parses a comma-separated column list; it must name every canonical field once.
pub fn parse_header_fields(raw: &str) -> Result<Vec<QuoteField>, ConfigError> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut seen = HashSet::new();

    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let field = name
            .parse::<QuoteField>()
            .map_err(|reason| ConfigError::Invalid {
                key: "QUOTES_HEADER_FIELDS",
                reason,
            })?;
        if !seen.insert(field) {
            return Err(ConfigError::Invalid {
                key: "QUOTES_HEADER_FIELDS",
                reason: format!("duplicate column '{name}'"),
            });
        }
        fields.push(field);
    }

    if fields.len() != FIELD_COUNT {
        return Err(ConfigError::Invalid {
            key: "QUOTES_HEADER_FIELDS",
            reason: format!("expected {FIELD_COUNT} columns, got {}", fields.len()),
        });
    }

    Ok(fields)
}
