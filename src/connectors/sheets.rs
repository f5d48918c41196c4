use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SheetsConfig;
use crate::connectors::google_auth::{
    ServiceAccountAuth, ServiceAccountKey, TokenSource, SHEETS_SCOPE,
};
use crate::connectors::{http_client, retry_after, ConnectorError, RetryPolicy, TabularStore};

const SERVICE: &str = "google sheets";
const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct AppendBody<'a> {
    values: &'a [Vec<String>],
}

/// One worksheet of a spreadsheet, addressed through the Sheets values API.
///
/// Requests are attempted once; retrying is left to the caller.
pub struct SheetsStore {
    client: Client,
    auth: Box<dyn TokenSource>,
    base_url: String,
    spreadsheet_id: String,
    worksheet: String,
}

impl SheetsStore {
    pub fn new(
        config: SheetsConfig,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = http_client(SERVICE, timeout)?;
        let key = ServiceAccountKey::from_file(&config.service_account_key)?;
        let auth = ServiceAccountAuth::new(client.clone(), key, SHEETS_SCOPE, retry)?;
        debug!(client_email = %auth.client_email(), "using service account for sheets");
        Ok(Self::with_token_source(client, Box::new(auth), config))
    }

    pub fn with_token_source(
        client: Client,
        auth: Box<dyn TokenSource>,
        config: SheetsConfig,
    ) -> Self {
        Self {
            client,
            auth,
            base_url: SHEETS_API_BASE.to_string(),
            spreadsheet_id: config.spreadsheet_id,
            worksheet: config.worksheet,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn values_url(&self, range_segment: &str) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ConnectorError::Config(format!("invalid sheets api url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ConnectorError::Config("sheets api url cannot be a base".to_string()))?
            .push("spreadsheets")
            .push(&self.spreadsheet_id)
            .push("values")
            .push(range_segment);
        Ok(url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<String, ConnectorError> {
        let token = self.auth.access_token().await?;
        debug!(%method, %url, "sheets api request");

        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|source| ConnectorError::transport(SERVICE, source))?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|source| ConnectorError::transport(SERVICE, source))?;
        if !status.is_success() {
            if status.as_u16() == 401 {
                self.auth.invalidate();
            }
            return Err(ConnectorError::from_status(SERVICE, status, &text, wait));
        }

        Ok(text)
    }
}

/// Quotes a worksheet title for A1 notation when it is not a plain identifier.
pub fn a1_sheet_name(worksheet: &str) -> String {
    if !worksheet.is_empty()
        && worksheet
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        worksheet.to_string()
    } else {
        format!("'{}'", worksheet.replace('\'', "''"))
    }
}

#[async_trait(?Send)]
impl TabularStore for SheetsStore {
    async fn read_header(&self) -> Result<Option<Vec<String>>, ConnectorError> {
        let url = self.values_url(&format!("{}!1:1", a1_sheet_name(&self.worksheet)))?;
        let body = self.send::<()>(Method::GET, url, None).await?;
        let range: ValueRange =
            serde_json::from_str(&body).map_err(|e| ConnectorError::decode(SERVICE, e))?;

        Ok(range.values.into_iter().next().map(|row| {
            row.into_iter()
                .map(|cell| match cell {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                })
                .collect()
        }))
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), ConnectorError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut url =
            self.values_url(&format!("{}!A1:append", a1_sheet_name(&self.worksheet)))?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED")
            .append_pair("insertDataOption", "INSERT_ROWS");

        self.send(Method::POST, url, Some(&AppendBody { values: rows }))
            .await?;
        debug!(rows = rows.len(), worksheet = %self.worksheet, "appended rows");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use reqwest::Client;
    use serde_json::json;

    use super::{a1_sheet_name, SheetsStore};
    use crate::config::SheetsConfig;
    use crate::connectors::google_auth::TokenSource;
    use crate::connectors::{test_server, ConnectorError, TabularStore};

    struct StaticToken;

    #[async_trait(?Send)]
    impl TokenSource for StaticToken {
        async fn access_token(&self) -> Result<String, ConnectorError> {
            Ok("sheets-token".to_string())
        }

        fn invalidate(&self) {}
    }

    fn store(base: &str, worksheet: &str) -> SheetsStore {
        SheetsStore::with_token_source(
            Client::new(),
            Box::new(StaticToken),
            SheetsConfig {
                spreadsheet_id: "sheet-123".to_string(),
                worksheet: worksheet.to_string(),
                service_account_key: "/dev/null".into(),
            },
        )
        .with_base_url(base)
    }

    #[test]
    fn sheet_names_are_quoted_when_needed() {
        assert_eq!(a1_sheet_name("quotes"), "quotes");
        assert_eq!(a1_sheet_name("Cotações 2025"), "'Cotações 2025'");
        assert_eq!(a1_sheet_name("it's"), "'it''s'");
    }

    #[tokio::test]
    async fn header_is_read_from_the_first_row() {
        let (base, recorded, _server) = test_server::spawn(vec![
            (
                200,
                json!({ "range": "quotes!A1:C1", "values": [["hotel_name", "hotel_city", 3]] }).to_string(),
            ),
            (200, json!({ "range": "quotes!1:1" }).to_string()),
        ])
        .await;

        let sheets = store(&base, "quotes");
        let header = sheets.read_header().await.expect("read header");
        assert_eq!(
            header,
            Some(vec!["hotel_name".to_string(), "hotel_city".to_string(), "3".to_string()])
        );
        assert_eq!(sheets.read_header().await.expect("empty sheet"), None);

        let requests = recorded.lock().expect("lock requests");
        assert!(requests[0]
            .request_line
            .starts_with("GET /spreadsheets/sheet-123/values/quotes!1:1"));
    }

    #[tokio::test]
    async fn rows_are_appended_as_user_entered() {
        let (base, recorded, _server) =
            test_server::spawn(vec![(200, json!({ "updates": { "updatedRows": 2 } }).to_string())])
                .await;

        store(&base, "Cotações 2025")
            .append_rows(&[
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string(), "d".to_string()],
            ])
            .await
            .expect("append rows");

        let requests = recorded.lock().expect("lock requests");
        let line = &requests[0].request_line;
        assert!(line.starts_with("POST /spreadsheets/sheet-123/values/"));
        assert!(line.contains("!A1:append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS"));
        assert!(line.contains("Cota%C3%A7%C3%B5es%202025"));
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).expect("body json");
        assert_eq!(body, json!({ "values": [["a", "b"], ["c", "d"]] }));
    }

    #[tokio::test]
    async fn missing_spreadsheet_is_permanent() {
        let (base, _recorded, _server) =
            test_server::spawn(vec![(404, r#"{"error":{"status":"NOT_FOUND"}}"#.to_string())]).await;

        let err = store(&base, "quotes")
            .append_rows(&[vec!["x".to_string()]])
            .await
            .expect_err("not found");
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(404));
    }
}
