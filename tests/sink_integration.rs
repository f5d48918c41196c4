use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quote_harvest::config::{Config, SheetsConfig};
use quote_harvest::connectors::google_auth::TokenSource;
use quote_harvest::connectors::{ConnectorError, RetryPolicy, SheetsStore};
use quote_harvest::extract::{QuoteField, QuoteRecord};
use quote_harvest::pipeline::push;
use quote_harvest::sink::{JsonlWriter, SinkWriter};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

fn temp_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("quote-harvest-sink-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    root
}

struct FixedToken;

#[async_trait(?Send)]
impl TokenSource for FixedToken {
    async fn access_token(&self) -> Result<String, ConnectorError> {
        Ok("it-token".to_string())
    }

    fn invalidate(&self) {}
}

/// Minimal Sheets stand-in: answers each connection with the next canned
/// response and keeps `(request line, body)` pairs.
async fn spawn_sheets(responses: Vec<(u16, Value)>) -> (String, Arc<Mutex<Vec<(String, String)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            let mut raw = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = stream.read(&mut chunk).await.unwrap_or(0);
                if read == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&raw);
                if let Some((head, rest)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if rest.len() >= length {
                        break;
                    }
                }
            }

            let text = String::from_utf8_lossy(&raw).to_string();
            let (head, body_in) = text.split_once("\r\n\r\n").unwrap_or((text.as_str(), ""));
            let request_line = head.lines().next().unwrap_or_default().to_string();
            sink.lock()
                .expect("lock")
                .push((request_line, body_in.to_string()));

            let payload = body.to_string();
            let response = format!(
                "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                payload.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (format!("http://{addr}"), seen)
}

fn sheets_writer(base: &str) -> SinkWriter<SheetsStore> {
    let store = SheetsStore::with_token_source(
        Client::new(),
        Box::new(FixedToken),
        SheetsConfig {
            spreadsheet_id: "spreadsheet-it".to_string(),
            worksheet: "Cotações".to_string(),
            service_account_key: PathBuf::from("/unused"),
        },
    )
    .with_base_url(base);
    SinkWriter::new(
        store,
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        },
    )
}

fn record(hotel: &str) -> QuoteRecord {
    let mut record = QuoteRecord::default();
    record.set(QuoteField::Timestamp, "2025-08-08 09:00");
    record.set(QuoteField::Subject, "Cotação grupo");
    record.set(QuoteField::HotelName, hotel);
    record.set(QuoteField::CancellationPolicy, "até 7 dias antes");
    record
}

#[tokio::test]
async fn fourteen_column_header_is_warned_and_rows_keep_fifteen_values() {
    let root = temp_root();
    let input = root.join("quotes.jsonl");
    {
        let mut writer = JsonlWriter::open(&input, false).expect("open jsonl");
        writer.write(&record("Hotel Sol")).expect("write");
        writer.write(&record("Hotel Lua")).expect("write");
    }

    let fourteen: Vec<&str> = QuoteField::ALL[..14].iter().map(|field| field.key()).collect();
    let (base, seen) = spawn_sheets(vec![
        (200, json!({ "range": "Cotações!1:1", "values": [fourteen] })),
        (503, json!({ "error": { "status": "UNAVAILABLE" } })),
        (200, json!({ "updates": { "updatedRows": 2 } })),
    ])
    .await;

    let writer = sheets_writer(&base);
    let summary = push(&writer, &input, &QuoteField::ALL).await.expect("push");
    assert_eq!(summary.written, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("14 columns"));

    let requests = seen.lock().expect("lock").clone();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].0.starts_with("GET "));
    assert!(requests[2].0.starts_with("POST "));
    let body: Value = serde_json::from_str(&requests[2].1).expect("append body");
    let rows = body["values"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].as_array().map(Vec::len), Some(15));
    assert_eq!(rows[0][4], "Hotel Sol");
    assert_eq!(rows[1][14], "até 7 dias antes");

    std::fs::remove_dir_all(root).ok();
}

#[tokio::test]
async fn denied_spreadsheet_aborts_before_writing() {
    let root = temp_root();
    let input = root.join("quotes.jsonl");
    {
        let mut writer = JsonlWriter::open(&input, false).expect("open jsonl");
        writer.write(&record("Hotel Sol")).expect("write");
    }

    let (base, seen) = spawn_sheets(vec![(
        403,
        json!({ "error": { "status": "PERMISSION_DENIED" } }),
    )])
    .await;

    let err = push(&sheets_writer(&base), &input, &QuoteField::ALL)
        .await
        .expect_err("permission denied");
    assert!(err.to_string().contains("403"));
    assert_eq!(seen.lock().expect("lock").len(), 1);

    std::fs::remove_dir_all(root).ok();
}

#[test]
fn configured_header_order_drives_row_order() {
    let mut keys: Vec<&str> = QuoteField::ALL.iter().map(|field| field.key()).collect();
    keys.reverse();
    let joined = keys.join(",");

    let config = Config::from_lookup(|key| match key {
        "QUOTES_HEADER_FIELDS" => Some(joined.clone()),
        _ => None,
    })
    .expect("config");
    assert_eq!(config.header[0], QuoteField::CancellationPolicy);

    let row = record("Hotel Sol").to_row(&config.header);
    assert_eq!(row[0], "até 7 dias antes");
    assert_eq!(row[14], "2025-08-08 09:00");
}
