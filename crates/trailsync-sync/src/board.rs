//! GraphQL client for the tracking board: inventory pages and batch mutations.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use trailsync_core::InventoryItem;
use trailsync_storage::{classify_status, FetchError, HttpClientConfig, HttpFetcher};

use crate::dispatch::{BatchExecutor, DispatchFailure};
use crate::planner::{escape_graphql, BatchDocument};

pub const INVENTORY_PAGE_SIZE: usize = 499;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("board api returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("board api reported errors: {0}")]
    Remote(String),
    #[error("board response could not be decoded: {0}")]
    Decode(String),
    #[error("board {0} not found")]
    BoardNotFound(String),
}

/// Existing items on the board, pulled once per run.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list_all_items(&self, board_id: &str) -> Result<Vec<InventoryItem>, BoardError>;
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct BoardsData {
    boards: Vec<BoardPage>,
}

#[derive(Debug, Deserialize)]
struct BoardPage {
    items_page: ItemsPage,
}

#[derive(Debug, Deserialize)]
struct NextPageData {
    next_items_page: ItemsPage,
}

#[derive(Debug, Deserialize)]
struct ItemsPage {
    cursor: Option<String>,
    #[serde(default)]
    items: Vec<ItemRow>,
}

#[derive(Debug, Deserialize)]
struct ItemRow {
    id: String,
    name: String,
}

pub fn first_page_query(board_id: &str) -> String {
    format!(
        "query {{ boards(ids: [\"{}\"]) {{ items_page(limit: {INVENTORY_PAGE_SIZE}) {{ cursor items {{ id name }} }} }} }}",
        escape_graphql(board_id)
    )
}

pub fn next_page_query(cursor: &str) -> String {
    format!(
        "query {{ next_items_page(limit: {INVENTORY_PAGE_SIZE}, cursor: \"{}\") {{ cursor items {{ id name }} }} }}",
        escape_graphql(cursor)
    )
}

static TRANSIENT_REMOTE_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate|complexity|timeout|temporary").expect("static regex compiles"));

/// Remote-reported errors about throttling or load are worth retrying.
pub fn is_transient_remote_error(message: &str) -> bool {
    TRANSIENT_REMOTE_ERROR.is_match(message)
}

/// Classifies one mutation response; success hands back `data`.
pub fn classify_response(status: StatusCode, body: &[u8]) -> Result<Value, DispatchFailure> {
    if !status.is_success() {
        let message = format!("http {status}: {}", String::from_utf8_lossy(body));
        return Err(if classify_status(status).is_retryable() {
            DispatchFailure::Retryable(message)
        } else {
            DispatchFailure::Fatal(message)
        });
    }

    let parsed: GraphQlResponse<Value> = serde_json::from_slice(body)
        .map_err(|e| DispatchFailure::Fatal(format!("malformed board response: {e}")))?;

    match parsed.errors {
        Some(errors) if !errors.is_empty() => {
            let message = Value::Array(errors).to_string();
            if is_transient_remote_error(&message) {
                Err(DispatchFailure::Retryable(message))
            } else {
                Err(DispatchFailure::Fatal(message))
            }
        }
        _ => Ok(parsed.data.unwrap_or(Value::Null)),
    }
}

pub struct MondayClient {
    http: HttpFetcher,
    api_url: String,
    api_token: String,
}

impl MondayClient {
    pub fn new(api_url: impl Into<String>, api_token: impl Into<String>, http: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            api_url: api_url.into(),
            api_token: api_token.into(),
        })
    }

    async fn query<T: DeserializeOwned + Send>(&self, query: String) -> Result<T, BoardError> {
        let resp = self
            .http
            .post_json_once(&self.api_url, Some(&self.api_token), &json!({ "query": query }))
            .await?;
        if !resp.status.is_success() {
            return Err(BoardError::Status {
                status: resp.status.as_u16(),
                body: resp.text(),
            });
        }
        let parsed: GraphQlResponse<T> =
            serde_json::from_slice(&resp.body).map_err(|e| BoardError::Decode(e.to_string()))?;
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            return Err(BoardError::Remote(Value::Array(errors).to_string()));
        }
        parsed
            .data
            .ok_or_else(|| BoardError::Decode("response carried no data".to_string()))
    }
}

#[async_trait]
impl InventorySource for MondayClient {
    async fn list_all_items(&self, board_id: &str) -> Result<Vec<InventoryItem>, BoardError> {
        let first: BoardsData = self.query(first_page_query(board_id)).await?;
        let mut page = first
            .boards
            .into_iter()
            .next()
            .map(|b| b.items_page)
            .ok_or_else(|| BoardError::BoardNotFound(board_id.to_string()))?;

        let mut items = Vec::new();
        let mut pages = 1usize;
        loop {
            items.extend(page.items.into_iter().map(|row| InventoryItem::new(row.id, row.name)));
            let Some(cursor) = page.cursor.filter(|c| !c.is_empty()) else {
                break;
            };
            debug!(pages, items = items.len(), "fetching next inventory page");
            let next: NextPageData = self.query(next_page_query(&cursor)).await?;
            page = next.next_items_page;
            pages += 1;
        }

        info!(board_id, pages, items = items.len(), "loaded board inventory");
        Ok(items)
    }
}

#[async_trait]
impl BatchExecutor for MondayClient {
    async fn execute(&self, document: &BatchDocument) -> Result<Value, DispatchFailure> {
        let body = json!({ "query": document.query() });
        let resp = self
            .http
            .post_json_once(&self.api_url, Some(&self.api_token), &body)
            .await
            .map_err(|err| {
                if err.disposition().is_retryable() {
                    DispatchFailure::Retryable(err.to_string())
                } else {
                    DispatchFailure::Fatal(err.to_string())
                }
            })?;
        classify_response(resp.status, &resp.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_and_rate_limit_statuses_are_retryable() {
        for code in [429u16, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(classify_response(status, b"busy"), Err(DispatchFailure::Retryable(_))));
        }
        let status = StatusCode::from_u16(401).unwrap();
        assert!(matches!(classify_response(status, b"no"), Err(DispatchFailure::Fatal(_))));
    }

    #[test]
    fn remote_errors_are_classified_by_message() {
        let body = br#"{"errors":[{"message":"Complexity budget exhausted"}]}"#;
        assert!(matches!(classify_response(StatusCode::OK, body), Err(DispatchFailure::Retryable(_))));

        let body = br#"{"errors":[{"message":"Column not found"}]}"#;
        let Err(DispatchFailure::Fatal(message)) = classify_response(StatusCode::OK, body) else {
            panic!("expected fatal");
        };
        assert!(message.contains("Column not found"));
    }

    #[test]
    fn success_returns_data_and_malformed_body_is_fatal() {
        let body = br#"{"data":{"op_0":{"id":"1"}}}"#;
        let data = classify_response(StatusCode::OK, body).unwrap();
        assert_eq!(data["op_0"]["id"], "1");

        assert!(matches!(classify_response(StatusCode::OK, b"<html>"), Err(DispatchFailure::Fatal(_))));
    }

    #[test]
    fn transient_pattern_is_case_insensitive() {
        assert!(is_transient_remote_error("RATE limit"));
        assert!(is_transient_remote_error("Temporary failure"));
        assert!(is_transient_remote_error("request TIMEOUT"));
        assert!(!is_transient_remote_error("invalid board id"));
    }

    #[test]
    fn inventory_queries_page_with_cursor() {
        assert_eq!(
            first_page_query("42"),
            "query { boards(ids: [\"42\"]) { items_page(limit: 499) { cursor items { id name } } } }"
        );
        assert!(next_page_query("abc\"def").contains("cursor: \"abc\\\"def\""));
    }

    #[test]
    fn inventory_pages_deserialize() {
        let body = r#"{"data":{"boards":[{"items_page":{"cursor":"c1","items":[{"id":"1","name":"5301"}]}}]}}"#;
        let parsed: GraphQlResponse<BoardsData> = serde_json::from_str(body).unwrap();
        let page = &parsed.data.unwrap().boards[0].items_page;
        assert_eq!(page.cursor.as_deref(), Some("c1"));
        assert_eq!(page.items[0].name, "5301");

        let body = r#"{"data":{"next_items_page":{"cursor":null,"items":[]}}}"#;
        let parsed: GraphQlResponse<NextPageData> = serde_json::from_str(body).unwrap();
        assert!(parsed.data.unwrap().next_items_page.cursor.is_none());
    }
}
