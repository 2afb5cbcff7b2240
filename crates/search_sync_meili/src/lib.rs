//! Meilisearch client
//!
//! Implements the [`SearchEngine`] port over the Meilisearch HTTP API.
//! Writes are accepted asynchronously by the engine (HTTP 202 plus a task
//! uid); acceptance counts as delivery.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use search_sync_core::error::SyncError;
use search_sync_core::ports::{Result, SearchEngine};
use search_sync_core::types::EngineSearchResult;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const PRIMARY_KEY: &str = "id";

#[derive(Debug, Clone)]
pub struct MeiliConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl MeiliConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ── Wire types ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskInfo {
    task_uid: u64,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    q: &'a str,
    offset: u64,
    limit: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    hits: Vec<Value>,
    #[serde(default)]
    estimated_total_hits: Option<u64>,
    #[serde(default)]
    total_hits: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: String,
}

// ── MeiliClient ────────────────────────────────────────────────

pub struct MeiliClient {
    http: Client,
    base_url: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl MeiliClient {
    pub fn new(config: MeiliConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .with_context(|| format!("Invalid Meilisearch URL: {}", config.url))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidInput(format!(
                "Meilisearch URL cannot be a base: {}",
                config.url
            )));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key,
            timeout: config.timeout,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SyncError::InvalidInput(format!(
                    "Meilisearch URL cannot be a base: {}",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send and reject non-2xx responses.
    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| self.transport_error(e, what))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body, what))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T> {
        let response = self.send(builder, what).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| self.transport_error(e, what))
    }

    fn transport_error(&self, e: reqwest::Error, what: &str) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.timeout)
        } else {
            SyncError::Engine(format!("{what}: {e}"))
        }
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let what = "get index";
        let url = self.endpoint(&["indexes", index])?;
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| self.transport_error(e, what))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(api_error(status, &body, what))
            }
        }
    }
}

fn api_error(status: StatusCode, body: &str, what: &str) -> SyncError {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => SyncError::Engine(format!(
            "{what}: HTTP {} {}: {}",
            status.as_u16(),
            err.code,
            err.message
        )),
        Err(_) => SyncError::Engine(format!(
            "{what}: HTTP {}: {}",
            status.as_u16(),
            body.chars().take(200).collect::<String>()
        )),
    }
}

#[async_trait]
impl SearchEngine for MeiliClient {
    async fn upsert_documents(&self, index: &str, documents: &[Value]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut url = self.endpoint(&["indexes", index, "documents"])?;
        url.query_pairs_mut().append_pair("primaryKey", PRIMARY_KEY);

        let task: TaskInfo = self
            .send_json(
                self.request(Method::POST, url).json(documents),
                "add documents",
            )
            .await?;
        debug!(index, count = documents.len(), task_uid = task.task_uid, "Documents enqueued");
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: i64) -> Result<()> {
        let id = id.to_string();
        let url = self.endpoint(&["indexes", index, "documents", &id])?;
        let task: TaskInfo = self
            .send_json(self.request(Method::DELETE, url), "delete document")
            .await?;
        debug!(index, id = %id, task_uid = task.task_uid, "Document deletion enqueued");
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &str,
        offset: u64,
        limit: u64,
    ) -> Result<EngineSearchResult> {
        let url = self.endpoint(&["indexes", index, "search"])?;
        let body = SearchRequest {
            q: query,
            offset,
            limit,
        };
        let response: SearchResponse = self
            .send_json(self.request(Method::POST, url).json(&body), "search")
            .await?;

        let estimated_total = response
            .estimated_total_hits
            .or(response.total_hits)
            .unwrap_or(response.hits.len() as u64);
        Ok(EngineSearchResult {
            hits: response.hits,
            estimated_total,
        })
    }

    async fn ensure_index(
        &self,
        index: &str,
        primary_key: &str,
        searchable_attributes: &[String],
    ) -> Result<()> {
        if !self.index_exists(index).await? {
            let url = self.endpoint(&["indexes"])?;
            let task: TaskInfo = self
                .send_json(
                    self.request(Method::POST, url)
                        .json(&json!({ "uid": index, "primaryKey": primary_key })),
                    "create index",
                )
                .await?;
            info!(index, task_uid = task.task_uid, "Search index created");
        }

        if !searchable_attributes.is_empty() {
            let url = self.endpoint(&["indexes", index, "settings", "searchable-attributes"])?;
            self.send(
                self.request(Method::PUT, url).json(searchable_attributes),
                "update searchable attributes",
            )
            .await?;
            debug!(
                index,
                attributes = searchable_attributes.len(),
                "Searchable attributes updated"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> MeiliClient {
        MeiliClient::new(MeiliConfig::new(url)).unwrap()
    }

    #[test]
    fn endpoint_appends_segments_to_base_path() {
        let c = client("http://localhost:7700/meili/");
        let url = c.endpoint(&["indexes", "item", "documents"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:7700/meili/indexes/item/documents");

        let c = client("http://localhost:7700");
        let url = c.endpoint(&["indexes", "item", "documents", "42"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:7700/indexes/item/documents/42");
    }

    #[test]
    fn endpoint_escapes_index_names() {
        let c = client("http://localhost:7700");
        let url = c.endpoint(&["indexes", "a/b", "search"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:7700/indexes/a%2Fb/search");
    }

    #[test]
    fn rejects_unusable_urls() {
        assert!(MeiliClient::new(MeiliConfig::new("not a url")).is_err());
        assert!(matches!(
            MeiliClient::new(MeiliConfig::new("mailto:search@example.com")),
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[test]
    fn api_error_prefers_structured_body() {
        let body = r#"{"message":"Index `item` not found.","code":"index_not_found","type":"invalid_request","link":""}"#;
        let err = api_error(StatusCode::NOT_FOUND, body, "search");
        assert_eq!(
            err.to_string(),
            "search engine: search: HTTP 404 index_not_found: Index `item` not found."
        );

        let long = "x".repeat(500);
        let err = api_error(StatusCode::BAD_GATEWAY, &long, "add documents");
        let SyncError::Engine(message) = err else {
            panic!("expected engine error");
        };
        assert!(message.starts_with("add documents: HTTP 502: "));
        assert_eq!(message.len(), "add documents: HTTP 502: ".len() + 200);
    }
}
