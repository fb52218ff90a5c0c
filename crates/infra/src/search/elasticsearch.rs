//! Elasticsearch adapter over its REST API.
//!
//! - existence: `HEAD /{index}`
//! - create: `PUT /{index}` with the field mappings
//! - upsert: `PUT /{index}/_doc/{id}` (full replace)
//! - search: `POST /{index}/_search` with a `multi_match` query

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

use newsflow_core::{DocumentFields, IndexDocument};

use super::{IndexSchema, SearchHit, SearchIndex, SearchIndexError, SearchResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ALREADY_EXISTS_TYPE: &str = "resource_already_exists_exception";

#[derive(Debug, Clone)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: String,
}

impl ElasticsearchIndex {
    pub fn new(base_url: impl Into<String>) -> SearchResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SearchIndexError::Request(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    #[instrument(skip(self), err)]
    async fn index_exists(&self, index: &str) -> SearchResult<bool> {
        let response = self
            .client
            .head(self.url(index))
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(SearchIndexError::Response {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    #[instrument(skip(self, schema), err)]
    async fn create_index(&self, index: &str, schema: &IndexSchema) -> SearchResult<()> {
        let response = self
            .client
            .put(self.url(index))
            .json(&schema.to_mappings())
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && error_type(&body).as_deref() == Some(ALREADY_EXISTS_TYPE)
        {
            return Err(SearchIndexError::AlreadyExists(index.to_string()));
        }
        Err(SearchIndexError::Response {
            status: status.as_u16(),
            body,
        })
    }

    #[instrument(skip(self, document), fields(document_id = %document.id), err)]
    async fn upsert_document(&self, index: &str, document: &IndexDocument) -> SearchResult<()> {
        let response = self
            .client
            .put(self.url(&format!("{index}/_doc/{}", document.id)))
            .json(&document.fields)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "document written");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(SearchIndexError::MissingIndex(index.to_string()));
        }
        Err(SearchIndexError::Response {
            status: status.as_u16(),
            body,
        })
    }

    #[instrument(skip(self), err)]
    async fn search(&self, index: &str, query: &str) -> SearchResult<Vec<SearchHit>> {
        let body = json!({
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": ["title", "content"]
                }
            }
        });

        let response = self
            .client
            .post(self.url(&format!("{index}/_search")))
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchIndexError::Response {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchIndexError::Decode(e.to_string()))?;

        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                id: hit.id,
                score: hit.score,
                document: hit.source,
            })
            .collect())
    }
}

fn request_error(err: reqwest::Error) -> SearchIndexError {
    SearchIndexError::Request(err.to_string())
}

/// `error.type` from an Elasticsearch error body.
fn error_type(body: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(body).ok()?;
    value["error"]["type"].as_str().map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: DocumentFields,
}
