//! Elasticsearch indexer.
//!
//! Speaks the small slice of the Elasticsearch REST API the pipeline needs:
//! `HEAD /{index}` + `PUT /{index}` for idempotent index creation and
//! `POST /_bulk` for batched upserts keyed by each document's own `id`.
//! Re-delivering a document overwrites the previous version, which is what
//! makes redelivery after a crash safe.
//!
//! Transient transport failures are not handled here; callers wrap these
//! operations in [`crate::retry::RetryPolicy`].

use crate::pipeline::DocumentSink;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Configuration for the Elasticsearch indexer.
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    /// Elasticsearch base URL (e.g., "http://localhost:9200").
    pub url: String,

    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Batched document indexer over the Elasticsearch HTTP API.
pub struct ElasticIndexer {
    http: reqwest::Client,
    config: ElasticConfig,
}

impl ElasticIndexer {
    /// Create a new indexer.
    pub fn new(config: ElasticConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        tracing::info!("Elasticsearch indexer initialized: url={}", config.url);
        Ok(Self { http, config })
    }

    /// Connectivity check, used by the startup retry loop.
    pub async fn ping(&self) -> Result<()> {
        self.http
            .get(&self.config.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Build the NDJSON `_bulk` request body.
    ///
    /// Every document must carry an `id` field; it becomes the index key so
    /// that delivery is an upsert.
    fn bulk_body(index: &str, documents: &[Value]) -> Result<String> {
        let mut body = String::new();
        for document in documents {
            let id = document
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Index("document has no id field".to_string()))?;
            let action = json!({ "index": { "_index": index, "_id": id } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&document.to_string());
            body.push('\n');
        }
        Ok(body)
    }

    /// Extract the first item error from a `_bulk` response.
    fn first_bulk_error(response: &Value) -> String {
        response
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find_map(|item| {
                    item.get("index")
                        .and_then(|op| op.get("error"))
                        .map(Value::to_string)
                })
            })
            .unwrap_or_else(|| "unknown bulk error".to_string())
    }
}

#[async_trait]
impl DocumentSink for ElasticIndexer {
    /// Create the index if it does not exist.
    ///
    /// An index that already exists is success, not failure; any other
    /// creation failure is a real error for the caller's retry loop.
    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<()> {
        let url = format!("{}/{}", self.config.url, index);

        let head = self.http.head(&url).send().await?;
        if head.status().is_success() {
            tracing::debug!("Index {} already exists", index);
            return Ok(());
        }

        let response = self.http.put(&url).json(mapping).send().await?;
        if response.status().is_success() {
            tracing::info!("Index {} created", index);
            return Ok(());
        }

        let body: Value = response.json().await.unwrap_or_default();
        let error_type = body
            .pointer("/error/type")
            .and_then(Value::as_str)
            .unwrap_or("");
        if error_type == "resource_already_exists_exception" {
            tracing::debug!("Index {} created concurrently", index);
            return Ok(());
        }

        Err(Error::Index(format!(
            "failed to create index {index}: {body}"
        )))
    }

    /// Deliver a batch of documents as a single `_bulk` upsert.
    async fn deliver(&self, index: &str, documents: &[Value]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let body = Self::bulk_body(index, documents)?;
        let response = self
            .http
            .post(format!("{}/_bulk", self.config.url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let result: Value = response.json().await?;
        if result.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            return Err(Error::Index(format!(
                "bulk delivery to {} reported item errors: {}",
                index,
                Self::first_bulk_error(&result)
            )));
        }

        tracing::debug!("Delivered {} documents to {}", documents.len(), index);
        Ok(documents.len())
    }
}

/// Mapping for the movies index.
pub fn movies_mapping() -> Value {
    json!({
        "settings": index_settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "imdb_rating": { "type": "float" },
                "genre": { "type": "keyword" },
                "title": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "description": { "type": "text", "analyzer": "ru_en" },
                "director": { "type": "text", "analyzer": "ru_en" },
                "actors_names": { "type": "text", "analyzer": "ru_en" },
                "writers_names": { "type": "text", "analyzer": "ru_en" },
                "actors": {
                    "type": "nested",
                    "dynamic": "strict",
                    "properties": {
                        "id": { "type": "keyword" },
                        "name": { "type": "text", "analyzer": "ru_en" }
                    }
                },
                "writers": {
                    "type": "nested",
                    "dynamic": "strict",
                    "properties": {
                        "id": { "type": "keyword" },
                        "name": { "type": "text", "analyzer": "ru_en" }
                    }
                }
            }
        }
    })
}

/// Mapping for the genres index.
pub fn genres_mapping() -> Value {
    json!({
        "settings": index_settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "name": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "description": { "type": "text", "analyzer": "ru_en" }
            }
        }
    })
}

/// Mapping for the persons index.
pub fn persons_mapping() -> Value {
    json!({
        "settings": index_settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "full_name": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "role": { "type": "keyword" }
            }
        }
    })
}

fn index_settings() -> Value {
    json!({
        "refresh_interval": "1s",
        "analysis": {
            "filter": {
                "english_stop": { "type": "stop", "stopwords": "_english_" },
                "english_stemmer": { "type": "stemmer", "language": "english" },
                "english_possessive_stemmer": {
                    "type": "stemmer",
                    "language": "possessive_english"
                },
                "russian_stop": { "type": "stop", "stopwords": "_russian_" },
                "russian_stemmer": { "type": "stemmer", "language": "russian" }
            },
            "analyzer": {
                "ru_en": {
                    "tokenizer": "standard",
                    "filter": [
                        "lowercase",
                        "english_stop",
                        "english_stemmer",
                        "english_possessive_stemmer",
                        "russian_stop",
                        "russian_stemmer"
                    ]
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_config_default() {
        let config = ElasticConfig::default();
        assert_eq!(config.url, "http://localhost:9200");
    }

    #[test]
    fn test_bulk_body_is_keyed_by_document_id() {
        let id = Uuid::new_v4();
        let doc = json!({ "id": id.to_string(), "title": "Film" });

        let body = ElasticIndexer::bulk_body("movies", &[doc]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);

        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "movies");
        assert_eq!(action["index"]["_id"], id.to_string());

        let source: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["title"], "Film");
    }

    #[test]
    fn test_bulk_body_rejects_document_without_id() {
        let doc = json!({ "title": "No Id" });
        assert!(ElasticIndexer::bulk_body("movies", &[doc]).is_err());
    }

    #[test]
    fn test_first_bulk_error_extraction() {
        let response = json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 200 } },
                { "index": { "_id": "b", "error": { "type": "mapper_parsing_exception" } } }
            ]
        });
        let message = ElasticIndexer::first_bulk_error(&response);
        assert!(message.contains("mapper_parsing_exception"));
    }

    #[test]
    fn test_mappings_declare_strict_documents() {
        for mapping in [movies_mapping(), genres_mapping(), persons_mapping()] {
            assert_eq!(mapping["mappings"]["dynamic"], "strict");
            assert_eq!(mapping["mappings"]["properties"]["id"]["type"], "keyword");
        }
    }

    // Delivery against a live cluster is exercised by the orchestrator tests
    // through the in-memory sink; wire tests require a running Elasticsearch.
}
