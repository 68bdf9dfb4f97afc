//! HTTP client for the external time-series dataset service.
//!
//! The engine never touches bulk ciphertext itself; it ingests events into
//! named datasets and queries them back by time range and metric. Queries
//! get a longer timeout than ingests, matching the service's behavior on
//! large ranges.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineResult, OrchestratorError};

/// One event to ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    /// Event time (epoch ms); the service stamps arrival time if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub metric: String,
    /// Opaque payload; ciphertext on every path this engine drives.
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Dataset/metric selector of an events query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRange {
    pub datasets: Vec<String>,
    pub metrics: Vec<String>,
}

/// A time-range query over one or more datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "dataRange")]
    pub data_range: DataRange,
    /// Inclusive lower bound (epoch ms).
    pub from: i64,
    /// Exclusive upper bound (epoch ms).
    pub to: i64,
    /// When set, the service projects each event down to these fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// One event coming back from a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventItem {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsPage {
    pub items: Vec<EventItem>,
    /// Continuation token; `null` when the page is the last one.
    pub cursor: Option<String>,
}

impl EventsPage {
    /// The page returned for an analysis that has no results yet.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }
}

/// Transport to the dataset service.
#[async_trait]
pub trait DatasetService: Send + Sync {
    /// Ingests a batch of events into `dataset`.
    async fn ingest(&self, dataset: &str, events: &[IngestEvent]) -> EngineResult<()>;

    /// Runs a time-range events query.
    async fn query(&self, query: &EventsQuery) -> EngineResult<EventsPage>;
}

/// [`DatasetService`] over plain HTTP.
pub struct HttpDatasetService {
    client: reqwest::Client,
    endpoint: String,
    ingest_timeout_seconds: u64,
    query_timeout_seconds: u64,
}

impl HttpDatasetService {
    pub fn new(endpoint: String, ingest_timeout_seconds: u64, query_timeout_seconds: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ingest_timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            endpoint,
            ingest_timeout_seconds,
            query_timeout_seconds,
        }
    }

    fn request_error(&self, what: &str, timeout: u64, e: reqwest::Error) -> OrchestratorError {
        if e.is_timeout() {
            OrchestratorError::dataset(format!("{what} timed out after {timeout}s"))
        } else if e.is_connect() {
            OrchestratorError::dataset(format!(
                "cannot connect to dataset service at {}",
                self.endpoint
            ))
        } else {
            OrchestratorError::dataset(format!("{what} failed: {e}"))
        }
    }
}

#[async_trait]
impl DatasetService for HttpDatasetService {
    async fn ingest(&self, dataset: &str, events: &[IngestEvent]) -> EngineResult<()> {
        debug!("Ingesting {} events into dataset {}", events.len(), dataset);
        let url = format!("{}/data/ingest/{}", self.endpoint, dataset);

        let response = self
            .client
            .post(&url)
            .json(events)
            .send()
            .await
            .map_err(|e| self.request_error("ingest", self.ingest_timeout_seconds, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::dataset(format!(
                "ingest rejected with HTTP {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn query(&self, query: &EventsQuery) -> EngineResult<EventsPage> {
        debug!(
            "Querying datasets {:?} in [{}, {})",
            query.data_range.datasets, query.from, query.to
        );
        let url = format!("{}/data/query/events", self.endpoint);

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.query_timeout_seconds))
            .json(query)
            .send()
            .await
            .map_err(|e| self.request_error("query", self.query_timeout_seconds, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::dataset(format!(
                "query rejected with HTTP {status}: {body}"
            )));
        }

        response
            .json::<EventsPage>()
            .await
            .map_err(|e| OrchestratorError::dataset(format!("unparsable query response: {e}")))
    }
}
