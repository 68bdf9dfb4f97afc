//! Append-only store for FHE computation results.
//!
//! MPC results flow back into the external dataset service; the FHE server
//! has no dataset of its own, so its results land here, keyed by metric and
//! queried by the same half-open timestamp ranges the dataset service uses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{collections, decode, encode, DocumentStore};
use crate::error::StoreError;

/// The encrypted payload of one FHE result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FheResultValue {
    /// Whether shares were already combined. FHE output arrives combined,
    /// so this defaults to `true`.
    #[serde(default = "default_combined")]
    pub is_combined: bool,
    pub c_result: String,
    pub analysis_id: String,
}

fn default_combined() -> bool {
    true
}

/// One stored FHE result event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FheResultRecord {
    /// Arrival time (epoch ms).
    pub ts: i64,
    pub metric: String,
    /// Who reported the result.
    pub source: String,
    pub value: FheResultValue,
}

/// Result records layered over the document store.
#[derive(Clone)]
pub struct FheResultStore {
    store: Arc<dyn DocumentStore>,
}

impl FheResultStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Appends a result record. Records are never updated or deleted.
    pub async fn append(&self, record: FheResultRecord) -> Result<(), StoreError> {
        let doc = encode(collections::FHE_RESULTS, &record)?;
        self.store.save(collections::FHE_RESULTS, doc).await?;
        Ok(())
    }

    /// All records for `metric` with `ts` in `[from, to)`, oldest first.
    pub async fn query_range(
        &self,
        metric: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<FheResultRecord>, StoreError> {
        let hits = self
            .store
            .search_eq(collections::FHE_RESULTS, "metric", metric)
            .await?;

        let mut records = Vec::new();
        for (_, doc) in hits {
            let record: FheResultRecord = decode(collections::FHE_RESULTS, doc)?;
            if record.ts >= from && record.ts < to {
                records.push(record);
            }
        }
        records.sort_by_key(|record| record.ts);
        Ok(records)
    }
}
