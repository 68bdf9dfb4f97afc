//! The analysis orchestration engine.
//!
//! [`Orchestrator`] drives everything: analysis lifecycle, key-share
//! distribution, cross-party status aggregation, batching, and the
//! streaming auto-batcher. It holds no state of its own — all persisted
//! entities live behind the [`DocumentStore`] seam, and all network effects
//! go through the [`ComputeClient`] and [`DatasetService`] seams, so the
//! whole engine runs unchanged against in-memory fakes in tests.

mod batch;
mod lifecycle;
mod status;
mod streaming;

pub use status::reduce_statuses;

use std::sync::Arc;

use tracing::info;

use crate::client::{ComputeClient, DatasetService, EventsQuery, IngestEvent};
use crate::error::{EngineResult, OrchestratorError};
use crate::models::{now_ms, MpcParty};
use crate::store::{collections, decode, encode, DocumentStore, FheResultStore};

/// Engine settings that do not belong to any single collaborator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the FHE compute server.
    pub fhe_endpoint: String,
    /// Delay before a streaming batch is pushed to the parties, decoupling
    /// submission from the ingest that triggered it.
    pub submit_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fhe_endpoint: "http://localhost:8400".to_string(),
            submit_delay_ms: 500,
        }
    }
}

/// The orchestration engine. Cheap to clone; clones share the same
/// collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn DocumentStore>,
    compute: Arc<dyn ComputeClient>,
    datasets: Arc<dyn DatasetService>,
    fhe_results: FheResultStore,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        compute: Arc<dyn ComputeClient>,
        datasets: Arc<dyn DatasetService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            fhe_results: FheResultStore::new(Arc::clone(&store)),
            store,
            compute,
            datasets,
            config,
        }
    }

    /// The FHE server, shaped as a party so both compute paths share one
    /// transport.
    fn fhe_party(&self) -> MpcParty {
        MpcParty {
            mpc_id: "fhe".to_string(),
            mpc_key: String::new(),
            host: self.config.fhe_endpoint.clone(),
            region: String::new(),
        }
    }

    // ---- Party registry -------------------------------------------------

    /// Registers a compute party.
    pub async fn register_party(&self, party: MpcParty) -> EngineResult<()> {
        info!("Registering party {}", party);
        let doc = encode(collections::MPC_PARTIES, &party)?;
        self.store.save(collections::MPC_PARTIES, doc).await?;
        Ok(())
    }

    /// All registered parties.
    pub async fn list_parties(&self) -> EngineResult<Vec<MpcParty>> {
        let docs = self.store.list(collections::MPC_PARTIES).await?;
        let mut parties = Vec::with_capacity(docs.len());
        for (_, doc) in docs {
            parties.push(decode(collections::MPC_PARTIES, doc)?);
        }
        Ok(parties)
    }

    /// Looks a party up by id.
    pub async fn find_party(&self, mpc_id: &str) -> EngineResult<Option<MpcParty>> {
        let hits = self
            .store
            .search_eq(collections::MPC_PARTIES, "mpc_id", mpc_id)
            .await?;
        match hits.into_iter().next() {
            Some((_, doc)) => Ok(Some(decode(collections::MPC_PARTIES, doc)?)),
            None => Ok(None),
        }
    }

    /// Resolves a party id to its registry entry, or fails the operation.
    pub(crate) async fn resolve_party(&self, mpc_id: &str) -> EngineResult<MpcParty> {
        self.find_party(mpc_id)
            .await?
            .ok_or_else(|| OrchestratorError::unregistered(mpc_id))
    }

    /// Kicks offline preprocessing on the named parties, or on every
    /// registered party when none are named.
    pub async fn trigger_offline(&self, mpc_ids: &[String]) -> EngineResult<Vec<String>> {
        let parties = if mpc_ids.is_empty() {
            self.list_parties().await?
        } else {
            let mut parties = Vec::with_capacity(mpc_ids.len());
            for mpc_id in mpc_ids {
                parties.push(self.resolve_party(mpc_id).await?);
            }
            parties
        };

        let mut kicked = Vec::with_capacity(parties.len());
        for party in parties {
            self.compute.trigger_offline(&party).await?;
            kicked.push(party.mpc_id);
        }
        Ok(kicked)
    }

    // ---- Data plane passthrough -----------------------------------------

    /// Ingests events into a dataset, then feeds each point to the
    /// streaming auto-batcher.
    pub async fn ingest_events(
        &self,
        caller: &str,
        dataset: &str,
        events: &[IngestEvent],
    ) -> EngineResult<()> {
        self.datasets.ingest(dataset, events).await?;

        for event in events {
            let timestamp = event.timestamp.unwrap_or_else(now_ms);
            self.on_ingested(caller, dataset, &event.metric, timestamp)
                .await?;
        }
        Ok(())
    }

    /// Runs an events query on behalf of a dashboard caller. The
    /// projection is pinned to non-payload fields; bulk ciphertext is
    /// fetched through the per-analysis data path instead.
    pub async fn query_events(
        &self,
        mut query: EventsQuery,
    ) -> EngineResult<crate::client::EventsPage> {
        query.fields = Some(vec![
            "timestamp".to_string(),
            "metric".to_string(),
            "source".to_string(),
        ]);
        self.datasets.query(&query).await
    }
}
