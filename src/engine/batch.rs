//! Batch assembly: merging prepared analyses into one combined compute
//! request.
//!
//! A batch spans analyses that share an identical party line-up. Each
//! party receives a single call carrying parallel arrays of analysis ids,
//! owners, and per-analysis data indexes, so the parties can amortize
//! their preprocessing across the whole batch.

use futures::future::try_join_all;
use tracing::{info, warn};

use super::{reduce_statuses, Orchestrator};
use crate::client::BatchAnalyseRequest;
use crate::error::{EngineResult, OrchestratorError};
use crate::models::{
    now_ms, Analysis, AnalysisStatus, Batch, BatchSpec, Invoker, PartyStatus,
};
use crate::store::{collections, decode, encode};

impl Orchestrator {
    /// Validates and persists a batch, then pushes it to each party.
    ///
    /// Members already marked `Queued` stay that way if a later step
    /// fails; likewise parties reached before a dispatch error keep the
    /// batch. The status sweep is what surfaces such partial state.
    pub async fn submit_batch(&self, spec: BatchSpec) -> EngineResult<String> {
        if spec.analysis_ids.is_empty() {
            return Err(OrchestratorError::invalid_batch(
                "a batch needs at least one analysis",
            ));
        }

        let mut members: Vec<(String, Analysis)> = Vec::with_capacity(spec.analysis_ids.len());
        let mut first_keys_exp_at = i64::MAX;
        for analysis_id in &spec.analysis_ids {
            let doc = self
                .store
                .fetch(collections::ANALYSES, analysis_id)
                .await?
                .ok_or(OrchestratorError::NotFound)?;
            let analysis: Analysis = decode(collections::ANALYSES, doc)?;
            if analysis.is_fhe() {
                return Err(OrchestratorError::invalid_batch(format!(
                    "analysis '{analysis_id}' is FHE-routed; batches cover MPC analyses only"
                )));
            }
            first_keys_exp_at = first_keys_exp_at.min(analysis.keys_exp_at);
            members.push((analysis_id.clone(), analysis));
        }

        let parties: Vec<String> = members[0].1.target.parties().to_vec();
        for (analysis_id, member) in &members {
            if member.target.parties() != parties.as_slice() {
                return Err(OrchestratorError::invalid_batch(format!(
                    "analysis '{analysis_id}' names different parties than the rest of the batch"
                )));
            }
        }

        if spec.analysis_ids.len() * spec.analysis_data_point_count != spec.batch_size {
            return Err(OrchestratorError::invalid_batch(format!(
                "batch_size {} does not equal {} analyses x {} data points each",
                spec.batch_size,
                spec.analysis_ids.len(),
                spec.analysis_data_point_count
            )));
        }
        for (analysis_id, member) in &members {
            if member.data_index.len() != spec.analysis_data_point_count {
                return Err(OrchestratorError::invalid_batch(format!(
                    "analysis '{analysis_id}' holds {} data points, expected {}",
                    member.data_index.len(),
                    spec.analysis_data_point_count
                )));
            }
        }
        if let Some(descriptor) = &spec.streaming {
            if descriptor.len() != members.len() {
                return Err(OrchestratorError::invalid_batch(
                    "streaming descriptor must carry one [start, expiry] pair per analysis",
                ));
            }
        }

        for (analysis_id, member) in &mut members {
            member.latest_status = AnalysisStatus::Queued;
            let doc = encode(collections::ANALYSES, member)?;
            self.store
                .put(collections::ANALYSES, analysis_id, doc)
                .await?;
        }

        let mut resolved = Vec::with_capacity(parties.len());
        for mpc_id in &parties {
            resolved.push(self.resolve_party(mpc_id).await?);
        }

        let user_ids: Vec<String> = members.iter().map(|(_, m)| m.user_id.clone()).collect();
        let data_indexes: Vec<Vec<i64>> =
            members.iter().map(|(_, m)| m.data_index.clone()).collect();
        let invoker = if spec.streaming.is_some() {
            Invoker::Streaming
        } else {
            Invoker::Manual
        };

        let batch = Batch {
            batch_size: spec.batch_size,
            analysis_data_point_count: spec.analysis_data_point_count,
            analysis_ids: spec.analysis_ids.clone(),
            user_ids: user_ids.clone(),
            parties,
            analysis_type: spec.analysis_type.clone(),
            online_only: spec.online_only,
            created_at: now_ms(),
            first_keys_exp_at,
            latest_status: AnalysisStatus::Queued,
            invoker,
            streaming: spec.streaming.clone(),
        };
        let doc = encode(collections::BATCHES, &batch)?;
        let batch_id = self.store.save(collections::BATCHES, doc).await?;

        let request = BatchAnalyseRequest {
            analysis_id: spec.analysis_ids,
            user_id: user_ids,
            data_index: data_indexes,
            analysis_type: spec.analysis_type,
            online_only: spec.online_only,
            streaming: spec.streaming,
        };
        for party in &resolved {
            self.compute.analyse_batch(party, &request).await?;
        }

        info!(
            "Submitted batch {} ({} analyses x {} points) to {} parties",
            batch_id,
            request.analysis_id.len(),
            spec.analysis_data_point_count,
            resolved.len()
        );
        Ok(batch_id)
    }

    /// Brings every live batch's status up to date.
    ///
    /// Each batch still in flight gets a full party-by-member status
    /// sweep; the union of readings reduces least-advanced-wins, and the
    /// result is mirrored onto every member analysis.
    pub async fn refresh_batch_statuses(&self) -> EngineResult<()> {
        let batches = self.store.list(collections::BATCHES).await?;

        for (batch_id, doc) in batches {
            let mut batch: Batch = decode(collections::BATCHES, doc)?;
            if matches!(
                batch.latest_status,
                AnalysisStatus::Completed | AnalysisStatus::Failed
            ) {
                continue;
            }

            let mut parties = Vec::with_capacity(batch.parties.len());
            for mpc_id in &batch.parties {
                parties.push(self.resolve_party(mpc_id).await?);
            }

            let mut probes = Vec::with_capacity(parties.len() * batch.analysis_ids.len());
            for party in &parties {
                for analysis_id in &batch.analysis_ids {
                    probes.push(async move {
                        self.compute.status(party, analysis_id).await
                    });
                }
            }
            let readings = try_join_all(probes).await?;

            batch.latest_status =
                reduce_statuses(readings.iter().map(|raw| PartyStatus::parse(raw)));
            let doc = encode(collections::BATCHES, &batch)?;
            self.store.put(collections::BATCHES, &batch_id, doc).await?;

            self.mirror_batch_status(&batch_id, &batch).await?;
        }
        Ok(())
    }

    /// Writes a batch's status onto each member analysis.
    async fn mirror_batch_status(&self, batch_id: &str, batch: &Batch) -> EngineResult<()> {
        for analysis_id in &batch.analysis_ids {
            match self.store.fetch(collections::ANALYSES, analysis_id).await? {
                Some(doc) => {
                    let mut analysis: Analysis = decode(collections::ANALYSES, doc)?;
                    analysis.latest_status = batch.latest_status;
                    let doc = encode(collections::ANALYSES, &analysis)?;
                    self.store
                        .put(collections::ANALYSES, analysis_id, doc)
                        .await?;
                }
                None => warn!(
                    "Batch {} member {} no longer exists, skipping status mirror",
                    batch_id, analysis_id
                ),
            }
        }
        Ok(())
    }

    /// All batches, oldest first, refreshed before listing. With
    /// `queued_only` the listing keeps only batches still `Queued`.
    pub async fn list_batches(&self, queued_only: bool) -> EngineResult<Vec<(String, Batch)>> {
        self.refresh_batch_statuses().await?;

        let docs = self.store.list(collections::BATCHES).await?;
        let mut batches = Vec::with_capacity(docs.len());
        for (batch_id, doc) in docs {
            let batch: Batch = decode(collections::BATCHES, doc)?;
            if queued_only && batch.latest_status != AnalysisStatus::Queued {
                continue;
            }
            batches.push((batch_id, batch));
        }
        batches.sort_by_key(|(_, batch)| batch.created_at);
        Ok(batches)
    }

    /// Fetches one batch by id.
    pub async fn fetch_batch(&self, batch_id: &str) -> EngineResult<Batch> {
        let doc = self
            .store
            .fetch(collections::BATCHES, batch_id)
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        decode(collections::BATCHES, doc).map_err(Into::into)
    }
}
