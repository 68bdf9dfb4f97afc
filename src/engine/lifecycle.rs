//! Analysis lifecycle operations.
//!
//! Creation and key-share distribution, dispatch to the compute parties,
//! owner-scoped reads, result recording, and the destructive cleanup. All
//! ownership checks funnel through [`Orchestrator::fetch_owned_analysis`]
//! so an unowned analysis is indistinguishable from a missing one.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::client::{AnalyseRequest, DataRange, EventItem, EventsPage, EventsQuery, IngestEvent};
use crate::error::{EngineResult, OrchestratorError};
use crate::models::{
    now_ms, timestamp_range, Analysis, AnalysisStatus, ComputeTarget, FheAnalysisSpec, KeyShare,
    MpcAnalysisSpec, ResultSubmission, MS_PER_HOUR,
};
use crate::store::{collections, decode, encode, FheResultRecord, FheResultValue};

/// Extracts the ciphertext bytes of a stored event (`value.map.c`) as a
/// lowercase hex string.
fn ciphertext_hex(value: &Value) -> Option<String> {
    let bytes = value.get("map")?.get("c")?.as_array()?;
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let byte = byte.as_u64().filter(|b| *b <= 255)?;
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

impl Orchestrator {
    /// Creates an MPC analysis: validates the party list against the
    /// registry, persists the analysis as `Prepared`, and stores one key
    /// share per party, each expiring with the analysis's key material.
    ///
    /// Nothing is pushed to the parties yet; that is
    /// [`Orchestrator::dispatch_analysis`]'s job (or the batch
    /// assembler's).
    pub async fn prepare_mpc_analysis(
        &self,
        caller: &str,
        spec: MpcAnalysisSpec,
    ) -> EngineResult<String> {
        if spec.parties.is_empty() {
            return Err(OrchestratorError::invalid_analysis(
                "at least one MPC party is required",
            ));
        }
        for (i, party) in spec.parties.iter().enumerate() {
            if spec.parties[..i].iter().any(|p| p.mpc_id == party.mpc_id) {
                return Err(OrchestratorError::invalid_analysis(format!(
                    "party '{}' appears more than once",
                    party.mpc_id
                )));
            }
        }
        if spec.exp_hours < 0.0 {
            return Err(OrchestratorError::invalid_analysis(
                "exp_hours must not be negative",
            ));
        }

        // Every named party must be registered before anything persists.
        for party in &spec.parties {
            self.resolve_party(&party.mpc_id).await?;
        }

        let created_at = now_ms();
        let keys_exp_at = created_at + (spec.exp_hours * MS_PER_HOUR).round() as i64;

        let analysis = Analysis {
            user_id: caller.to_string(),
            user_key: spec.user_key,
            source_dataset: spec.source_dataset,
            result_dataset: spec.result_dataset,
            metric: spec.metric,
            data_index: spec.data_index,
            target: ComputeTarget::Mpc {
                parties: spec.parties.iter().map(|p| p.mpc_id.clone()).collect(),
            },
            analysis_type: spec.analysis_type,
            created_at,
            keys_exp_at,
            result_timestamps: Vec::new(),
            latest_status: AnalysisStatus::Prepared,
            invoker: spec.invoker,
        };

        let doc = encode(collections::ANALYSES, &analysis)?;
        let analysis_id = self.store.save(collections::ANALYSES, doc).await?;

        for party in spec.parties {
            let share = KeyShare {
                analysis_id: analysis_id.clone(),
                user_id: caller.to_string(),
                mpc_id: party.mpc_id,
                key_share: party.key_share,
                exp_at: keys_exp_at,
            };
            let doc = encode(collections::KEY_SHARES, &share)?;
            let share_id = self.store.save(collections::KEY_SHARES, doc).await?;
            self.store
                .expire_at(collections::KEY_SHARES, &share_id, keys_exp_at)
                .await?;
        }

        info!(
            "Prepared MPC analysis {} for {} across {} parties",
            analysis_id,
            caller,
            analysis.target.parties().len()
        );
        Ok(analysis_id)
    }

    /// Creates an FHE analysis and immediately pushes it to the FHE
    /// server. No key shares exist on this path; the server computes on
    /// material it already holds.
    pub async fn prepare_fhe_analysis(
        &self,
        caller: &str,
        spec: FheAnalysisSpec,
    ) -> EngineResult<String> {
        if spec.exp_hours < 0.0 {
            return Err(OrchestratorError::invalid_analysis(
                "exp_hours must not be negative",
            ));
        }

        let created_at = now_ms();
        let keys_exp_at = created_at + (spec.exp_hours * MS_PER_HOUR).round() as i64;

        let analysis = Analysis {
            user_id: caller.to_string(),
            user_key: String::new(),
            source_dataset: spec.source_dataset,
            result_dataset: spec.result_dataset,
            metric: spec.metric,
            data_index: spec.data_index.clone(),
            target: ComputeTarget::Fhe,
            analysis_type: spec.analysis_type.clone(),
            created_at,
            keys_exp_at,
            result_timestamps: Vec::new(),
            latest_status: AnalysisStatus::Queued,
            invoker: Default::default(),
        };

        let doc = encode(collections::ANALYSES, &analysis)?;
        let analysis_id = self.store.save(collections::ANALYSES, doc).await?;

        let request = AnalyseRequest {
            analysis_id: analysis_id.clone(),
            user_id: caller.to_string(),
            data_index: spec.data_index,
            user_key: None,
            analysis_type: spec.analysis_type,
        };
        self.compute.analyse(&self.fhe_party(), &request).await?;

        info!("Prepared FHE analysis {} for {}", analysis_id, caller);
        Ok(analysis_id)
    }

    /// Pushes a prepared MPC analysis to each of its parties and marks it
    /// `Queued`. A party failure aborts the call; parties already reached
    /// keep the job (no rollback), which the next status sweep surfaces.
    pub async fn dispatch_analysis(&self, caller: &str, analysis_id: &str) -> EngineResult<()> {
        let mut analysis = self.fetch_owned_analysis(caller, analysis_id).await?;

        if analysis.is_fhe() {
            return Err(OrchestratorError::invalid_analysis(
                "fhe analyses are dispatched at prepare time",
            ));
        }

        let request = AnalyseRequest {
            analysis_id: analysis_id.to_string(),
            user_id: analysis.user_id.clone(),
            data_index: analysis.data_index.clone(),
            user_key: Some(analysis.user_key.clone()),
            analysis_type: analysis.analysis_type.clone(),
        };

        for mpc_id in analysis.target.parties() {
            let party = self.resolve_party(mpc_id).await?;
            self.compute.analyse(&party, &request).await?;
        }

        analysis.latest_status = AnalysisStatus::Queued;
        let doc = encode(collections::ANALYSES, &analysis)?;
        self.store.put(collections::ANALYSES, analysis_id, doc).await?;

        info!("Dispatched analysis {} to its parties", analysis_id);
        Ok(())
    }

    /// All analyses owned by `caller`, oldest first. Every analysis whose
    /// status a party poll could still change is refreshed (and the
    /// refresh persisted) before returning.
    pub async fn list_analyses(&self, caller: &str) -> EngineResult<Vec<(String, Analysis)>> {
        let hits = self
            .store
            .search_eq(collections::ANALYSES, "user_id", caller)
            .await?;

        let mut analyses = Vec::with_capacity(hits.len());
        for (analysis_id, doc) in hits {
            let mut analysis: Analysis = decode(collections::ANALYSES, doc)?;
            if !analysis.latest_status.is_settled() {
                self.refresh_analysis_status(&analysis_id, &mut analysis)
                    .await?;
            }
            analyses.push((analysis_id, analysis));
        }

        analyses.sort_by_key(|(_, analysis)| analysis.created_at);
        Ok(analyses)
    }

    /// Fetches an analysis the caller owns. A missing analysis and one
    /// owned by someone else both come back `NotFound`.
    pub async fn fetch_owned_analysis(
        &self,
        caller: &str,
        analysis_id: &str,
    ) -> EngineResult<Analysis> {
        let doc = self
            .store
            .fetch(collections::ANALYSES, analysis_id)
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        let analysis: Analysis = decode(collections::ANALYSES, doc)?;

        if analysis.user_id != caller {
            return Err(OrchestratorError::NotFound);
        }
        Ok(analysis)
    }

    /// Records a result pushed back by a compute party. The reporting
    /// party claims the analysis owner's id; a wrong claim reads as
    /// `NotFound`. The arrival timestamp lands on the analysis through an
    /// atomic append, so concurrent reports from different parties all
    /// survive.
    pub async fn record_result(
        &self,
        reporting_party: &str,
        analysis_id: &str,
        submission: ResultSubmission,
    ) -> EngineResult<()> {
        let analysis = self
            .fetch_owned_analysis(&submission.user_id, analysis_id)
            .await?;

        let arrived_at = now_ms();

        if analysis.is_fhe() {
            let record = FheResultRecord {
                ts: arrived_at,
                metric: analysis.metric.clone(),
                source: reporting_party.to_string(),
                value: FheResultValue {
                    is_combined: submission.is_combined.unwrap_or(true),
                    c_result: submission.result,
                    analysis_id: analysis_id.to_string(),
                },
            };
            self.fhe_results.append(record).await?;
        } else {
            let event = IngestEvent {
                timestamp: Some(arrived_at),
                metric: analysis.metric.clone(),
                value: json!({
                    "is_combined": submission.is_combined.unwrap_or(false),
                    "c_result": submission.result,
                }),
                source: Some(reporting_party.to_string()),
                tags: None,
            };
            self.datasets
                .ingest(&analysis.result_dataset, &[event])
                .await?;
        }

        self.store
            .array_push(
                collections::ANALYSES,
                analysis_id,
                "result_timestamps",
                json!(arrived_at),
            )
            .await?;

        debug!(
            "Recorded result for analysis {} from {}",
            analysis_id, reporting_party
        );
        Ok(())
    }

    /// The encrypted results of an analysis, or an empty page when no
    /// party has reported yet.
    pub async fn fetch_result(&self, caller: &str, analysis_id: &str) -> EngineResult<EventsPage> {
        let analysis = self.fetch_owned_analysis(caller, analysis_id).await?;

        let Some((from, to)) = analysis.result_range() else {
            return Ok(EventsPage::empty());
        };

        if analysis.is_fhe() {
            let records = self
                .fhe_results
                .query_range(&analysis.metric, from, to)
                .await?;
            let mut items = Vec::with_capacity(records.len());
            for record in records {
                items.push(EventItem {
                    timestamp: record.ts,
                    dataset: Some(analysis.result_dataset.clone()),
                    metric: Some(record.metric),
                    value: encode(collections::FHE_RESULTS, &record.value)?,
                    source: Some(record.source),
                });
            }
            return Ok(EventsPage {
                items,
                cursor: None,
            });
        }

        let query = EventsQuery {
            data_range: DataRange {
                datasets: vec![analysis.result_dataset.clone()],
                metrics: vec![analysis.metric.clone()],
            },
            from,
            to,
            fields: None,
        };
        self.datasets.query(&query).await
    }

    /// Hands a compute party the ciphertexts it needs, hex encoded. The
    /// party supplies the owner's id and the data points it wants; absent
    /// an explicit list, the analysis's own data index is used.
    pub async fn fetch_analysis_data(
        &self,
        claimed_user: &str,
        analysis_id: &str,
        data_index: Option<&[i64]>,
    ) -> EngineResult<Vec<String>> {
        let analysis = self.fetch_owned_analysis(claimed_user, analysis_id).await?;

        let index = data_index.unwrap_or(&analysis.data_index);
        let (from, to) = timestamp_range(index).ok_or_else(|| {
            OrchestratorError::invalid_analysis("data index must not be empty")
        })?;

        let query = EventsQuery {
            data_range: DataRange {
                datasets: vec![analysis.source_dataset.clone()],
                metrics: vec![analysis.metric.clone()],
            },
            from,
            to,
            fields: None,
        };
        let page = self.datasets.query(&query).await?;

        let mut user_data = Vec::with_capacity(page.items.len());
        for item in page.items {
            let hex = ciphertext_hex(&item.value).ok_or_else(|| {
                OrchestratorError::dataset(format!(
                    "event at {} carries no ciphertext payload",
                    item.timestamp
                ))
            })?;
            user_data.push(hex);
        }
        Ok(user_data)
    }

    /// The key share intended for the calling party. Shares for other
    /// parties are invisible, same as missing ones.
    pub async fn fetch_key_share(
        &self,
        party_caller: &str,
        analysis_id: &str,
    ) -> EngineResult<KeyShare> {
        let hits = self
            .store
            .search_eq(collections::KEY_SHARES, "analysis_id", analysis_id)
            .await?;

        for (_, doc) in hits {
            let share: KeyShare = decode(collections::KEY_SHARES, doc)?;
            if share.mpc_id == party_caller {
                return Ok(share);
            }
        }
        Err(OrchestratorError::NotFound)
    }

    /// Deletes every analysis and every key share. Test-environment reset
    /// only; results already ingested into datasets stay where they are.
    pub async fn cleanup_analyses(&self) -> EngineResult<(usize, usize)> {
        let analyses = self.store.list(collections::ANALYSES).await?;
        let analysis_ids: Vec<String> = analyses.into_iter().map(|(id, _)| id).collect();
        self.store
            .delete(collections::ANALYSES, &analysis_ids)
            .await?;

        let shares = self.store.list(collections::KEY_SHARES).await?;
        let share_ids: Vec<String> = shares.into_iter().map(|(id, _)| id).collect();
        self.store
            .delete(collections::KEY_SHARES, &share_ids)
            .await?;

        warn!(
            "Cleanup removed {} analyses and {} key shares",
            analysis_ids.len(),
            share_ids.len()
        );
        Ok((analysis_ids.len(), share_ids.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{make_engine, make_mpc_spec, register_parties};
    use super::*;
    use crate::models::FheAnalysisSpec;
    use crate::store::DocumentStore;
    use std::sync::Arc;

    fn make_fhe_spec() -> FheAnalysisSpec {
        FheAnalysisSpec {
            exp_hours: 1.0,
            source_dataset: "src-ds".to_string(),
            result_dataset: "res-ds".to_string(),
            metric: "ecg".to_string(),
            data_index: vec![100, 200],
            analysis_type: "heartbeat-demo".to_string(),
        }
    }

    #[tokio::test]
    async fn test_prepare_creates_one_share_per_party_with_matching_expiry() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();

        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        assert_eq!(analysis.latest_status, AnalysisStatus::Prepared);
        assert_eq!(analysis.target.parties(), ["mpc1", "mpc2"]);

        let shares = t
            .store
            .search_eq(collections::KEY_SHARES, "analysis_id", &id)
            .await
            .unwrap();
        assert_eq!(shares.len(), 2);
        for (_, doc) in shares {
            let share: KeyShare = decode(collections::KEY_SHARES, doc).unwrap();
            assert_eq!(share.exp_at, analysis.keys_exp_at);
            assert_eq!(share.user_id, "u1");
            assert_eq!(share.key_share, format!("share-for-{}", share.mpc_id));
        }
    }

    #[tokio::test]
    async fn test_prepare_rejects_unregistered_party() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let err = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::UnregisteredParty { ref mpc_id } if mpc_id == "mpc2"
        ));

        // Validation failed before anything persisted.
        assert!(t.store.list(collections::ANALYSES).await.unwrap().is_empty());
        assert!(t.store.list(collections::KEY_SHARES).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_rejects_bad_party_lists() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let err = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidAnalysis(_)));

        let err = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidAnalysis(_)));
    }

    #[tokio::test]
    async fn test_prepare_rejects_negative_expiry() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let mut spec = make_mpc_spec(&["mpc1"]);
        spec.exp_hours = -1.0;
        let err = t.engine.prepare_mpc_analysis("u1", spec).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidAnalysis(_)));
    }

    #[tokio::test]
    async fn test_prepare_accepts_fractional_expiry_hours() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let mut spec = make_mpc_spec(&["mpc1"]);
        spec.exp_hours = 0.5;
        let id = t.engine.prepare_mpc_analysis("u1", spec).await.unwrap();

        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        assert_eq!(analysis.keys_exp_at - analysis.created_at, 1_800_000);
    }

    #[tokio::test]
    async fn test_prepare_fhe_queues_and_pushes_immediately() {
        let t = make_engine();

        let id = t
            .engine
            .prepare_fhe_analysis("u1", make_fhe_spec())
            .await
            .unwrap();

        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        assert!(analysis.is_fhe());
        assert_eq!(analysis.latest_status, AnalysisStatus::Queued);
        assert!(analysis.user_key.is_empty());

        let calls = t.compute.analyse_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "fhe");
        assert!(calls[0].1.user_key.is_none());
        assert_eq!(calls[0].1.analysis_id, id);
    }

    #[tokio::test]
    async fn test_dispatch_pushes_to_every_party_and_marks_queued() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();
        t.engine.dispatch_analysis("u1", &id).await.unwrap();

        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        assert_eq!(analysis.latest_status, AnalysisStatus::Queued);

        let calls = t.compute.analyse_calls.lock().unwrap();
        let targets: Vec<&str> = calls.iter().map(|(mpc_id, _)| mpc_id.as_str()).collect();
        assert_eq!(targets, ["mpc1", "mpc2"]);
        assert_eq!(calls[0].1.user_key.as_deref(), Some("user-pk"));
        assert_eq!(calls[0].1.data_index, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_dispatch_failure_keeps_partial_state_visible() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;
        t.compute.fail_party("mpc2");

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();
        let err = t.engine.dispatch_analysis("u1", &id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PartyCompute { .. }));

        // The first party already holds the job; the record still says
        // Prepared. Only the next status sweep can surface the mismatch.
        assert_eq!(t.compute.analyse_calls.lock().unwrap().len(), 1);
        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        assert_eq!(analysis.latest_status, AnalysisStatus::Prepared);
    }

    #[tokio::test]
    async fn test_fetch_owned_never_leaks_existence() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();

        let missing = t.engine.fetch_owned_analysis("u1", "no-such-id").await;
        let unowned = t.engine.fetch_owned_analysis("u2", &id).await;
        assert_eq!(missing.unwrap_err().to_string(), "not found");
        assert_eq!(unowned.unwrap_err().to_string(), "not found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_result_reports_all_land() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2", "mpc3"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2", "mpc3"]))
            .await
            .unwrap();

        let engine = Arc::new(t.engine.clone());
        let mut handles = Vec::new();
        for reporter in ["mpc1", "mpc2", "mpc3", "mpc1"] {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .record_result(
                        reporter,
                        &id,
                        ResultSubmission {
                            user_id: "u1".to_string(),
                            result: format!("cipher-from-{reporter}"),
                            is_combined: None,
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        assert_eq!(analysis.result_timestamps.len(), 4);
        assert_eq!(t.datasets.ingests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_record_result_rejects_wrong_owner_claim() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();

        let err = t
            .engine
            .record_result(
                "mpc1",
                &id,
                ResultSubmission {
                    user_id: "intruder".to_string(),
                    result: "cipher".to_string(),
                    is_combined: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound));
        assert!(t.datasets.ingests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_result_mpc_ingests_into_result_dataset() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();
        t.engine
            .record_result(
                "mpc1",
                &id,
                ResultSubmission {
                    user_id: "u1".to_string(),
                    result: "cipher-a".to_string(),
                    is_combined: None,
                },
            )
            .await
            .unwrap();

        let ingests = t.datasets.ingests.lock().unwrap();
        assert_eq!(ingests.len(), 1);
        let (dataset, events) = &ingests[0];
        assert_eq!(dataset, "res-ds");
        assert_eq!(events[0].value["c_result"], "cipher-a");
        assert_eq!(events[0].value["is_combined"], false);
        assert_eq!(events[0].source.as_deref(), Some("mpc1"));
    }

    #[tokio::test]
    async fn test_record_result_fhe_lands_in_result_store() {
        let t = make_engine();
        let id = t
            .engine
            .prepare_fhe_analysis("u1", make_fhe_spec())
            .await
            .unwrap();

        t.engine
            .record_result(
                "fhe",
                &id,
                ResultSubmission {
                    user_id: "u1".to_string(),
                    result: "cipher-f".to_string(),
                    is_combined: None,
                },
            )
            .await
            .unwrap();

        // Nothing goes through the dataset service on the FHE path.
        assert!(t.datasets.ingests.lock().unwrap().is_empty());

        let page = t.engine.fetch_result("u1", &id).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].value["c_result"], "cipher-f");
        assert_eq!(page.items[0].value["analysis_id"], id);
        assert_eq!(page.items[0].value["is_combined"], true);
        assert_eq!(page.items[0].source.as_deref(), Some("fhe"));
    }

    #[tokio::test]
    async fn test_fetch_result_before_any_report_is_empty() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();
        let page = t.engine.fetch_result("u1", &id).await.unwrap();

        assert!(page.items.is_empty());
        assert!(page.cursor.is_none());
        assert!(t.datasets.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_result_queries_result_timestamp_range() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();
        for reporter in ["mpc1", "mpc2"] {
            t.engine
                .record_result(
                    reporter,
                    &id,
                    ResultSubmission {
                        user_id: "u1".to_string(),
                        result: "cipher".to_string(),
                        is_combined: None,
                    },
                )
                .await
                .unwrap();
        }

        t.engine.fetch_result("u1", &id).await.unwrap();

        let analysis = t.engine.fetch_owned_analysis("u1", &id).await.unwrap();
        let (from, to) = analysis.result_range().unwrap();
        let queries = t.datasets.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].from, from);
        assert_eq!(queries[0].to, to);
        assert_eq!(queries[0].data_range.datasets, ["res-ds"]);
        assert_eq!(queries[0].data_range.metrics, ["ecg"]);
    }

    #[tokio::test]
    async fn test_fetch_analysis_data_hex_encodes_ciphertexts() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();

        t.datasets.push_page(EventsPage {
            items: vec![
                EventItem {
                    timestamp: 100,
                    dataset: None,
                    metric: None,
                    value: json!({"map": {"c": [0, 255, 16]}}),
                    source: None,
                },
                EventItem {
                    timestamp: 200,
                    dataset: None,
                    metric: None,
                    value: json!({"map": {"c": [171]}}),
                    source: None,
                },
            ],
            cursor: None,
        });

        let data = t
            .engine
            .fetch_analysis_data("u1", &id, Some(&[200, 100]))
            .await
            .unwrap();
        assert_eq!(data, vec!["00ff10".to_string(), "ab".to_string()]);

        let queries = t.datasets.queries.lock().unwrap();
        assert_eq!(queries[0].from, 100);
        assert_eq!(queries[0].to, 201);
        assert_eq!(queries[0].data_range.datasets, ["src-ds"]);
    }

    #[tokio::test]
    async fn test_fetch_analysis_data_rejects_payload_without_ciphertext() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();
        t.datasets.push_page(EventsPage {
            items: vec![EventItem {
                timestamp: 100,
                dataset: None,
                metric: None,
                value: json!({"unexpected": true}),
                source: None,
            }],
            cursor: None,
        });

        let err = t
            .engine
            .fetch_analysis_data("u1", &id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Dataset(_)));
    }

    #[tokio::test]
    async fn test_fetch_key_share_only_answers_the_designated_party() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();

        let share = t.engine.fetch_key_share("mpc2", &id).await.unwrap();
        assert_eq!(share.mpc_id, "mpc2");
        assert_eq!(share.key_share, "share-for-mpc2");

        let err = t.engine.fetch_key_share("mpc9", &id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound));
    }

    #[tokio::test]
    async fn test_cleanup_removes_analyses_and_shares() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;

        t.engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();
        t.engine
            .prepare_mpc_analysis("u2", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();

        let (analyses, shares) = t.engine.cleanup_analyses().await.unwrap();
        assert_eq!(analyses, 2);
        assert_eq!(shares, 3);
        assert!(t.store.list(collections::ANALYSES).await.unwrap().is_empty());
        assert!(t.store.list(collections::KEY_SHARES).await.unwrap().is_empty());

        // The registry survives a cleanup.
        assert_eq!(t.engine.list_parties().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_refreshes_only_active_analyses() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;

        let prepared = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();
        let dispatched = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1"]))
            .await
            .unwrap();
        t.engine.dispatch_analysis("u1", &dispatched).await.unwrap();
        t.compute.set_status("mpc1", &dispatched, "Completed");

        let analyses = t.engine.list_analyses("u1").await.unwrap();
        let by_id: std::collections::HashMap<_, _> = analyses.into_iter().collect();

        assert_eq!(
            by_id[&prepared].latest_status,
            AnalysisStatus::Prepared,
            "prepared analyses are not polled"
        );
        assert_eq!(by_id[&dispatched].latest_status, AnalysisStatus::Completed);

        // The refresh is persisted, not just reported.
        let stored = t
            .engine
            .fetch_owned_analysis("u1", &dispatched)
            .await
            .unwrap();
        assert_eq!(stored.latest_status, AnalysisStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_fails_hard_when_a_party_is_unreachable() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2"]).await;

        let id = t
            .engine
            .prepare_mpc_analysis("u1", make_mpc_spec(&["mpc1", "mpc2"]))
            .await
            .unwrap();
        t.engine.dispatch_analysis("u1", &id).await.unwrap();
        t.compute.fail_party("mpc2");

        let err = t.engine.list_analyses("u1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PartyCompute { .. }));
    }

    #[test]
    fn test_ciphertext_hex_rejects_out_of_range_bytes() {
        assert_eq!(
            ciphertext_hex(&json!({"map": {"c": [0, 15, 255]}})),
            Some("000fff".to_string())
        );
        assert_eq!(ciphertext_hex(&json!({"map": {"c": [256]}})), None);
        assert_eq!(ciphertext_hex(&json!({"map": {}})), None);
        assert_eq!(ciphertext_hex(&json!("not-an-object")), None);
    }
}
