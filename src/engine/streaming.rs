//! The streaming auto-batcher.
//!
//! An active session turns every ingested data point into a one-point
//! analysis and flushes them into a batch once `batch_size` are pending.
//! The flush is decoupled from the ingest call through a durable
//! submission ledger: the taken ids are persisted as a `Pending` entry
//! first, and a detached worker drives the entry to `Acknowledged`, so an
//! ill-timed crash leaves a recoverable record instead of a lost batch.

use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::Orchestrator;
use crate::error::{EngineResult, OrchestratorError};
use crate::models::{
    now_ms, BatchSpec, BatchSubmission, Invoker, MpcAnalysisSpec, PartyShare, StreamingInfo,
    StreamingSession, StreamingSpec, SubmissionState, STREAMING_PARTIES,
};
use crate::store::{collections, decode, encode};

/// Fixed document id of the singleton session. Conditional create on
/// this id is what makes "at most one session" hold under racing starts.
const ACTIVE_SESSION: &str = "active";

impl Orchestrator {
    /// Opens the streaming session. There can be only one; it implicitly
    /// ends when its key material expires.
    pub async fn start_streaming(&self, spec: StreamingSpec) -> EngineResult<()> {
        if spec.key_shares.len() != STREAMING_PARTIES.len() {
            return Err(OrchestratorError::invalid_analysis(format!(
                "streaming needs exactly {} key shares, ordered {}",
                STREAMING_PARTIES.len(),
                STREAMING_PARTIES.join(", ")
            )));
        }
        if spec.batch_size == 0 {
            return Err(OrchestratorError::invalid_analysis(
                "streaming batch size must be at least 1",
            ));
        }
        if spec.keys_exp_at <= now_ms() {
            return Err(OrchestratorError::invalid_analysis(
                "streaming keys are already expired",
            ));
        }

        let session = StreamingSession {
            analysis_type: spec.analysis_type,
            batch_size: spec.batch_size,
            key_shares: spec.key_shares,
            start_time: spec.start_time,
            keys_exp_at: spec.keys_exp_at,
            source: spec.source,
            result: spec.result,
            submitted_batches: Vec::new(),
            current_analysis_ids: Vec::new(),
        };
        // The expiry rides along with the conditional create: the session
        // can never exist, even briefly, without its end-of-life set.
        let doc = encode(collections::STREAMING, &session)?;
        let created = self
            .store
            .insert_unique(
                collections::STREAMING,
                ACTIVE_SESSION,
                doc,
                Some(session.keys_exp_at),
            )
            .await?;
        if !created {
            return Err(OrchestratorError::AlreadyStreaming);
        }

        info!(
            "Streaming session open on '{}', flushing batches of {}",
            session.source, session.batch_size
        );
        Ok(())
    }

    /// Closes the streaming session.
    pub async fn stop_streaming(&self) -> EngineResult<()> {
        if self.active_session().await?.is_none() {
            return Err(OrchestratorError::NotStreaming);
        }
        self.store
            .delete(collections::STREAMING, &[ACTIVE_SESSION.to_string()])
            .await?;
        info!("Streaming session closed");
        Ok(())
    }

    /// The session state with key shares redacted.
    pub async fn streaming_info(&self) -> EngineResult<StreamingInfo> {
        let session = self.active_session().await?;
        Ok(StreamingInfo {
            is_streaming: session.is_some(),
            session: session.map(Into::into),
        })
    }

    async fn active_session(&self) -> EngineResult<Option<StreamingSession>> {
        match self
            .store
            .fetch(collections::STREAMING, ACTIVE_SESSION)
            .await?
        {
            Some(doc) => Ok(Some(decode(collections::STREAMING, doc)?)),
            None => Ok(None),
        }
    }

    /// Reacts to one ingested data point.
    ///
    /// Without an active session, or for a dataset other than the session
    /// source, this is a no-op. Otherwise the point becomes a one-point
    /// analysis on the canonical parties; reaching `batch_size` pending
    /// analyses moves them into the submission ledger and schedules the
    /// deferred dispatch.
    pub(crate) async fn on_ingested(
        &self,
        caller: &str,
        dataset: &str,
        metric: &str,
        timestamp: i64,
    ) -> EngineResult<()> {
        let Some(session) = self.active_session().await? else {
            return Ok(());
        };
        if session.source != dataset {
            return Ok(());
        }

        let parties = STREAMING_PARTIES
            .iter()
            .zip(&session.key_shares)
            .map(|(mpc_id, key_share)| PartyShare {
                mpc_id: (*mpc_id).to_string(),
                key_share: key_share.clone(),
            })
            .collect();
        let analysis_id = self
            .prepare_mpc_analysis(
                caller,
                MpcAnalysisSpec {
                    parties,
                    exp_hours: session.remaining_exp_hours(now_ms()),
                    user_key: String::new(),
                    source_dataset: session.source.clone(),
                    result_dataset: session.result.clone(),
                    metric: metric.to_string(),
                    data_index: vec![timestamp],
                    analysis_type: session.analysis_type.clone(),
                    invoker: Invoker::Streaming,
                },
            )
            .await?;

        self.store
            .array_push(
                collections::STREAMING,
                ACTIVE_SESSION,
                "current_analysis_ids",
                json!(analysis_id),
            )
            .await?;

        let Some(session) = self.active_session().await? else {
            return Ok(());
        };
        if session.current_analysis_ids.len() < session.batch_size {
            return Ok(());
        }

        // Concurrent ingests may reach this point together; the atomic
        // all-or-nothing take guarantees each pending id lands in exactly
        // one flush, and whoever finds the queue back below the threshold
        // takes nothing rather than flushing an undersized batch.
        let taken = self
            .store
            .array_take_front(
                collections::STREAMING,
                ACTIVE_SESSION,
                "current_analysis_ids",
                session.batch_size,
            )
            .await?;
        let analysis_ids: Vec<String> = taken
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();
        if analysis_ids.is_empty() {
            return Ok(());
        }

        let submission = BatchSubmission {
            analysis_ids,
            analysis_type: session.analysis_type.clone(),
            start_time: session.start_time,
            keys_exp_at: session.keys_exp_at,
            state: SubmissionState::Pending,
            created_at: now_ms(),
            batch_id: None,
        };
        let doc = encode(collections::SUBMISSIONS, &submission)?;
        let submission_id = self.store.save(collections::SUBMISSIONS, doc).await?;
        debug!(
            "Flushing {} pending analyses as submission {}",
            submission.analysis_ids.len(),
            submission_id
        );

        // The ingest reply must not wait on the compute parties. The
        // ledger entry is already durable, so the worst a crash here can
        // do is leave it Pending for a later flush.
        let engine = self.clone();
        let delay = Duration::from_millis(self.config.submit_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = engine.drive_submission(&submission_id).await {
                error!("Deferred batch submission {} failed: {}", submission_id, err);
            }
        });

        Ok(())
    }

    /// Drives one ledger entry through `pending -> dispatched ->
    /// acknowledged`. The `Pending -> Dispatched` move is a conditional
    /// swap on the stored state, so however many drivers race on one
    /// entry, exactly one of them pushes the batch.
    pub(crate) async fn drive_submission(
        &self,
        submission_id: &str,
    ) -> EngineResult<Option<String>> {
        let doc = self
            .store
            .fetch(collections::SUBMISSIONS, submission_id)
            .await?
            .ok_or(OrchestratorError::NotFound)?;
        let mut submission: BatchSubmission = decode(collections::SUBMISSIONS, doc)?;

        if submission.state != SubmissionState::Pending {
            debug!(
                "Submission {} is already {}, leaving it alone",
                submission_id, submission.state
            );
            return Ok(submission.batch_id);
        }

        submission.state = SubmissionState::Dispatched;
        let doc = encode(collections::SUBMISSIONS, &submission)?;
        let claimed = self
            .store
            .put_if_eq(
                collections::SUBMISSIONS,
                submission_id,
                "state",
                &json!(SubmissionState::Pending),
                doc,
            )
            .await?;
        if !claimed {
            debug!(
                "Submission {} was claimed by another driver",
                submission_id
            );
            return Ok(None);
        }

        let member_count = submission.analysis_ids.len();
        let batch_id = self
            .submit_batch(BatchSpec {
                batch_size: member_count,
                analysis_data_point_count: 1,
                analysis_ids: submission.analysis_ids.clone(),
                analysis_type: submission.analysis_type.clone(),
                online_only: false,
                streaming: Some(vec![
                    [submission.start_time, submission.keys_exp_at];
                    member_count
                ]),
            })
            .await?;

        submission.state = SubmissionState::Acknowledged;
        submission.batch_id = Some(batch_id.clone());
        let doc = encode(collections::SUBMISSIONS, &submission)?;
        self.store
            .put(collections::SUBMISSIONS, submission_id, doc)
            .await?;

        // Best effort: the session may have stopped or expired while the
        // batch was in flight; the ledger already records the batch id.
        if let Err(err) = self
            .store
            .array_push(
                collections::STREAMING,
                ACTIVE_SESSION,
                "submitted_batches",
                json!(batch_id),
            )
            .await
        {
            debug!("No session left to record batch {} on: {}", batch_id, err);
        }

        info!(
            "Streaming submission {} became batch {} ({} analyses)",
            submission_id, batch_id, member_count
        );
        Ok(Some(batch_id))
    }

    /// Re-drives ledger entries a crash left in `Pending`. Entries stuck
    /// in `Dispatched` are reported but never re-pushed; whether their
    /// batch reached the parties is what the status sweep answers.
    pub async fn flush_pending_submissions(&self) -> EngineResult<Vec<(String, String)>> {
        let entries = self.store.list(collections::SUBMISSIONS).await?;

        let mut driven = Vec::new();
        for (submission_id, doc) in entries {
            let submission: BatchSubmission = decode(collections::SUBMISSIONS, doc)?;
            match submission.state {
                SubmissionState::Pending => {
                    if let Some(batch_id) = self.drive_submission(&submission_id).await? {
                        driven.push((submission_id, batch_id));
                    }
                }
                SubmissionState::Dispatched => warn!(
                    "Submission {} is stuck dispatched without an acknowledged batch",
                    submission_id
                ),
                SubmissionState::Acknowledged => {}
            }
        }
        Ok(driven)
    }

    /// The whole submission ledger, oldest first.
    pub async fn list_submissions(&self) -> EngineResult<Vec<(String, BatchSubmission)>> {
        let entries = self.store.list(collections::SUBMISSIONS).await?;
        let mut submissions: Vec<(String, BatchSubmission)> = Vec::with_capacity(entries.len());
        for (submission_id, doc) in entries {
            submissions.push((submission_id, decode(collections::SUBMISSIONS, doc)?));
        }
        submissions.sort_by_key(|(_, submission)| submission.created_at);
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{
        make_engine, make_mpc_spec, register_parties, FakeComputeClient, FakeDatasetService,
        TestEngine,
    };
    use super::super::EngineConfig;
    use super::*;
    use crate::client::IngestEvent;
    use crate::error::StoreError;
    use crate::models::AnalysisStatus;
    use crate::store::{DocumentStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;

    fn make_stream_spec(now: i64) -> StreamingSpec {
        StreamingSpec {
            analysis_type: "heartbeat-demo".to_string(),
            batch_size: 3,
            key_shares: vec!["ks1".into(), "ks2".into(), "ks3".into()],
            start_time: now,
            keys_exp_at: now + 3_600_000,
            source: "src-ds".to_string(),
            result: "res-ds".to_string(),
        }
    }

    fn make_event(timestamp: i64) -> IngestEvent {
        IngestEvent {
            timestamp: Some(timestamp),
            metric: "ecg".to_string(),
            value: json!({"map": {"c": [7]}}),
            source: Some("sensor-1".to_string()),
            tags: None,
        }
    }

    async fn save_submission(t: &TestEngine, submission: &BatchSubmission) -> String {
        let doc = encode(collections::SUBMISSIONS, submission).unwrap();
        t.store.save(collections::SUBMISSIONS, doc).await.unwrap()
    }

    /// A one-point MPC analysis suitable as a streaming batch member.
    async fn make_one_point_member(t: &TestEngine, timestamp: i64) -> String {
        let mut spec = make_mpc_spec(&["mpc1"]);
        spec.data_index = vec![timestamp];
        t.engine.prepare_mpc_analysis("u1", spec).await.unwrap()
    }

    /// A store that answers submission-ledger writes slowly, holding open
    /// the window in which two drivers can both observe a Pending entry.
    #[derive(Default)]
    struct LaggedSubmissionStore {
        inner: MemoryStore,
    }

    impl LaggedSubmissionStore {
        async fn lag(&self, collection: &str) {
            if collection == collections::SUBMISSIONS {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        }
    }

    #[async_trait]
    impl DocumentStore for LaggedSubmissionStore {
        async fn save(&self, collection: &str, doc: Value) -> Result<String, StoreError> {
            self.inner.save(collection, doc).await
        }

        async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
            self.lag(collection).await;
            self.inner.put(collection, id, doc).await
        }

        async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
            self.inner.fetch(collection, id).await
        }

        async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.list(collection).await
        }

        async fn search_eq(
            &self,
            collection: &str,
            field: &str,
            value: &str,
        ) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.search_eq(collection, field, value).await
        }

        async fn array_push(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            value: Value,
        ) -> Result<(), StoreError> {
            self.inner.array_push(collection, id, field, value).await
        }

        async fn array_take_front(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            count: usize,
        ) -> Result<Vec<Value>, StoreError> {
            self.inner.array_take_front(collection, id, field, count).await
        }

        async fn insert_unique(
            &self,
            collection: &str,
            id: &str,
            doc: Value,
            expire_at: Option<i64>,
        ) -> Result<bool, StoreError> {
            self.inner.insert_unique(collection, id, doc, expire_at).await
        }

        async fn put_if_eq(
            &self,
            collection: &str,
            id: &str,
            field: &str,
            expected: &Value,
            doc: Value,
        ) -> Result<bool, StoreError> {
            self.lag(collection).await;
            self.inner.put_if_eq(collection, id, field, expected, doc).await
        }

        async fn expire_at(&self, collection: &str, id: &str, at_ms: i64) -> Result<(), StoreError> {
            self.inner.expire_at(collection, id, at_ms).await
        }

        async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
            self.inner.delete(collection, ids).await
        }
    }

    async fn settle_until<F>(t: &TestEngine, mut done: F)
    where
        F: FnMut(&TestEngine) -> bool,
    {
        for _ in 0..100 {
            if done(t) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deferred submission did not settle in time");
    }

    #[tokio::test]
    async fn test_second_start_is_already_streaming() {
        let t = make_engine();
        let now = now_ms();

        t.engine.start_streaming(make_stream_spec(now)).await.unwrap();
        let err = t
            .engine
            .start_streaming(make_stream_spec(now))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyStreaming));
    }

    #[tokio::test]
    async fn test_stop_without_session_is_not_streaming() {
        let t = make_engine();
        let err = t.engine.stop_streaming().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotStreaming));

        t.engine
            .start_streaming(make_stream_spec(now_ms()))
            .await
            .unwrap();
        t.engine.stop_streaming().await.unwrap();
        assert!(!t.engine.streaming_info().await.unwrap().is_streaming);
    }

    #[tokio::test]
    async fn test_start_validates_the_spec() {
        let t = make_engine();
        let now = now_ms();

        let mut two_shares = make_stream_spec(now);
        two_shares.key_shares.pop();
        let err = t.engine.start_streaming(two_shares).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidAnalysis(_)));

        let mut empty_batches = make_stream_spec(now);
        empty_batches.batch_size = 0;
        let err = t.engine.start_streaming(empty_batches).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidAnalysis(_)));

        let mut expired = make_stream_spec(now);
        expired.keys_exp_at = now - 1;
        let err = t.engine.start_streaming(expired).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidAnalysis(_)));
    }

    #[tokio::test]
    async fn test_info_exposes_session_without_shares() {
        let t = make_engine();
        t.engine
            .start_streaming(make_stream_spec(now_ms()))
            .await
            .unwrap();

        let info = t.engine.streaming_info().await.unwrap();
        assert!(info.is_streaming);
        let session = info.session.unwrap();
        assert_eq!(session.batch_size, 3);
        assert_eq!(session.source, "src-ds");
        assert!(session.current_analysis_ids.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_is_noop_without_matching_session() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2", "mpc3"]).await;

        // No session at all.
        t.engine
            .ingest_events("u1", "src-ds", &[make_event(100)])
            .await
            .unwrap();

        // A session watching a different dataset.
        t.engine
            .start_streaming(make_stream_spec(now_ms()))
            .await
            .unwrap();
        t.engine
            .ingest_events("u1", "other-ds", &[make_event(200)])
            .await
            .unwrap();

        assert!(t.engine.list_analyses("u1").await.unwrap().is_empty());
        let info = t.engine.streaming_info().await.unwrap();
        assert!(info.session.unwrap().current_analysis_ids.is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_three_flushes_on_third_point() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2", "mpc3"]).await;
        let now = now_ms();
        t.engine.start_streaming(make_stream_spec(now)).await.unwrap();

        t.engine
            .ingest_events("u1", "src-ds", &[make_event(100), make_event(200)])
            .await
            .unwrap();

        let info = t.engine.streaming_info().await.unwrap();
        let session = info.session.unwrap();
        assert_eq!(session.current_analysis_ids.len(), 2);
        assert!(session.submitted_batches.is_empty());
        assert!(t.engine.list_submissions().await.unwrap().is_empty());

        // One streaming analysis per point, owned by the ingesting user.
        let analyses = t.engine.list_analyses("u1").await.unwrap();
        assert_eq!(analyses.len(), 2);
        let (_, first) = &analyses[0];
        assert_eq!(first.invoker, Invoker::Streaming);
        assert_eq!(first.data_index.len(), 1);
        assert!(first.user_key.is_empty());
        assert_eq!(first.target.parties(), STREAMING_PARTIES);

        t.engine
            .ingest_events("u1", "src-ds", &[make_event(300)])
            .await
            .unwrap();
        settle_until(&t, |t| {
            t.compute.batch_calls.lock().unwrap().len() == 3
        })
        .await;
        // The worker records the batch on the session last; wait for it.
        let mut info = t.engine.streaming_info().await.unwrap();
        for _ in 0..100 {
            if info
                .session
                .as_ref()
                .is_some_and(|session| !session.submitted_batches.is_empty())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            info = t.engine.streaming_info().await.unwrap();
        }
        let session = info.session.unwrap();
        assert!(session.current_analysis_ids.is_empty());
        assert_eq!(session.submitted_batches.len(), 1);

        let submissions = t.engine.list_submissions().await.unwrap();
        assert_eq!(submissions.len(), 1);
        let (_, submission) = &submissions[0];
        assert_eq!(submission.state, SubmissionState::Acknowledged);
        assert_eq!(
            submission.batch_id.as_deref(),
            Some(session.submitted_batches[0].as_str())
        );
        assert_eq!(submission.analysis_ids.len(), 3);

        // One dispatch per canonical party, carrying the descriptor.
        let calls = t.compute.batch_calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let request = &calls[0].1;
        assert_eq!(request.analysis_id.len(), 3);
        assert_eq!(
            request.streaming,
            Some(vec![[now, now + 3_600_000]; 3])
        );
        drop(calls);

        let batch = t
            .engine
            .fetch_batch(&session.submitted_batches[0])
            .await
            .unwrap();
        assert_eq!(batch.invoker, Invoker::Streaming);
        assert_eq!(batch.analysis_data_point_count, 1);
        assert_eq!(batch.latest_status, AnalysisStatus::Queued);
    }

    #[tokio::test]
    async fn test_flush_redrives_pending_entries_only() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;
        let now = now_ms();

        let member = make_one_point_member(&t, 100).await;
        let pending_id = save_submission(
            &t,
            &BatchSubmission {
                analysis_ids: vec![member],
                analysis_type: "heartbeat-demo".to_string(),
                start_time: now,
                keys_exp_at: now + 3_600_000,
                state: SubmissionState::Pending,
                created_at: now,
                batch_id: None,
            },
        )
        .await;
        let stuck_id = save_submission(
            &t,
            &BatchSubmission {
                analysis_ids: vec!["a-lost".to_string()],
                analysis_type: "heartbeat-demo".to_string(),
                start_time: now,
                keys_exp_at: now + 3_600_000,
                state: SubmissionState::Dispatched,
                created_at: now,
                batch_id: None,
            },
        )
        .await;

        let driven = t.engine.flush_pending_submissions().await.unwrap();
        assert_eq!(driven.len(), 1);
        assert_eq!(driven[0].0, pending_id);

        // The pending entry became a real batch; the stuck one was left
        // exactly as it was.
        assert_eq!(t.compute.batch_calls.lock().unwrap().len(), 1);
        let submissions = t.engine.list_submissions().await.unwrap();
        for (submission_id, submission) in submissions {
            if submission_id == stuck_id {
                assert_eq!(submission.state, SubmissionState::Dispatched);
                assert!(submission.batch_id.is_none());
            } else {
                assert_eq!(submission.state, SubmissionState::Acknowledged);
                assert!(submission.batch_id.is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_failed_dispatch_leaves_a_visible_dispatched_entry() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;
        t.compute.fail_party("mpc1");
        let now = now_ms();

        let member = make_one_point_member(&t, 100).await;
        let submission_id = save_submission(
            &t,
            &BatchSubmission {
                analysis_ids: vec![member],
                analysis_type: "heartbeat-demo".to_string(),
                start_time: now,
                keys_exp_at: now + 3_600_000,
                state: SubmissionState::Pending,
                created_at: now,
                batch_id: None,
            },
        )
        .await;

        let err = t.engine.drive_submission(&submission_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PartyCompute { .. }));

        let submissions = t.engine.list_submissions().await.unwrap();
        assert_eq!(submissions[0].1.state, SubmissionState::Dispatched);
        assert!(submissions[0].1.batch_id.is_none());
    }

    #[tokio::test]
    async fn test_drive_leaves_settled_entries_alone() {
        let t = make_engine();
        let now = now_ms();

        let acked_id = save_submission(
            &t,
            &BatchSubmission {
                analysis_ids: vec!["a1".to_string()],
                analysis_type: "heartbeat-demo".to_string(),
                start_time: now,
                keys_exp_at: now + 3_600_000,
                state: SubmissionState::Acknowledged,
                created_at: now,
                batch_id: Some("b-done".to_string()),
            },
        )
        .await;

        let driven = t.engine.drive_submission(&acked_id).await.unwrap();
        assert_eq!(driven.as_deref(), Some("b-done"));
        assert!(t.compute.batch_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drive_succeeds_after_session_is_gone() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1"]).await;
        let now = now_ms();

        // No session exists; the ledger entry is self-contained.
        let member = make_one_point_member(&t, 100).await;
        let submission_id = save_submission(
            &t,
            &BatchSubmission {
                analysis_ids: vec![member],
                analysis_type: "heartbeat-demo".to_string(),
                start_time: now,
                keys_exp_at: now + 3_600_000,
                state: SubmissionState::Pending,
                created_at: now,
                batch_id: None,
            },
        )
        .await;

        let batch_id = t
            .engine
            .drive_submission(&submission_id)
            .await
            .unwrap()
            .unwrap();
        assert!(t.engine.fetch_batch(&batch_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_racing_drivers_push_the_batch_exactly_once() {
        // The deferred worker and an explicit flush can race on the same
        // Pending entry. Slow ledger writes let both of them read it as
        // Pending; the conditional claim still admits only one dispatch.
        let store = Arc::new(LaggedSubmissionStore::default());
        let compute = Arc::new(FakeComputeClient::default());
        let engine = Orchestrator::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            Arc::clone(&compute) as Arc<dyn crate::client::ComputeClient>,
            Arc::new(FakeDatasetService::default()),
            EngineConfig {
                fhe_endpoint: "http://fhe.test".to_string(),
                submit_delay_ms: 10,
            },
        );
        register_parties(&engine, &["mpc1"]).await;
        let mut spec = make_mpc_spec(&["mpc1"]);
        spec.data_index = vec![100];
        let member = engine.prepare_mpc_analysis("u1", spec).await.unwrap();

        let now = now_ms();
        let doc = encode(
            collections::SUBMISSIONS,
            &BatchSubmission {
                analysis_ids: vec![member],
                analysis_type: "heartbeat-demo".to_string(),
                start_time: now,
                keys_exp_at: now + 3_600_000,
                state: SubmissionState::Pending,
                created_at: now,
                batch_id: None,
            },
        )
        .unwrap();
        let submission_id = store
            .save(collections::SUBMISSIONS, doc)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            engine.drive_submission(&submission_id),
            engine.drive_submission(&submission_id),
        );
        let driven: Vec<String> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(driven.len(), 1);

        // One dispatch to the single party, one batch record, one
        // acknowledged ledger entry pointing at it.
        assert_eq!(compute.batch_calls.lock().unwrap().len(), 1);
        assert_eq!(store.list(collections::BATCHES).await.unwrap().len(), 1);
        let submissions = engine.list_submissions().await.unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].1.state, SubmissionState::Acknowledged);
        assert_eq!(submissions[0].1.batch_id.as_deref(), Some(driven[0].as_str()));
    }

    #[tokio::test]
    async fn test_take_below_threshold_flushes_nothing() {
        let t = make_engine();
        register_parties(&t.engine, &["mpc1", "mpc2", "mpc3"]).await;
        t.engine
            .start_streaming(make_stream_spec(now_ms()))
            .await
            .unwrap();

        t.engine
            .ingest_events("u1", "src-ds", &[make_event(100), make_event(200)])
            .await
            .unwrap();

        // An ingest that saw the queue crest the threshold can find it
        // already drained below it by the time it takes; it comes away
        // empty-handed instead of flushing an undersized batch.
        let taken = t
            .store
            .array_take_front(
                collections::STREAMING,
                ACTIVE_SESSION,
                "current_analysis_ids",
                3,
            )
            .await
            .unwrap();
        assert!(taken.is_empty());

        let info = t.engine.streaming_info().await.unwrap();
        assert_eq!(info.session.unwrap().current_analysis_ids.len(), 2);
        assert!(t.engine.list_submissions().await.unwrap().is_empty());
    }
}
