//! Data models for the orchestration engine.
//!
//! This module contains all the core data structures used throughout
//! the application for representing analyses, key shares, batches and
//! streaming sessions, plus the request shapes the engine accepts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds per hour, used for key-expiry arithmetic.
pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// Current wall-clock time as UTC epoch milliseconds.
///
/// All persisted and wire-level timestamps use this representation.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Half-open range `[min, max + 1)` covering a list of event timestamps.
///
/// Returns `None` for an empty list.
pub fn timestamp_range(timestamps: &[i64]) -> Option<(i64, i64)> {
    let min = *timestamps.iter().min()?;
    let max = *timestamps.iter().max()?;
    Some((min, max + 1))
}

/// Lifecycle status of an analysis or a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisStatus {
    /// Created and key shares distributed, not yet pushed to any party
    Prepared,
    /// Accepted by every party, waiting for compute slots
    Queued,
    /// At least one party reports active computation
    Running,
    /// Every party reports the computation finished
    Completed,
    /// At least one party reports failure
    Failed,
    /// Parties returned something this engine does not recognize
    Unknown,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Prepared => write!(f, "Prepared"),
            AnalysisStatus::Queued => write!(f, "Queued"),
            AnalysisStatus::Running => write!(f, "Running"),
            AnalysisStatus::Completed => write!(f, "Completed"),
            AnalysisStatus::Failed => write!(f, "Failed"),
            AnalysisStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl AnalysisStatus {
    /// Returns an emoji representation of the status.
    pub fn emoji(&self) -> &'static str {
        match self {
            AnalysisStatus::Prepared => "📦",
            AnalysisStatus::Queued => "🕐",
            AnalysisStatus::Running => "⚙️",
            AnalysisStatus::Completed => "✅",
            AnalysisStatus::Failed => "❌",
            AnalysisStatus::Unknown => "❓",
        }
    }

    /// Whether polling the parties can still change this status.
    ///
    /// `Prepared` jobs were never dispatched, `Completed` and `Failed`
    /// are terminal; everything else is worth a refresh.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Prepared | AnalysisStatus::Completed | AnalysisStatus::Failed
        )
    }
}

/// Status one compute party reports for one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyStatus {
    Queuing,
    Running,
    Completed,
    Failed,
}

impl PartyStatus {
    /// Parses a party's reported status, case-insensitively.
    ///
    /// Anything outside the four known states maps to `None`; the
    /// aggregation rule treats that as "unknown progress".
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "queuing" => Some(PartyStatus::Queuing),
            "running" => Some(PartyStatus::Running),
            "completed" => Some(PartyStatus::Completed),
            "failed" => Some(PartyStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PartyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyStatus::Queuing => write!(f, "Queuing"),
            PartyStatus::Running => write!(f, "Running"),
            PartyStatus::Completed => write!(f, "Completed"),
            PartyStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// One row of a per-party status view: the party id and whatever status
/// string it reported, verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyStatusReport {
    pub mpc_id: String,
    pub status: String,
}

impl PartyStatusReport {
    /// The typed reading of the reported status, if recognized.
    pub fn parsed(&self) -> Option<PartyStatus> {
        PartyStatus::parse(&self.status)
    }
}

/// Where an analysis is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ComputeTarget {
    /// Secret-shared computation across the named MPC parties.
    Mpc { parties: Vec<String> },
    /// Homomorphic computation on the single FHE server.
    Fhe,
}

impl ComputeTarget {
    /// The MPC party ids, empty for FHE routing.
    pub fn parties(&self) -> &[String] {
        match self {
            ComputeTarget::Mpc { parties } => parties,
            ComputeTarget::Fhe => &[],
        }
    }

    pub fn is_fhe(&self) -> bool {
        matches!(self, ComputeTarget::Fhe)
    }
}

impl fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeTarget::Mpc { parties } => write!(f, "mpc[{}]", parties.join(", ")),
            ComputeTarget::Fhe => write!(f, "fhe"),
        }
    }
}

/// Who created an analysis or batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Invoker {
    /// A direct caller (user or dashboard).
    #[default]
    Manual,
    /// The streaming auto-batcher.
    Streaming,
}

impl fmt::Display for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invoker::Manual => write!(f, "manual"),
            Invoker::Streaming => write!(f, "streaming"),
        }
    }
}

/// One requested secure computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Owning user id.
    pub user_id: String,
    /// User public key (MPC); empty for FHE-routed analyses.
    pub user_key: String,
    /// Dataset holding the encrypted input events.
    pub source_dataset: String,
    /// Dataset where parties push encrypted results.
    pub result_dataset: String,
    /// Metric name within the datasets.
    pub metric: String,
    /// Ordered timestamps of the data points to compute over.
    pub data_index: Vec<i64>,
    /// Compute routing: a set of MPC parties or the FHE server.
    pub target: ComputeTarget,
    /// The model/programme the parties should run.
    pub analysis_type: String,
    /// Creation time (epoch ms).
    pub created_at: i64,
    /// Absolute expiry of the distributed key material (epoch ms).
    pub keys_exp_at: i64,
    /// Arrival time of each reported result; append-only.
    #[serde(default)]
    pub result_timestamps: Vec<i64>,
    /// Last status this engine observed or derived.
    pub latest_status: AnalysisStatus,
    #[serde(default)]
    pub invoker: Invoker,
}

impl Analysis {
    pub fn is_fhe(&self) -> bool {
        self.target.is_fhe()
    }

    /// Query range `[min, max + 1)` covering all reported results.
    pub fn result_range(&self) -> Option<(i64, i64)> {
        timestamp_range(&self.result_timestamps)
    }
}

/// One party's encrypted fragment of a user's key material for one
/// analysis. Never updated; purged by the store at `exp_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyShare {
    pub analysis_id: String,
    pub user_id: String,
    pub mpc_id: String,
    /// Opaque encrypted share payload.
    pub key_share: String,
    /// Absolute expiry, equal to the owning analysis's `keys_exp_at`.
    pub exp_at: i64,
}

/// A registered MPC compute party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcParty {
    pub mpc_id: String,
    /// The party's public key; shares are encrypted against it.
    pub mpc_key: String,
    /// Base URL of the party's compute endpoint.
    pub host: String,
    pub region: String,
}

impl fmt::Display for MpcParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) @ {}", self.mpc_id, self.region, self.host)
    }
}

/// A combined compute request spanning several analyses that share the
/// same compute parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Declared total data-point count across all members.
    pub batch_size: usize,
    /// Data points per member analysis.
    pub analysis_data_point_count: usize,
    /// Member analysis ids.
    pub analysis_ids: Vec<String>,
    /// Owners of the members, parallel to `analysis_ids`.
    pub user_ids: Vec<String>,
    /// Party list shared by every member.
    pub parties: Vec<String>,
    pub analysis_type: String,
    /// Skip the offline preprocessing phase on the parties.
    #[serde(default)]
    pub online_only: bool,
    pub created_at: i64,
    /// Earliest key expiry across the members.
    pub first_keys_exp_at: i64,
    pub latest_status: AnalysisStatus,
    #[serde(default)]
    pub invoker: Invoker,
    /// `[start_time, keys_exp_at]` per member for batches produced by a
    /// streaming session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<Vec<[i64; 2]>>,
}

/// The canonical party line-up for streaming sessions, in key-share
/// order.
pub const STREAMING_PARTIES: [&str; 3] = ["mpc1", "mpc2", "mpc3"];

/// The single active ingestion-to-computation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSession {
    pub analysis_type: String,
    /// Pending analyses are flushed into a batch at this count.
    pub batch_size: usize,
    /// Key shares for the canonical parties, ordered `mpc1, mpc2, mpc3`.
    pub key_shares: Vec<String>,
    pub start_time: i64,
    /// Session implicitly ends here (store-level expiry).
    pub keys_exp_at: i64,
    /// Dataset whose ingests feed the session.
    pub source: String,
    pub result: String,
    /// History of batches flushed during this session; append-only.
    #[serde(default)]
    pub submitted_batches: Vec<String>,
    /// Analyses created but not yet batched; append-only, trimmed on
    /// flush.
    #[serde(default)]
    pub current_analysis_ids: Vec<String>,
}

impl StreamingSession {
    /// Remaining key-material lifetime in (fractional) hours.
    pub fn remaining_exp_hours(&self, now: i64) -> f64 {
        (self.keys_exp_at - now) as f64 / MS_PER_HOUR
    }
}

/// Externally visible session state; the key shares never leave the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSessionView {
    pub analysis_type: String,
    pub batch_size: usize,
    pub start_time: i64,
    pub keys_exp_at: i64,
    pub source: String,
    pub result: String,
    pub submitted_batches: Vec<String>,
    pub current_analysis_ids: Vec<String>,
}

impl From<StreamingSession> for StreamingSessionView {
    fn from(session: StreamingSession) -> Self {
        Self {
            analysis_type: session.analysis_type,
            batch_size: session.batch_size,
            start_time: session.start_time,
            keys_exp_at: session.keys_exp_at,
            source: session.source,
            result: session.result,
            submitted_batches: session.submitted_batches,
            current_analysis_ids: session.current_analysis_ids,
        }
    }
}

/// Answer to a streaming-info query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingInfo {
    pub is_streaming: bool,
    #[serde(flatten)]
    pub session: Option<StreamingSessionView>,
}

/// Progress of one deferred streaming batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    /// Recorded; no party has been contacted yet.
    Pending,
    /// Dispatch attempted; outcome not yet acknowledged.
    Dispatched,
    /// The batch exists and every party accepted it.
    Acknowledged,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionState::Pending => write!(f, "pending"),
            SubmissionState::Dispatched => write!(f, "dispatched"),
            SubmissionState::Acknowledged => write!(f, "acknowledged"),
        }
    }
}

/// Durable record of one streaming batch flush.
///
/// Written before the deferred dispatch runs, so a crash between taking
/// the pending analyses and submitting the batch leaves a visible
/// `Pending` entry instead of a silently dropped batch. Self-contained:
/// it can be driven even after the session that produced it is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmission {
    /// The analysis ids taken from the session's pending queue.
    pub analysis_ids: Vec<String>,
    pub analysis_type: String,
    /// Session start, forwarded in the streaming descriptor.
    pub start_time: i64,
    pub keys_exp_at: i64,
    pub state: SubmissionState,
    pub created_at: i64,
    /// Set once the batch has been created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

/// A party named in an MPC prepare request, with the key share intended
/// for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyShare {
    pub mpc_id: String,
    pub key_share: String,
}

/// Request to prepare an MPC analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcAnalysisSpec {
    pub parties: Vec<PartyShare>,
    /// Hours (fractional allowed) until the key shares expire.
    pub exp_hours: f64,
    pub user_key: String,
    pub source_dataset: String,
    pub result_dataset: String,
    pub metric: String,
    pub data_index: Vec<i64>,
    pub analysis_type: String,
    #[serde(default)]
    pub invoker: Invoker,
}

/// Request to prepare an FHE analysis. No parties, no user key: the FHE
/// server computes alone on material it already holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FheAnalysisSpec {
    pub exp_hours: f64,
    pub source_dataset: String,
    pub result_dataset: String,
    pub metric: String,
    pub data_index: Vec<i64>,
    pub analysis_type: String,
}

/// Request to combine prepared analyses into one batched computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    pub batch_size: usize,
    pub analysis_data_point_count: usize,
    pub analysis_ids: Vec<String>,
    pub analysis_type: String,
    #[serde(default)]
    pub online_only: bool,
    /// Present iff the batch was produced by a streaming session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<Vec<[i64; 2]>>,
}

/// Request to open a streaming session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSpec {
    pub analysis_type: String,
    pub batch_size: usize,
    /// Ordered `mpc1, mpc2, mpc3`.
    pub key_shares: Vec<String>,
    pub start_time: i64,
    pub keys_exp_at: i64,
    pub source: String,
    pub result: String,
}

/// A result pushed back by a compute party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSubmission {
    /// The analysis owner's id, as claimed by the reporting party.
    pub user_id: String,
    /// The encrypted result ciphertext.
    pub result: String,
    /// Whether the parties already combined their shares. Defaults to
    /// `false` on the MPC path and `true` on the FHE path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_combined: Option<bool>,
}
