//! Cross-party status aggregation.
//!
//! One analysis runs on several parties, each with its own opinion of how
//! far the computation has got. The aggregate is conservative: the least
//! advanced party speaks for the whole analysis, and any failure is
//! visible immediately.

use futures::future::try_join_all;
use tracing::debug;

use super::Orchestrator;
use crate::error::{EngineResult, OrchestratorError};
use crate::models::{Analysis, AnalysisStatus, PartyStatus, PartyStatusReport};
use crate::store::{collections, encode};

/// Reduces per-party readings to one status, least advanced wins.
///
/// Priority order: failed > queuing > running > completed. A reading of
/// `None` (the party said something unrecognized) caps the result at
/// `Unknown` unless a less-advanced recognized reading is present, so an
/// analysis never looks `Completed` while any party's answer was not
/// understood. An empty reading set is `Unknown`.
pub fn reduce_statuses<I>(statuses: I) -> AnalysisStatus
where
    I: IntoIterator<Item = Option<PartyStatus>>,
{
    let mut any = false;
    let mut failed = false;
    let mut queuing = false;
    let mut running = false;
    let mut unrecognized = false;

    for status in statuses {
        any = true;
        match status {
            Some(PartyStatus::Failed) => failed = true,
            Some(PartyStatus::Queuing) => queuing = true,
            Some(PartyStatus::Running) => running = true,
            Some(PartyStatus::Completed) => {}
            None => unrecognized = true,
        }
    }

    if failed {
        AnalysisStatus::Failed
    } else if queuing {
        AnalysisStatus::Queued
    } else if running {
        AnalysisStatus::Running
    } else if any && !unrecognized {
        AnalysisStatus::Completed
    } else {
        AnalysisStatus::Unknown
    }
}

impl Orchestrator {
    /// Asks every party responsible for an analysis where it stands.
    ///
    /// Reports carry each party's wording verbatim; interpretation is the
    /// reducer's job. Any party error fails the whole call.
    pub(crate) async fn party_statuses(
        &self,
        analysis_id: &str,
        analysis: &Analysis,
    ) -> EngineResult<Vec<PartyStatusReport>> {
        if analysis.is_fhe() {
            let fhe = self.fhe_party();
            let status = self.compute.status(&fhe, analysis_id).await?;
            return Ok(vec![PartyStatusReport {
                mpc_id: fhe.mpc_id,
                status,
            }]);
        }

        let mut parties = Vec::with_capacity(analysis.target.parties().len());
        for mpc_id in analysis.target.parties() {
            parties.push(self.resolve_party(mpc_id).await?);
        }

        let polls = parties.iter().map(|party| async move {
            let status = self.compute.status(party, analysis_id).await?;
            Ok::<_, OrchestratorError>(PartyStatusReport {
                mpc_id: party.mpc_id.clone(),
                status,
            })
        });
        try_join_all(polls).await
    }

    /// The reduced live status of an analysis.
    pub(crate) async fn poll_analysis_status(
        &self,
        analysis_id: &str,
        analysis: &Analysis,
    ) -> EngineResult<AnalysisStatus> {
        let reports = self.party_statuses(analysis_id, analysis).await?;
        Ok(reduce_statuses(reports.iter().map(|report| report.parsed())))
    }

    /// Polls the parties and persists what they said as the analysis's
    /// latest status.
    pub(crate) async fn refresh_analysis_status(
        &self,
        analysis_id: &str,
        analysis: &mut Analysis,
    ) -> EngineResult<()> {
        let status = self.poll_analysis_status(analysis_id, analysis).await?;
        if status != analysis.latest_status {
            debug!(
                "Analysis {} moved {} -> {}",
                analysis_id, analysis.latest_status, status
            );
        }
        analysis.latest_status = status;
        let doc = encode(collections::ANALYSES, analysis)?;
        self.store
            .put(collections::ANALYSES, analysis_id, doc)
            .await?;
        Ok(())
    }

    /// Owner-facing status view: the per-party table plus the reduction,
    /// which is also persisted as the analysis's latest status.
    pub async fn analysis_status(
        &self,
        caller: &str,
        analysis_id: &str,
    ) -> EngineResult<(AnalysisStatus, Vec<PartyStatusReport>)> {
        let mut analysis = self.fetch_owned_analysis(caller, analysis_id).await?;

        let reports = self.party_statuses(analysis_id, &analysis).await?;
        let status = reduce_statuses(reports.iter().map(|report| report.parsed()));

        analysis.latest_status = status;
        let doc = encode(collections::ANALYSES, &analysis)?;
        self.store
            .put(collections::ANALYSES, analysis_id, doc)
            .await?;
        Ok((status, reports))
    }
}
