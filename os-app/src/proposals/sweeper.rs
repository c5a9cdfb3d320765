use crate::proposals::claims::InFlightClaims;
use crate::proposals::model::ProposalStatus;
use crate::proposals::store::{ProposalStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    /// Lost the compare-and-set to a human decision.
    pub conflicts: usize,
    /// Held by an in-flight callback handler.
    pub skipped_in_flight: usize,
    pub failures: usize,
}

/// Expires pending proposals that outlived the expiry window. Does not edit
/// approval messages; stale buttons answer "already handled".
pub struct ExpirySweeper {
    store: Arc<dyn ProposalStore>,
    claims: InFlightClaims,
    expiry_window: Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<dyn ProposalStore>,
        claims: InFlightClaims,
        expiry_window: Duration,
    ) -> Self {
        Self {
            store,
            claims,
            expiry_window,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        self.sweep_once_at(Utc::now()).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sweep_once_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let cutoff = now - self.expiry_window;
        let overdue = self.store.list_overdue_pending(cutoff).await?;
        let mut report = SweepReport::default();

        for proposal in overdue {
            let Some(_claim) = self.claims.try_claim(proposal.id) else {
                report.skipped_in_flight += 1;
                continue;
            };
            match self
                .store
                .transition(
                    proposal.id,
                    ProposalStatus::Pending,
                    ProposalStatus::Expired,
                    now,
                    None,
                )
                .await
            {
                Ok(_) => {
                    report.expired += 1;
                    tracing::info!(
                        proposal_id = %proposal.id,
                        created_at = %proposal.created_at,
                        "proposal expired by sweeper"
                    );
                }
                Err(StoreError::Conflict { current, .. }) => {
                    report.conflicts += 1;
                    tracing::debug!(proposal_id = %proposal.id, %current, "sweeper lost race");
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::warn!(
                        proposal_id = %proposal.id,
                        error = %e,
                        "sweeper transition failed"
                    );
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(?report, "expiry sweep finished");
        }
        Ok(report)
    }

    pub fn spawn(
        self: Arc<Self>,
        period: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("expiry sweeper received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "expiry sweep failed");
                        }
                    }
                }
            }
        })
    }
}
