use crate::proposals::approval::ApprovalPresenter;
use crate::proposals::model::{EventProposal, ProposalId, ProposalStatus};
use crate::proposals::store::{ProposalStore, StoreError};
use crate::proposals::validator::{ProposalRequest, ProposalValidator, ValidationError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("proposal rejected by validator: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingestion path: validate, store as pending, present for approval.
pub struct ProposalService {
    validator: ProposalValidator,
    store: Arc<dyn ProposalStore>,
    presenter: ApprovalPresenter,
}

impl ProposalService {
    pub fn new(
        validator: ProposalValidator,
        store: Arc<dyn ProposalStore>,
        presenter: ApprovalPresenter,
    ) -> Self {
        Self {
            validator,
            store,
            presenter,
        }
    }

    pub async fn submit(&self, request: ProposalRequest) -> Result<EventProposal, SubmitError> {
        self.submit_at(request, Utc::now()).await
    }

    /// The returned record reflects the stored state, including the message
    /// reference when delivery succeeded.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(origin = %request.origin_conversation_id)
    )]
    pub async fn submit_at(
        &self,
        request: ProposalRequest,
        now: DateTime<Utc>,
    ) -> Result<EventProposal, SubmitError> {
        let validated = self.validator.validate(&request, now).inspect_err(|e| {
            tracing::warn!(rule = e.rule(), error = %e, "proposal failed validation");
        })?;

        let mut proposal = EventProposal {
            id: ProposalId::generate(),
            title: validated.title,
            start: validated.start,
            end: validated.end,
            attendees: validated.attendees,
            description: validated.description,
            location: validated.location,
            origin_conversation_id: validated.origin_conversation_id,
            created_at: now,
            status: ProposalStatus::Pending,
            message: None,
            resolved_at: None,
            external_event_id: None,
            external_link: None,
        };
        self.store.create(&proposal).await?;
        tracing::info!(proposal_id = %proposal.id, start = %proposal.start, "proposal stored");

        if let Some(handle) = self.presenter.present(&proposal).await {
            match self.store.attach_message(proposal.id, &handle).await {
                Ok(()) => proposal.message = Some(handle),
                Err(e) => tracing::warn!(
                    proposal_id = %proposal.id,
                    error = %e,
                    "could not record approval message reference"
                ),
            }
        }
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposals::store::SqliteProposalStore;
    use crate::proposals::testing::{FakeChannel, ts};
    use os_channels::ChannelAdapter;

    fn service(channel: Arc<dyn ChannelAdapter>) -> (ProposalService, Arc<SqliteProposalStore>) {
        let store = Arc::new(SqliteProposalStore::open_in_memory().expect("store"));
        let service = ProposalService::new(
            ProposalValidator::new(chrono_tz::Europe::Berlin).expect("validator"),
            store.clone(),
            ApprovalPresenter::new(channel, chrono_tz::Europe::Berlin),
        );
        (service, store)
    }

    fn coffee() -> ProposalRequest {
        serde_json::from_value(serde_json::json!({
            "title": "Coffee with Alice",
            "startTime": "2026-10-18T14:00:00",
            "endTime": "2026-10-18T14:30:00",
            "attendees": ["alice@example.com"],
            "originConversationId": "555"
        }))
        .expect("request")
    }

    #[tokio::test]
    async fn accepted_proposal_is_stored_pending_and_presented() {
        let channel = Arc::new(FakeChannel::default());
        let (service, store) = service(channel.clone());

        let proposal = service.submit_at(coffee(), ts(9, 0)).await.expect("submitted");

        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.created_at, ts(9, 0));
        let stored = store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Pending);
        assert!(stored.message.is_some());
        assert_eq!(stored.message, proposal.message);
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(channel.sent()[0].1.actions.len(), 2);
    }

    #[tokio::test]
    async fn invalid_proposal_creates_nothing() {
        let channel = Arc::new(FakeChannel::default());
        let (service, store) = service(channel.clone());
        let mut request = coffee();
        request.attendees = vec!["alice".to_string()];

        let err = service.submit_at(request, ts(9, 0)).await.expect_err("invalid");

        assert!(matches!(err, SubmitError::Invalid(ValidationError::InvalidAttendee(_))));
        assert!(store.list(None).await.expect("list").is_empty());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_leaves_proposal_pending_without_message() {
        let (service, store) = service(Arc::new(FakeChannel::failing_sends()));

        let proposal = service.submit_at(coffee(), ts(9, 0)).await.expect("submitted");

        let stored = store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Pending);
        assert_eq!(stored.message, None);
    }
}
