use crate::proposals::approval::{
    ApprovalPresenter, created_text, expired_text, skipped_text, start_passed_text,
    unrecorded_text,
};
use crate::proposals::claims::{ClaimGuard, InFlightClaims};
use crate::proposals::model::{
    ApprovalAction, EventProposal, ProposalId, ProposalStatus, parse_action_payload,
};
use crate::proposals::store::{ProposalStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use os_calendar::{CalendarError, CreatedEvent, EventWriter};
use os_channels::{InboundAction, MessageHandle};
use std::collections::HashSet;
use std::sync::Arc;

const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_BASE_MS: u64 = 50;
const WRITING_ACK: &str = "Adding to calendar…";

/// What a single tap resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Payload was not one of ours.
    Ignored,
    Unauthorized,
    NotFound,
    /// Another handler in this process holds the proposal.
    InFlight,
    AlreadyHandled(ProposalStatus),
    Expired,
    StartTimePassed,
    Rejected,
    Approved(CreatedEvent),
    WriteFailed { class: &'static str, message: String },
    /// The event exists but its approval is not stored yet. The proposal stays
    /// claimed until a later tap records it.
    RecordPending(CreatedEvent),
    StoreFailed,
}

impl CallbackOutcome {
    /// `None` for outcomes whose tap was acknowledged before the calendar write.
    pub fn ack_text(&self) -> Option<String> {
        let text = match self {
            Self::Approved(_) | Self::WriteFailed { .. } | Self::RecordPending(_) => return None,
            Self::Ignored => String::new(),
            Self::Unauthorized => "You are not authorised to decide on proposals.".to_string(),
            Self::NotFound => "This proposal is no longer available.".to_string(),
            Self::InFlight => "Already being handled.".to_string(),
            Self::AlreadyHandled(status) => format!("Already handled ({status})."),
            Self::Expired => "This proposal has expired.".to_string(),
            Self::StartTimePassed => "The start time has already passed.".to_string(),
            Self::Rejected => "Skipped.".to_string(),
            Self::StoreFailed => "Something went wrong, please try again.".to_string(),
        };
        Some(text)
    }
}

/// A created event whose approval could not be stored. Holds the claim so
/// neither the sweeper nor another tap can act on the proposal meanwhile.
struct UnrecordedApproval {
    proposal: EventProposal,
    created: CreatedEvent,
    decided_at: DateTime<Utc>,
    _claim: ClaimGuard,
}

/// Drives a proposal through its state machine in response to a tap.
pub struct CallbackRouter {
    store: Arc<dyn ProposalStore>,
    writer: Arc<dyn EventWriter>,
    presenter: ApprovalPresenter,
    claims: InFlightClaims,
    expiry_window: Duration,
    allowed_senders: HashSet<String>,
    unrecorded: DashMap<ProposalId, UnrecordedApproval>,
}

impl CallbackRouter {
    pub fn new(
        store: Arc<dyn ProposalStore>,
        writer: Arc<dyn EventWriter>,
        presenter: ApprovalPresenter,
        claims: InFlightClaims,
        expiry_window: Duration,
    ) -> Self {
        Self {
            store,
            writer,
            presenter,
            claims,
            expiry_window,
            allowed_senders: HashSet::new(),
            unrecorded: DashMap::new(),
        }
    }

    /// Restrict decisions to these sender ids. Empty allows anyone.
    pub fn with_allowed_senders<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_senders = senders.into_iter().map(Into::into).collect();
        self
    }

    pub async fn handle_action(&self, action: InboundAction) -> CallbackOutcome {
        self.handle_action_at(action, Utc::now()).await
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(action_id = %action.action_id, sender_id = %action.sender_id)
    )]
    pub async fn handle_action_at(
        &self,
        action: InboundAction,
        now: DateTime<Utc>,
    ) -> CallbackOutcome {
        let outcome = self.route(&action, now).await;
        tracing::info!(?outcome, payload = %action.payload, "callback handled");
        if let Some(text) = outcome.ack_text() {
            self.presenter.acknowledge(&action.action_id, &text).await;
        }
        outcome
    }

    async fn route(&self, action: &InboundAction, now: DateTime<Utc>) -> CallbackOutcome {
        if !self.allowed_senders.is_empty()
            && !self.allowed_senders.contains(action.sender_id.as_str())
        {
            tracing::warn!(sender_id = %action.sender_id, "tap from unauthorised sender");
            return CallbackOutcome::Unauthorized;
        }

        let Some((decision, id)) = parse_action_payload(&action.payload) else {
            tracing::debug!(payload = %action.payload, "ignoring unrecognised callback payload");
            return CallbackOutcome::Ignored;
        };

        // Either button finishes a held approval; the event already exists.
        if let Some((_, held)) = self.unrecorded.remove(&id) {
            return self.finish_unrecorded(action, held).await;
        }

        let Some(claim) = self.claims.try_claim(id) else {
            tracing::info!(proposal_id = %id, "proposal already in flight");
            return CallbackOutcome::InFlight;
        };

        self.decide(action, id, decision, claim, now).await
    }

    async fn decide(
        &self,
        action: &InboundAction,
        id: ProposalId,
        decision: ApprovalAction,
        claim: ClaimGuard,
        now: DateTime<Utc>,
    ) -> CallbackOutcome {
        let proposal = match self.store.get(id).await {
            Ok(proposal) => proposal,
            Err(StoreError::NotFound(_)) => return CallbackOutcome::NotFound,
            Err(e) => {
                tracing::error!(proposal_id = %id, error = %e, "proposal lookup failed");
                return CallbackOutcome::StoreFailed;
            }
        };

        if proposal.status.is_terminal() {
            return CallbackOutcome::AlreadyHandled(proposal.status);
        }

        let handle = proposal.message.clone().or_else(|| action.message.clone());

        if proposal.is_overdue_at(now, self.expiry_window) {
            let text = expired_text(&proposal);
            return match self
                .finish(&proposal, handle.as_ref(), ProposalStatus::Expired, now, text)
                .await
            {
                Ok(()) => CallbackOutcome::Expired,
                Err(outcome) => outcome,
            };
        }

        if proposal.start_has_passed_at(now) {
            let text = start_passed_text(&proposal);
            return match self
                .finish(&proposal, handle.as_ref(), ProposalStatus::Expired, now, text)
                .await
            {
                Ok(()) => CallbackOutcome::StartTimePassed,
                Err(outcome) => outcome,
            };
        }

        match decision {
            ApprovalAction::Reject => {
                let text = skipped_text(&proposal);
                match self
                    .finish(&proposal, handle.as_ref(), ProposalStatus::Rejected, now, text)
                    .await
                {
                    Ok(()) => CallbackOutcome::Rejected,
                    Err(outcome) => outcome,
                }
            }
            ApprovalAction::Approve => self.approve(action, proposal, handle, claim, now).await,
        }
    }

    async fn approve(
        &self,
        action: &InboundAction,
        proposal: EventProposal,
        handle: Option<MessageHandle>,
        claim: ClaimGuard,
        now: DateTime<Utc>,
    ) -> CallbackOutcome {
        // Telegram refuses answers to callback queries that are too old.
        self.presenter.acknowledge(&action.action_id, WRITING_ACK).await;

        tracing::info!(proposal_id = %proposal.id, "creating calendar event");
        let created = match self.writer.create_event(&proposal.to_new_event()).await {
            Ok(created) => created,
            Err(e) => {
                let class = e.class();
                let message = failure_detail(&e);
                tracing::error!(
                    proposal_id = %proposal.id,
                    class,
                    error = %e,
                    "calendar write failed; proposal stays pending"
                );
                if let Some(handle) = &handle {
                    self.presenter
                        .show_failure(&proposal, handle, class, &message)
                        .await;
                }
                return CallbackOutcome::WriteFailed { class, message };
            }
        };

        self.record_approval(proposal, handle, created, claim, now).await
    }

    async fn finish_unrecorded(
        &self,
        action: &InboundAction,
        held: UnrecordedApproval,
    ) -> CallbackOutcome {
        self.presenter.acknowledge(&action.action_id, WRITING_ACK).await;

        let UnrecordedApproval {
            proposal,
            created,
            decided_at,
            _claim: claim,
        } = held;
        tracing::info!(
            proposal_id = %proposal.id,
            external_event_id = %created.id,
            "recording approval for an event that already exists"
        );
        let handle = proposal.message.clone().or_else(|| action.message.clone());
        self.record_approval(proposal, handle, created, claim, decided_at).await
    }

    /// Stores `Pending -> Approved` for an event that was already created.
    /// Backend failures past the retry budget park the approval in `unrecorded`.
    async fn record_approval(
        &self,
        proposal: EventProposal,
        handle: Option<MessageHandle>,
        created: CreatedEvent,
        claim: ClaimGuard,
        decided_at: DateTime<Utc>,
    ) -> CallbackOutcome {
        match self.store_approval(proposal.id, &created, decided_at).await {
            Ok(()) => {
                tracing::info!(
                    proposal_id = %proposal.id,
                    external_event_id = %created.id,
                    "proposal approved"
                );
            }
            Err(StoreError::Backend(detail)) => {
                tracing::error!(
                    proposal_id = %proposal.id,
                    external_event_id = %created.id,
                    external_link = %created.html_link,
                    attempts = RECORD_ATTEMPTS,
                    error = %detail,
                    "event created but approval not recorded; holding the proposal"
                );
                if let Some(handle) = &handle {
                    self.presenter
                        .show_notice(&proposal, handle, unrecorded_text(&created))
                        .await;
                }
                self.unrecorded.insert(
                    proposal.id,
                    UnrecordedApproval {
                        proposal,
                        created: created.clone(),
                        decided_at,
                        _claim: claim,
                    },
                );
                return CallbackOutcome::RecordPending(created);
            }
            Err(e) => {
                // Decided by another process; the event exists, so confirm it anyway.
                tracing::error!(
                    proposal_id = %proposal.id,
                    external_event_id = %created.id,
                    error = %e,
                    "calendar event created but the proposal was decided elsewhere"
                );
            }
        }
        if let Some(handle) = &handle {
            self.presenter
                .resolve(proposal.id, handle, created_text(&proposal, &created))
                .await;
        }
        CallbackOutcome::Approved(created)
    }

    async fn store_approval(
        &self,
        id: ProposalId,
        created: &CreatedEvent,
        decided_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            let result = self
                .store
                .transition(
                    id,
                    ProposalStatus::Pending,
                    ProposalStatus::Approved,
                    decided_at,
                    Some(created),
                )
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(StoreError::Backend(detail)) if attempt < RECORD_ATTEMPTS => {
                    let delay = record_retry_delay(attempt);
                    tracing::warn!(
                        proposal_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %detail,
                        "approval record failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves a pending proposal into a terminal state that involves no write,
    /// then edits its message.
    async fn finish(
        &self,
        proposal: &EventProposal,
        handle: Option<&MessageHandle>,
        next: ProposalStatus,
        now: DateTime<Utc>,
        outcome_text: String,
    ) -> Result<(), CallbackOutcome> {
        match self
            .store
            .transition(proposal.id, ProposalStatus::Pending, next, now, None)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { current, .. }) => {
                return Err(CallbackOutcome::AlreadyHandled(current));
            }
            Err(StoreError::NotFound(_)) => return Err(CallbackOutcome::NotFound),
            Err(e) => {
                tracing::error!(proposal_id = %proposal.id, %next, error = %e, "transition failed");
                return Err(CallbackOutcome::StoreFailed);
            }
        }
        tracing::info!(proposal_id = %proposal.id, status = %next, "proposal resolved");

        if let Some(handle) = handle {
            self.presenter.resolve(proposal.id, handle, outcome_text).await;
        }
        Ok(())
    }
}

fn record_retry_delay(attempt: u32) -> std::time::Duration {
    let shift = attempt.saturating_sub(1).min(6);
    std::time::Duration::from_millis(RECORD_RETRY_BASE_MS.saturating_mul(1_u64 << shift))
}

/// Provider messages are shown verbatim; transport failures get a generic notice.
fn failure_detail(error: &CalendarError) -> String {
    match error {
        CalendarError::Api { message, .. } => message.clone(),
        CalendarError::Network(_) => "the calendar service could not be reached".to_string(),
        CalendarError::Authorization(_) => {
            "calendar access was refused; re-authorise the calendar account".to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposals::model::DEFAULT_EXPIRY_WINDOW_HOURS;
    use crate::proposals::store::SqliteProposalStore;
    use crate::proposals::sweeper::ExpirySweeper;
    use crate::proposals::testing::{
        FakeChannel, FakeWriter, FlakyStore, proposal_created_at, tap, ts,
    };

    struct Harness {
        store: Arc<SqliteProposalStore>,
        channel: Arc<FakeChannel>,
        writer: Arc<FakeWriter>,
        router: Arc<CallbackRouter>,
    }

    fn harness_with(writer: FakeWriter) -> Harness {
        let store = Arc::new(SqliteProposalStore::open_in_memory().expect("store"));
        let channel = Arc::new(FakeChannel::default());
        let writer = Arc::new(writer);
        let presenter = ApprovalPresenter::new(channel.clone(), chrono_tz::Europe::Berlin);
        let router = CallbackRouter::new(
            store.clone(),
            writer.clone(),
            presenter,
            InFlightClaims::new(),
            Duration::hours(DEFAULT_EXPIRY_WINDOW_HOURS),
        );
        Harness {
            store,
            channel,
            writer,
            router: Arc::new(router),
        }
    }

    fn harness() -> Harness {
        harness_with(FakeWriter::default())
    }

    fn message() -> MessageHandle {
        MessageHandle {
            conversation_id: "555".into(),
            message_id: "7".into(),
        }
    }

    async fn stored_pending(h: &Harness, created_at: DateTime<Utc>) -> EventProposal {
        let proposal = proposal_created_at(created_at);
        h.store.create(&proposal).await.expect("create");
        h.store
            .attach_message(proposal.id, &message())
            .await
            .expect("attach");
        proposal
    }

    fn approve(id: ProposalId) -> String {
        ApprovalAction::Approve.payload_for(id)
    }

    fn reject(id: ProposalId) -> String {
        ApprovalAction::Reject.payload_for(id)
    }

    #[tokio::test]
    async fn approve_creates_event_and_records_approval() {
        let h = harness();
        let proposal = stored_pending(&h, ts(9, 0)).await;

        let outcome = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", None), ts(9, 5))
            .await;

        let CallbackOutcome::Approved(created) = outcome.clone() else {
            panic!("expected approval, got {outcome:?}");
        };
        assert_eq!(h.writer.calls(), 1);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Approved);
        assert_eq!(stored.external_event_id.as_deref(), Some(created.id.as_str()));
        assert_eq!(stored.resolved_at, Some(ts(9, 5)));

        let edits = h.channel.replaced();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].0, message());
        assert!(edits[0].1.content.contains(&created.html_link));
        assert!(edits[0].1.actions.is_empty());
        assert_eq!(h.channel.acks(), vec![WRITING_ACK.to_string()]);
    }

    #[tokio::test]
    async fn approval_tap_is_acknowledged_before_the_write_finishes() {
        let h = harness_with(FakeWriter::with_delay(std::time::Duration::from_millis(300)));
        let proposal = stored_pending(&h, ts(9, 0)).await;

        let router = h.router.clone();
        let payload = approve(proposal.id);
        let task = tokio::spawn(async move {
            router
                .handle_action_at(tap(&payload, "42", None), ts(9, 5))
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(h.channel.acks(), vec![WRITING_ACK.to_string()]);
        assert!(h.channel.replaced().is_empty());

        assert!(matches!(task.await.expect("join"), CallbackOutcome::Approved(_)));
        assert_eq!(h.channel.acks().len(), 1);
    }

    #[tokio::test]
    async fn reject_makes_no_external_call() {
        let h = harness();
        let proposal = stored_pending(&h, ts(9, 0)).await;

        let outcome = h
            .router
            .handle_action_at(tap(&reject(proposal.id), "42", None), ts(9, 5))
            .await;

        assert_eq!(outcome, CallbackOutcome::Rejected);
        assert_eq!(h.writer.calls(), 0);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Rejected);
        let edits = h.channel.replaced();
        assert_eq!(edits[0].1.content, "Skipped: Coffee with Alice");
        assert!(edits[0].1.actions.is_empty());
    }

    #[tokio::test]
    async fn repeated_reject_is_a_no_op() {
        let h = harness();
        let proposal = stored_pending(&h, ts(9, 0)).await;
        h.router
            .handle_action_at(tap(&reject(proposal.id), "42", None), ts(9, 5))
            .await;

        let outcome = h
            .router
            .handle_action_at(tap(&reject(proposal.id), "42", None), ts(9, 30))
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::AlreadyHandled(ProposalStatus::Rejected)
        );
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.resolved_at, Some(ts(9, 5)));
        assert_eq!(h.channel.replaced().len(), 1);
        assert_eq!(h.writer.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_approvals_write_once() {
        let h = harness_with(FakeWriter::with_delay(std::time::Duration::from_millis(50)));
        let proposal = stored_pending(&h, ts(9, 0)).await;

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let router = h.router.clone();
            let payload = approve(proposal.id);
            tasks.push(tokio::spawn(async move {
                router
                    .handle_action_at(tap(&payload, "42", None), ts(9, 5))
                    .await
            }));
        }

        let mut approved = 0;
        for task in tasks {
            match task.await.expect("join") {
                CallbackOutcome::Approved(_) => approved += 1,
                CallbackOutcome::InFlight
                | CallbackOutcome::AlreadyHandled(ProposalStatus::Approved) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(approved, 1);
        assert_eq!(h.writer.calls(), 1);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Approved);
    }

    #[tokio::test]
    async fn failed_write_keeps_proposal_pending_and_retry_succeeds() {
        let h = harness();
        let proposal = stored_pending(&h, ts(9, 0)).await;
        h.writer.queue(Err(CalendarError::Api {
            status: 403,
            message: "Rate Limit Exceeded".to_string(),
        }));

        let outcome = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", None), ts(9, 5))
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::WriteFailed {
                class: "api",
                message: "Rate Limit Exceeded".to_string()
            }
        );
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Pending);
        assert_eq!(stored.resolved_at, None);
        let edits = h.channel.replaced();
        assert!(edits[0].1.content.contains("Rate Limit Exceeded"));
        assert_eq!(edits[0].1.actions.len(), 2);

        let retry = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", None), ts(9, 6))
            .await;
        assert!(matches!(retry, CallbackOutcome::Approved(_)));
        assert_eq!(h.writer.calls(), 2);
    }

    #[tokio::test]
    async fn tap_after_expiry_window_expires_lazily_without_writing() {
        let h = harness();
        let proposal = stored_pending(&h, ts(8, 0)).await;
        let late = ts(8, 0) + Duration::hours(25);

        let outcome = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", None), late)
            .await;

        assert_eq!(outcome, CallbackOutcome::Expired);
        assert_eq!(h.writer.calls(), 0);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Expired);
        assert!(h.channel.replaced()[0].1.content.contains("Expired"));
    }

    #[tokio::test]
    async fn tap_just_inside_expiry_window_is_still_decided() {
        let h = harness();
        let proposal = stored_pending(&h, ts(8, 0)).await;
        let just_before = ts(8, 0) + Duration::hours(24) - Duration::seconds(1);

        let outcome = h
            .router
            .handle_action_at(tap(&reject(proposal.id), "42", None), just_before)
            .await;

        assert_eq!(outcome, CallbackOutcome::Rejected);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Rejected);
    }

    #[tokio::test]
    async fn tap_exactly_at_expiry_window_expires() {
        let h = harness();
        let proposal = stored_pending(&h, ts(8, 0)).await;
        let boundary = ts(8, 0) + Duration::hours(24);

        let outcome = h
            .router
            .handle_action_at(tap(&reject(proposal.id), "42", None), boundary)
            .await;

        assert_eq!(outcome, CallbackOutcome::Expired);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Expired);
        assert_eq!(stored.resolved_at, Some(boundary));
    }

    #[tokio::test]
    async fn approving_after_start_time_expires_instead_of_writing() {
        let h = harness();
        let mut proposal = proposal_created_at(ts(9, 0));
        proposal.start = ts(8, 30);
        proposal.end = ts(9, 30);
        h.store.create(&proposal).await.expect("create");

        let outcome = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", Some(message())), ts(9, 5))
            .await;

        assert_eq!(outcome, CallbackOutcome::StartTimePassed);
        assert_eq!(h.writer.calls(), 0);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Expired);
        let edits = h.channel.replaced();
        assert_eq!(edits[0].0, message());
        assert!(edits[0].1.content.contains("start time"));
    }

    #[tokio::test]
    async fn tap_on_already_expired_proposal_is_already_handled() {
        let h = harness();
        let proposal = stored_pending(&h, ts(8, 0)).await;
        h.store
            .transition(
                proposal.id,
                ProposalStatus::Pending,
                ProposalStatus::Expired,
                ts(8, 0) + Duration::hours(24),
                None,
            )
            .await
            .expect("sweep");

        let outcome = h
            .router
            .handle_action_at(
                tap(&approve(proposal.id), "42", None),
                ts(8, 0) + Duration::hours(25),
            )
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::AlreadyHandled(ProposalStatus::Expired)
        );
        assert_eq!(h.writer.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_proposal_is_reported_as_unavailable() {
        let h = harness();
        let outcome = h
            .router
            .handle_action_at(tap(&approve(ProposalId::generate()), "42", None), ts(9, 0))
            .await;
        assert_eq!(outcome, CallbackOutcome::NotFound);
        assert_eq!(
            h.channel.acks(),
            vec!["This proposal is no longer available.".to_string()]
        );
    }

    #[tokio::test]
    async fn foreign_payloads_are_ignored() {
        let h = harness();
        let proposal = stored_pending(&h, ts(9, 0)).await;
        let outcome = h
            .router
            .handle_action_at(tap(&format!("snooze:{}", proposal.id), "42", None), ts(9, 5))
            .await;
        assert_eq!(outcome, CallbackOutcome::Ignored);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn only_allowed_senders_can_decide() {
        let store = Arc::new(SqliteProposalStore::open_in_memory().expect("store"));
        let channel = Arc::new(FakeChannel::default());
        let router = CallbackRouter::new(
            store.clone(),
            Arc::new(FakeWriter::default()),
            ApprovalPresenter::new(channel, chrono_tz::UTC),
            InFlightClaims::new(),
            Duration::hours(DEFAULT_EXPIRY_WINDOW_HOURS),
        )
        .with_allowed_senders(["42"]);
        let proposal = proposal_created_at(ts(9, 0));
        store.create(&proposal).await.expect("create");

        let outcome = router
            .handle_action_at(tap(&reject(proposal.id), "99", None), ts(9, 5))
            .await;
        assert_eq!(outcome, CallbackOutcome::Unauthorized);
        let stored = store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Pending);

        let outcome = router
            .handle_action_at(tap(&reject(proposal.id), "42", None), ts(9, 5))
            .await;
        assert_eq!(outcome, CallbackOutcome::Rejected);
    }

    struct FlakyHarness {
        store: Arc<FlakyStore>,
        channel: Arc<FakeChannel>,
        writer: Arc<FakeWriter>,
        claims: InFlightClaims,
        router: CallbackRouter,
    }

    fn flaky_harness(approval_failures: usize) -> FlakyHarness {
        let store = Arc::new(FlakyStore::failing(ProposalStatus::Approved, approval_failures));
        let channel = Arc::new(FakeChannel::default());
        let writer = Arc::new(FakeWriter::default());
        let claims = InFlightClaims::new();
        let router = CallbackRouter::new(
            store.clone(),
            writer.clone(),
            ApprovalPresenter::new(channel.clone(), chrono_tz::UTC),
            claims.clone(),
            Duration::hours(DEFAULT_EXPIRY_WINDOW_HOURS),
        );
        FlakyHarness {
            store,
            channel,
            writer,
            claims,
            router,
        }
    }

    #[tokio::test]
    async fn approval_record_is_retried_after_a_backend_error() {
        let h = flaky_harness(1);
        let proposal = proposal_created_at(ts(9, 0));
        h.store.create(&proposal).await.expect("create");

        let outcome = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", Some(message())), ts(9, 5))
            .await;

        assert!(matches!(outcome, CallbackOutcome::Approved(_)), "{outcome:?}");
        assert_eq!(h.store.remaining_failures(), 0);
        assert_eq!(h.writer.calls(), 1);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Approved);
        assert_eq!(stored.external_event_id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn unrecorded_approval_is_finished_by_the_next_tap_without_a_second_write() {
        let h = flaky_harness(RECORD_ATTEMPTS as usize);
        let proposal = proposal_created_at(ts(9, 0));
        h.store.create(&proposal).await.expect("create");

        let first = h
            .router
            .handle_action_at(tap(&approve(proposal.id), "42", Some(message())), ts(9, 5))
            .await;

        let CallbackOutcome::RecordPending(created) = first.clone() else {
            panic!("expected a held approval, got {first:?}");
        };
        assert_eq!(created.id, "evt-1");
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Pending);
        let edits = h.channel.replaced();
        assert!(edits[0].1.content.contains(&created.html_link));
        assert_eq!(edits[0].1.actions.len(), 2);

        // The held claim keeps the sweeper away even past the expiry window.
        assert!(h.claims.try_claim(proposal.id).is_none());
        let sweeper = ExpirySweeper::new(
            h.store.clone(),
            h.claims.clone(),
            Duration::hours(DEFAULT_EXPIRY_WINDOW_HOURS),
        );
        let report = sweeper
            .sweep_once_at(ts(9, 0) + Duration::hours(25))
            .await
            .expect("sweep");
        assert_eq!(report.expired, 0);
        assert_eq!(report.skipped_in_flight, 1);

        let second = h
            .router
            .handle_action_at(tap(&reject(proposal.id), "42", Some(message())), ts(10, 0))
            .await;

        assert_eq!(second, CallbackOutcome::Approved(created.clone()));
        assert_eq!(h.writer.calls(), 1);
        let stored = h.store.get(proposal.id).await.expect("get");
        assert_eq!(stored.status, ProposalStatus::Approved);
        assert_eq!(stored.external_event_id.as_deref(), Some("evt-1"));
        assert_eq!(stored.resolved_at, Some(ts(9, 5)));
        assert!(h.claims.try_claim(proposal.id).is_some());
        assert_eq!(
            h.channel.acks(),
            vec![WRITING_ACK.to_string(), WRITING_ACK.to_string()]
        );
    }
}
