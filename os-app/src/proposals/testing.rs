//! In-crate fakes shared by the proposal tests.

use crate::proposals::model::{EventProposal, ProposalId, ProposalStatus};
use crate::proposals::store::{ProposalStore, SqliteProposalStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use os_calendar::{CalendarError, CreatedEvent, EventWriter, NewEvent};
use os_channels::{
    ActionId, ChannelAdapter, ConversationId, InboundAction, InteractiveMessage, MessageHandle,
    MessageId, SenderId,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// 2026-10-17 at `hour:minute` UTC.
pub fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 17, hour, minute, 0).unwrap()
}

/// A pending proposal starting one day after `created_at`.
pub fn proposal_created_at(created_at: DateTime<Utc>) -> EventProposal {
    let start = created_at + Duration::days(1);
    EventProposal {
        id: ProposalId::generate(),
        title: "Coffee with Alice".to_string(),
        start,
        end: start + Duration::minutes(30),
        attendees: vec!["alice@example.com".to_string()],
        description: Some("Catch up".to_string()),
        location: None,
        origin_conversation_id: "555".to_string(),
        created_at,
        status: ProposalStatus::Pending,
        message: None,
        resolved_at: None,
        external_event_id: None,
        external_link: None,
    }
}

pub fn tap(payload: &str, sender: &str, message: Option<MessageHandle>) -> InboundAction {
    InboundAction {
        action_id: ActionId::new(format!("cbq-{}", ProposalId::generate())),
        channel_id: "fake".to_string(),
        sender_id: SenderId::new(sender),
        message,
        payload: payload.to_string(),
        received_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct FakeChannel {
    fail_sends: bool,
    next_message_id: AtomicU64,
    sent: Mutex<Vec<(ConversationId, InteractiveMessage)>>,
    replaced: Mutex<Vec<(MessageHandle, InteractiveMessage)>>,
    acks: Mutex<Vec<(ActionId, String)>>,
}

impl FakeChannel {
    pub fn failing_sends() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(ConversationId, InteractiveMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn replaced(&self) -> Vec<(MessageHandle, InteractiveMessage)> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<String> {
        self.acks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for FakeChannel {
    fn channel_id(&self) -> &str {
        "fake"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundAction>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_interactive(
        &self,
        conversation_id: &ConversationId,
        message: InteractiveMessage,
    ) -> anyhow::Result<MessageHandle> {
        if self.fail_sends {
            anyhow::bail!("chat not found");
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent
            .lock()
            .unwrap()
            .push((conversation_id.clone(), message));
        Ok(MessageHandle {
            conversation_id: conversation_id.clone(),
            message_id: MessageId::new(id.to_string()),
        })
    }

    async fn replace_message(
        &self,
        handle: &MessageHandle,
        message: InteractiveMessage,
    ) -> anyhow::Result<()> {
        self.replaced
            .lock()
            .unwrap()
            .push((handle.clone(), message));
        Ok(())
    }

    async fn acknowledge(&self, action_id: &ActionId, text: &str) -> anyhow::Result<()> {
        self.acks
            .lock()
            .unwrap()
            .push((action_id.clone(), text.to_string()));
        Ok(())
    }
}

/// Calendar writer that records calls. Queued results are used first;
/// afterwards every call succeeds.
#[derive(Default)]
pub struct FakeWriter {
    calls: AtomicUsize,
    queued: Mutex<VecDeque<Result<CreatedEvent, CalendarError>>>,
    delay: std::time::Duration,
}

impl FakeWriter {
    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn queue(&self, result: Result<CreatedEvent, CalendarError>) {
        self.queued.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventWriter for FakeWriter {
    async fn create_event(&self, _event: &NewEvent) -> os_calendar::Result<CreatedEvent> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.queued.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            Ok(CreatedEvent {
                id: format!("evt-{n}"),
                html_link: format!("https://calendar.example/evt-{n}"),
            })
        })
    }
}

/// In-memory SQLite store whose first `failures` transitions into `fail_on`
/// return a backend error.
pub struct FlakyStore {
    inner: SqliteProposalStore,
    fail_on: ProposalStatus,
    remaining_failures: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(fail_on: ProposalStatus, failures: usize) -> Self {
        Self {
            inner: SqliteProposalStore::open_in_memory().unwrap(),
            fail_on,
            remaining_failures: AtomicUsize::new(failures),
        }
    }

    pub fn remaining_failures(&self) -> usize {
        self.remaining_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProposalStore for FlakyStore {
    async fn create(&self, proposal: &EventProposal) -> Result<(), StoreError> {
        self.inner.create(proposal).await
    }

    async fn get(&self, id: ProposalId) -> Result<EventProposal, StoreError> {
        self.inner.get(id).await
    }

    async fn transition(
        &self,
        id: ProposalId,
        expected: ProposalStatus,
        next: ProposalStatus,
        resolved_at: DateTime<Utc>,
        external: Option<&CreatedEvent>,
    ) -> Result<EventProposal, StoreError> {
        if next == self.fail_on
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Backend("database is locked".to_string()));
        }
        self.inner
            .transition(id, expected, next, resolved_at, external)
            .await
    }

    async fn attach_message(
        &self,
        id: ProposalId,
        handle: &MessageHandle,
    ) -> Result<(), StoreError> {
        self.inner.attach_message(id, handle).await
    }

    async fn list_overdue_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EventProposal>, StoreError> {
        self.inner.list_overdue_pending(cutoff).await
    }

    async fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<EventProposal>, StoreError> {
        self.inner.list(status).await
    }
}
