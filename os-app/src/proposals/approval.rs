use crate::proposals::model::{ApprovalAction, EventProposal, ProposalId};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use os_calendar::CreatedEvent;
use os_channels::{
    ActionButton, ActionId, ChannelAdapter, ConversationId, InteractiveMessage, MessageHandle,
};
use std::sync::Arc;

const APPROVE_LABEL: &str = "Add to calendar";
const REJECT_LABEL: &str = "Skip";

/// Renders proposals into the approval conversation and edits them once decided.
#[derive(Clone)]
pub struct ApprovalPresenter {
    channel: Arc<dyn ChannelAdapter>,
    time_zone: Tz,
}

impl ApprovalPresenter {
    pub fn new(channel: Arc<dyn ChannelAdapter>, time_zone: Tz) -> Self {
        Self { channel, time_zone }
    }

    /// Delivers the proposal with its two actions. A delivery failure is
    /// logged and yields `None`; the proposal stays pending either way.
    pub async fn present(&self, proposal: &EventProposal) -> Option<MessageHandle> {
        let conversation_id = ConversationId::new(proposal.origin_conversation_id.clone());
        let message = InteractiveMessage {
            content: self.render_summary(proposal),
            actions: decision_buttons(proposal.id),
        };
        match self.channel.send_interactive(&conversation_id, message).await {
            Ok(handle) => {
                tracing::info!(
                    proposal_id = %proposal.id,
                    channel = self.channel.channel_id(),
                    conversation_id = %handle.conversation_id,
                    message_id = %handle.message_id,
                    "approval message delivered"
                );
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(
                    proposal_id = %proposal.id,
                    channel = self.channel.channel_id(),
                    error = %e,
                    "approval message delivery failed; proposal stays pending"
                );
                None
            }
        }
    }

    /// Replaces the approval message with static outcome text and drops its actions.
    pub async fn resolve(
        &self,
        proposal_id: ProposalId,
        handle: &MessageHandle,
        outcome_text: String,
    ) {
        self.replace(
            proposal_id,
            handle,
            InteractiveMessage {
                content: outcome_text,
                actions: Vec::new(),
            },
        )
        .await;
    }

    /// Shows a write failure while keeping both actions so the human can tap again.
    pub async fn show_failure(
        &self,
        proposal: &EventProposal,
        handle: &MessageHandle,
        class: &str,
        detail: &str,
    ) {
        self.show_notice(proposal, handle, failure_text(class, detail)).await;
    }

    /// Appends `notice` under the summary; both actions stay.
    pub async fn show_notice(
        &self,
        proposal: &EventProposal,
        handle: &MessageHandle,
        notice: String,
    ) {
        let content = format!("{}\n\n{notice}", self.render_summary(proposal));
        self.replace(
            proposal.id,
            handle,
            InteractiveMessage {
                content,
                actions: decision_buttons(proposal.id),
            },
        )
        .await;
    }

    pub async fn acknowledge(&self, action_id: &ActionId, text: &str) {
        if let Err(e) = self.channel.acknowledge(action_id, text).await {
            tracing::warn!(action_id = %action_id, error = %e, "action acknowledgement failed");
        }
    }

    async fn replace(
        &self,
        proposal_id: ProposalId,
        handle: &MessageHandle,
        message: InteractiveMessage,
    ) {
        if let Err(e) = self.channel.replace_message(handle, message).await {
            tracing::warn!(
                proposal_id = %proposal_id,
                message_id = %handle.message_id,
                error = %e,
                "approval message edit failed"
            );
        }
    }

    pub fn render_summary(&self, proposal: &EventProposal) -> String {
        let mut lines = vec![
            format!("📅 {}", proposal.title),
            format!("🕒 {}", format_range(proposal.start, proposal.end, self.time_zone)),
        ];
        if !proposal.attendees.is_empty() {
            lines.push(format!("👥 {}", proposal.attendees.join(", ")));
        }
        if let Some(location) = &proposal.location {
            lines.push(format!("📍 {location}"));
        }
        if let Some(description) = &proposal.description {
            lines.push(String::new());
            lines.push(description.clone());
        }
        lines.join("\n")
    }
}

fn decision_buttons(id: ProposalId) -> Vec<ActionButton> {
    vec![
        ActionButton {
            label: APPROVE_LABEL.to_string(),
            payload: ApprovalAction::Approve.payload_for(id),
        },
        ActionButton {
            label: REJECT_LABEL.to_string(),
            payload: ApprovalAction::Reject.payload_for(id),
        },
    ]
}

/// Same-day ranges print the date once.
pub fn format_range(start: DateTime<Utc>, end: DateTime<Utc>, tz: Tz) -> String {
    let start = start.with_timezone(&tz);
    let end = end.with_timezone(&tz);
    let end_format = if start.date_naive() == end.date_naive() {
        "%H:%M"
    } else {
        "%a %-d %b %Y %H:%M"
    };
    format!(
        "{} - {} ({})",
        start.format("%a %-d %b %Y %H:%M"),
        end.format(end_format),
        tz.name()
    )
}

pub fn created_text(proposal: &EventProposal, event: &CreatedEvent) -> String {
    if event.html_link.is_empty() {
        format!("✅ Added to calendar: {}", proposal.title)
    } else {
        format!("✅ Added to calendar: {}\n{}", proposal.title, event.html_link)
    }
}

pub fn skipped_text(proposal: &EventProposal) -> String {
    format!("Skipped: {}", proposal.title)
}

pub fn expired_text(proposal: &EventProposal) -> String {
    format!("⌛ Expired without a decision: {}", proposal.title)
}

pub fn start_passed_text(proposal: &EventProposal) -> String {
    format!(
        "⌛ Not added: the start time of {} has already passed",
        proposal.title
    )
}

pub fn unrecorded_text(event: &CreatedEvent) -> String {
    let mut text = "⚠️ The event was created but the decision could not be saved.".to_string();
    if !event.html_link.is_empty() {
        text.push('\n');
        text.push_str(&event.html_link);
    }
    text.push_str("\nTap either button to finish; the event will not be created again.");
    text
}

pub fn failure_text(class: &str, detail: &str) -> String {
    format!("⚠️ Could not add the event ({class} error): {detail}\nTap again to retry.")
}
