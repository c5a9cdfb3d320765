use chrono::{DateTime, Duration, Utc};
use os_calendar::NewEvent;
use os_channels::MessageHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_EXPIRY_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(Uuid);

impl ProposalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The complete table of legal moves: out of `pending`, into any terminal
    /// state. Nothing leaves a terminal state.
    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Approved | Self::Rejected | Self::Expired
            )
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown proposal status {other:?}")),
        }
    }
}

/// The two decisions a human can make on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    /// Callback payload carried by the action button: `<tag>:<proposal id>`.
    pub fn payload_for(self, id: ProposalId) -> String {
        format!("{}:{id}", self.tag())
    }
}

/// Parses a tapped action's payload. Unknown tags and malformed ids yield `None`.
pub fn parse_action_payload(payload: &str) -> Option<(ApprovalAction, ProposalId)> {
    let (tag, id) = payload.trim().split_once(':')?;
    Some((ApprovalAction::from_tag(tag)?, ProposalId::parse(id)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventProposal {
    pub id: ProposalId,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub origin_conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub status: ProposalStatus,
    pub message: Option<MessageHandle>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub external_event_id: Option<String>,
    pub external_link: Option<String>,
}

impl EventProposal {
    /// True once the proposal has been pending for the whole expiry window.
    pub fn is_overdue_at(&self, now: DateTime<Utc>, expiry_window: Duration) -> bool {
        now - self.created_at >= expiry_window
    }

    pub fn start_has_passed_at(&self, now: DateTime<Utc>) -> bool {
        self.start <= now
    }

    pub fn to_new_event(&self) -> NewEvent {
        NewEvent {
            summary: self.title.clone(),
            description: self.description.clone(),
            location: self.location.clone(),
            start: self.start,
            end: self.end,
            attendees: self.attendees.clone(),
        }
    }
}
