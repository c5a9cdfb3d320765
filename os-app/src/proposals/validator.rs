use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];
const EMAIL_SHAPE: &str = r"^[^@\s]+@[^@\s]+\.[^@\s.][^@\s]*$";

/// Raw proposal as emitted by the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposalRequest {
    pub title: String,
    #[serde(alias = "startTime")]
    pub start_time: String,
    #[serde(alias = "endTime")]
    pub end_time: String,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(alias = "originConversationId")]
    pub origin_conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("title is empty")]
    EmptyTitle,
    #[error("start time {0:?} is not a valid timestamp")]
    InvalidStartTime(String),
    #[error("end time {0:?} is not a valid timestamp")]
    InvalidEndTime(String),
    #[error("start {start} is not before end {end}")]
    StartNotBeforeEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("start {start} is not in the future")]
    StartNotInFuture { start: DateTime<Utc> },
    #[error("attendee {0:?} is not an email address")]
    InvalidAttendee(String),
}

impl ValidationError {
    /// Name of the rule that rejected the request, in check order.
    pub fn rule(&self) -> &'static str {
        match self {
            Self::EmptyTitle => "title",
            Self::InvalidStartTime(_) | Self::InvalidEndTime(_) => "timestamps",
            Self::StartNotBeforeEnd { .. } => "ordering",
            Self::StartNotInFuture { .. } => "future",
            Self::InvalidAttendee(_) => "attendees",
        }
    }
}

/// A request that passed every rule, with timestamps resolved to UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedProposal {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub origin_conversation_id: String,
}

pub struct ProposalValidator {
    time_zone: Tz,
    email_shape: Regex,
}

impl ProposalValidator {
    /// `time_zone` is the zone timestamps without an explicit offset are read in.
    pub fn new(time_zone: Tz) -> anyhow::Result<Self> {
        let email_shape = Regex::new(EMAIL_SHAPE)
            .map_err(|e| anyhow::anyhow!("compile email pattern: {e}"))?;
        Ok(Self {
            time_zone,
            email_shape,
        })
    }

    /// Checks, in order, stopping at the first failure: title, timestamps,
    /// start before end, start in the future, attendee shape.
    pub fn validate(
        &self,
        request: &ProposalRequest,
        now: DateTime<Utc>,
    ) -> Result<ValidatedProposal, ValidationError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }

        let start = self
            .parse_timestamp(&request.start_time)
            .ok_or_else(|| ValidationError::InvalidStartTime(request.start_time.clone()))?;
        let end = self
            .parse_timestamp(&request.end_time)
            .ok_or_else(|| ValidationError::InvalidEndTime(request.end_time.clone()))?;

        if start >= end {
            return Err(ValidationError::StartNotBeforeEnd { start, end });
        }
        if start <= now {
            return Err(ValidationError::StartNotInFuture { start });
        }

        let mut attendees = Vec::with_capacity(request.attendees.len());
        for attendee in &request.attendees {
            let trimmed = attendee.trim();
            if !self.email_shape.is_match(trimmed) {
                return Err(ValidationError::InvalidAttendee(attendee.clone()));
            }
            attendees.push(trimmed.to_string());
        }

        Ok(ValidatedProposal {
            title: title.to_string(),
            start,
            end,
            attendees,
            description: non_empty(request.description.as_deref()),
            location: non_empty(request.location.as_deref()),
            origin_conversation_id: request.origin_conversation_id.trim().to_string(),
        })
    }

    /// RFC 3339 with an offset is taken as-is; a bare local timestamp is
    /// read in the configured zone. Times skipped by a DST jump are invalid.
    fn parse_timestamp(&self, value: &str) -> Option<DateTime<Utc>> {
        let value = value.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Some(parsed.with_timezone(&Utc));
        }
        NAIVE_TIMESTAMP_FORMATS.iter().find_map(|format| {
            let naive = NaiveDateTime::parse_from_str(value, format).ok()?;
            self.time_zone
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.with_timezone(&Utc))
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}
