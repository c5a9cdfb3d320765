use crate::credentials::CredentialManager;
use crate::error::{CalendarError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const GOOGLE_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
pub const DEFAULT_CALENDAR_ID: &str = "primary";

/// Event to create, already validated upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEvent {
    pub id: String,
    pub html_link: String,
}

#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn create_event(&self, event: &NewEvent) -> Result<CreatedEvent>;
}

enum PostOutcome {
    Created(CreatedEvent),
    Unauthorized(String),
}

#[derive(Clone)]
pub struct CalendarClient {
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
    events_url: Url,
    time_zone: Tz,
}

impl CalendarClient {
    pub fn new(
        credentials: Arc<CredentialManager>,
        api_base: &str,
        calendar_id: &str,
        time_zone: Tz,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CalendarError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            credentials,
            events_url: events_url(api_base, calendar_id)?,
            time_zone,
        })
    }

    fn build_payload(&self, event: &NewEvent) -> serde_json::Value {
        let mut payload = json!({
            "summary": event.summary,
            "start": self.event_time(event.start),
            "end": self.event_time(event.end),
        });
        if let Some(description) = non_empty(event.description.as_deref()) {
            payload["description"] = json!(description);
        }
        if let Some(location) = non_empty(event.location.as_deref()) {
            payload["location"] = json!(location);
        }
        // An empty attendees array is not the same as no attendees field for Google.
        if !event.attendees.is_empty() {
            payload["attendees"] = event
                .attendees
                .iter()
                .map(|email| json!({ "email": email }))
                .collect();
        }
        payload
    }

    fn event_time(&self, at: DateTime<Utc>) -> serde_json::Value {
        json!({
            "dateTime": at.with_timezone(&self.time_zone).to_rfc3339(),
            "timeZone": self.time_zone.name(),
        })
    }

    async fn post_event(
        &self,
        access_token: &str,
        payload: &serde_json::Value,
    ) -> Result<PostOutcome> {
        let resp = self
            .http
            .post(self.events_url.clone())
            .bearer_auth(access_token)
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            return Ok(PostOutcome::Unauthorized(provider_error_message(&body)));
        }
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response body>".to_string());
            return Err(CalendarError::Api {
                status: status.as_u16(),
                message: provider_error_message(&body),
            });
        }

        let created: GoogleCreatedEvent = resp.json().await.map_err(|e| CalendarError::Api {
            status: status.as_u16(),
            message: format!("unreadable create-event response: {e}"),
        })?;
        Ok(PostOutcome::Created(CreatedEvent {
            id: created.id,
            html_link: created.html_link.unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl EventWriter for CalendarClient {
    /// Creates the event, retrying exactly once after a forced credential
    /// refresh when the API rejects the access token.
    #[tracing::instrument(level = "info", skip_all, fields(summary = %event.summary))]
    async fn create_event(&self, event: &NewEvent) -> Result<CreatedEvent> {
        if event.summary.trim().is_empty() {
            return Err(CalendarError::InvalidEvent("summary is empty".to_string()));
        }
        if event.start >= event.end {
            return Err(CalendarError::InvalidEvent(
                "start must be before end".to_string(),
            ));
        }

        let payload = self.build_payload(event);
        let token = self.credentials.access_token().await?;
        let detail = match self.post_event(&token, &payload).await? {
            PostOutcome::Created(created) => return Ok(created),
            PostOutcome::Unauthorized(detail) => detail,
        };

        tracing::warn!(
            %detail,
            "calendar api rejected access token; forcing refresh and retrying once"
        );
        let token = self.credentials.force_refresh().await?;
        match self.post_event(&token, &payload).await? {
            PostOutcome::Created(created) => Ok(created),
            PostOutcome::Unauthorized(detail) => Err(CalendarError::Authorization(format!(
                "calendar api rejected refreshed token: {detail}"
            ))),
        }
    }
}

fn events_url(api_base: &str, calendar_id: &str) -> Result<Url> {
    let mut url = Url::parse(api_base.trim_end_matches('/'))
        .map_err(|e| CalendarError::Configuration(format!("invalid calendar api base: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| {
            CalendarError::Configuration("calendar api base cannot be a base".to_string())
        })?
        .pop_if_empty()
        .extend(["calendars", calendar_id, "events"]);
    Ok(url)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn provider_error_message(body: &str) -> String {
    serde_json::from_str::<GoogleErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.message)
        .unwrap_or_else(|| body.trim().to_string())
}

#[derive(Debug, Deserialize)]
struct GoogleCreatedEvent {
    id: String,
    #[serde(rename = "htmlLink", default)]
    html_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorEnvelope {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: Option<String>,
}
