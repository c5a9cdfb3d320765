use crate::error::{CalendarError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const REFRESH_SAFETY_MARGIN_SECS: i64 = 300;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Persisted OAuth material for the calendar account.
///
/// The refresh token is never rotated here; the access token and its expiry
/// are always replaced together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default, alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "expiry")]
    pub access_token_expires_at: Option<DateTime<Utc>>,
}

impl OAuthCredential {
    /// True when the access token outlives `now + margin`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        if self.access_token.trim().is_empty() {
            return false;
        }
        self.access_token_expires_at
            .is_some_and(|expires_at| expires_at > now + margin)
    }

    fn with_access_token(&self, access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            refresh_token: self.refresh_token.clone(),
            access_token,
            access_token_expires_at: Some(expires_at),
        }
    }
}

impl fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("access_token_expires_at", &self.access_token_expires_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    DEFAULT_EXPIRES_IN_SECS
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Read/refresh/write access to the single credential record on disk.
///
/// Refreshes are serialized through `refresh_lock` and every refresh is
/// written back as a whole-file replacement before the new token is handed out.
pub struct CredentialManager {
    http: reqwest::Client,
    path: PathBuf,
    token_endpoint: String,
    safety_margin: Duration,
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        path: impl Into<PathBuf>,
        token_endpoint: impl Into<String>,
        request_timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CalendarError::Configuration(e.to_string()))?;
        Ok(Self {
            http,
            path: path.into(),
            token_endpoint: token_endpoint.into(),
            safety_margin: Duration::seconds(REFRESH_SAFETY_MARGIN_SECS),
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<OAuthCredential> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CalendarError::Configuration(format!(
                    "credential file not found: {}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|e| {
            CalendarError::Configuration(format!(
                "parse credential file {}: {e}",
                self.path.display()
            ))
        })
    }

    pub async fn access_token(&self) -> Result<String> {
        self.access_token_at(Utc::now()).await
    }

    /// Returns the stored token when it is still valid past the safety margin,
    /// otherwise refreshes, persists, and returns the new one.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn access_token_at(&self, now: DateTime<Utc>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        let credential = self.load().await?;
        if credential.is_valid_at(now, self.safety_margin) {
            return Ok(credential.access_token);
        }
        tracing::info!(
            expires_at = ?credential.access_token_expires_at,
            "access token expired or inside safety margin; refreshing"
        );
        let refreshed = self.refresh_and_persist(&credential, now).await?;
        Ok(refreshed.access_token)
    }

    /// Refreshes regardless of the stored expiry. Used after the calendar API
    /// rejects a token that looked valid locally.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn force_refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        let credential = self.load().await?;
        let refreshed = self.refresh_and_persist(&credential, Utc::now()).await?;
        Ok(refreshed.access_token)
    }

    async fn refresh_and_persist(
        &self,
        credential: &OAuthCredential,
        now: DateTime<Utc>,
    ) -> Result<OAuthCredential> {
        let grant = self.request_refresh(credential).await?;
        let expires_at = now + Duration::seconds(grant.expires_in.max(0));
        let refreshed = credential.with_access_token(grant.access_token, expires_at);
        self.persist(&refreshed).await?;
        tracing::info!(%expires_at, "access token refreshed and persisted");
        Ok(refreshed)
    }

    async fn request_refresh(&self, credential: &OAuthCredential) -> Result<TokenGrant> {
        if credential.refresh_token.trim().is_empty() {
            return Err(CalendarError::Configuration(
                "credential file has no refresh_token".to_string(),
            ));
        }
        let resp = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("client_id", credential.client_id.as_str()),
                ("client_secret", credential.client_secret.as_str()),
                ("refresh_token", credential.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response body>".to_string());
            return Err(CalendarError::Authorization(format!(
                "token refresh failed: status={status} detail={}",
                token_error_detail(&body)
            )));
        }

        resp.json::<TokenGrant>().await.map_err(|e| {
            CalendarError::Authorization(format!("token refresh returned unreadable body: {e}"))
        })
    }

    async fn persist(&self, credential: &OAuthCredential) -> Result<()> {
        let json = serde_json::to_vec_pretty(credential)
            .map_err(|e| CalendarError::Io(format!("serialize credential: {e}")))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn token_error_detail(body: &str) -> String {
    match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(parsed) => match parsed.error_description {
            Some(description) => format!("{}: {description}", parsed.error),
            None => parsed.error,
        },
        Err(_) => body.trim().to_string(),
    }
}
