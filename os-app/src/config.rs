//! calgate configuration loader.

use crate::proposals::model::DEFAULT_EXPIRY_WINDOW_HOURS;
use chrono_tz::Tz;
use os_calendar::{DEFAULT_CALENDAR_ID, GOOGLE_CALENDAR_API_BASE, GOOGLE_TOKEN_ENDPOINT};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalgateConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub proposals: ProposalsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// IANA zone used to read bare timestamps and render event times.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
        }
    }
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Telegram user ids allowed to approve or reject. Empty allows anyone
    /// who can see the approval message.
    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: String,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            calendar_id: default_calendar_id(),
            token_endpoint: default_token_endpoint(),
            api_base_url: default_api_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

fn default_credentials_path() -> String {
    "~/.calgate/credentials.json".to_string()
}

fn default_calendar_id() -> String {
    DEFAULT_CALENDAR_ID.to_string()
}

fn default_token_endpoint() -> String {
    GOOGLE_TOKEN_ENDPOINT.to_string()
}

fn default_api_base_url() -> String {
    GOOGLE_CALENDAR_API_BASE.to_string()
}

fn default_request_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposalsConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u32,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for ProposalsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            expiry_hours: default_expiry_hours(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

fn default_database_path() -> String {
    "~/.calgate/data/proposals.db".to_string()
}

fn default_expiry_hours() -> u32 {
    DEFAULT_EXPIRY_WINDOW_HOURS as u32
}

fn default_sweep_interval_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// When set, ingestion requests must carry `Authorization: Bearer <token>`.
    #[serde(default)]
    pub ingest_token: Option<String>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            host: default_server_host(),
            port: default_server_port(),
            ingest_token: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_max_in_flight() -> usize {
    64
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8787
}

impl CalgateConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg: CalgateConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_blank("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
            self.telegram.enabled = true;
        }
        if let Some(v) = non_blank("CALGATE_TIME_ZONE") {
            self.general.time_zone = v;
        }
        if let Some(v) = non_blank("CALGATE_CREDENTIALS_PATH") {
            self.calendar.credentials_path = v;
        }
        if let Some(v) = non_blank("CALGATE_DATABASE_PATH") {
            self.proposals.database_path = v;
        }
        if let Some(v) = non_blank("CALGATE_INGEST_TOKEN") {
            self.server.ingest_token = Some(v);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.time_zone()?;
        if self.telegram.enabled && self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required when telegram is enabled"
            ));
        }
        if self.proposals.expiry_hours == 0 {
            return Err(anyhow::anyhow!("proposals.expiry_hours must be > 0"));
        }
        if self.proposals.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "proposals.sweep_interval_seconds must be > 0"
            ));
        }
        if self.calendar.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!(
                "calendar.request_timeout_seconds must be > 0"
            ));
        }
        if self.server.enabled && self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.enabled && self.server.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.request_timeout_seconds must be > 0"));
        }
        if self.server.enabled && self.server.max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.max_in_flight must be > 0"));
        }
        Ok(())
    }

    pub fn time_zone(&self) -> anyhow::Result<Tz> {
        self.general
            .time_zone
            .trim()
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("general.time_zone {:?}: {e}", self.general.time_zone))
    }

    pub fn credentials_path(&self) -> PathBuf {
        expand_home(&self.calendar.credentials_path)
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.proposals.database_path)
    }

    pub fn expiry_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.proposals.expiry_hours))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.proposals.sweep_interval_seconds)
    }

    pub fn calendar_timeout(&self) -> Duration {
        Duration::from_secs(self.calendar.request_timeout_seconds)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    pub fn allowed_sender_ids(&self) -> Vec<String> {
        self.telegram
            .allowed_user_ids
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn expand_home(raw: &str) -> PathBuf {
    let raw = raw.trim();
    if raw == "~" {
        return home_dir();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(raw),
    }
}

pub fn default_config_path() -> PathBuf {
    home_dir().join(".calgate").join("config.toml")
}
