use thiserror::Error;

pub type Result<T> = std::result::Result<T, CalendarError>;

#[derive(Debug, Error)]
pub enum CalendarError {
    /// Missing or unreadable local setup (credential file, endpoints). Not retryable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The identity provider or the calendar API rejected our credentials.
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("calendar api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl CalendarError {
    /// Short label shown to the human in failure notices.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "config",
            Self::Authorization(_) => "auth",
            Self::Api { .. } => "api",
            Self::Network(_) => "network",
            Self::Io(_) => "io",
            Self::InvalidEvent(_) => "invalid",
        }
    }
}

impl From<std::io::Error> for CalendarError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for CalendarError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}
