//! Calendar write path for calgate.
//!
//! Holds the OAuth credential record for the calendar account and performs
//! the single write action the system supports: creating an event.

mod client;
mod credentials;
mod error;

pub use client::{
    CalendarClient, CreatedEvent, DEFAULT_CALENDAR_ID, EventWriter, GOOGLE_CALENDAR_API_BASE,
    NewEvent,
};
pub use credentials::{
    CredentialManager, GOOGLE_TOKEN_ENDPOINT, OAuthCredential, REFRESH_SAFETY_MARGIN_SECS,
};
pub use error::{CalendarError, Result};
