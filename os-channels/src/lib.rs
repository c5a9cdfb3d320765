//! Channel adapters for calgate.
//!
//! Adapters are pure I/O: they deliver interactive approval messages, edit
//! them once a decision is made, and turn platform button taps into
//! `InboundAction`s.

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    ActionButton, ActionId, ConversationId, InboundAction, InteractiveMessage, MessageHandle,
    MessageId, SenderId,
};
