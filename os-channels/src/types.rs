use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(SenderId);
id_newtype!(ActionId);

/// One tappable affordance on an interactive message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub label: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveMessage {
    pub content: String,
    pub actions: Vec<ActionButton>,
}

/// Weak reference to a delivered message. The channel owns the message itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

/// A user tapping one of the actions of an interactive message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundAction {
    pub action_id: ActionId,
    pub channel_id: String,
    pub sender_id: SenderId,
    /// The message the tapped action belongs to, when the platform reports it.
    pub message: Option<MessageHandle>,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}
