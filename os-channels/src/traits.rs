use crate::types::{ActionId, ConversationId, InboundAction, InteractiveMessage, MessageHandle};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving action taps. Push to tx for each inbound action.
    async fn start(&self, tx: mpsc::Sender<InboundAction>) -> Result<()>;

    /// Deliver a message carrying tappable actions to a conversation.
    async fn send_interactive(
        &self,
        conversation_id: &ConversationId,
        message: InteractiveMessage,
    ) -> Result<MessageHandle>;

    /// Replace a delivered message's content. An empty action list strips
    /// every affordance from the message.
    async fn replace_message(&self, handle: &MessageHandle, message: InteractiveMessage)
    -> Result<()>;

    /// Short-lived notice shown only to the user who tapped.
    async fn acknowledge(&self, action_id: &ActionId, text: &str) -> Result<()>;
}
