//! Seam to the chat platform. The bot core never formats protocol-level
//! messages; it emits text through this trait and the adapter decides how
//! to render it.

use vmherd_common::types::Capability;

/// Who invoked a command, with their capability tier already resolved by
/// the chat adapter.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub user_id: String,
    pub capability: Capability,
}

impl CommandContext {
    pub fn new(user_id: impl Into<String>, capability: Capability) -> Self {
        Self {
            user_id: user_id.into(),
            capability,
        }
    }
}

/// Three-way outcome of an interactive confirmation. A timed-out dialog is
/// neither approval nor refusal and must be handled as its own case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Cancelled,
    TimedOut,
}

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    /// Final reply for the invocation. Best-effort; adapters log failures.
    async fn reply(&self, ctx: &CommandContext, text: &str);

    /// Intermediate progress update during a long-running command.
    async fn progress(&self, ctx: &CommandContext, text: &str);

    /// Asks the invoking user to confirm a destructive action. The adapter
    /// owns the dialog timeout (60s in the reference adapter).
    async fn confirm(&self, ctx: &CommandContext, prompt: &str) -> Confirmation;

    /// Out-of-band note to a user (e.g. auto-shutdown notice). Best-effort.
    async fn notify_user(&self, user_id: &str, text: &str);
}

/// Gateway used when no chat adapter is attached: messages go to the log
/// and confirmations time out, so destructive paths never proceed.
pub struct LoggingGateway;

#[async_trait::async_trait]
impl ChatGateway for LoggingGateway {
    async fn reply(&self, ctx: &CommandContext, text: &str) {
        tracing::info!(user = %ctx.user_id, "reply: {text}");
    }

    async fn progress(&self, ctx: &CommandContext, text: &str) {
        tracing::info!(user = %ctx.user_id, "progress: {text}");
    }

    async fn confirm(&self, ctx: &CommandContext, prompt: &str) -> Confirmation {
        tracing::warn!(user = %ctx.user_id, "no interactive gateway to confirm: {prompt}");
        Confirmation::TimedOut
    }

    async fn notify_user(&self, user_id: &str, text: &str) {
        tracing::info!(user = user_id, "notify: {text}");
    }
}
