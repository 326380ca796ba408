use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::update::{CallbackQuery, ChosenInlineResult, InlineQuery, Message, Update, UpdateKind};

/// Delivers one update to application logic.
///
/// An `Err` counts as a failed delivery and is retried until the retry
/// budget runs out. Implementations are not assumed to be idempotent.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, update: &Update) -> Result<()>;
}

/// Typed per-kind handlers. Override only the kinds the application consumes.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn on_direct_message(&self, _update_id: i64, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_group_message(&self, _update_id: i64, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_edited_message(&self, _update_id: i64, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_channel_post(&self, _update_id: i64, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_edited_channel_post(&self, _update_id: i64, _msg: &Message) -> Result<()> {
        Ok(())
    }

    async fn on_inline_query(&self, _update_id: i64, _query: &InlineQuery) -> Result<()> {
        Ok(())
    }

    async fn on_callback_query(&self, _update_id: i64, _query: &CallbackQuery) -> Result<()> {
        Ok(())
    }

    async fn on_chosen_inline_result(
        &self,
        _update_id: i64,
        _result: &ChosenInlineResult,
    ) -> Result<()> {
        Ok(())
    }
}

/// Routes each update to the matching [`UpdateHandler`] method.
pub struct Router<H> {
    handler: H,
}

impl<H: UpdateHandler> Router<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: UpdateHandler> Dispatcher for Router<H> {
    async fn dispatch(&self, update: &Update) -> Result<()> {
        let id = update.update_id;
        match &update.kind {
            UpdateKind::DirectMessage(msg) => self.handler.on_direct_message(id, msg).await,
            UpdateKind::GroupMessage(msg) => self.handler.on_group_message(id, msg).await,
            UpdateKind::EditedMessage(msg) => self.handler.on_edited_message(id, msg).await,
            UpdateKind::ChannelPost(msg) => self.handler.on_channel_post(id, msg).await,
            UpdateKind::EditedChannelPost(msg) => {
                self.handler.on_edited_channel_post(id, msg).await
            }
            UpdateKind::InlineQuery(query) => self.handler.on_inline_query(id, query).await,
            UpdateKind::CallbackQuery(query) => self.handler.on_callback_query(id, query).await,
            UpdateKind::ChosenInlineResult(result) => {
                self.handler.on_chosen_inline_result(id, result).await
            }
        }
    }
}

/// Handler used by the binary: logs every update it is handed.
pub struct LogHandler;

fn describe_message(msg: &Message) -> String {
    let sender = msg
        .from
        .as_ref()
        .map(|u| u.first_name.as_str())
        .unwrap_or("unknown");
    let body = msg.text.as_deref().or(msg.caption.as_deref()).unwrap_or("");
    format!("chat {} from {}: {}", msg.chat.id, sender, body)
}

#[async_trait]
impl UpdateHandler for LogHandler {
    async fn on_direct_message(&self, update_id: i64, msg: &Message) -> Result<()> {
        info!("[{}] direct message {}", update_id, describe_message(msg));
        Ok(())
    }

    async fn on_group_message(&self, update_id: i64, msg: &Message) -> Result<()> {
        info!("[{}] group message {}", update_id, describe_message(msg));
        Ok(())
    }

    async fn on_edited_message(&self, update_id: i64, msg: &Message) -> Result<()> {
        info!("[{}] edited message {}", update_id, describe_message(msg));
        Ok(())
    }

    async fn on_channel_post(&self, update_id: i64, msg: &Message) -> Result<()> {
        info!("[{}] channel post {}", update_id, describe_message(msg));
        Ok(())
    }

    async fn on_edited_channel_post(&self, update_id: i64, msg: &Message) -> Result<()> {
        info!("[{}] edited channel post {}", update_id, describe_message(msg));
        Ok(())
    }

    async fn on_inline_query(&self, update_id: i64, query: &InlineQuery) -> Result<()> {
        info!(
            "[{}] inline query {} from {}: {:?}",
            update_id, query.id, query.from.id, query.query
        );
        Ok(())
    }

    async fn on_callback_query(&self, update_id: i64, query: &CallbackQuery) -> Result<()> {
        info!(
            "[{}] callback {} from {}: {:?}",
            update_id, query.id, query.from.id, query.data
        );
        Ok(())
    }

    async fn on_chosen_inline_result(
        &self,
        update_id: i64,
        result: &ChosenInlineResult,
    ) -> Result<()> {
        info!(
            "[{}] chosen inline result {} from {}",
            update_id, result.result_id, result.from.id
        );
        Ok(())
    }
}
