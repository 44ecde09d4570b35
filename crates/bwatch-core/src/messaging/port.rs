use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MediaKind, MessageId},
    formatting::RichText,
    messaging::types::{Invoice, Keyboard, SendOutcome},
};

/// Outbound notification port.
///
/// Telegram is the only implementation; the router never sees platform errors,
/// only a `SendOutcome`.
#[async_trait]
pub trait NotifierPort: Send + Sync {
    /// Plain text annotated with entities (no parse mode).
    async fn send_rich(
        &self,
        chat_id: ChatId,
        text: &RichText,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome;

    async fn send_html(&self, chat_id: ChatId, html: &str, keyboard: Option<&Keyboard>)
        -> SendOutcome;

    /// Upload a local file. `caption` is ignored for kinds without caption support.
    async fn send_media(
        &self,
        chat_id: ChatId,
        kind: MediaKind,
        path: &Path,
        caption: Option<&RichText>,
    ) -> SendOutcome;

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> SendOutcome;

    async fn answer_pre_checkout(&self, query_id: &str, ok: bool, error: Option<&str>)
        -> SendOutcome;

    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> SendOutcome;

    async fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> SendOutcome;
}
