//! Telegram adapter (teloxide).
//!
//! Implements the `bwatch-core` NotifierPort and MediaFetcher over the Bot API,
//! plus the raw long-polling transport for business updates.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{
    net::Download,
    prelude::*,
    types::{
        InlineKeyboardButton, InlineKeyboardMarkup, InputFile, KeyboardButton, KeyboardMarkup,
        LabeledPrice, MessageEntity, MessageEntityKind, ParseMode, ReplyMarkup,
    },
    ApiError, RequestError,
};

use tokio::time::sleep;
use tracing::debug;

pub mod polling;

use bwatch_core::{
    domain::{ChatId, MediaKind, MessageId},
    errors::Error,
    formatting::{EntityKind, RichText},
    messaging::{
        port::NotifierPort,
        types::{Invoice, Keyboard, SendOutcome},
    },
    ports::MediaFetcher,
    Result,
};

/// Bot handle pointed at the configured API server.
pub fn build_bot(token: &str, api_url: &str) -> Result<Bot> {
    let url = reqwest::Url::parse(api_url)
        .map_err(|e| Error::Config(format!("invalid TELEGRAM_API_URL {api_url:?}: {e}")))?;
    Ok(Bot::new(token).set_api_url(url))
}

/// `@username` of the bot itself, without the `@`.
pub async fn fetch_bot_username(bot: &Bot) -> Result<String> {
    let me = bot
        .get_me()
        .await
        .map_err(|e| Error::External(format!("getMe failed: {e}")))?;
    Ok(me
        .user
        .username
        .clone()
        .unwrap_or_else(|| "your_bot".to_string()))
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    /// Retry once on `RetryAfter`, then classify.
    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> SendOutcome
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(_) => return SendOutcome::Delivered,
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(e) => return classify(e),
            }
        }
    }
}

/// Errors that mean "this recipient cannot be reached" rather than "try later".
pub fn classify(e: RequestError) -> SendOutcome {
    match &e {
        RequestError::Api(
            ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::UserDeactivated
            | ApiError::ChatNotFound
            | ApiError::CantInitiateConversation,
        ) => {
            debug!(error = %e, "Recipient unavailable");
            SendOutcome::RecipientUnavailable
        }
        _ => SendOutcome::TransientFailure(format!("telegram error: {e}")),
    }
}

pub fn tg_entities(text: &RichText) -> Vec<MessageEntity> {
    text.entities()
        .iter()
        .filter_map(|e| {
            let kind = match &e.kind {
                EntityKind::Bold => MessageEntityKind::Bold,
                EntityKind::Italic => MessageEntityKind::Italic,
                EntityKind::Mention { user_id } => MessageEntityKind::TextLink {
                    url: reqwest::Url::parse(&format!("tg://user?id={user_id}")).ok()?,
                },
            };
            Some(MessageEntity::new(kind, e.offset, e.length))
        })
        .collect()
}

pub fn tg_markup(keyboard: &Keyboard) -> ReplyMarkup {
    match keyboard {
        Keyboard::Inline(rows) => {
            let rows: Vec<Vec<InlineKeyboardButton>> = rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| {
                            InlineKeyboardButton::callback(b.label.clone(), b.callback_data.clone())
                        })
                        .collect()
                })
                .collect();
            InlineKeyboardMarkup::new(rows).into()
        }
        Keyboard::Reply(rows) => {
            let rows: Vec<Vec<KeyboardButton>> = rows
                .iter()
                .map(|row| row.iter().map(KeyboardButton::new).collect())
                .collect();
            KeyboardMarkup::new(rows).resize_keyboard(true).into()
        }
    }
}

#[async_trait]
impl NotifierPort for TelegramNotifier {
    async fn send_rich(
        &self,
        chat_id: ChatId,
        text: &RichText,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome {
        let entities = tg_entities(text);
        let markup = keyboard.map(tg_markup);
        self.with_retry(|| {
            let mut req = self
                .bot
                .send_message(Self::tg_chat(chat_id), text.text().to_string())
                .entities(entities.clone());
            if let Some(m) = &markup {
                req = req.reply_markup(m.clone());
            }
            req
        })
        .await
    }

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome {
        let markup = keyboard.map(tg_markup);
        self.with_retry(|| {
            let mut req = self
                .bot
                .send_message(Self::tg_chat(chat_id), html.to_string())
                .parse_mode(ParseMode::Html);
            if let Some(m) = &markup {
                req = req.reply_markup(m.clone());
            }
            req
        })
        .await
    }

    async fn send_media(
        &self,
        chat_id: ChatId,
        kind: MediaKind,
        path: &Path,
        caption: Option<&RichText>,
    ) -> SendOutcome {
        let chat = Self::tg_chat(chat_id);
        let (text, entities) = match caption {
            Some(c) => (Some(c.text().to_string()), tg_entities(c)),
            None => (None, Vec::new()),
        };
        let file = || InputFile::file(path.to_path_buf());
        match kind {
            MediaKind::Photo => {
                self.with_retry(|| {
                    let mut req = self.bot.send_photo(chat, file());
                    if let Some(t) = &text {
                        req = req.caption(t.clone()).caption_entities(entities.clone());
                    }
                    req
                })
                .await
            }
            MediaKind::Video => {
                self.with_retry(|| {
                    let mut req = self.bot.send_video(chat, file());
                    if let Some(t) = &text {
                        req = req.caption(t.clone()).caption_entities(entities.clone());
                    }
                    req
                })
                .await
            }
            MediaKind::Document => {
                self.with_retry(|| {
                    let mut req = self.bot.send_document(chat, file());
                    if let Some(t) = &text {
                        req = req.caption(t.clone()).caption_entities(entities.clone());
                    }
                    req
                })
                .await
            }
            MediaKind::VideoNote => {
                self.with_retry(|| self.bot.send_video_note(chat, file()))
                    .await
            }
        }
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> SendOutcome {
        self.with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            if show_alert {
                req = req.show_alert(true);
            }
            req
        })
        .await
    }

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        ok: bool,
        error: Option<&str>,
    ) -> SendOutcome {
        self.with_retry(|| {
            let mut req = self
                .bot
                .answer_pre_checkout_query(query_id.to_string(), ok);
            if let Some(e) = error {
                req = req.error_message(e.to_string());
            }
            req
        })
        .await
    }

    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> SendOutcome {
        // Stars invoices carry an empty provider token.
        self.with_retry(|| {
            self.bot.send_invoice(
                Self::tg_chat(chat_id),
                invoice.title.clone(),
                invoice.description.clone(),
                invoice.payload.clone(),
                String::new(),
                invoice.currency.clone(),
                vec![LabeledPrice::new(invoice.label.clone(), invoice.amount as i32)],
            )
        })
        .await
    }

    async fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> SendOutcome {
        self.with_retry(|| {
            self.bot.copy_message(
                Self::tg_chat(to),
                Self::tg_chat(from),
                teloxide::types::MessageId(message_id.0),
            )
        })
        .await
    }
}

/// Downloads attachments through `getFile`.
#[derive(Clone)]
pub struct TelegramFetcher {
    bot: Bot,
}

impl TelegramFetcher {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MediaFetcher for TelegramFetcher {
    async fn fetch(&self, file_id: &str, dest: &Path) -> Result<()> {
        let file = self
            .bot
            .get_file(file_id.to_string())
            .await
            .map_err(|e| Error::External(format!("getFile failed: {e}")))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        if let Err(e) = self.bot.download_file(&file.path, &mut out).await {
            drop(out);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::External(format!("download failed: {e}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bwatch_core::messaging::types::InlineButton;

    #[test]
    fn mention_becomes_profile_link() {
        let text = RichText::new("👤 Ann wrote").bold("wrote").mention("Ann", 7);
        let entities = tg_entities(&text);
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().any(|e| e.kind == MessageEntityKind::Bold));
        let link = entities
            .iter()
            .find(|e| matches!(e.kind, MessageEntityKind::TextLink { .. }))
            .unwrap();
        assert_eq!(link.offset, 3);
        assert_eq!(link.length, 3);
        match &link.kind {
            MessageEntityKind::TextLink { url } => assert_eq!(url.as_str(), "tg://user?id=7"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn inline_keyboard_keeps_rows() {
        let kb = Keyboard::Inline(vec![
            vec![InlineButton::new("a", "x"), InlineButton::new("b", "y")],
            vec![InlineButton::new("c", "z")],
        ]);
        match tg_markup(&kb) {
            ReplyMarkup::InlineKeyboard(m) => {
                assert_eq!(m.inline_keyboard.len(), 2);
                assert_eq!(m.inline_keyboard[0].len(), 2);
            }
            _ => panic!("expected inline keyboard"),
        }
    }

    #[test]
    fn blocked_bot_is_unavailable_not_transient() {
        assert_eq!(
            classify(RequestError::Api(ApiError::BotBlocked)),
            SendOutcome::RecipientUnavailable
        );
        assert!(matches!(
            classify(RequestError::Api(ApiError::MessageTextIsEmpty)),
            SendOutcome::TransientFailure(_)
        ));
    }
}
