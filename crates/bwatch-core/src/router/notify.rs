//! Owner notifications and the small send helpers every handler shares.

use tracing::{debug, warn};

use crate::{
    context::AppContext,
    domain::{ChatId, MediaKind, UserId},
    formatting::RichText,
    messaging::types::{Keyboard, SendOutcome},
    store::CachedMedia,
    update::User,
    utils::clip_text,
};

pub const TEXT_LIMIT: usize = 1500;
pub const CAPTION_LIMIT: usize = 900;

const EDIT_TITLE: &str = "Сообщение изменено";
const DELETE_TITLE: &str = "Сообщение удалено";
const RESCUE_TITLE: &str = "Медиа с таймером сохранено";
const USER_FIELD: &str = "Пользователь: ";

/// Video notes carry no caption; these bodies say nothing the note doesn't.
const NOTE_PLACEHOLDERS: [&str; 3] = ["[video note]", "[content]", "[empty]"];

pub fn log_outcome(outcome: &SendOutcome, chat: ChatId, what: &str) {
    match outcome {
        SendOutcome::Delivered => {}
        SendOutcome::RecipientUnavailable => {
            debug!(chat_id = chat.0, what, "Recipient unavailable")
        }
        SendOutcome::TransientFailure(reason) => {
            warn!(chat_id = chat.0, what, reason = %reason, "Send failed")
        }
    }
}

/// HTML text, optionally with a keyboard.
pub async fn say(
    ctx: &AppContext,
    chat: ChatId,
    html: &str,
    keyboard: Option<&Keyboard>,
) -> SendOutcome {
    let out = ctx.notifier.send_html(chat, html, keyboard).await;
    log_outcome(&out, chat, "text");
    out
}

pub async fn say_rich(
    ctx: &AppContext,
    chat: ChatId,
    text: &RichText,
    keyboard: Option<&Keyboard>,
) -> SendOutcome {
    let out = ctx.notifier.send_rich(chat, text, keyboard).await;
    log_outcome(&out, chat, "rich text");
    out
}

/// `⭐ <title>` line that opens a multi-message view.
pub async fn header(ctx: &AppContext, chat: ChatId, title: &str) -> SendOutcome {
    let text = RichText::new(format!("⭐ {title}")).bold(title);
    say_rich(ctx, chat, &text, None).await
}

/// Not blocked (admin exempt) and has started the bot.
pub async fn can_receive(ctx: &AppContext, recipient: UserId) -> bool {
    !ctx.gate.is_blocked_effective(recipient).await && ctx.gate.is_bot_user(recipient).await
}

fn attribute(text: RichText, label: &str, user: Option<&User>) -> RichText {
    match user {
        Some(u) if u.id != 0 => text.mention_after(USER_FIELD, label, u.id),
        _ => text,
    }
}

fn label_of(user: Option<&User>) -> String {
    user.map(User::label)
        .unwrap_or_else(|| "Пользователь".to_string())
}

pub fn edit_notice(editor: Option<&User>, chat_label: &str, old: &str, new: &str) -> RichText {
    let label = label_of(editor);
    let old = clip_text(old, TEXT_LIMIT);
    let new = clip_text(new, TEXT_LIMIT);
    let text = RichText::new(format!(
        "✏️ {EDIT_TITLE}\n👤 {USER_FIELD}{label}\n💬 {chat_label}\n\n🕓 Было:\n{old}\n\n🆕 Стало:\n{new}"
    ));
    attribute(text, &label, editor)
        .bold(EDIT_TITLE)
        .italic_after("🕓 Было:\n", &old)
}

/// `limit` is the text cap; video notes drop placeholder bodies.
pub fn delete_notice(
    author: Option<&User>,
    chat_label: &str,
    body: &str,
    limit: usize,
    kind: Option<MediaKind>,
) -> RichText {
    let label = label_of(author);
    let mut body = clip_text(body, limit);
    if kind == Some(MediaKind::VideoNote)
        && NOTE_PLACEHOLDERS.contains(&body.to_lowercase().as_str())
    {
        body.clear();
    }
    let chat_line = format!("💬 {chat_label}");
    let mut raw = format!("🗑 {DELETE_TITLE}\n👤 {USER_FIELD}{label}\n{chat_line}");
    if !body.is_empty() {
        raw.push_str("\n\n");
        raw.push_str(&body);
    }
    attribute(RichText::new(raw), &label, author)
        .bold(DELETE_TITLE)
        .italic_after(&chat_line, &body)
}

pub fn rescue_notice(author: Option<&User>, chat_label: &str, note: Option<&str>) -> RichText {
    let label = label_of(author);
    let mut raw = format!("⏳ {RESCUE_TITLE}\n👤 {USER_FIELD}{label}\n💬 {chat_label}");
    if let Some(n) = note.filter(|n| !n.is_empty()) {
        raw.push_str("\n\n");
        raw.push_str(n);
    }
    attribute(RichText::new(raw), &label, author).bold(RESCUE_TITLE)
}

pub async fn notify_edit(
    ctx: &AppContext,
    recipient: UserId,
    editor: Option<&User>,
    chat_label: &str,
    old: &str,
    new: &str,
) -> SendOutcome {
    if !can_receive(ctx, recipient).await {
        return SendOutcome::RecipientUnavailable;
    }
    let text = edit_notice(editor, chat_label, old, new);
    say_rich(ctx, recipient.into(), &text, None).await
}

/// Tombstone for one deleted message, with the cached media when there is one.
///
/// A failed media upload falls back to the text alone.
pub async fn notify_delete(
    ctx: &AppContext,
    recipient: UserId,
    author: Option<&User>,
    chat_label: &str,
    body: &str,
    media: Option<&CachedMedia>,
) -> SendOutcome {
    if !can_receive(ctx, recipient).await {
        return SendOutcome::RecipientUnavailable;
    }
    let chat: ChatId = recipient.into();
    let Some(media) = media else {
        let text = delete_notice(author, chat_label, body, TEXT_LIMIT, None);
        return say_rich(ctx, chat, &text, None).await;
    };

    let caption = delete_notice(author, chat_label, body, CAPTION_LIMIT, Some(media.kind));
    let attached = media.kind.supports_caption().then_some(&caption);
    let out = ctx
        .notifier
        .send_media(chat, media.kind, &media.path, attached)
        .await;
    log_outcome(&out, chat, media.kind.as_str());
    match out {
        SendOutcome::RecipientUnavailable => out,
        SendOutcome::Delivered if attached.is_some() => out,
        _ => say_rich(ctx, chat, &caption, None).await,
    }
}

/// Timer media first, then the header naming who sent it.
pub async fn send_rescue(
    ctx: &AppContext,
    recipient: UserId,
    author: Option<&User>,
    chat_label: &str,
    media: &CachedMedia,
    note: Option<&str>,
) -> SendOutcome {
    if !can_receive(ctx, recipient).await {
        return SendOutcome::RecipientUnavailable;
    }
    let chat: ChatId = recipient.into();
    let out = ctx
        .notifier
        .send_media(chat, media.kind, &media.path, None)
        .await;
    log_outcome(&out, chat, media.kind.as_str());
    if out == SendOutcome::RecipientUnavailable {
        return out;
    }
    let header = rescue_notice(author, chat_label, note);
    say_rich(ctx, chat, &header, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatting::{utf16_len, EntityKind};

    fn ann() -> User {
        User {
            id: 7,
            first_name: Some("Ann".into()),
            ..Default::default()
        }
    }

    #[test]
    fn edit_notice_layout_and_entities() {
        let u = ann();
        let rt = edit_notice(Some(&u), "Личный чат", "a", "b");
        assert_eq!(
            rt.text(),
            "✏️ Сообщение изменено\n👤 Пользователь: Ann\n💬 Личный чат\n\n🕓 Было:\na\n\n🆕 Стало:\nb"
        );
        let e = rt.entities();
        assert_eq!(e[0].kind, EntityKind::Mention { user_id: 7 });
        assert_eq!(e[0].offset, utf16_len("✏️ Сообщение изменено\n👤 Пользователь: "));
        assert_eq!(e[1].kind, EntityKind::Bold);
        assert_eq!(e[2].kind, EntityKind::Italic);
        assert_eq!(
            e[2].offset,
            utf16_len("✏️ Сообщение изменено\n👤 Пользователь: Ann\n💬 Личный чат\n\n🕓 Было:\n")
        );
    }

    #[test]
    fn unknown_author_gets_no_mention() {
        let rt = delete_notice(None, "Чат 5", "[сообщение не сохранено]", TEXT_LIMIT, None);
        assert!(rt.text().contains("👤 Пользователь: Пользователь"));
        assert!(rt
            .entities()
            .iter()
            .all(|e| !matches!(e.kind, EntityKind::Mention { .. })));
    }

    #[test]
    fn video_note_placeholder_body_is_dropped() {
        let u = ann();
        let rt = delete_notice(Some(&u), "Личный чат", "[video note]", CAPTION_LIMIT, Some(MediaKind::VideoNote));
        assert!(rt.text().ends_with("💬 Личный чат"));

        let rt = delete_notice(Some(&u), "Личный чат", "[video note]", CAPTION_LIMIT, Some(MediaKind::Photo));
        assert!(rt.text().ends_with("\n\n[video note]"));
    }

    #[test]
    fn caption_is_capped() {
        let body = "x".repeat(2000);
        let rt = delete_notice(None, "c", &body, CAPTION_LIMIT, Some(MediaKind::Photo));
        let tail = rt.text().rsplit("\n\n").next().unwrap_or_default();
        assert_eq!(tail.chars().count(), CAPTION_LIMIT);
    }

    #[test]
    fn rescue_notice_appends_note() {
        let rt = rescue_notice(None, "Личный чат", Some("look"));
        assert!(rt.text().starts_with("⏳ Медиа с таймером сохранено\n"));
        assert!(rt.text().ends_with("\n\nlook"));
        assert_eq!(rescue_notice(None, "c", Some("")).text().matches('\n').count(), 2);
    }
}
