//! Tombstones for deleted business messages.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::{
    context::AppContext,
    dedup::NotifyKey,
    domain::{ChatId, MessageId, UserId},
    router::notify::notify_delete,
    update::{DeletedBusinessMessages, Message},
    vault::remove_file_quiet,
    Result,
};

pub const NOT_SAVED: &str = "[сообщение не сохранено]";

pub async fn handle(ctx: &AppContext, del: &DeletedBusinessMessages) -> Result<()> {
    let Some(owner) = ctx.ownership.resolve(del.connection_id().as_ref()).await? else {
        debug!(chat_id = del.chat.id, "Delete without a mapped owner; dropping");
        return Ok(());
    };
    if !ctx.gate.has_access(owner, ctx.now()).await {
        debug!(owner = owner.0, "Owner without access; dropping delete");
        return Ok(());
    }
    if del.message_ids.is_empty() {
        return Ok(());
    }

    let recipients = ctx.ownership.recipients(owner, del.chat.chat_id()).await;
    for mid in &del.message_ids {
        if let Err(e) = tombstone(ctx, del, MessageId(*mid), &recipients).await {
            warn!(chat_id = del.chat.id, message_id = mid, error = %e, "Failed to handle deleted message");
        }
    }
    Ok(())
}

/// Rows go first; the file goes after every recipient had its chance.
async fn tombstone(
    ctx: &AppContext,
    del: &DeletedBusinessMessages,
    mid: MessageId,
    recipients: &BTreeSet<UserId>,
) -> Result<()> {
    let chat: ChatId = del.chat.chat_id();
    let cache = ctx.vault.cache();
    let snapshot = cache
        .get_message(chat, mid)
        .await?
        .as_ref()
        .and_then(Message::from_snapshot);
    let media = ctx.vault.media(chat, mid).await?;

    let body = snapshot
        .as_ref()
        .map(Message::display_text)
        .unwrap_or_else(|| NOT_SAVED.to_string());
    let author = snapshot.as_ref().and_then(|m| m.from.as_ref());
    let author_id = author.map(|u| u.user_id());
    let chat_label = snapshot
        .as_ref()
        .map(|m| m.chat.label())
        .unwrap_or_else(|| del.chat.label());

    let author_blocked = match author_id {
        Some(a) => ctx.gate.is_blocked_effective(a).await,
        None => false,
    };
    if author_id.is_some() && !author_blocked {
        ctx.log_event(author_id, "deleted_message", Some(chat.0), Some(mid.0))
            .await;
    }

    if let Err(e) = cache.delete_message(chat, mid).await {
        warn!(chat_id = chat.0, message_id = mid.0, error = %e, "Failed to drop cached message");
    }
    if media.is_some() {
        if let Err(e) = cache.delete_media(chat, mid).await {
            warn!(chat_id = chat.0, message_id = mid.0, error = %e, "Failed to drop cached media row");
        }
    }

    if !author_blocked {
        for recipient in recipients {
            if Some(*recipient) == author_id {
                continue;
            }
            let key = NotifyKey::Delete {
                recipient: *recipient,
                message_id: mid,
            };
            if !ctx.should_notify(key) {
                debug!(recipient = recipient.0, message_id = mid.0, "Duplicate delete notification suppressed");
                continue;
            }
            notify_delete(ctx, *recipient, author, &chat_label, &body, media.as_ref()).await;
        }
    }

    if let Some(m) = &media {
        remove_file_quiet(&m.path).await;
    }
    Ok(())
}
