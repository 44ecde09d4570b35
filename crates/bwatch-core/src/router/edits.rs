//! Edit notifications (business edits and the private-chat fallback).

use tracing::{debug, info, warn};

use crate::{
    context::AppContext,
    dedup::NotifyKey,
    domain::UserId,
    router::notify::notify_edit,
    update::Message,
    Result,
};

pub const OLD_NOT_SAVED: &str = "[старое сообщение не сохранено — бот был подключён позже]";

/// Text of the cached snapshot, or the placeholder when there is none.
async fn old_text(ctx: &AppContext, msg: &Message) -> String {
    let snapshot = match ctx.vault.cache().get_message(msg.chat_id(), msg.id()).await {
        Ok(s) => s,
        Err(e) => {
            warn!(chat_id = msg.chat.id, message_id = msg.message_id, error = %e, "Failed to load snapshot");
            None
        }
    };
    snapshot
        .as_ref()
        .and_then(Message::from_snapshot)
        .map(|m| m.display_text())
        .unwrap_or_else(|| OLD_NOT_SAVED.to_string())
}

async fn refresh(ctx: &AppContext, msg: &mut Message) -> Result<()> {
    ctx.vault.store(msg, ctx.now()).await?;
    ctx.vault.enforce_limits(msg.chat_id()).await;
    Ok(())
}

pub async fn business(ctx: &AppContext, mut msg: Message) -> Result<()> {
    let now = ctx.now();
    let Some(owner) = ctx.ownership.resolve(msg.connection_id().as_ref()).await? else {
        return refresh(ctx, &mut msg).await;
    };
    if !ctx.gate.has_access(owner, now).await {
        debug!(owner = owner.0, "Owner without access; dropping edit");
        return Ok(());
    }

    let old = old_text(ctx, &msg).await;
    let new = msg.display_text();
    let editor = msg.sender_id();
    info!(
        owner = owner.0,
        editor = editor.map(|e| e.0),
        chat_id = msg.chat.id,
        message_id = msg.message_id,
        changed = old != new,
        "Business edit"
    );

    let editor_blocked = match editor {
        Some(e) => ctx.gate.is_blocked_effective(e).await,
        None => false,
    };
    if old != new && !editor_blocked {
        if editor.is_some() {
            ctx.log_event(editor, "edited_message", Some(msg.chat.id), Some(msg.message_id))
                .await;
        }
        let chat_label = msg.chat.label();
        let edit_date = msg.edit_date.unwrap_or(0);
        for recipient in ctx.ownership.recipients(owner, msg.chat_id()).await {
            if Some(recipient) == editor {
                continue;
            }
            let key = NotifyKey::Edit {
                recipient,
                message_id: msg.id(),
                edit_date,
            };
            if !ctx.should_notify(key) {
                debug!(recipient = recipient.0, "Duplicate edit notification suppressed");
                continue;
            }
            notify_edit(ctx, recipient, msg.from.as_ref(), &chat_label, &old, &new).await;
        }
    }

    refresh(ctx, &mut msg).await
}

/// Edits in the user's own private chat with the bot go back to that user only.
pub async fn plain(ctx: &AppContext, mut msg: Message) -> Result<()> {
    if !msg.chat.is_private() {
        return refresh(ctx, &mut msg).await;
    }
    let old = old_text(ctx, &msg).await;
    let new = msg.display_text();
    let user = UserId(msg.chat.id);
    if old != new && ctx.gate.is_bot_user(user).await {
        notify_edit(ctx, user, msg.from.as_ref(), &msg.chat.label(), &old, &new).await;
    }
    refresh(ctx, &mut msg).await
}
