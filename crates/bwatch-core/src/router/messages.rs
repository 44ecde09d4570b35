//! Plain and business messages: gates, ownership, private menu, cache, rescue.

use tracing::{debug, info, warn};

use crate::{
    context::AppContext,
    domain::{ChatId, UserId},
    formatting::RichText,
    router::{
        admin,
        notify::{can_receive, say, say_rich, send_rescue},
        views::{self, MenuCommand},
    },
    store::{PendingInput, UserProfile},
    update::Message,
    Result,
};

pub const EPHEMERAL_TAG: &str = "ephemeral";

const BOUND_NOTICE: &str =
    "✅ Бизнес-аккаунт привязан. Теперь уведомления будут приходить только по вашим бизнес-чатам.";

pub async fn handle(ctx: &AppContext, mut msg: Message, business: bool) -> Result<()> {
    let now = ctx.now();
    let chat = msg.chat_id();

    if business {
        let owner = ctx.ownership.resolve(msg.connection_id().as_ref()).await?;
        if let Some(owner) = owner {
            if !ctx.gate.has_access(owner, now).await {
                debug!(owner = owner.0, chat_id = chat.0, "Owner without access; dropping");
                return Ok(());
            }
        }
        track_business_ownership(ctx, &msg, now).await;
    } else {
        if ctx.gate.is_blocked_effective(UserId(chat.0)).await {
            debug!(chat_id = chat.0, "Blocked chat; dropping");
            return Ok(());
        }
        if msg.chat.is_private() {
            if let Some(from) = &msg.from {
                if let Err(e) = ctx.accounts.touch_user(&UserProfile::from(from), now).await {
                    warn!(user_id = from.id, error = %e, "Failed to touch user");
                }
            }
            if handle_private(ctx, &msg, now).await {
                return Ok(());
            }
            if ctx.owner_id().is_none() && ctx.is_admin(UserId(chat.0)) {
                if let Err(e) = ctx.set_owner_id(UserId(chat.0)).await {
                    warn!(user_id = chat.0, error = %e, "Failed to store owner id");
                }
            }
        }
    }

    if let Err(e) = ctx.vault.store(&mut msg, now).await {
        warn!(chat_id = chat.0, message_id = msg.message_id, error = %e, "Failed to cache message");
    }
    rescue_reply(ctx, &msg, now).await;
    ctx.vault.enforce_limits(chat).await;

    if !business && msg.chat.is_private() && msg.text.as_deref() == Some("/start") {
        let user = msg.sender_id().unwrap_or(UserId(chat.0));
        ctx.log_event(Some(user), "start", Some(chat.0), Some(msg.message_id))
            .await;
        views::start(ctx, UserId(chat.0)).await;
    }
    Ok(())
}

/// Recovery, then explicit binding, then owner-chat tracking.
async fn track_business_ownership(ctx: &AppContext, msg: &Message, now: i64) {
    if let Err(e) = ctx.ownership.recover_from_outgoing(msg, now).await {
        warn!(chat_id = msg.chat.id, error = %e, "Ownership recovery failed");
    }
    match ctx.ownership.bind_if_requested(msg, now).await {
        Ok(Some(owner)) => {
            info!(owner = owner.0, "Business account bound on request");
            if can_receive(ctx, owner).await {
                say(ctx, owner.into(), BOUND_NOTICE, None).await;
            }
        }
        Ok(None) => {}
        Err(e) => warn!(chat_id = msg.chat.id, error = %e, "Business binding failed"),
    }
    if let Err(e) = ctx.ownership.track_chat(msg, now).await {
        warn!(chat_id = msg.chat.id, error = %e, "Failed to track owner chat");
    }
}

/// Menu commands and pending inputs. `true` when the message was consumed.
async fn handle_private(ctx: &AppContext, msg: &Message, now: i64) -> bool {
    let user = UserId(msg.chat.id);
    let chat: ChatId = user.into();
    if let Err(e) = ctx.accounts.mark_bot_user(user, now).await {
        warn!(user_id = user.0, error = %e, "Failed to mark bot user");
    }
    let is_admin = ctx.is_admin(user);

    if let Some(cmd) = msg.text.as_deref().and_then(MenuCommand::parse) {
        if is_admin || !cmd.admin_only() {
            run_menu(ctx, user, cmd).await;
            return true;
        }
    }

    let pending = ctx.accounts.pending_input(user).await.unwrap_or_else(|e| {
        warn!(user_id = user.0, error = %e, "Failed to read pending input");
        None
    });
    match pending {
        Some(PendingInput::PriceEdit) if is_admin => {
            admin::apply_price_edit(ctx, user, msg.text.as_deref().unwrap_or_default()).await;
            true
        }
        Some(PendingInput::Broadcast) if is_admin => {
            clear_pending(ctx, user, now).await;
            admin::broadcast(ctx, user, msg.id()).await;
            true
        }
        Some(PendingInput::Support) => {
            clear_pending(ctx, user, now).await;
            forward_to_support(ctx, msg).await;
            say(ctx, chat, "✅ Спасибо! Сообщение отправлено в поддержку.", None).await;
            true
        }
        _ => false,
    }
}

async fn run_menu(ctx: &AppContext, user: UserId, cmd: MenuCommand) {
    let chat: ChatId = user.into();
    let now = ctx.now();
    match cmd {
        MenuCommand::Status => views::status(ctx, user).await,
        MenuCommand::Privacy => views::privacy(ctx, chat).await,
        MenuCommand::Support => {
            set_pending(ctx, user, PendingInput::Support, now).await;
            views::support_prompt(ctx, chat).await;
        }
        MenuCommand::Connect => views::connect_business(ctx, user).await,
        MenuCommand::Admin => admin::panel(ctx, user, 1).await,
        MenuCommand::Blacklist => admin::blacklist(ctx, user).await,
        MenuCommand::Broadcast => {
            set_pending(ctx, user, PendingInput::Broadcast, now).await;
            views::broadcast_prompt(ctx, chat).await;
        }
        MenuCommand::Cancel => {
            clear_pending(ctx, user, now).await;
            say(ctx, chat, "Отменено.", None).await;
        }
    }
}

async fn set_pending(ctx: &AppContext, user: UserId, pending: PendingInput, now: i64) {
    if let Err(e) = ctx
        .accounts
        .set_pending_input(user, Some(pending), now)
        .await
    {
        warn!(user_id = user.0, pending = pending.as_str(), error = %e, "Failed to set pending input");
    }
}

async fn clear_pending(ctx: &AppContext, user: UserId, now: i64) {
    if let Err(e) = ctx.accounts.set_pending_input(user, None, now).await {
        warn!(user_id = user.0, error = %e, "Failed to clear pending input");
    }
}

async fn forward_to_support(ctx: &AppContext, msg: &Message) {
    let Some(support) = ctx.cfg.support_chat_id else {
        warn!(chat_id = msg.chat.id, "SUPPORT_CHAT_ID is not set; support message dropped");
        return;
    };
    let uid = msg.sender_id().map(|u| u.0).unwrap_or(msg.chat.id);
    let who = msg
        .from
        .as_ref()
        .map(admin::who)
        .unwrap_or_else(|| format!("Пользователь {uid}"));
    let text = RichText::new(format!(
        "🆘 Обращение в поддержку\n👤 {who} (id {uid})\n\n{}",
        msg.display_text()
    ))
    .mention_after("👤 ", &who, uid);
    let out = say_rich(ctx, support, &text, None).await;
    if !out.is_delivered() {
        warn!(user_id = uid, "Support message was not delivered");
    }
}

/// Replying to timer media is the only moment the bot sees it; save it and
/// hand it to the owner once.
async fn rescue_reply(ctx: &AppContext, msg: &Message, now: i64) {
    let Some(reply) = msg.reply_to_message.as_deref() else {
        return;
    };
    let mut reply = reply.clone();
    let recipient = rescue_recipient(ctx, msg, now).await;
    let cache = ctx.vault.cache();
    let already_rescued = match recipient {
        Some(r) => match cache.forwarded_exists(r, reply.id(), EPHEMERAL_TAG).await {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "Failed to read rescue tag");
                true
            }
        },
        None => false,
    };

    // Rescued media is released after delivery; never fetch it a second time.
    let stored = if already_rescued {
        ctx.vault.store_snapshot(&reply, now).await
    } else {
        ctx.vault.store(&mut reply, now).await
    };
    if let Err(e) = stored {
        warn!(chat_id = reply.chat.id, message_id = reply.message_id, error = %e, "Failed to cache replied message");
    }

    let Some(recipient) = recipient else {
        return;
    };
    if already_rescued {
        return;
    }
    let chat = reply.chat_id();
    let media = match ctx.vault.media(chat, reply.id()).await {
        Ok(Some(m)) if m.kind.may_self_destruct() => m,
        Ok(_) => return,
        Err(e) => {
            warn!(chat_id = chat.0, error = %e, "Failed to load replied media");
            return;
        }
    };

    if let Err(e) = cache
        .set_forwarded(recipient, reply.id(), EPHEMERAL_TAG, now)
        .await
    {
        warn!(error = %e, "Failed to set rescue tag");
        return;
    }

    info!(
        recipient = recipient.0,
        chat_id = chat.0,
        message_id = reply.message_id,
        kind = media.kind.as_str(),
        "Forwarding timer media"
    );
    let author = reply.from.as_ref().or(msg.from.as_ref());
    let note = reply.caption.as_deref();
    let out = send_rescue(ctx, recipient, author, &reply.chat.label(), &media, note).await;
    if !out.is_delivered() {
        debug!(recipient = recipient.0, "Timer media not delivered");
    }

    if let Err(e) = ctx.vault.release_media(chat, reply.id()).await {
        warn!(chat_id = chat.0, error = %e, "Failed to release rescued media");
    }
}

/// The business owner when subscribed, else the chat itself if it started the bot.
async fn rescue_recipient(ctx: &AppContext, msg: &Message, now: i64) -> Option<UserId> {
    let owner = match ctx.ownership.resolve(msg.connection_id().as_ref()).await {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "Failed to resolve rescue owner");
            None
        }
    };
    if let Some(owner) = owner {
        if ctx.gate.has_access(owner, now).await {
            return Some(owner);
        }
    }
    let chat_user = UserId(msg.chat.id);
    ctx.gate.is_bot_user(chat_user).await.then_some(chat_user)
}
