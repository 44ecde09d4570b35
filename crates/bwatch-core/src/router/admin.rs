//! Administrator panel, moderation, prices, broadcast and cache purge.

use std::time::Duration;

use tracing::{info, warn};

use crate::{
    access::{parse_price_edit, Plan},
    context::AppContext,
    domain::{ChatId, MessageId, UserId},
    formatting::RichText,
    messaging::types::{InlineButton, Keyboard},
    router::notify::{say, say_rich},
    store::{PendingInput, UserRecord},
    update::User,
};

pub const USERS_PER_PAGE: u64 = 10;
const BLACKLIST_LIMIT: usize = 25;
const FREE_LIST_LIMIT: usize = 50;
const ACTION_STATS_LIMIT: usize = 8;

pub const PRICE_FORMAT_HINT: &str = "❌ Не понял формат. Пример: 7=15 14=25 30=45";

fn back_row() -> Vec<InlineButton> {
    vec![InlineButton::new("⬅️ Назад", "admin")]
}

/// Clamp a requested page into `1..=total_pages`.
pub fn clamp_page(requested: u64, total_users: u64) -> (u64, u64) {
    let total_pages = total_users.div_ceil(USERS_PER_PAGE).max(1);
    (requested.clamp(1, total_pages), total_pages)
}

fn user_row(text: RichText, u: &UserRecord, blocked_mark: bool) -> RichText {
    let who = u.display();
    let mut line = format!("\n- {} — {who}", u.user_id);
    if blocked_mark && u.blocked {
        line.push_str(" — 🚫 блок");
    }
    text.append(&line).mention_last(&who, u.user_id)
}

pub async fn panel(ctx: &AppContext, admin: UserId, page: u64) {
    let total = ctx.accounts.count_users().await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to count users");
        0
    });
    let (page, total_pages) = clamp_page(page, total);
    let offset = usize::try_from((page - 1) * USERS_PER_PAGE).unwrap_or(0);
    let users = ctx
        .accounts
        .list_users(USERS_PER_PAGE as usize, offset)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list users");
            Vec::new()
        });

    let mut text = RichText::new(format!(
        "👑 Админка\n\nПользователей: {total}\nСтраница: {page}/{total_pages}\n\nПользователи:"
    ));
    if users.is_empty() {
        text = text.append("\n- пока нет пользователей");
    }
    for u in &users {
        text = user_row(text, u, true);
    }

    match ctx.accounts.action_counts(ACTION_STATS_LIMIT).await {
        Ok(stats) if !stats.is_empty() => {
            text = text.append("\n\nДействия:");
            for (action, n) in stats {
                text = text.append(&format!("\n- {action}: {n}"));
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to read action stats"),
    }

    let paid = ctx.gate.paid_mode().await;
    let mut rows = vec![
        vec![
            InlineButton::new(
                if paid {
                    "💰 Платный режим: ВКЛ"
                } else {
                    "💸 Платный режим: ВЫКЛ"
                },
                "admin_paid_toggle",
            ),
            InlineButton::new("🎁 Бесплатные", "admin_free_list"),
        ],
        vec![InlineButton::new("⭐ Цены", "admin_prices")],
    ];
    let mut nav = Vec::new();
    if page > 1 {
        nav.push(InlineButton::new("⬅️", format!("admin_page:{}", page - 1)));
    }
    nav.push(InlineButton::new(format!("{page}/{total_pages}"), "noop"));
    if page < total_pages {
        nav.push(InlineButton::new("➡️", format!("admin_page:{}", page + 1)));
    }
    rows.push(nav);
    for u in &users {
        rows.push(vec![InlineButton::new(
            format!("⚙️ {}", u.user_id),
            format!("admin_u:{}", u.user_id),
        )]);
    }
    rows.push(vec![InlineButton::new("🚫 Черный список", "admin_blacklist")]);
    rows.push(vec![InlineButton::new("🧹 Очистить кэш", "admin_cache_clear")]);

    say_rich(ctx, admin.into(), &text, Some(&Keyboard::Inline(rows))).await;
}

pub async fn toggle_paid_mode(ctx: &AppContext, admin: UserId) {
    let enabled = !ctx.gate.paid_mode().await;
    if let Err(e) = ctx.gate.set_paid_mode(enabled).await {
        warn!(error = %e, "Failed to toggle paid mode");
        say(ctx, admin.into(), "❌ Не удалось сохранить настройку.", None).await;
        return;
    }
    info!(enabled, "Paid mode changed");
    let state = if enabled { "ВКЛ" } else { "ВЫКЛ" };
    say(ctx, admin.into(), &format!("✅ Платный режим теперь: {state}"), None).await;
    panel(ctx, admin, 1).await;
}

pub async fn free_list(ctx: &AppContext, admin: UserId) {
    let ids = ctx
        .accounts
        .list_free_users(FREE_LIST_LIMIT)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list free users");
            Vec::new()
        });
    let mut lines = vec!["🎁 Бесплатные пользователи".to_string(), String::new()];
    if ids.is_empty() {
        lines.push("- список пуст".to_string());
    }
    lines.extend(ids.iter().map(|id| format!("- {}", id.0)));
    let kb = Keyboard::Inline(vec![back_row()]);
    say(ctx, admin.into(), &lines.join("\n"), Some(&kb)).await;
}

pub async fn prices(ctx: &AppContext, admin: UserId) {
    let mut lines = vec!["⭐ Цены Stars".to_string(), String::new()];
    for plan in Plan::ALL {
        lines.push(format!("{} дней: {}⭐", plan.days(), ctx.gate.price(plan).await));
    }
    lines.push(String::new());
    lines.push("Нажми ✏️ Изменить, затем отправь одним сообщением: 7=15 14=25 30=45".to_string());
    let kb = Keyboard::Inline(vec![
        vec![InlineButton::new("✏️ Изменить", "admin_prices_edit")],
        back_row(),
    ]);
    say(ctx, admin.into(), &lines.join("\n"), Some(&kb)).await;
}

pub async fn prices_edit_prompt(ctx: &AppContext, admin: UserId) {
    if let Err(e) = ctx
        .accounts
        .set_pending_input(admin, Some(PendingInput::PriceEdit), ctx.now())
        .await
    {
        warn!(error = %e, "Failed to arm price edit");
    }
    say(ctx, admin.into(), "✏️ Отправь новые цены: 7=15 14=25 30=45", None).await;
}

/// Consume a pending price edit. Unparsable input keeps the request armed.
pub async fn apply_price_edit(ctx: &AppContext, admin: UserId, text: &str) {
    let parsed = parse_price_edit(text);
    if parsed.is_empty() {
        say(ctx, admin.into(), PRICE_FORMAT_HINT, None).await;
        return;
    }
    match ctx.gate.set_prices(&parsed).await {
        Ok(saved) => info!(saved, "Prices updated"),
        Err(e) => {
            warn!(error = %e, "Failed to save prices");
            say(ctx, admin.into(), "❌ Не удалось сохранить цены.", None).await;
            return;
        }
    }
    if let Err(e) = ctx.accounts.set_pending_input(admin, None, ctx.now()).await {
        warn!(error = %e, "Failed to clear price edit");
    }
    say(ctx, admin.into(), "✅ Цены обновлены", None).await;
}

pub async fn cache_clear_confirm(ctx: &AppContext, admin: UserId) {
    let kb = Keyboard::Inline(vec![
        vec![
            InlineButton::new("✅ Да, очистить", "admin_cache_clear_yes"),
            InlineButton::new("❌ Нет", "admin_cache_clear_no"),
        ],
        back_row(),
    ]);
    let text = "🧹 Очистка кэша\n\nУдалить кэш сообщений/медиа и файлы из папки media?";
    say(ctx, admin.into(), text, Some(&kb)).await;
}

pub async fn cache_clear(ctx: &AppContext, admin: UserId) {
    let text = match ctx.vault.purge().await {
        Ok(r) => format!(
            "✅ Кэш очищен.\n\nmessages: {}\nmedia rows: {}\nforwarded: {}\nfiles deleted: {}",
            r.messages, r.media, r.forwarded, r.files
        ),
        Err(e) => {
            warn!(error = %e, "Cache purge failed");
            "❌ Не удалось очистить кэш.".to_string()
        }
    };
    say(ctx, admin.into(), &text, None).await;
}

pub async fn blacklist(ctx: &AppContext, admin: UserId) {
    let users = ctx
        .accounts
        .list_blocked_users(BLACKLIST_LIMIT)
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list blocked users");
            Vec::new()
        });
    let mut text = RichText::new("🚫 Черный список\n\nЗаблокированные пользователи:");
    let mut rows = Vec::new();
    if users.is_empty() {
        text = text.append("\n- список пуст");
    }
    for u in &users {
        text = user_row(text, u, false);
        rows.push(vec![InlineButton::new(
            format!("✅ Разблокировать {}", u.user_id),
            format!("admin_unblock:{}", u.user_id),
        )]);
    }
    rows.push(back_row());
    say_rich(ctx, admin.into(), &text, Some(&Keyboard::Inline(rows))).await;
}

pub async fn user_card(ctx: &AppContext, admin: UserId, user: UserId) {
    let blocked = ctx.gate.is_blocked(user).await;
    let free = ctx.gate.is_free(user).await;
    let block_btn = if blocked {
        InlineButton::new("✅ Разблокировать", format!("admin_unblock:{}", user.0))
    } else {
        InlineButton::new("🚫 Заблокировать", format!("admin_block:{}", user.0))
    };
    let free_btn = if free {
        InlineButton::new("💰 Убрать бесплатный", format!("admin_free_del:{}", user.0))
    } else {
        InlineButton::new("🎁 Сделать бесплатным", format!("admin_free_add:{}", user.0))
    };
    let kb = Keyboard::Inline(vec![
        vec![block_btn],
        vec![free_btn],
        back_row(),
        vec![InlineButton::new("🚫 Черный список", "admin_blacklist")],
    ]);
    say(ctx, admin.into(), &format!("Пользователь: {}", user.0), Some(&kb)).await;
}

pub async fn set_free(ctx: &AppContext, admin: UserId, user: UserId, free: bool) {
    if let Err(e) = ctx.accounts.set_free_user(user, free, ctx.now()).await {
        warn!(user_id = user.0, error = %e, "Failed to update free list");
        return;
    }
    let text = if free {
        format!("🎁 Пользователь {} теперь бесплатный", user.0)
    } else {
        format!("💰 Пользователь {} убран из бесплатных", user.0)
    };
    say(ctx, admin.into(), &text, None).await;
    user_card(ctx, admin, user).await;
}

pub async fn set_blocked(ctx: &AppContext, admin: UserId, user: UserId, blocked: bool) {
    if let Err(e) = ctx.accounts.set_blocked(user, blocked, ctx.now()).await {
        warn!(user_id = user.0, error = %e, "Failed to update blocked flag");
        return;
    }
    info!(user_id = user.0, blocked, "Blocked flag changed");
    let text = if blocked {
        format!("🚫 Пользователь {} заблокирован", user.0)
    } else {
        format!("✅ Пользователь {} разблокирован", user.0)
    };
    say(ctx, admin.into(), &text, None).await;
}

/// Copy the admin's message to every unblocked bot user except the admin.
pub async fn broadcast(ctx: &AppContext, admin: UserId, message_id: MessageId) {
    let recipients = ctx.accounts.list_bot_user_ids().await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to list broadcast recipients");
        Vec::new()
    });
    let from: ChatId = admin.into();
    let (mut ok, mut fail) = (0u64, 0u64);
    for uid in recipients.into_iter().filter(|u| *u != admin) {
        if ctx
            .notifier
            .copy_message(uid.into(), from, message_id)
            .await
            .is_delivered()
        {
            ok += 1;
        } else {
            fail += 1;
        }
        if ctx.cfg.broadcast_delay > Duration::ZERO {
            tokio::time::sleep(ctx.cfg.broadcast_delay).await;
        }
    }
    info!(ok, fail, "Broadcast finished");
    let text = format!("✅ Рассылка завершена. Успешно: {ok}, ошибок: {fail}.");
    say(ctx, from, &text, None).await;
}

/// `@username`, the name, or `Пользователь <id>`.
pub fn who(user: &User) -> String {
    match (&user.username, user.full_name()) {
        (Some(u), _) if !u.is_empty() => format!("@{u}"),
        (_, Some(name)) => name,
        _ => format!("Пользователь {}", user.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_is_clamped() {
        assert_eq!(clamp_page(1, 0), (1, 1));
        assert_eq!(clamp_page(0, 25), (1, 3));
        assert_eq!(clamp_page(9, 25), (3, 3));
        assert_eq!(clamp_page(2, 20), (2, 2));
    }

    #[test]
    fn who_falls_back_to_id() {
        let u = User {
            id: 4,
            ..Default::default()
        };
        assert_eq!(who(&u), "Пользователь 4");
    }
}
