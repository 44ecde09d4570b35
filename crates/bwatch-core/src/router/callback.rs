//! Inline-button callbacks.

use tracing::{debug, warn};

use crate::{
    access::Plan,
    context::AppContext,
    domain::{ChatId, UserId},
    messaging::types::SendOutcome,
    router::{
        admin,
        notify::{log_outcome, say},
        views,
    },
    store::{PendingInput, UserProfile},
    update::CallbackQuery,
    Result,
};

/// Callback id used for internal refreshes; never answered.
pub const SENTINEL_ID: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Noop,
    OpenSub,
    Buy(String),
    Status,
    Privacy,
    Help,
    Support,
    SupportCancel,
    Admin(AdminAction),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminAction {
    Panel(u64),
    PaidToggle,
    FreeList,
    Prices,
    PricesEdit,
    CacheClear,
    CacheClearYes,
    CacheClearNo,
    Blacklist,
    UserCard(UserId),
    FreeAdd(UserId),
    FreeDel(UserId),
    Block(UserId),
    Unblock(UserId),
}

impl Action {
    pub fn parse(data: &str) -> Option<Self> {
        let simple = match data {
            "noop" => Some(Action::Noop),
            "open_sub" => Some(Action::OpenSub),
            "status" => Some(Action::Status),
            "privacy" => Some(Action::Privacy),
            "help" => Some(Action::Help),
            "support" => Some(Action::Support),
            "support_cancel" => Some(Action::SupportCancel),
            "admin" => Some(Action::Admin(AdminAction::Panel(1))),
            "admin_paid_toggle" => Some(Action::Admin(AdminAction::PaidToggle)),
            "admin_free_list" => Some(Action::Admin(AdminAction::FreeList)),
            "admin_prices" => Some(Action::Admin(AdminAction::Prices)),
            "admin_prices_edit" => Some(Action::Admin(AdminAction::PricesEdit)),
            "admin_cache_clear" => Some(Action::Admin(AdminAction::CacheClear)),
            "admin_cache_clear_yes" => Some(Action::Admin(AdminAction::CacheClearYes)),
            "admin_cache_clear_no" => Some(Action::Admin(AdminAction::CacheClearNo)),
            "admin_blacklist" => Some(Action::Admin(AdminAction::Blacklist)),
            _ => None,
        };
        if simple.is_some() {
            return simple;
        }

        let (prefix, arg) = data.split_once(':')?;
        if prefix == "buy" {
            return Some(Action::Buy(arg.to_string()));
        }
        if prefix == "admin_page" {
            return Some(Action::Admin(AdminAction::Panel(arg.parse().unwrap_or(1))));
        }
        let user = UserId(arg.parse::<i64>().ok()?);
        let action = match prefix {
            "admin_u" => AdminAction::UserCard(user),
            "admin_free_add" => AdminAction::FreeAdd(user),
            "admin_free_del" => AdminAction::FreeDel(user),
            "admin_block" => AdminAction::Block(user),
            "admin_unblock" => AdminAction::Unblock(user),
            _ => return None,
        };
        Some(Action::Admin(action))
    }
}

pub async fn handle(ctx: &AppContext, q: &CallbackQuery) -> Result<()> {
    let user = q.from.user_id();
    if ctx.gate.is_blocked_effective(user).await {
        let out = ctx
            .notifier
            .answer_callback(&q.id, Some("🚫 Вы заблокированы"), true)
            .await;
        log_outcome(&out, user.into(), "callback answer");
        return Ok(());
    }

    let now = ctx.now();
    if let Err(e) = ctx.accounts.touch_user(&UserProfile::from(&q.from), now).await {
        warn!(user_id = user.0, error = %e, "Failed to touch user");
    }
    if let Err(e) = ctx.accounts.mark_bot_user(user, now).await {
        warn!(user_id = user.0, error = %e, "Failed to mark bot user");
    }

    if !q.id.is_empty() && q.id != SENTINEL_ID {
        let out = ctx.notifier.answer_callback(&q.id, None, false).await;
        log_outcome(&out, user.into(), "callback answer");
    }

    let data = q.data.as_deref().unwrap_or_default();
    let Some(action) = Action::parse(data) else {
        debug!(user_id = user.0, data, "Unknown callback data");
        return Ok(());
    };
    route(ctx, user, action).await;
    Ok(())
}

pub async fn route(ctx: &AppContext, user: UserId, action: Action) {
    let chat: ChatId = user.into();
    match action {
        Action::Noop => {}
        Action::OpenSub => views::subscription(ctx, user).await,
        Action::Buy(plan) => buy(ctx, user, &plan).await,
        Action::Status => views::status(ctx, user).await,
        Action::Privacy => views::privacy(ctx, chat).await,
        Action::Help => views::help(ctx, chat).await,
        Action::Support => {
            set_pending(ctx, user, Some(PendingInput::Support)).await;
            views::support_prompt(ctx, chat).await;
        }
        Action::SupportCancel => {
            set_pending(ctx, user, None).await;
            say(ctx, chat, "Отменено.", None).await;
        }
        Action::Admin(a) if ctx.is_admin(user) => route_admin(ctx, user, a).await,
        Action::Admin(a) => debug!(user_id = user.0, action = ?a, "Admin callback from non-admin"),
    }
}

async fn route_admin(ctx: &AppContext, admin_id: UserId, action: AdminAction) {
    match action {
        AdminAction::Panel(page) => admin::panel(ctx, admin_id, page).await,
        AdminAction::PaidToggle => admin::toggle_paid_mode(ctx, admin_id).await,
        AdminAction::FreeList => admin::free_list(ctx, admin_id).await,
        AdminAction::Prices => admin::prices(ctx, admin_id).await,
        AdminAction::PricesEdit => admin::prices_edit_prompt(ctx, admin_id).await,
        AdminAction::CacheClear => admin::cache_clear_confirm(ctx, admin_id).await,
        AdminAction::CacheClearYes => admin::cache_clear(ctx, admin_id).await,
        AdminAction::CacheClearNo => {
            say(ctx, admin_id.into(), "Отменено.", None).await;
        }
        AdminAction::Blacklist => admin::blacklist(ctx, admin_id).await,
        AdminAction::UserCard(u) => admin::user_card(ctx, admin_id, u).await,
        AdminAction::FreeAdd(u) => admin::set_free(ctx, admin_id, u, true).await,
        AdminAction::FreeDel(u) => admin::set_free(ctx, admin_id, u, false).await,
        AdminAction::Block(u) => admin::set_blocked(ctx, admin_id, u, true).await,
        AdminAction::Unblock(u) => admin::set_blocked(ctx, admin_id, u, false).await,
    }
}

async fn set_pending(ctx: &AppContext, user: UserId, pending: Option<PendingInput>) {
    if let Err(e) = ctx
        .accounts
        .set_pending_input(user, pending, ctx.now())
        .await
    {
        warn!(user_id = user.0, error = %e, "Failed to update pending input");
    }
}

async fn buy(ctx: &AppContext, user: UserId, plan: &str) {
    let chat: ChatId = user.into();
    let invoice = match Plan::parse(plan) {
        Some(p) => ctx.gate.invoice(p, user).await,
        None => None,
    };
    let Some(invoice) = invoice else {
        say(ctx, chat, "❌ Неизвестный тариф", None).await;
        return;
    };
    match ctx.notifier.send_invoice(chat, &invoice).await {
        SendOutcome::Delivered => {}
        SendOutcome::RecipientUnavailable => debug!(user_id = user.0, "Invoice recipient unavailable"),
        SendOutcome::TransientFailure(reason) => {
            warn!(user_id = user.0, reason = %reason, "Failed to send invoice");
            say(ctx, chat, "❌ Не удалось создать счёт. Попробуйте позже.", None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_and_prefixed_actions() {
        assert_eq!(Action::parse("noop"), Some(Action::Noop));
        assert_eq!(Action::parse("buy:7d"), Some(Action::Buy("7d".into())));
        assert_eq!(
            Action::parse("admin_page:3"),
            Some(Action::Admin(AdminAction::Panel(3)))
        );
        assert_eq!(
            Action::parse("admin_page:x"),
            Some(Action::Admin(AdminAction::Panel(1)))
        );
        assert_eq!(
            Action::parse("admin_block:42"),
            Some(Action::Admin(AdminAction::Block(UserId(42))))
        );
        assert_eq!(Action::parse("admin_u:abc"), None);
        assert_eq!(Action::parse("askuser:1:2"), None);
        assert_eq!(Action::parse(""), None);
    }
}
