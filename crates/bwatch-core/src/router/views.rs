//! User-facing screens: menu, status, privacy, help, subscription, welcome.

use tracing::warn;

use crate::{
    access::Plan,
    context::AppContext,
    domain::{ChatId, UserId},
    formatting::escape_html,
    messaging::types::{InlineButton, Keyboard},
    router::notify::{header, say},
    store::PendingInput,
    utils::fmt_dt,
};

pub const BTN_STATUS: &str = "📊 Статус";
pub const BTN_PRIVACY: &str = "🔒 Конфиденциальность";
pub const BTN_SUPPORT: &str = "🆘 Техподдержка";
pub const BTN_CONNECT: &str = "🔗 Подключить бизнес";
pub const BTN_ADMIN: &str = "👑 Админка";
pub const BTN_BLACKLIST: &str = "🚫 Черный список";
pub const BTN_BROADCAST: &str = "📣 Рассылка";
pub const BTN_CANCEL: &str = "❌ Отмена";

/// Reply-keyboard vocabulary understood in private chats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuCommand {
    Status,
    Privacy,
    Support,
    Connect,
    Admin,
    Blacklist,
    Broadcast,
    Cancel,
}

impl MenuCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            BTN_STATUS => Some(Self::Status),
            BTN_PRIVACY => Some(Self::Privacy),
            BTN_SUPPORT => Some(Self::Support),
            BTN_CONNECT => Some(Self::Connect),
            BTN_ADMIN => Some(Self::Admin),
            BTN_BLACKLIST => Some(Self::Blacklist),
            BTN_BROADCAST => Some(Self::Broadcast),
            BTN_CANCEL => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn admin_only(self) -> bool {
        matches!(self, Self::Admin | Self::Blacklist | Self::Broadcast)
    }
}

pub fn main_menu(is_admin: bool) -> Keyboard {
    let row = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    if is_admin {
        Keyboard::Reply(vec![
            row(&[BTN_ADMIN, BTN_BLACKLIST]),
            row(&[BTN_BROADCAST, BTN_CANCEL]),
            row(&[BTN_STATUS, BTN_CONNECT]),
        ])
    } else {
        Keyboard::Reply(vec![
            row(&[BTN_STATUS]),
            row(&[BTN_PRIVACY, BTN_SUPPORT]),
            row(&[BTN_CONNECT]),
        ])
    }
}

async fn connections_of(ctx: &AppContext, user: UserId) -> u64 {
    ctx.accounts
        .count_connections_for_owner(user)
        .await
        .unwrap_or_else(|e| {
            warn!(user_id = user.0, error = %e, "Failed to count connections");
            0
        })
}

async fn chats_of(ctx: &AppContext, user: UserId) -> u64 {
    ctx.accounts
        .count_owner_chats(user)
        .await
        .unwrap_or_else(|e| {
            warn!(user_id = user.0, error = %e, "Failed to count owner chats");
            0
        })
}

pub async fn status(ctx: &AppContext, user: UserId) {
    let now = ctx.now();
    let mut lines = vec![
        "📊 Статус".to_string(),
        String::new(),
        format!("• Ваш ID: {}", user.0),
    ];
    let access = if ctx.gate.is_blocked_effective(user).await {
        "🚫 заблокирован"
    } else {
        "✅ открыт"
    };
    lines.push(format!("• Доступ: {access}"));
    if ctx.is_admin(user) {
        lines.push("• Подписка: 👑 админ (бесплатно)".to_string());
    } else {
        let until = ctx.gate.paid_until(user).await;
        if until > now {
            lines.push(format!("• Подписка: ✅ активна до {}", fmt_dt(until)));
        } else {
            lines.push("• Подписка: ❌ нет".to_string());
        }
    }
    lines.push(format!(
        "• Бизнес-подключений (для вашего аккаунта): {}",
        connections_of(ctx, user).await
    ));
    lines.push(format!(
        "• Подключённые бизнес-чаты (для вашего аккаунта): {}",
        chats_of(ctx, user).await
    ));
    if ctx.is_admin(user) {
        let owner = ctx
            .owner_id()
            .map(|o| o.0.to_string())
            .unwrap_or_else(|| "не задан".to_string());
        lines.push(format!("• OWNER_ID (владелец/админ): {owner}"));
    }
    say(ctx, user.into(), &lines.join("\n"), None).await;
}

pub async fn privacy(ctx: &AppContext, chat: ChatId) {
    let text = "🔒 Конфиденциальность и безопасность\n\n\
        Этот бот не передаёт содержимое ваших сообщений сторонним сервисам.\n\n\
        Важно: работа через <b>Telegram для бизнеса</b> доступна только при наличии <b>Telegram Premium</b>.\n\n\
        Бот взаимодействует только с официальным Telegram Bot API, чтобы получать обновления и отправлять уведомления.";
    say(ctx, chat, text, None).await;
}

pub async fn help(ctx: &AppContext, chat: ChatId) {
    let bot = escape_html(ctx.bot_username());
    let text = format!(
        "📌 Инструкция\n\n\
        Важно: для работы бизнес-чатботов нужен <b>Telegram Premium</b> (функция <b>Telegram для бизнеса</b>).\n\n\
        1) Откройте Telegram → <b>Telegram для бизнеса</b>\n\
        2) Перейдите в <b>Чат-боты</b>\n\
        3) Добавьте <code>@{bot}</code>\n\n\
        После этого просто начните переписку (вы можете написать кому-то сами или вам могут написать) — бот начнёт получать бизнес-апдейты."
    );
    say(ctx, chat, &text, None).await;
}

/// Buy buttons for the enabled plans, two per row.
pub async fn plan_buttons(ctx: &AppContext) -> Keyboard {
    let mut buttons = Vec::new();
    for plan in Plan::ALL {
        if let Some(price) = ctx.gate.plan_price(plan).await {
            buttons.push(InlineButton::new(
                format!("{} дней — {price}⭐", plan.days()),
                format!("buy:{}", plan.key()),
            ));
        }
    }
    Keyboard::Inline(buttons.chunks(2).map(<[InlineButton]>::to_vec).collect())
}

pub async fn subscription(ctx: &AppContext, user: UserId) {
    let chat: ChatId = user.into();
    header(ctx, chat, "Подписка").await;
    let until = ctx.gate.paid_until(user).await;
    let (status, hint) = if until > ctx.now() {
        (
            format!("✅ Активна до {}", fmt_dt(until)),
            "Вы можете продлить доступ заранее — срок добавится сверху.",
        )
    } else {
        (
            "❌ Не активна".to_string(),
            "Чтобы подключить бизнес-чаты и получать уведомления — оформите подписку ниже.",
        )
    };
    let text = format!(
        "⭐ Доступ к бизнес-уведомлениям\n\n\
        Статус: {status}\n\n\
        {hint}\n\n\
        🤖 Официальный бот Telegram Premium: <a href=\"https://t.me/PremiumBot\">@PremiumBot</a>\n\
        💡 Выгодно покупать Telegram Premium в официальном боте."
    );
    let kb = plan_buttons(ctx).await;
    say(ctx, chat, &text, Some(&kb)).await;
}

pub async fn support_prompt(ctx: &AppContext, chat: ChatId) {
    let text = "🆘 Техподдержка\n\n\
        Опишите проблему одним сообщением и отправьте сюда. \
        Ваше сообщение будет передано в поддержку.";
    let kb = Keyboard::single("Отмена", "support_cancel");
    say(ctx, chat, text, Some(&kb)).await;
}

pub async fn broadcast_prompt(ctx: &AppContext, chat: ChatId) {
    let text = "📣 Рассылка\n\n\
        Отправь одно сообщение (текст/фото/видео и т.д.). Я разошлю его всем пользователям бота.\n\n\
        Чтобы отменить — нажми ❌ Отмена.";
    say(ctx, chat, text, None).await;
}

pub async fn onboarding(ctx: &AppContext, chat: ChatId) {
    header(ctx, chat, "Подключение Telegram для бизнеса").await;
    let bot = escape_html(ctx.bot_username());
    let text = format!(
        "1) Telegram → Telegram для бизнеса → Чат-боты\n\
        2) Добавьте <code>@{bot}</code>\n\
        3) Напишите кому-то от имени бизнеса (или вам напишут)\n\n\
        После первого сообщения бот привяжет бизнес-аккаунт."
    );
    say(ctx, chat, &text, None).await;
}

/// "Connect business" menu item: arms the explicit binding.
pub async fn connect_business(ctx: &AppContext, user: UserId) {
    let chat: ChatId = user.into();
    if !ctx.gate.has_access(user, ctx.now()).await {
        subscription(ctx, user).await;
        return;
    }
    let connections = connections_of(ctx, user).await;
    if connections > 0 {
        let chats = chats_of(ctx, user).await;
        let text = format!("✅ Уже подключено. Подключений: {connections}. Чатов: {chats}.");
        say(ctx, chat, &text, None).await;
        return;
    }
    if let Err(e) = ctx
        .accounts
        .set_pending_input(user, Some(PendingInput::BusinessBind), ctx.now())
        .await
    {
        warn!(user_id = user.0, error = %e, "Failed to arm business binding");
    }
    header(ctx, chat, "Подключение Telegram для бизнеса").await;
    let text = "1) Убедитесь, что бот добавлен: Telegram → Telegram для бизнеса → Чат-боты\n\
        2) Затем напишите любому человеку от имени бизнеса (или вам напишут)\n\n\
        После первого сообщения бот привяжет ваш бизнес-аккаунт и начнёт присылать уведомления только по вашим чатам.";
    say(ctx, chat, text, None).await;
}

/// Welcome flow for `/start`.
pub async fn start(ctx: &AppContext, user: UserId) {
    let chat: ChatId = user.into();
    let is_admin = ctx.is_admin(user);
    if is_admin {
        if let Err(e) = ctx.set_owner_id(user).await {
            warn!(error = %e, "Failed to persist owner id");
        }
    }
    let has_access = ctx.gate.has_access(user, ctx.now()).await;

    header(ctx, chat, "Добро пожаловать!").await;
    let intro = "🕵️‍♂️ Этот бот помогает следить за вашими бизнес-чатами.\n\n\
        Что он умеет:\n\
        • Уведомляет об изменениях сообщений ✏️\n\
        • Уведомляет об удалениях 🗑\n\
        • Сохраняет исчезающие фото/видео при ответе ⏳";
    say(ctx, chat, intro, Some(&main_menu(is_admin))).await;

    if !is_admin && !has_access && ctx.gate.paid_mode().await {
        let kb = Keyboard::single("⭐ Подписка / продлить", "open_sub");
        let text = "🔒 Доступ к подключению бизнес-чатов сейчас не активен.\n\
            Оформите подписку в Telegram Stars — и сможете подключить Telegram для бизнеса.";
        say(ctx, chat, text, Some(&kb)).await;
    }

    let bot = escape_html(ctx.bot_username());
    if has_access {
        let text = format!(
            "🔗 Подключение Telegram для бизнеса:\n\
            Telegram → Telegram для бизнеса → Чат-боты → добавить:\n\
            <code>@{bot}</code>"
        );
        say(ctx, chat, &text, None).await;
    }

    let connections = connections_of(ctx, user).await;
    if connections > 0 {
        let chats = chats_of(ctx, user).await;
        let text = format!(
            "✅ Бот подключён в Telegram для бизнеса. Подключений: {connections}. Чатов: {chats}."
        );
        say(ctx, chat, &text, None).await;
    } else if has_access {
        let text = format!(
            "❗️ Пока нет подключённых бизнес-чатов. Добавьте @{bot} в Telegram для бизнеса → Чат-боты и начните переписку (вы можете написать кому-то сами)."
        );
        say(ctx, chat, &text, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn menu_vocabulary_roundtrips() {
        assert_eq!(MenuCommand::parse(" 📊 Статус "), Some(MenuCommand::Status));
        assert_eq!(MenuCommand::parse("❌ Отмена"), Some(MenuCommand::Cancel));
        assert_eq!(MenuCommand::parse("Статус"), None);
        assert!(MenuCommand::Broadcast.admin_only());
        assert!(!MenuCommand::Connect.admin_only());
    }

    #[test]
    fn admin_menu_differs_from_user_menu() {
        let Keyboard::Reply(admin) = main_menu(true) else {
            panic!("reply keyboard expected");
        };
        assert_eq!(admin[0], vec![BTN_ADMIN.to_string(), BTN_BLACKLIST.to_string()]);
        let Keyboard::Reply(user) = main_menu(false) else {
            panic!("reply keyboard expected");
        };
        assert_eq!(user.len(), 3);
        assert!(user.iter().flatten().all(|b| b != BTN_ADMIN));
    }
}
