//! Stars checkout and settlement.

use tracing::{info, warn};

use crate::{
    access::PurchasePayload,
    context::AppContext,
    domain::{ChatId, UserId},
    formatting::RichText,
    router::{
        notify::{log_outcome, say_rich},
        views,
    },
    update::{Message, PreCheckoutQuery},
    utils::fmt_dt,
    Result,
};

pub async fn pre_checkout(ctx: &AppContext, q: &PreCheckoutQuery) -> Result<()> {
    let verdict = ctx
        .gate
        .validate_checkout(q.currency.as_deref(), &q.invoice_payload);
    if let Err(reason) = verdict {
        warn!(user_id = q.from.id, reason, "Rejecting checkout");
    }
    let out = ctx
        .notifier
        .answer_pre_checkout(&q.id, verdict.is_ok(), verdict.err())
        .await;
    log_outcome(&out, q.from.user_id().into(), "pre-checkout answer");
    Ok(())
}

/// Extend the buyer (the paying chat) by the purchased plan.
pub async fn settle(ctx: &AppContext, msg: &Message) -> Result<()> {
    let Some(payment) = msg.successful_payment.as_ref() else {
        return Ok(());
    };
    let buyer = UserId(msg.chat.id);
    let Some(payload) = PurchasePayload::parse(&payment.invoice_payload) else {
        warn!(user_id = buyer.0, payload = %payment.invoice_payload, "Ignoring payment with malformed payload");
        return Ok(());
    };
    if ctx.gate.plan_price(payload.plan).await.is_none() {
        warn!(user_id = buyer.0, plan = payload.plan.key(), "Ignoring payment for a disabled plan");
        return Ok(());
    }

    let until = ctx.gate.extend(buyer, payload.plan, ctx.now()).await?;
    info!(
        user_id = buyer.0,
        plan = payload.plan.key(),
        amount = payment.total_amount,
        until,
        "Subscription extended"
    );
    ctx.log_event(Some(buyer), "payment", Some(msg.chat.id), Some(msg.message_id))
        .await;

    let chat: ChatId = buyer.into();
    let title = "Оплата получена";
    let text = RichText::new(format!(
        "⭐ {title}\n\n✅ Доступ активен до {}",
        fmt_dt(until)
    ))
    .bold(title);
    say_rich(ctx, chat, &text, None).await;

    let connections = ctx
        .accounts
        .count_connections_for_owner(buyer)
        .await
        .unwrap_or_else(|e| {
            warn!(user_id = buyer.0, error = %e, "Failed to count connections");
            0
        });
    if connections == 0 {
        views::onboarding(ctx, chat).await;
    }
    Ok(())
}
