//! Inbound event router.
//!
//! Updates are handled one at a time, in arrival order. Each handler runs
//! inside its own error boundary: a failure is logged and the next update
//! proceeds.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    context::AppContext,
    update::{Update, UpdateKind},
};

pub mod admin;
pub mod callback;
pub mod connection;
pub mod deletes;
pub mod edits;
pub mod messages;
pub mod notify;
pub mod payments;
pub mod views;


/// Decode and handle one raw Bot API update.
pub async fn dispatch_raw(ctx: &AppContext, raw: Value) {
    match Update::decode(raw) {
        Ok(update) => dispatch(ctx, update).await,
        Err(e) => debug!(error = %e, "Ignoring undecodable update"),
    }
}

pub async fn dispatch(ctx: &AppContext, update: Update) {
    let update_id = update.update_id;
    let Some(kind) = update.kind else {
        debug!(update_id, "Ignoring unhandled update kind");
        return;
    };
    let name = kind.name();
    if name.contains("business") {
        info!(update_id, kind = name, "Business update");
    }

    let res = match kind {
        UpdateKind::PreCheckoutQuery(q) => payments::pre_checkout(ctx, &q).await,
        UpdateKind::SuccessfulPayment(m) => payments::settle(ctx, &m).await,
        UpdateKind::BusinessConnection(bc) => connection::handle(ctx, &bc).await,
        UpdateKind::CallbackQuery(q) => callback::handle(ctx, &q).await,
        UpdateKind::Message(m) => messages::handle(ctx, m, false).await,
        UpdateKind::BusinessMessage(m) => messages::handle(ctx, m, true).await,
        UpdateKind::EditedBusinessMessage(m) => edits::business(ctx, m).await,
        UpdateKind::DeletedBusinessMessages(d) => deletes::handle(ctx, &d).await,
        UpdateKind::EditedMessage(m) => edits::plain(ctx, m).await,
    };

    if let Err(e) = res {
        warn!(update_id, kind = name, error = %e, "Update handler failed");
    }
}
