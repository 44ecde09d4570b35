use tracing::{debug, warn};

use crate::{
    context::AppContext,
    router::notify::{can_receive, say},
    update::BusinessConnection,
    Result,
};

const CONNECTED_NOTICE: &str = "✅ Бот добавлен в Telegram для бизнеса и готов работать.\n\
    Теперь он будет присылать уведомления по вашим бизнес-чатам.";

/// Telegram vouches for `business_connection` ownership, so a subscribed
/// owner's mapping is written unconditionally.
pub async fn handle(ctx: &AppContext, bc: &BusinessConnection) -> Result<()> {
    let (Some(cid), Some(owner)) = (bc.connection_id(), bc.owner()) else {
        debug!("business_connection without id or owner");
        return Ok(());
    };
    let now = ctx.now();
    let has_access = ctx.gate.has_access(owner, now).await;
    if has_access {
        ctx.ownership.set_authoritative(&cid, owner, now).await?;
    }

    let first_time = match ctx.accounts.mark_connection_notified(&cid).await {
        Ok(v) => v,
        Err(e) => {
            warn!(connection_id = %cid, error = %e, "Failed to mark connection notified");
            false
        }
    };
    if first_time && has_access && can_receive(ctx, owner).await {
        say(ctx, owner.into(), CONNECTED_NOTICE, None).await;
    }
    Ok(())
}
