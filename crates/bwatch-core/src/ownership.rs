//! Business connection → owner resolution.
//!
//! Business events carry only an opaque connection id. Everything the monitor
//! sends about a business chat goes to the user this module resolves, so the
//! mapping is only ever changed under the rules below.

use std::{collections::BTreeSet, sync::Arc};

use tracing::info;

use crate::{
    access::AccessGate,
    domain::{ChatId, ConnectionId, UserId},
    store::{AccountStore, PendingInput},
    update::Message,
    Result,
};

/// Result of a safety-checked mapping write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemapOutcome {
    Inserted,
    Unchanged,
    Remapped { from: UserId },
    Refused { current: UserId },
}

impl RemapOutcome {
    pub fn changed(self) -> bool {
        matches!(self, RemapOutcome::Inserted | RemapOutcome::Remapped { .. })
    }
}

/// May a mapping owned by `old` move to `new`?
///
/// Only away from the administrator or from someone who never started the bot,
/// and only to someone who has.
pub fn remap_allowed(old_is_admin: bool, old_is_bot_user: bool, new_is_bot_user: bool) -> bool {
    (old_is_admin || !old_is_bot_user) && new_is_bot_user
}

pub struct OwnershipResolver {
    accounts: Arc<dyn AccountStore>,
    gate: Arc<AccessGate>,
}

impl OwnershipResolver {
    pub fn new(accounts: Arc<dyn AccountStore>, gate: Arc<AccessGate>) -> Self {
        Self { accounts, gate }
    }

    /// Persisted owner of `cid`. No global fallback.
    pub async fn resolve(&self, cid: Option<&ConnectionId>) -> Result<Option<UserId>> {
        let Some(cid) = cid else {
            return Ok(None);
        };
        Ok(self
            .accounts
            .get_connection(cid)
            .await?
            .map(|c| UserId(c.owner_user_id)))
    }

    /// Unconditional write for sources Telegram vouches for. Keeps `notified`.
    /// Returns the previous owner.
    pub async fn set_authoritative(
        &self,
        cid: &ConnectionId,
        owner: UserId,
        now: i64,
    ) -> Result<Option<UserId>> {
        let prev = self.resolve(Some(cid)).await?;
        self.accounts.put_connection(cid, owner, false, now).await?;
        if prev != Some(owner) {
            info!(connection_id = %cid, ?prev, owner = owner.0, "Mapped business connection");
        }
        Ok(prev)
    }

    /// Insert if missing; otherwise remap only when [`remap_allowed`] says so.
    pub async fn upsert_safe(
        &self,
        cid: &ConnectionId,
        new_owner: UserId,
        now: i64,
    ) -> Result<RemapOutcome> {
        let Some(current) = self.resolve(Some(cid)).await? else {
            self.accounts
                .put_connection(cid, new_owner, true, now)
                .await?;
            return Ok(RemapOutcome::Inserted);
        };
        if current == new_owner {
            return Ok(RemapOutcome::Unchanged);
        }
        let allowed = remap_allowed(
            self.gate.is_admin(current),
            self.gate.is_bot_user(current).await,
            self.gate.is_bot_user(new_owner).await,
        );
        if !allowed {
            return Ok(RemapOutcome::Refused { current });
        }
        self.accounts
            .put_connection(cid, new_owner, true, now)
            .await?;
        Ok(RemapOutcome::Remapped { from: current })
    }

    /// Outgoing business message: the sender is the account owner.
    ///
    /// Re-points the mapping to a subscribed bot user who is visibly speaking
    /// on this connection.
    pub async fn recover_from_outgoing(&self, msg: &Message, now: i64) -> Result<bool> {
        let (Some(cid), Some(sender)) = (msg.connection_id(), msg.sender_id()) else {
            return Ok(false);
        };
        if sender.0 == msg.chat.id {
            return Ok(false);
        }
        if !self.gate.is_bot_user(sender).await || !self.gate.has_access(sender, now).await {
            return Ok(false);
        }
        let prev = self.resolve(Some(&cid)).await?;
        if prev == Some(sender) {
            return Ok(false);
        }
        self.accounts.put_connection(&cid, sender, false, now).await?;
        info!(connection_id = %cid, ?prev, owner = sender.0, "Recovered business connection owner");
        Ok(true)
    }

    /// Explicit binding requested through the "connect business" menu.
    ///
    /// Returns the bound owner when a pending request was consumed.
    pub async fn bind_if_requested(&self, msg: &Message, now: i64) -> Result<Option<UserId>> {
        let (Some(cid), Some(sender)) = (msg.connection_id(), msg.sender_id()) else {
            return Ok(None);
        };
        if sender.0 == msg.chat.id {
            return Ok(None);
        }
        if self.accounts.pending_input(sender).await? != Some(PendingInput::BusinessBind) {
            return Ok(None);
        }
        if !self.gate.is_bot_user(sender).await || !self.gate.has_access(sender, now).await {
            return Ok(None);
        }
        let outcome = self.upsert_safe(&cid, sender, now).await?;
        if outcome.changed() {
            info!(connection_id = %cid, ?outcome, owner = sender.0, "Rebound business connection");
        }
        self.accounts.set_pending_input(sender, None, now).await?;
        Ok(Some(sender))
    }

    /// Record the chat under its mapped owner (subscribed owners only).
    pub async fn track_chat(&self, msg: &Message, now: i64) -> Result<bool> {
        let Some(owner) = self.resolve(msg.connection_id().as_ref()).await? else {
            return Ok(false);
        };
        if !self.gate.has_access(owner, now).await {
            return Ok(false);
        }
        self.accounts
            .add_owner_chat(owner, msg.chat_id(), now)
            .await
    }

    /// Who hears about a business chat: the owner, plus the other participant
    /// when both sides run the monitor and the other side tracks this owner.
    pub async fn recipients(&self, owner: UserId, chat_id: ChatId) -> BTreeSet<UserId> {
        let mut out = BTreeSet::from([owner]);
        let other = UserId(chat_id.0);
        if other != owner
            && self.gate.is_bot_user(other).await
            && matches!(
                self.accounts.has_owner_chat(other, ChatId(owner.0)).await,
                Ok(true)
            )
        {
            out.insert(other);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{config::Config, store::memory::MemoryStore};

    const ADMIN: UserId = UserId(1);

    fn resolver() -> (Arc<MemoryStore>, OwnershipResolver) {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(AccessGate::new(store.clone(), &Config::new("t", ADMIN)));
        (store.clone(), OwnershipResolver::new(store, gate))
    }

    fn outgoing(cid: &str, from: i64, chat: i64) -> Message {
        Message::from_value(json!({
            "message_id": 1,
            "business_connection_id": cid,
            "from": {"id": from},
            "chat": {"id": chat, "type": "private"},
            "text": "hi"
        }))
        .unwrap()
    }

    #[test]
    fn remap_rule_cases() {
        // Stale owner who never started the bot -> bot user.
        assert!(remap_allowed(false, false, true));
        // Active owner cannot be displaced.
        assert!(!remap_allowed(false, true, true));
        // Target must have started the bot.
        assert!(!remap_allowed(false, false, false));
        // Admin-held mapping may be released.
        assert!(remap_allowed(true, true, true));
    }

    #[tokio::test]
    async fn upsert_safe_inserts_then_guards() {
        let (store, r) = resolver();
        let cid = ConnectionId("c".into());
        assert_eq!(
            r.upsert_safe(&cid, UserId(5), 0).await.unwrap(),
            RemapOutcome::Inserted
        );
        assert_eq!(
            r.upsert_safe(&cid, UserId(5), 0).await.unwrap(),
            RemapOutcome::Unchanged
        );

        // 5 never started the bot; 6 has.
        store.mark_bot_user(UserId(6), 0).await.unwrap();
        assert_eq!(
            r.upsert_safe(&cid, UserId(6), 1).await.unwrap(),
            RemapOutcome::Remapped { from: UserId(5) }
        );

        // 6 is an active bot user now: 7 cannot take over.
        store.mark_bot_user(UserId(7), 0).await.unwrap();
        assert_eq!(
            r.upsert_safe(&cid, UserId(7), 2).await.unwrap(),
            RemapOutcome::Refused { current: UserId(6) }
        );
        assert_eq!(r.resolve(Some(&cid)).await.unwrap(), Some(UserId(6)));
    }

    #[tokio::test]
    async fn safe_remap_resets_notified() {
        let (store, r) = resolver();
        let cid = ConnectionId("c".into());
        r.upsert_safe(&cid, UserId(5), 0).await.unwrap();
        assert!(store.mark_connection_notified(&cid).await.unwrap());
        store.mark_bot_user(UserId(6), 0).await.unwrap();
        r.upsert_safe(&cid, UserId(6), 1).await.unwrap();
        assert!(store.mark_connection_notified(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn recovery_needs_outgoing_bot_user() {
        let (store, r) = resolver();
        let cid = ConnectionId("c".into());
        r.set_authoritative(&cid, UserId(5), 0).await.unwrap();

        // Incoming message (sender == chat) never recovers.
        store.mark_bot_user(UserId(9), 0).await.unwrap();
        assert!(!r.recover_from_outgoing(&outgoing("c", 9, 9), 0).await.unwrap());

        // Outgoing from someone who never started the bot.
        assert!(!r.recover_from_outgoing(&outgoing("c", 8, 9), 0).await.unwrap());

        assert!(r.recover_from_outgoing(&outgoing("c", 9, 3), 0).await.unwrap());
        assert_eq!(r.resolve(Some(&cid)).await.unwrap(), Some(UserId(9)));
    }

    #[tokio::test]
    async fn bind_consumes_pending_request() {
        let (store, r) = resolver();
        store.mark_bot_user(UserId(9), 0).await.unwrap();
        let msg = outgoing("c", 9, 3);
        assert_eq!(r.bind_if_requested(&msg, 0).await.unwrap(), None);

        store
            .set_pending_input(UserId(9), Some(PendingInput::BusinessBind), 0)
            .await
            .unwrap();
        assert_eq!(r.bind_if_requested(&msg, 0).await.unwrap(), Some(UserId(9)));
        assert_eq!(store.pending_input(UserId(9)).await.unwrap(), None);
        assert_eq!(
            r.resolve(Some(&ConnectionId("c".into()))).await.unwrap(),
            Some(UserId(9))
        );
    }

    #[tokio::test]
    async fn mutual_chat_adds_other_owner() {
        let (store, r) = resolver();
        let owner = UserId(5);
        assert_eq!(
            r.recipients(owner, ChatId(6)).await,
            BTreeSet::from([owner])
        );
        store.mark_bot_user(UserId(6), 0).await.unwrap();
        assert_eq!(
            r.recipients(owner, ChatId(6)).await,
            BTreeSet::from([owner])
        );
        store.add_owner_chat(UserId(6), ChatId(5), 0).await.unwrap();
        assert_eq!(
            r.recipients(owner, ChatId(6)).await,
            BTreeSet::from([owner, UserId(6)])
        );
    }
}
