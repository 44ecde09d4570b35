//! Remote-primary account store with a local mirror.
//!
//! Writes go to the remote store first and then to the local one; a write
//! fails only when both sides fail. Reads come from the remote store. Reads
//! that only feed listings or counters fall back to the local copy; reads that
//! gate access (subscriptions, free users, connection owners) surface the
//! error so the caller denies.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    domain::{ChatId, ConnectionId, UserId},
    store::{
        AccountSnapshot, AccountStore, ConnectionRecord, EventRecord, PendingInput, UserProfile,
        UserRecord, KV_BOOTSTRAPPED_AT,
    },
    Result,
};

pub struct MirroredAccountStore {
    remote: Arc<dyn AccountStore>,
    local: Arc<dyn AccountStore>,
}

impl MirroredAccountStore {
    pub fn new(remote: Arc<dyn AccountStore>, local: Arc<dyn AccountStore>) -> Self {
        Self { remote, local }
    }

    /// Seed an empty remote store from the local one.
    ///
    /// Runs once: the `bootstrapped_at` marker is written last and checked first.
    pub async fn bootstrap_if_empty(&self, now: i64) -> Result<bool> {
        if self.remote.kv_get(KV_BOOTSTRAPPED_AT).await?.is_some() {
            return Ok(false);
        }
        if !self.remote.kv_is_empty().await? {
            self.remote
                .kv_set(KV_BOOTSTRAPPED_AT, &now.to_string())
                .await?;
            return Ok(false);
        }
        let snapshot = self.local.export_accounts().await?;
        info!(
            users = snapshot.users.len(),
            subscriptions = snapshot.subscriptions.len(),
            free_users = snapshot.free_users.len(),
            "Seeding remote account store from local copy"
        );
        self.remote.import_accounts(&snapshot).await?;
        self.remote
            .kv_set(KV_BOOTSTRAPPED_AT, &now.to_string())
            .await?;
        Ok(true)
    }
}

/// Apply a write to both stores; only a double failure is an error.
macro_rules! mirror_write {
    ($self:ident, $op:literal, |$s:ident| $call:expr) => {{
        let remote = {
            let $s = &$self.remote;
            $call.await
        };
        let local = {
            let $s = &$self.local;
            $call.await
        };
        match (remote, local) {
            (Ok(v), _) => Ok(v),
            (Err(e), Ok(v)) => {
                warn!(error = %e, op = $op, "Remote write failed; kept local copy");
                Ok(v)
            }
            (Err(e), Err(local_err)) => {
                warn!(error = %local_err, op = $op, "Local write failed too");
                Err(e)
            }
        }
    }};
}

/// Read remote, fall back to local on error.
macro_rules! fallback_read {
    ($self:ident, $op:literal, |$s:ident| $call:expr) => {{
        let remote = {
            let $s = &$self.remote;
            $call.await
        };
        match remote {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!(error = %e, op = $op, "Remote read failed; using local copy");
                let $s = &$self.local;
                $call.await
            }
        }
    }};
}

#[async_trait]
impl AccountStore for MirroredAccountStore {
    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        fallback_read!(self, "kv_get", |s| s.kv_get(key))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        mirror_write!(self, "kv_set", |s| s.kv_set(key, value))
    }

    async fn kv_is_empty(&self) -> Result<bool> {
        self.remote.kv_is_empty().await
    }

    async fn touch_user(&self, profile: &UserProfile, now: i64) -> Result<()> {
        mirror_write!(self, "touch_user", |s| s.touch_user(profile, now))
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        self.remote.get_user(user_id).await
    }

    async fn mark_bot_user(&self, user_id: UserId, now: i64) -> Result<()> {
        mirror_write!(self, "mark_bot_user", |s| s.mark_bot_user(user_id, now))
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool, now: i64) -> Result<()> {
        mirror_write!(self, "set_blocked", |s| s.set_blocked(user_id, blocked, now))
    }

    async fn count_users(&self) -> Result<u64> {
        fallback_read!(self, "count_users", |s| s.count_users())
    }

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<UserRecord>> {
        fallback_read!(self, "list_users", |s| s.list_users(limit, offset))
    }

    async fn list_blocked_users(&self, limit: usize) -> Result<Vec<UserRecord>> {
        fallback_read!(self, "list_blocked_users", |s| s.list_blocked_users(limit))
    }

    async fn list_bot_user_ids(&self) -> Result<Vec<UserId>> {
        fallback_read!(self, "list_bot_user_ids", |s| s.list_bot_user_ids())
    }

    async fn paid_until(&self, user_id: UserId) -> Result<i64> {
        self.remote.paid_until(user_id).await
    }

    async fn set_paid_until(&self, user_id: UserId, until: i64, now: i64) -> Result<()> {
        mirror_write!(self, "set_paid_until", |s| s.set_paid_until(user_id, until, now))
    }

    async fn is_free_user(&self, user_id: UserId) -> Result<bool> {
        self.remote.is_free_user(user_id).await
    }

    async fn set_free_user(&self, user_id: UserId, free: bool, now: i64) -> Result<()> {
        mirror_write!(self, "set_free_user", |s| s.set_free_user(user_id, free, now))
    }

    async fn list_free_users(&self, limit: usize) -> Result<Vec<UserId>> {
        fallback_read!(self, "list_free_users", |s| s.list_free_users(limit))
    }

    async fn get_connection(&self, cid: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        self.remote.get_connection(cid).await
    }

    async fn put_connection(
        &self,
        cid: &ConnectionId,
        owner: UserId,
        reset_notified: bool,
        now: i64,
    ) -> Result<()> {
        mirror_write!(self, "put_connection", |s| s
            .put_connection(cid, owner, reset_notified, now))
    }

    async fn mark_connection_notified(&self, cid: &ConnectionId) -> Result<bool> {
        // The remote answer decides; the local flag just follows.
        let first = self.remote.mark_connection_notified(cid).await?;
        if let Err(e) = self.local.mark_connection_notified(cid).await {
            warn!(error = %e, "Local notified flag not updated");
        }
        Ok(first)
    }

    async fn count_connections_for_owner(&self, owner: UserId) -> Result<u64> {
        fallback_read!(self, "count_connections_for_owner", |s| s
            .count_connections_for_owner(owner))
    }

    async fn add_owner_chat(&self, owner: UserId, chat_id: ChatId, now: i64) -> Result<bool> {
        mirror_write!(self, "add_owner_chat", |s| s.add_owner_chat(owner, chat_id, now))
    }

    async fn has_owner_chat(&self, owner: UserId, chat_id: ChatId) -> Result<bool> {
        self.remote.has_owner_chat(owner, chat_id).await
    }

    async fn count_owner_chats(&self, owner: UserId) -> Result<u64> {
        fallback_read!(self, "count_owner_chats", |s| s.count_owner_chats(owner))
    }

    async fn pending_input(&self, user_id: UserId) -> Result<Option<PendingInput>> {
        fallback_read!(self, "pending_input", |s| s.pending_input(user_id))
    }

    async fn set_pending_input(
        &self,
        user_id: UserId,
        pending: Option<PendingInput>,
        now: i64,
    ) -> Result<()> {
        mirror_write!(self, "set_pending_input", |s| s
            .set_pending_input(user_id, pending, now))
    }

    async fn log_event(&self, event: &EventRecord) -> Result<()> {
        mirror_write!(self, "log_event", |s| s.log_event(event))
    }

    async fn action_counts(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        fallback_read!(self, "action_counts", |s| s.action_counts(limit))
    }

    async fn export_accounts(&self) -> Result<AccountSnapshot> {
        fallback_read!(self, "export_accounts", |s| s.export_accounts())
    }

    async fn import_accounts(&self, snapshot: &AccountSnapshot) -> Result<()> {
        mirror_write!(self, "import_accounts", |s| s.import_accounts(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn pair() -> (Arc<MemoryStore>, Arc<MemoryStore>, MirroredAccountStore) {
        let remote = Arc::new(MemoryStore::new());
        let local = Arc::new(MemoryStore::new());
        let m = MirroredAccountStore::new(remote.clone(), local.clone());
        (remote, local, m)
    }

    #[tokio::test]
    async fn writes_reach_both_sides() {
        let (remote, local, m) = pair();
        m.set_paid_until(UserId(1), 500, 0).await.unwrap();
        assert_eq!(remote.paid_until(UserId(1)).await.unwrap(), 500);
        assert_eq!(local.paid_until(UserId(1)).await.unwrap(), 500);
    }

    #[tokio::test]
    async fn gating_reads_do_not_fall_back() {
        let (remote, _local, m) = pair();
        m.set_free_user(UserId(2), true, 0).await.unwrap();
        remote.set_unavailable(true);
        assert!(m.is_free_user(UserId(2)).await.is_err());
        // Listings still work from the local copy.
        assert_eq!(m.list_free_users(10).await.unwrap(), vec![UserId(2)]);
        // A write with one side down still succeeds.
        m.kv_set("paid_mode", "1").await.unwrap();
    }

    #[tokio::test]
    async fn bootstrap_copies_local_accounts_once() {
        let (remote, local, m) = pair();
        local.set_paid_until(UserId(3), 900, 0).await.unwrap();
        local.kv_set("paid_mode", "1").await.unwrap();

        assert!(m.bootstrap_if_empty(10).await.unwrap());
        assert_eq!(remote.paid_until(UserId(3)).await.unwrap(), 900);
        assert_eq!(
            remote.kv_get("paid_mode").await.unwrap().as_deref(),
            Some("1")
        );
        assert!(!m.bootstrap_if_empty(11).await.unwrap());
    }

    #[tokio::test]
    async fn remote_with_settings_is_only_marked() {
        let (remote, local, m) = pair();
        remote.kv_set("paid_mode", "0").await.unwrap();
        local.set_paid_until(UserId(4), 900, 0).await.unwrap();

        assert!(!m.bootstrap_if_empty(10).await.unwrap());
        assert_eq!(remote.paid_until(UserId(4)).await.unwrap(), 0);
        assert_eq!(
            remote.kv_get(KV_BOOTSTRAPPED_AT).await.unwrap().as_deref(),
            Some("10")
        );
    }
}
