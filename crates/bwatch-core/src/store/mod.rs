//! Storage contracts.
//!
//! Account state (users, subscriptions, ownership, settings) may live in a
//! remote document store; the message/media cache is always local.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChatId, ConnectionId, MediaKind, MessageId, UserId},
    Result,
};

pub mod memory;
pub mod mirror;

pub const KV_PAID_MODE: &str = "paid_mode";
pub const KV_OWNER_ID: &str = "owner_id";
pub const KV_BOOTSTRAPPED_AT: &str = "bootstrapped_at";

pub fn kv_price_key(plan: &str) -> String {
    format!("stars_price_{plan}")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_seen: i64,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub bot_user: bool,
}

impl UserRecord {
    /// `@username`, the name, or a numeric fallback.
    pub fn display(&self) -> String {
        if let Some(u) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return format!("@{u}");
        }
        if let Some(n) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return n.trim().to_string();
        }
        format!("Пользователь {}", self.user_id)
    }
}

/// Profile fields refreshed on every touch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: Option<String>,
    pub name: Option<String>,
}

impl From<&crate::update::User> for UserProfile {
    fn from(u: &crate::update::User) -> Self {
        Self {
            user_id: u.user_id(),
            username: u.username.clone().filter(|s| !s.is_empty()),
            name: u.full_name(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: String,
    pub owner_user_id: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub notified: bool,
}

/// What the user's next free-form private message means.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PendingInput {
    Support,
    Broadcast,
    BusinessBind,
    PriceEdit,
}

impl PendingInput {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingInput::Support => "support",
            PendingInput::Broadcast => "broadcast",
            PendingInput::BusinessBind => "business_bind",
            PendingInput::PriceEdit => "price_edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "support" => Some(PendingInput::Support),
            "broadcast" => Some(PendingInput::Broadcast),
            "business_bind" => Some(PendingInput::BusinessBind),
            "price_edit" => Some(PendingInput::PriceEdit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub user_id: Option<i64>,
    pub action: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub message_id: Option<i32>,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: i64,
    pub paid_until: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeUserRecord {
    pub user_id: i64,
    #[serde(default)]
    pub created_at: i64,
}

/// Portable copy of account state, used to seed an empty remote store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub users: Vec<UserRecord>,
    pub subscriptions: Vec<SubscriptionRecord>,
    pub free_users: Vec<FreeUserRecord>,
    pub kv: Vec<(String, String)>,
}

impl AccountSnapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.subscriptions.is_empty()
            && self.free_users.is_empty()
            && self.kv.is_empty()
    }
}

/// Users, subscriptions, connection ownership, pending inputs, settings, audit log.
#[async_trait]
pub trait AccountStore: Send + Sync {
    // Settings
    async fn kv_get(&self, key: &str) -> Result<Option<String>>;
    async fn kv_set(&self, key: &str, value: &str) -> Result<()>;
    /// `true` when no setting has been stored yet.
    async fn kv_is_empty(&self) -> Result<bool>;

    // Users
    /// Upsert profile fields and `last_seen`; keeps `blocked` and `bot_user`.
    async fn touch_user(&self, profile: &UserProfile, now: i64) -> Result<()>;
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    async fn mark_bot_user(&self, user_id: UserId, now: i64) -> Result<()>;
    async fn set_blocked(&self, user_id: UserId, blocked: bool, now: i64) -> Result<()>;
    async fn count_users(&self) -> Result<u64>;
    /// Most recently seen first.
    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<UserRecord>>;
    async fn list_blocked_users(&self, limit: usize) -> Result<Vec<UserRecord>>;
    /// Unblocked users who started the bot, ascending id.
    async fn list_bot_user_ids(&self) -> Result<Vec<UserId>>;

    // Subscriptions
    /// 0 when the user never paid.
    async fn paid_until(&self, user_id: UserId) -> Result<i64>;
    async fn set_paid_until(&self, user_id: UserId, until: i64, now: i64) -> Result<()>;
    async fn is_free_user(&self, user_id: UserId) -> Result<bool>;
    async fn set_free_user(&self, user_id: UserId, free: bool, now: i64) -> Result<()>;
    async fn list_free_users(&self, limit: usize) -> Result<Vec<UserId>>;

    // Business connections
    async fn get_connection(&self, cid: &ConnectionId) -> Result<Option<ConnectionRecord>>;
    /// Insert or re-point a mapping. `reset_notified` clears the one-shot flag.
    async fn put_connection(
        &self,
        cid: &ConnectionId,
        owner: UserId,
        reset_notified: bool,
        now: i64,
    ) -> Result<()>;
    /// Check-and-set: `true` only for the call that flips `notified` to set.
    /// Missing rows are never marked.
    async fn mark_connection_notified(&self, cid: &ConnectionId) -> Result<bool>;
    async fn count_connections_for_owner(&self, owner: UserId) -> Result<u64>;

    // Owner chats
    /// `true` when the pair was not seen before.
    async fn add_owner_chat(&self, owner: UserId, chat_id: ChatId, now: i64) -> Result<bool>;
    async fn has_owner_chat(&self, owner: UserId, chat_id: ChatId) -> Result<bool>;
    async fn count_owner_chats(&self, owner: UserId) -> Result<u64>;

    // Pending inputs
    async fn pending_input(&self, user_id: UserId) -> Result<Option<PendingInput>>;
    /// `None` clears.
    async fn set_pending_input(
        &self,
        user_id: UserId,
        pending: Option<PendingInput>,
        now: i64,
    ) -> Result<()>;

    // Audit log
    async fn log_event(&self, event: &EventRecord) -> Result<()>;
    /// Most frequent actions first.
    async fn action_counts(&self, limit: usize) -> Result<Vec<(String, u64)>>;

    // Bulk copy
    async fn export_accounts(&self) -> Result<AccountSnapshot>;
    async fn import_accounts(&self, snapshot: &AccountSnapshot) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedMedia {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub created_at: i64,
}

/// Row counts removed by a cache purge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClearedRows {
    pub messages: u64,
    pub media: u64,
    pub forwarded: u64,
}

/// Local message snapshots, media rows and rescue dedup tags.
///
/// Ordering for the eviction queries is newest `created_at` first, ties broken
/// by insertion order (later insert is newer).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Upsert by (chat, message); refreshes `created_at`.
    async fn put_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        payload: &Value,
        now: i64,
    ) -> Result<()>;
    async fn get_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<Option<Value>>;
    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;
    /// Message ids of `chat_id` beyond the `keep` newest.
    async fn messages_beyond(&self, chat_id: ChatId, keep: usize) -> Result<Vec<MessageId>>;

    async fn put_media(&self, media: &CachedMedia) -> Result<()>;
    async fn get_media(&self, chat_id: ChatId, message_id: MessageId)
        -> Result<Option<CachedMedia>>;
    async fn delete_media(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;
    /// Media rows beyond the `keep` newest across all chats.
    async fn media_beyond(&self, keep: usize) -> Result<Vec<CachedMedia>>;

    async fn forwarded_exists(&self, recipient: UserId, message_id: MessageId, tag: &str)
        -> Result<bool>;
    /// Insert-if-absent.
    async fn set_forwarded(
        &self,
        recipient: UserId,
        message_id: MessageId,
        tag: &str,
        now: i64,
    ) -> Result<()>;

    /// Delete every message, media and forwarded row.
    async fn clear(&self) -> Result<ClearedRows>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_input_names_are_stable() {
        for p in [
            PendingInput::Support,
            PendingInput::Broadcast,
            PendingInput::BusinessBind,
            PendingInput::PriceEdit,
        ] {
            assert_eq!(PendingInput::parse(p.as_str()), Some(p));
        }
        assert_eq!(PendingInput::parse("prices"), None);
    }

    #[test]
    fn user_display_falls_back_to_id() {
        let mut u = UserRecord {
            user_id: 5,
            username: None,
            name: None,
            first_seen: 0,
            last_seen: 0,
            blocked: false,
            bot_user: false,
        };
        assert_eq!(u.display(), "Пользователь 5");
        u.name = Some("Ann".into());
        assert_eq!(u.display(), "Ann");
        u.username = Some("ann".into());
        assert_eq!(u.display(), "@ann");
    }
}
