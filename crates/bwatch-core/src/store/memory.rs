//! In-process store used by tests and as a throwaway backend.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    domain::{ChatId, ConnectionId, MessageId, UserId},
    errors::Error,
    store::{
        AccountSnapshot, AccountStore, CacheStore, CachedMedia, ClearedRows, ConnectionRecord,
        EventRecord, FreeUserRecord, PendingInput, SubscriptionRecord, UserProfile, UserRecord,
    },
    Result,
};

#[derive(Debug)]
struct MessageRow {
    payload: Value,
    created_at: i64,
    seq: u64,
}

#[derive(Debug)]
struct MediaRow {
    media: CachedMedia,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    kv: HashMap<String, String>,
    users: BTreeMap<i64, UserRecord>,
    subscriptions: BTreeMap<i64, SubscriptionRecord>,
    free_users: BTreeMap<i64, i64>,
    connections: HashMap<String, ConnectionRecord>,
    owner_chats: BTreeMap<(i64, i64), i64>,
    pending: HashMap<i64, PendingInput>,
    events: Vec<EventRecord>,
    messages: HashMap<(i64, i32), MessageRow>,
    media: HashMap<(i64, i32), MediaRow>,
    forwarded: HashSet<(i64, i32, String)>,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn user_mut(&mut self, user_id: UserId, now: i64) -> &mut UserRecord {
        self.users.entry(user_id.0).or_insert_with(|| UserRecord {
            user_id: user_id.0,
            username: None,
            name: None,
            first_seen: now,
            last_seen: now,
            blocked: false,
            bot_user: false,
        })
    }
}

/// Both storage contracts over plain collections.
///
/// `set_unavailable(true)` makes every call fail, which is how tests simulate
/// an unreachable backend. `set_cache_writes_failing(true)` fails only the
/// message cache writes and leaves reads working.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    cache_writes_failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_cache_writes_failing(&self, failing: bool) {
        self.cache_writes_failing.store(failing, Ordering::SeqCst);
    }

    fn lock_for_cache_write(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.cache_writes_failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("message cache is read-only".to_string()));
        }
        self.lock()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store unavailable".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))
    }

    /// Number of cached message snapshots.
    pub fn message_count(&self) -> usize {
        self.inner.lock().map(|g| g.messages.len()).unwrap_or(0)
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.inner.lock().map(|g| g.events.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.kv.is_empty())
    }

    async fn touch_user(&self, profile: &UserProfile, now: i64) -> Result<()> {
        let mut g = self.lock()?;
        let u = g.user_mut(profile.user_id, now);
        u.username = profile.username.clone();
        u.name = profile.name.clone();
        u.last_seen = now;
        Ok(())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.lock()?.users.get(&user_id.0).cloned())
    }

    async fn mark_bot_user(&self, user_id: UserId, now: i64) -> Result<()> {
        let mut g = self.lock()?;
        let u = g.user_mut(user_id, now);
        u.bot_user = true;
        u.last_seen = now;
        Ok(())
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool, now: i64) -> Result<()> {
        let mut g = self.lock()?;
        g.user_mut(user_id, now).blocked = blocked;
        Ok(())
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.lock()?.users.len() as u64)
    }

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<UserRecord>> {
        let g = self.lock()?;
        let mut all = g.users.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(b.user_id.cmp(&a.user_id)));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_blocked_users(&self, limit: usize) -> Result<Vec<UserRecord>> {
        let g = self.lock()?;
        let mut all = g
            .users
            .values()
            .filter(|u| u.blocked)
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all.truncate(limit);
        Ok(all)
    }

    async fn list_bot_user_ids(&self) -> Result<Vec<UserId>> {
        Ok(self
            .lock()?
            .users
            .values()
            .filter(|u| u.bot_user && !u.blocked)
            .map(|u| UserId(u.user_id))
            .collect())
    }

    async fn paid_until(&self, user_id: UserId) -> Result<i64> {
        Ok(self
            .lock()?
            .subscriptions
            .get(&user_id.0)
            .map(|s| s.paid_until)
            .unwrap_or(0))
    }

    async fn set_paid_until(&self, user_id: UserId, until: i64, now: i64) -> Result<()> {
        let mut g = self.lock()?;
        let row = g
            .subscriptions
            .entry(user_id.0)
            .or_insert_with(|| SubscriptionRecord {
                user_id: user_id.0,
                paid_until: 0,
                created_at: now,
                updated_at: now,
            });
        row.paid_until = until;
        row.updated_at = now;
        Ok(())
    }

    async fn is_free_user(&self, user_id: UserId) -> Result<bool> {
        Ok(self.lock()?.free_users.contains_key(&user_id.0))
    }

    async fn set_free_user(&self, user_id: UserId, free: bool, now: i64) -> Result<()> {
        let mut g = self.lock()?;
        if free {
            g.free_users.entry(user_id.0).or_insert(now);
        } else {
            g.free_users.remove(&user_id.0);
        }
        Ok(())
    }

    async fn list_free_users(&self, limit: usize) -> Result<Vec<UserId>> {
        Ok(self
            .lock()?
            .free_users
            .keys()
            .take(limit)
            .map(|id| UserId(*id))
            .collect())
    }

    async fn get_connection(&self, cid: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        Ok(self.lock()?.connections.get(cid.as_str()).cloned())
    }

    async fn put_connection(
        &self,
        cid: &ConnectionId,
        owner: UserId,
        reset_notified: bool,
        now: i64,
    ) -> Result<()> {
        let mut g = self.lock()?;
        let row = g
            .connections
            .entry(cid.as_str().to_string())
            .or_insert_with(|| ConnectionRecord {
                connection_id: cid.as_str().to_string(),
                owner_user_id: owner.0,
                created_at: now,
                updated_at: now,
                notified: false,
            });
        row.owner_user_id = owner.0;
        row.updated_at = now;
        if reset_notified {
            row.notified = false;
        }
        Ok(())
    }

    async fn mark_connection_notified(&self, cid: &ConnectionId) -> Result<bool> {
        let mut g = self.lock()?;
        match g.connections.get_mut(cid.as_str()) {
            Some(row) if !row.notified => {
                row.notified = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_connections_for_owner(&self, owner: UserId) -> Result<u64> {
        Ok(self
            .lock()?
            .connections
            .values()
            .filter(|c| c.owner_user_id == owner.0)
            .count() as u64)
    }

    async fn add_owner_chat(&self, owner: UserId, chat_id: ChatId, now: i64) -> Result<bool> {
        let mut g = self.lock()?;
        Ok(g.owner_chats.insert((owner.0, chat_id.0), now).is_none())
    }

    async fn has_owner_chat(&self, owner: UserId, chat_id: ChatId) -> Result<bool> {
        Ok(self.lock()?.owner_chats.contains_key(&(owner.0, chat_id.0)))
    }

    async fn count_owner_chats(&self, owner: UserId) -> Result<u64> {
        Ok(self
            .lock()?
            .owner_chats
            .keys()
            .filter(|(o, _)| *o == owner.0)
            .count() as u64)
    }

    async fn pending_input(&self, user_id: UserId) -> Result<Option<PendingInput>> {
        Ok(self.lock()?.pending.get(&user_id.0).copied())
    }

    async fn set_pending_input(
        &self,
        user_id: UserId,
        pending: Option<PendingInput>,
        _now: i64,
    ) -> Result<()> {
        let mut g = self.lock()?;
        match pending {
            Some(p) => {
                g.pending.insert(user_id.0, p);
            }
            None => {
                g.pending.remove(&user_id.0);
            }
        }
        Ok(())
    }

    async fn log_event(&self, event: &EventRecord) -> Result<()> {
        self.lock()?.events.push(event.clone());
        Ok(())
    }

    async fn action_counts(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        let g = self.lock()?;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for e in &g.events {
            *counts.entry(e.action.as_str()).or_default() += 1;
        }
        let mut out = counts
            .into_iter()
            .map(|(a, c)| (a.to_string(), c))
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        out.truncate(limit);
        Ok(out)
    }

    async fn export_accounts(&self) -> Result<AccountSnapshot> {
        let g = self.lock()?;
        let mut kv = g
            .kv
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        kv.sort();
        Ok(AccountSnapshot {
            users: g.users.values().cloned().collect(),
            subscriptions: g.subscriptions.values().cloned().collect(),
            free_users: g
                .free_users
                .iter()
                .map(|(id, at)| FreeUserRecord {
                    user_id: *id,
                    created_at: *at,
                })
                .collect(),
            kv,
        })
    }

    async fn import_accounts(&self, snapshot: &AccountSnapshot) -> Result<()> {
        let mut g = self.lock()?;
        for u in &snapshot.users {
            g.users.insert(u.user_id, u.clone());
        }
        for s in &snapshot.subscriptions {
            g.subscriptions.insert(s.user_id, s.clone());
        }
        for f in &snapshot.free_users {
            g.free_users.insert(f.user_id, f.created_at);
        }
        for (k, v) in &snapshot.kv {
            g.kv.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn put_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        payload: &Value,
        now: i64,
    ) -> Result<()> {
        let mut g = self.lock_for_cache_write()?;
        let seq = g.next_seq();
        g.messages.insert(
            (chat_id.0, message_id.0),
            MessageRow {
                payload: payload.clone(),
                created_at: now,
                seq,
            },
        );
        Ok(())
    }

    async fn get_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<Option<Value>> {
        Ok(self
            .lock()?
            .messages
            .get(&(chat_id.0, message_id.0))
            .map(|r| r.payload.clone()))
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.lock_for_cache_write()?
            .messages
            .remove(&(chat_id.0, message_id.0));
        Ok(())
    }

    async fn messages_beyond(&self, chat_id: ChatId, keep: usize) -> Result<Vec<MessageId>> {
        let g = self.lock()?;
        let mut rows = g
            .messages
            .iter()
            .filter(|((c, _), _)| *c == chat_id.0)
            .map(|((_, m), row)| (row.created_at, row.seq, *m))
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(rows.into_iter().skip(keep).map(|r| MessageId(r.2)).collect())
    }

    async fn put_media(&self, media: &CachedMedia) -> Result<()> {
        let mut g = self.lock()?;
        let seq = g.next_seq();
        g.media.insert(
            (media.chat_id.0, media.message_id.0),
            MediaRow {
                media: media.clone(),
                seq,
            },
        );
        Ok(())
    }

    async fn get_media(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<CachedMedia>> {
        Ok(self
            .lock()?
            .media
            .get(&(chat_id.0, message_id.0))
            .map(|r| r.media.clone()))
    }

    async fn delete_media(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.lock_for_cache_write()?
            .media
            .remove(&(chat_id.0, message_id.0));
        Ok(())
    }

    async fn media_beyond(&self, keep: usize) -> Result<Vec<CachedMedia>> {
        let g = self.lock()?;
        let mut rows = g.media.values().collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.media
                .created_at
                .cmp(&a.media.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(rows.into_iter().skip(keep).map(|r| r.media.clone()).collect())
    }

    async fn forwarded_exists(
        &self,
        recipient: UserId,
        message_id: MessageId,
        tag: &str,
    ) -> Result<bool> {
        Ok(self
            .lock()?
            .forwarded
            .contains(&(recipient.0, message_id.0, tag.to_string())))
    }

    async fn set_forwarded(
        &self,
        recipient: UserId,
        message_id: MessageId,
        tag: &str,
        _now: i64,
    ) -> Result<()> {
        self.lock()?
            .forwarded
            .insert((recipient.0, message_id.0, tag.to_string()));
        Ok(())
    }

    async fn clear(&self) -> Result<ClearedRows> {
        let mut g = self.lock()?;
        let counts = ClearedRows {
            messages: g.messages.len() as u64,
            media: g.media.len() as u64,
            forwarded: g.forwarded.len() as u64,
        };
        g.messages.clear();
        g.media.clear();
        g.forwarded.clear();
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_keeps_flags() {
        let s = MemoryStore::new();
        s.mark_bot_user(UserId(1), 10).await.unwrap();
        s.set_blocked(UserId(1), true, 10).await.unwrap();
        s.touch_user(
            &UserProfile {
                user_id: UserId(1),
                username: Some("a".into()),
                name: None,
            },
            20,
        )
        .await
        .unwrap();
        let u = s.get_user(UserId(1)).await.unwrap().unwrap();
        assert!(u.blocked && u.bot_user);
        assert_eq!(u.first_seen, 10);
        assert_eq!(u.last_seen, 20);
        assert!(s.list_bot_user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notified_flag_is_check_and_set() {
        let s = MemoryStore::new();
        let cid = ConnectionId("c".into());
        assert!(!s.mark_connection_notified(&cid).await.unwrap());
        s.put_connection(&cid, UserId(1), false, 0).await.unwrap();
        assert!(s.mark_connection_notified(&cid).await.unwrap());
        assert!(!s.mark_connection_notified(&cid).await.unwrap());
        s.put_connection(&cid, UserId(1), false, 1).await.unwrap();
        assert!(!s.mark_connection_notified(&cid).await.unwrap());
        s.put_connection(&cid, UserId(2), true, 2).await.unwrap();
        assert!(s.mark_connection_notified(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn same_second_writes_evict_oldest_insert_first() {
        let s = MemoryStore::new();
        for mid in 1..=4 {
            s.put_message(ChatId(7), MessageId(mid), &Value::Null, 100)
                .await
                .unwrap();
        }
        let beyond = s.messages_beyond(ChatId(7), 2).await.unwrap();
        assert_eq!(beyond, vec![MessageId(2), MessageId(1)]);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let s = MemoryStore::new();
        s.set_unavailable(true);
        assert!(s.paid_until(UserId(1)).await.is_err());
        s.set_unavailable(false);
        assert_eq!(s.paid_until(UserId(1)).await.unwrap(), 0);
    }
}
