//! SQLite adapter (rusqlite + r2d2).
//!
//! Implements both storage contracts of `bwatch-core`. Every call borrows a
//! pooled connection on the blocking thread pool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use bwatch_core::{
    domain::{ChatId, ConnectionId, MediaKind, MessageId, UserId},
    errors::Error,
    store::{
        AccountSnapshot, AccountStore, CacheStore, CachedMedia, ClearedRows, ConnectionRecord,
        EventRecord, FreeUserRecord, PendingInput, SubscriptionRecord, UserProfile, UserRecord,
    },
    Result,
};

pub mod schema;

pub type DbPool = Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;";

fn storage_err(e: impl std::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open (or create) the database file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        let manager =
            SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(storage_err)?;
        Self::with_pool(pool)
    }

    /// Private in-memory database; one connection so every call sees the same data.
    pub fn in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(storage_err)?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: DbPool) -> Result<Self> {
        let conn = pool.get().map_err(storage_err)?;
        schema::migrate(&conn).map_err(storage_err)?;
        drop(conn);
        Ok(Self { pool })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(storage_err)?;
            f(&conn).map_err(storage_err)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {e}")))?
    }
}

fn user_row(r: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: r.get(0)?,
        username: r.get(1)?,
        name: r.get(2)?,
        first_seen: r.get(3)?,
        last_seen: r.get(4)?,
        blocked: r.get(5)?,
        bot_user: r.get(6)?,
    })
}

const USER_COLUMNS: &str = "user_id, username, name, first_seen, last_seen, blocked, bot_user";

fn media_row(r: &Row<'_>) -> rusqlite::Result<Option<CachedMedia>> {
    let kind: String = r.get(2)?;
    let Some(kind) = MediaKind::parse(&kind) else {
        return Ok(None);
    };
    let path: String = r.get(3)?;
    Ok(Some(CachedMedia {
        chat_id: ChatId(r.get(0)?),
        message_id: MessageId(r.get(1)?),
        kind,
        path: PathBuf::from(path),
        created_at: r.get(4)?,
    }))
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.run(move |c| {
            c.query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))
                .optional()
        })
        .await
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |c| {
            c.execute(
                "INSERT INTO kv(key, value) VALUES(?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn kv_is_empty(&self) -> Result<bool> {
        self.run(|c| c.query_row("SELECT NOT EXISTS(SELECT 1 FROM kv)", [], |r| r.get(0)))
            .await
    }

    async fn touch_user(&self, profile: &UserProfile, now: i64) -> Result<()> {
        let p = profile.clone();
        self.run(move |c| {
            c.execute(
                "INSERT INTO users(user_id, username, name, first_seen, last_seen)
                 VALUES(?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   username = excluded.username,
                   name = excluded.name,
                   last_seen = excluded.last_seen",
                params![p.user_id.0, p.username, p.name, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        self.run(move |c| {
            c.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                [user_id.0],
                user_row,
            )
            .optional()
        })
        .await
    }

    async fn mark_bot_user(&self, user_id: UserId, now: i64) -> Result<()> {
        self.run(move |c| {
            c.execute(
                "INSERT INTO users(user_id, first_seen, last_seen, bot_user) VALUES(?1, ?2, ?2, 1)
                 ON CONFLICT(user_id) DO UPDATE SET bot_user = 1, last_seen = excluded.last_seen",
                params![user_id.0, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool, now: i64) -> Result<()> {
        self.run(move |c| {
            c.execute(
                "INSERT INTO users(user_id, first_seen, last_seen, blocked) VALUES(?1, ?2, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET blocked = excluded.blocked",
                params![user_id.0, now, blocked],
            )
            .map(|_| ())
        })
        .await
    }

    async fn count_users(&self) -> Result<u64> {
        self.run(|c| c.query_row("SELECT COUNT(*) FROM users", [], |r| r.get::<_, i64>(0)))
            .await
            .map(|n| n.max(0) as u64)
    }

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<UserRecord>> {
        self.run(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 ORDER BY last_seen DESC, user_id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], user_row)?;
            rows.collect()
        })
        .await
    }

    async fn list_blocked_users(&self, limit: usize) -> Result<Vec<UserRecord>> {
        self.run(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE blocked = 1
                 ORDER BY last_seen DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map([limit as i64], user_row)?;
            rows.collect()
        })
        .await
    }

    async fn list_bot_user_ids(&self) -> Result<Vec<UserId>> {
        self.run(|c| {
            let mut stmt = c.prepare(
                "SELECT user_id FROM users WHERE bot_user = 1 AND blocked = 0 ORDER BY user_id",
            )?;
            let rows = stmt.query_map([], |r| r.get(0).map(UserId))?;
            rows.collect()
        })
        .await
    }

    async fn paid_until(&self, user_id: UserId) -> Result<i64> {
        self.run(move |c| {
            c.query_row(
                "SELECT paid_until FROM subscriptions WHERE user_id = ?1",
                [user_id.0],
                |r| r.get(0),
            )
            .optional()
        })
        .await
        .map(|v| v.unwrap_or(0))
    }

    async fn set_paid_until(&self, user_id: UserId, until: i64, now: i64) -> Result<()> {
        self.run(move |c| {
            c.execute(
                "INSERT INTO subscriptions(user_id, paid_until, created_at, updated_at)
                 VALUES(?1, ?2, ?3, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                   paid_until = excluded.paid_until,
                   updated_at = excluded.updated_at",
                params![user_id.0, until, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn is_free_user(&self, user_id: UserId) -> Result<bool> {
        self.run(move |c| {
            c.query_row(
                "SELECT 1 FROM free_users WHERE user_id = ?1",
                [user_id.0],
                |_| Ok(()),
            )
            .optional()
            .map(|v| v.is_some())
        })
        .await
    }

    async fn set_free_user(&self, user_id: UserId, free: bool, now: i64) -> Result<()> {
        self.run(move |c| {
            if free {
                c.execute(
                    "INSERT OR IGNORE INTO free_users(user_id, created_at) VALUES(?1, ?2)",
                    params![user_id.0, now],
                )?;
            } else {
                c.execute("DELETE FROM free_users WHERE user_id = ?1", [user_id.0])?;
            }
            Ok(())
        })
        .await
    }

    async fn list_free_users(&self, limit: usize) -> Result<Vec<UserId>> {
        self.run(move |c| {
            let mut stmt =
                c.prepare("SELECT user_id FROM free_users ORDER BY user_id LIMIT ?1")?;
            let rows = stmt.query_map([limit as i64], |r| r.get(0).map(UserId))?;
            rows.collect()
        })
        .await
    }

    async fn get_connection(&self, cid: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        let cid = cid.as_str().to_string();
        self.run(move |c| {
            c.query_row(
                "SELECT connection_id, owner_user_id, created_at, updated_at, notified
                 FROM business_connections WHERE connection_id = ?1",
                [cid],
                |r| {
                    Ok(ConnectionRecord {
                        connection_id: r.get(0)?,
                        owner_user_id: r.get(1)?,
                        created_at: r.get(2)?,
                        updated_at: r.get(3)?,
                        notified: r.get(4)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn put_connection(
        &self,
        cid: &ConnectionId,
        owner: UserId,
        reset_notified: bool,
        now: i64,
    ) -> Result<()> {
        let cid = cid.as_str().to_string();
        self.run(move |c| {
            c.execute(
                "INSERT INTO business_connections(connection_id, owner_user_id, created_at, updated_at, notified)
                 VALUES(?1, ?2, ?3, ?3, 0)
                 ON CONFLICT(connection_id) DO UPDATE SET
                   owner_user_id = excluded.owner_user_id,
                   updated_at = excluded.updated_at,
                   notified = CASE WHEN ?4 THEN 0 ELSE notified END",
                params![cid, owner.0, now, reset_notified],
            )
            .map(|_| ())
        })
        .await
    }

    async fn mark_connection_notified(&self, cid: &ConnectionId) -> Result<bool> {
        let cid = cid.as_str().to_string();
        self.run(move |c| {
            c.execute(
                "UPDATE business_connections SET notified = 1
                 WHERE connection_id = ?1 AND notified = 0",
                [cid],
            )
            .map(|n| n == 1)
        })
        .await
    }

    async fn count_connections_for_owner(&self, owner: UserId) -> Result<u64> {
        self.run(move |c| {
            c.query_row(
                "SELECT COUNT(*) FROM business_connections WHERE owner_user_id = ?1",
                [owner.0],
                |r| r.get::<_, i64>(0),
            )
        })
        .await
        .map(|n| n.max(0) as u64)
    }

    async fn add_owner_chat(&self, owner: UserId, chat_id: ChatId, now: i64) -> Result<bool> {
        self.run(move |c| {
            c.execute(
                "INSERT OR IGNORE INTO owner_chats(owner_user_id, chat_id, created_at)
                 VALUES(?1, ?2, ?3)",
                params![owner.0, chat_id.0, now],
            )
            .map(|n| n > 0)
        })
        .await
    }

    async fn has_owner_chat(&self, owner: UserId, chat_id: ChatId) -> Result<bool> {
        self.run(move |c| {
            c.query_row(
                "SELECT 1 FROM owner_chats WHERE owner_user_id = ?1 AND chat_id = ?2",
                params![owner.0, chat_id.0],
                |_| Ok(()),
            )
            .optional()
            .map(|v| v.is_some())
        })
        .await
    }

    async fn count_owner_chats(&self, owner: UserId) -> Result<u64> {
        self.run(move |c| {
            c.query_row(
                "SELECT COUNT(*) FROM owner_chats WHERE owner_user_id = ?1",
                [owner.0],
                |r| r.get::<_, i64>(0),
            )
        })
        .await
        .map(|n| n.max(0) as u64)
    }

    async fn pending_input(&self, user_id: UserId) -> Result<Option<PendingInput>> {
        let kind: Option<String> = self
            .run(move |c| {
                c.query_row(
                    "SELECT kind FROM pending_inputs WHERE user_id = ?1",
                    [user_id.0],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        Ok(kind.as_deref().and_then(PendingInput::parse))
    }

    async fn set_pending_input(
        &self,
        user_id: UserId,
        pending: Option<PendingInput>,
        now: i64,
    ) -> Result<()> {
        self.run(move |c| {
            match pending {
                Some(p) => c.execute(
                    "INSERT OR REPLACE INTO pending_inputs(user_id, kind, created_at)
                     VALUES(?1, ?2, ?3)",
                    params![user_id.0, p.as_str(), now],
                )?,
                None => c.execute("DELETE FROM pending_inputs WHERE user_id = ?1", [user_id.0])?,
            };
            Ok(())
        })
        .await
    }

    async fn log_event(&self, event: &EventRecord) -> Result<()> {
        let e = event.clone();
        self.run(move |c| {
            c.execute(
                "INSERT INTO events(user_id, action, chat_id, message_id, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![e.user_id, e.action, e.chat_id, e.message_id, e.created_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn action_counts(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        self.run(move |c| {
            let mut stmt = c.prepare(
                "SELECT action, COUNT(*) AS n FROM events GROUP BY action
                 ORDER BY n DESC, action ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?.max(0) as u64))
            })?;
            rows.collect()
        })
        .await
    }

    async fn export_accounts(&self) -> Result<AccountSnapshot> {
        self.run(|c| {
            let users = {
                let mut stmt = c.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY user_id"))?;
                let rows = stmt.query_map([], user_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let subscriptions = {
                let mut stmt = c.prepare(
                    "SELECT user_id, paid_until, created_at, updated_at FROM subscriptions ORDER BY user_id",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok(SubscriptionRecord {
                        user_id: r.get(0)?,
                        paid_until: r.get(1)?,
                        created_at: r.get(2)?,
                        updated_at: r.get(3)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let free_users = {
                let mut stmt = c.prepare("SELECT user_id, created_at FROM free_users ORDER BY user_id")?;
                let rows = stmt.query_map([], |r| {
                    Ok(FreeUserRecord {
                        user_id: r.get(0)?,
                        created_at: r.get(1)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let kv = {
                let mut stmt = c.prepare("SELECT key, value FROM kv ORDER BY key")?;
                let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            Ok(AccountSnapshot {
                users,
                subscriptions,
                free_users,
                kv,
            })
        })
        .await
    }

    async fn import_accounts(&self, snapshot: &AccountSnapshot) -> Result<()> {
        let s = snapshot.clone();
        self.run(move |c| {
            let tx = c.unchecked_transaction()?;
            for u in &s.users {
                tx.execute(
                    &format!("INSERT OR REPLACE INTO users({USER_COLUMNS}) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                    params![u.user_id, u.username, u.name, u.first_seen, u.last_seen, u.blocked, u.bot_user],
                )?;
            }
            for sub in &s.subscriptions {
                tx.execute(
                    "INSERT OR REPLACE INTO subscriptions(user_id, paid_until, created_at, updated_at)
                     VALUES(?1, ?2, ?3, ?4)",
                    params![sub.user_id, sub.paid_until, sub.created_at, sub.updated_at],
                )?;
            }
            for f in &s.free_users {
                tx.execute(
                    "INSERT OR REPLACE INTO free_users(user_id, created_at) VALUES(?1, ?2)",
                    params![f.user_id, f.created_at],
                )?;
            }
            for (k, v) in &s.kv {
                tx.execute(
                    "INSERT OR REPLACE INTO kv(key, value) VALUES(?1, ?2)",
                    params![k, v],
                )?;
            }
            tx.commit()
        })
        .await
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn put_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        payload: &Value,
        now: i64,
    ) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        self.run(move |c| {
            c.execute(
                "INSERT OR REPLACE INTO messages(chat_id, message_id, payload_json, created_at)
                 VALUES(?1, ?2, ?3, ?4)",
                params![chat_id.0, message_id.0, json, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .run(move |c| {
                c.query_row(
                    "SELECT payload_json FROM messages WHERE chat_id = ?1 AND message_id = ?2",
                    params![chat_id.0, message_id.0],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.run(move |c| {
            c.execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id.0, message_id.0],
            )
            .map(|_| ())
        })
        .await
    }

    async fn messages_beyond(&self, chat_id: ChatId, keep: usize) -> Result<Vec<MessageId>> {
        self.run(move |c| {
            let mut stmt = c.prepare(
                "SELECT message_id FROM messages WHERE chat_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT -1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![chat_id.0, keep as i64], |r| {
                r.get(0).map(MessageId)
            })?;
            rows.collect()
        })
        .await
    }

    async fn put_media(&self, media: &CachedMedia) -> Result<()> {
        let m = media.clone();
        self.run(move |c| {
            c.execute(
                "INSERT OR REPLACE INTO media(chat_id, message_id, kind, path, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    m.chat_id.0,
                    m.message_id.0,
                    m.kind.as_str(),
                    m.path.to_string_lossy().into_owned(),
                    m.created_at
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_media(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<CachedMedia>> {
        self.run(move |c| {
            c.query_row(
                "SELECT chat_id, message_id, kind, path, created_at FROM media
                 WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id.0, message_id.0],
                media_row,
            )
            .optional()
            .map(Option::flatten)
        })
        .await
    }

    async fn delete_media(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.run(move |c| {
            c.execute(
                "DELETE FROM media WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id.0, message_id.0],
            )
            .map(|_| ())
        })
        .await
    }

    async fn media_beyond(&self, keep: usize) -> Result<Vec<CachedMedia>> {
        self.run(move |c| {
            let mut stmt = c.prepare(
                "SELECT chat_id, message_id, kind, path, created_at FROM media
                 ORDER BY created_at DESC, rowid DESC LIMIT -1 OFFSET ?1",
            )?;
            let rows = stmt.query_map([keep as i64], media_row)?;
            let mut out = Vec::new();
            for row in rows {
                if let Some(m) = row? {
                    out.push(m);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn forwarded_exists(
        &self,
        recipient: UserId,
        message_id: MessageId,
        tag: &str,
    ) -> Result<bool> {
        let tag = tag.to_string();
        self.run(move |c| {
            c.query_row(
                "SELECT 1 FROM forwarded WHERE recipient_id = ?1 AND message_id = ?2 AND tag = ?3",
                params![recipient.0, message_id.0, tag],
                |_| Ok(()),
            )
            .optional()
            .map(|v| v.is_some())
        })
        .await
    }

    async fn set_forwarded(
        &self,
        recipient: UserId,
        message_id: MessageId,
        tag: &str,
        now: i64,
    ) -> Result<()> {
        let tag = tag.to_string();
        self.run(move |c| {
            c.execute(
                "INSERT OR IGNORE INTO forwarded(recipient_id, message_id, tag, created_at)
                 VALUES(?1, ?2, ?3, ?4)",
                params![recipient.0, message_id.0, tag, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn clear(&self) -> Result<ClearedRows> {
        self.run(|c| {
            let tx = c.unchecked_transaction()?;
            let messages = tx.execute("DELETE FROM messages", [])? as u64;
            let media = tx.execute("DELETE FROM media", [])? as u64;
            let forwarded = tx.execute("DELETE FROM forwarded", [])? as u64;
            tx.commit()?;
            Ok(ClearedRows {
                messages,
                media,
                forwarded,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    #[tokio::test]
    async fn touch_keeps_flags() {
        let s = store();
        s.mark_bot_user(UserId(5), 10).await.unwrap();
        s.set_blocked(UserId(5), true, 11).await.unwrap();
        s.touch_user(
            &UserProfile {
                user_id: UserId(5),
                username: Some("ann".into()),
                name: Some("Ann".into()),
            },
            12,
        )
        .await
        .unwrap();

        let u = s.get_user(UserId(5)).await.unwrap().unwrap();
        assert!(u.blocked && u.bot_user);
        assert_eq!(u.username.as_deref(), Some("ann"));
        assert_eq!((u.first_seen, u.last_seen), (10, 12));
        assert!(s.list_bot_user_ids().await.unwrap().is_empty());
        assert_eq!(s.list_blocked_users(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connection_notice_flag_flips_once() {
        let s = store();
        let cid = ConnectionId("c1".into());
        assert!(!s.mark_connection_notified(&cid).await.unwrap());

        s.put_connection(&cid, UserId(1), false, 1).await.unwrap();
        assert!(s.mark_connection_notified(&cid).await.unwrap());
        assert!(!s.mark_connection_notified(&cid).await.unwrap());

        // Re-pointing without reset keeps the flag; with reset clears it.
        s.put_connection(&cid, UserId(2), false, 2).await.unwrap();
        assert!(s.get_connection(&cid).await.unwrap().unwrap().notified);
        s.put_connection(&cid, UserId(3), true, 3).await.unwrap();
        let row = s.get_connection(&cid).await.unwrap().unwrap();
        assert_eq!(row.owner_user_id, 3);
        assert!(!row.notified);
        assert_eq!(row.created_at, 1);
        assert_eq!(s.count_connections_for_owner(UserId(3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn owner_chat_insert_reports_novelty() {
        let s = store();
        assert!(s.add_owner_chat(UserId(1), ChatId(9), 1).await.unwrap());
        assert!(!s.add_owner_chat(UserId(1), ChatId(9), 2).await.unwrap());
        assert!(s.has_owner_chat(UserId(1), ChatId(9)).await.unwrap());
        assert!(!s.has_owner_chat(UserId(9), ChatId(1)).await.unwrap());
        assert_eq!(s.count_owner_chats(UserId(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_input_replaces_and_clears() {
        let s = store();
        s.set_pending_input(UserId(1), Some(PendingInput::Support), 1)
            .await
            .unwrap();
        s.set_pending_input(UserId(1), Some(PendingInput::Broadcast), 2)
            .await
            .unwrap();
        assert_eq!(
            s.pending_input(UserId(1)).await.unwrap(),
            Some(PendingInput::Broadcast)
        );
        s.set_pending_input(UserId(1), None, 3).await.unwrap();
        assert_eq!(s.pending_input(UserId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn eviction_order_is_newest_first_with_insert_tiebreak() {
        let s = store();
        let chat = ChatId(7);
        for (mid, at) in [(1, 100), (2, 100), (3, 50), (4, 200)] {
            s.put_message(chat, MessageId(mid), &json!({"message_id": mid}), at)
                .await
                .unwrap();
        }
        let beyond = s.messages_beyond(chat, 2).await.unwrap();
        assert_eq!(beyond, vec![MessageId(1), MessageId(3)]);
        assert!(s.messages_beyond(chat, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn media_rows_and_forward_tags() {
        let s = store();
        for (mid, at) in [(1, 10), (2, 20)] {
            s.put_media(&CachedMedia {
                chat_id: ChatId(7),
                message_id: MessageId(mid),
                kind: MediaKind::Photo,
                path: PathBuf::from(format!("/tmp/m{mid}")),
                created_at: at,
            })
            .await
            .unwrap();
        }
        let old = s.media_beyond(1).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].message_id, MessageId(1));
        assert_eq!(
            s.get_media(ChatId(7), MessageId(2)).await.unwrap().unwrap().path,
            PathBuf::from("/tmp/m2")
        );

        assert!(!s.forwarded_exists(UserId(1), MessageId(2), "ephemeral").await.unwrap());
        s.set_forwarded(UserId(1), MessageId(2), "ephemeral", 1).await.unwrap();
        s.set_forwarded(UserId(1), MessageId(2), "ephemeral", 2).await.unwrap();
        assert!(s.forwarded_exists(UserId(1), MessageId(2), "ephemeral").await.unwrap());

        let cleared = s.clear().await.unwrap();
        assert_eq!(
            cleared,
            ClearedRows {
                messages: 0,
                media: 2,
                forwarded: 1
            }
        );
    }

    #[tokio::test]
    async fn action_counts_rank_by_frequency() {
        let s = store();
        for action in ["edit", "delete", "edit", "start", "edit", "delete"] {
            s.log_event(&EventRecord {
                user_id: Some(1),
                action: action.to_string(),
                chat_id: None,
                message_id: None,
                created_at: 1,
            })
            .await
            .unwrap();
        }
        let counts = s.action_counts(2).await.unwrap();
        assert_eq!(
            counts,
            vec![("edit".to_string(), 3), ("delete".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn export_then_import_into_empty_store() {
        let src = store();
        src.kv_set("paid_mode", "1").await.unwrap();
        src.mark_bot_user(UserId(5), 1).await.unwrap();
        src.set_paid_until(UserId(5), 999, 1).await.unwrap();
        src.set_free_user(UserId(6), true, 1).await.unwrap();

        let snap = src.export_accounts().await.unwrap();
        let dst = store();
        assert!(dst.kv_is_empty().await.unwrap());
        dst.import_accounts(&snap).await.unwrap();
        assert!(!dst.kv_is_empty().await.unwrap());

        assert_eq!(dst.kv_get("paid_mode").await.unwrap().as_deref(), Some("1"));
        assert_eq!(dst.paid_until(UserId(5)).await.unwrap(), 999);
        assert!(dst.is_free_user(UserId(6)).await.unwrap());
        assert_eq!(dst.export_accounts().await.unwrap(), snap);
    }
}
