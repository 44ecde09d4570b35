//! Firebase Realtime Database adapter (REST).
//!
//! Account state is kept as plain JSON nodes addressed by path, e.g.
//! `users/<id>`. Updates are read-modify-write; there is no transaction.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

use bwatch_core::{
    domain::{ChatId, ConnectionId, UserId},
    errors::Error,
    store::{
        AccountSnapshot, AccountStore, ConnectionRecord, EventRecord, FreeUserRecord,
        PendingInput, SubscriptionRecord, UserProfile, UserRecord,
    },
    Result,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct RtdbStore {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl RtdbStore {
    pub fn new(url: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Remote(format!("rtdb client build failed: {e}")))?;
        Ok(Self {
            http,
            base: url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        debug!(%method, path, "rtdb request");
        let mut req = self.http.request(method.clone(), node_url(&self.base, path));
        if let Some(t) = &self.token {
            req = req.query(&[("auth", t)]);
        }
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Remote(format!("rtdb {method} {path}: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Remote(format!("rtdb {method} {path}: {e}")))?;
        if !status.is_success() {
            return Err(Error::Remote(format!(
                "rtdb {method} {path} failed: {status} {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Remote(format!("rtdb {method} {path}: bad json: {e}")))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    async fn put(&self, path: &str, value: &Value) -> Result<()> {
        self.request(Method::PUT, path, Some(value)).await.map(|_| ())
    }

    async fn patch(&self, path: &str, value: &Value) -> Result<()> {
        self.request(Method::PATCH, path, Some(value)).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.request(Method::DELETE, path, None).await.map(|_| ())
    }

    async fn load_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let v = self.get(&format!("users/{}", user_id.0)).await?;
        Ok(parse_user(&user_id.0.to_string(), &v))
    }

    /// Read the user node (or start a fresh one), apply `f`, write it back.
    async fn update_user(
        &self,
        user_id: UserId,
        now: i64,
        f: impl FnOnce(&mut UserRecord) + Send,
    ) -> Result<()> {
        let mut user = self.load_user(user_id).await?.unwrap_or(UserRecord {
            user_id: user_id.0,
            username: None,
            name: None,
            first_seen: now,
            last_seen: now,
            blocked: false,
            bot_user: false,
        });
        f(&mut user);
        self.put(&format!("users/{}", user_id.0), &serde_json::to_value(&user)?)
            .await
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        let v = self.get("users").await?;
        Ok(children(&v)
            .into_iter()
            .filter_map(|(k, v)| parse_user(&k, v))
            .collect())
    }

    async fn all_connections(&self) -> Result<Vec<ConnectionRecord>> {
        let v = self.get("business_connections").await?;
        Ok(children(&v)
            .into_iter()
            .filter_map(|(k, v)| parse_connection(&k, v))
            .collect())
    }
}

/// `{base}/{path}.json`; leading and trailing slashes on `path` are ignored.
pub fn node_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}.json",
        base.trim_end_matches('/'),
        path.trim_matches('/')
    )
}

/// Firebase keys may not contain `.`, `#`, `$`, `[`, `]` or `/`.
pub fn key_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '.' | '#' | '$' | '[' | ']' | '/' => format!("_{:02X}", c as u32),
            c => c.to_string(),
        })
        .collect()
}

/// Child nodes of a collection.
///
/// Collections with small integer keys may come back as JSON arrays with
/// `null` holes; both shapes are accepted.
pub fn children(v: &Value) -> Vec<(String, &Value)> {
    match v {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    }
}

fn int_field(v: &Value, key: &str) -> Option<i64> {
    match v.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Flags were historically written as 0/1 integers.
fn flag_field(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Scalars are stored as strings but older writers used numbers.
pub fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

pub fn parse_user(key: &str, v: &Value) -> Option<UserRecord> {
    if !v.is_object() {
        return None;
    }
    let user_id = int_field(v, "user_id").or_else(|| key.parse().ok())?;
    Some(UserRecord {
        user_id,
        username: str_field(v, "username"),
        name: str_field(v, "name"),
        first_seen: int_field(v, "first_seen").unwrap_or(0),
        last_seen: int_field(v, "last_seen").unwrap_or(0),
        blocked: flag_field(v, "blocked"),
        bot_user: flag_field(v, "bot_user"),
    })
}

fn parse_subscription(key: &str, v: &Value) -> Option<SubscriptionRecord> {
    let user_id = int_field(v, "user_id").or_else(|| key.parse().ok())?;
    Some(SubscriptionRecord {
        user_id,
        paid_until: int_field(v, "paid_until")?,
        created_at: int_field(v, "created_at").unwrap_or(0),
        updated_at: int_field(v, "updated_at").unwrap_or(0),
    })
}

fn parse_connection(key: &str, v: &Value) -> Option<ConnectionRecord> {
    Some(ConnectionRecord {
        connection_id: str_field(v, "connection_id").unwrap_or_else(|| key.to_string()),
        owner_user_id: int_field(v, "owner_user_id")?,
        created_at: int_field(v, "created_at").unwrap_or(0),
        updated_at: int_field(v, "updated_at").unwrap_or(0),
        notified: flag_field(v, "notified"),
    })
}

/// Most frequent first, ties by name.
pub fn rank_actions(events: &Value, limit: usize) -> Vec<(String, u64)> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for (_, e) in children(events) {
        if let Some(action) = str_field(e, "action") {
            *counts.entry(action).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

fn sort_recent_first(users: &mut [UserRecord]) {
    users.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| b.user_id.cmp(&a.user_id))
    });
}

#[async_trait]
impl AccountStore for RtdbStore {
    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let v = self.get(&format!("kv/{}", key_segment(key))).await?;
        Ok(scalar_text(&v))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.put(&format!("kv/{}", key_segment(key)), &json!(value))
            .await
    }

    async fn kv_is_empty(&self) -> Result<bool> {
        let v = self.get("kv").await?;
        Ok(children(&v).is_empty())
    }

    async fn touch_user(&self, profile: &UserProfile, now: i64) -> Result<()> {
        let username = profile.username.clone();
        let name = profile.name.clone();
        self.update_user(profile.user_id, now, move |u| {
            u.username = username;
            u.name = name;
            u.last_seen = now;
        })
        .await
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        self.load_user(user_id).await
    }

    async fn mark_bot_user(&self, user_id: UserId, now: i64) -> Result<()> {
        self.update_user(user_id, now, move |u| {
            u.bot_user = true;
            u.last_seen = now;
        })
        .await
    }

    async fn set_blocked(&self, user_id: UserId, blocked: bool, now: i64) -> Result<()> {
        self.update_user(user_id, now, move |u| u.blocked = blocked)
            .await
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.all_users().await?.len() as u64)
    }

    async fn list_users(&self, limit: usize, offset: usize) -> Result<Vec<UserRecord>> {
        let mut users = self.all_users().await?;
        sort_recent_first(&mut users);
        Ok(users.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_blocked_users(&self, limit: usize) -> Result<Vec<UserRecord>> {
        let mut users: Vec<UserRecord> = self
            .all_users()
            .await?
            .into_iter()
            .filter(|u| u.blocked)
            .collect();
        sort_recent_first(&mut users);
        users.truncate(limit);
        Ok(users)
    }

    async fn list_bot_user_ids(&self) -> Result<Vec<UserId>> {
        let mut ids: Vec<UserId> = self
            .all_users()
            .await?
            .into_iter()
            .filter(|u| u.bot_user && !u.blocked)
            .map(|u| UserId(u.user_id))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn paid_until(&self, user_id: UserId) -> Result<i64> {
        let v = self.get(&format!("subscriptions/{}", user_id.0)).await?;
        Ok(int_field(&v, "paid_until").unwrap_or(0))
    }

    async fn set_paid_until(&self, user_id: UserId, until: i64, now: i64) -> Result<()> {
        let path = format!("subscriptions/{}", user_id.0);
        let prev = self.get(&path).await?;
        let record = SubscriptionRecord {
            user_id: user_id.0,
            paid_until: until,
            created_at: int_field(&prev, "created_at").unwrap_or(now),
            updated_at: now,
        };
        self.put(&path, &serde_json::to_value(&record)?).await
    }

    async fn is_free_user(&self, user_id: UserId) -> Result<bool> {
        let v = self.get(&format!("free_users/{}", user_id.0)).await?;
        Ok(!v.is_null())
    }

    async fn set_free_user(&self, user_id: UserId, free: bool, now: i64) -> Result<()> {
        let path = format!("free_users/{}", user_id.0);
        if !free {
            return self.delete(&path).await;
        }
        if !self.get(&path).await?.is_null() {
            return Ok(());
        }
        let record = FreeUserRecord {
            user_id: user_id.0,
            created_at: now,
        };
        self.put(&path, &serde_json::to_value(&record)?).await
    }

    async fn list_free_users(&self, limit: usize) -> Result<Vec<UserId>> {
        let v = self.get("free_users").await?;
        let mut ids: Vec<UserId> = children(&v)
            .into_iter()
            .filter_map(|(k, v)| int_field(v, "user_id").or_else(|| k.parse().ok()))
            .map(UserId)
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn get_connection(&self, cid: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        let key = key_segment(cid.as_str());
        let v = self.get(&format!("business_connections/{key}")).await?;
        Ok(parse_connection(cid.as_str(), &v))
    }

    async fn put_connection(
        &self,
        cid: &ConnectionId,
        owner: UserId,
        reset_notified: bool,
        now: i64,
    ) -> Result<()> {
        let prev = self.get_connection(cid).await?;
        let record = ConnectionRecord {
            connection_id: cid.as_str().to_string(),
            owner_user_id: owner.0,
            created_at: prev.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
            notified: !reset_notified && prev.is_some_and(|p| p.notified),
        };
        let key = key_segment(cid.as_str());
        self.put(
            &format!("business_connections/{key}"),
            &serde_json::to_value(&record)?,
        )
        .await
    }

    async fn mark_connection_notified(&self, cid: &ConnectionId) -> Result<bool> {
        // Not atomic: two racing pollers could both see `false`.
        match self.get_connection(cid).await? {
            Some(c) if !c.notified => {
                let key = key_segment(cid.as_str());
                self.put(
                    &format!("business_connections/{key}/notified"),
                    &json!(true),
                )
                .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_connections_for_owner(&self, owner: UserId) -> Result<u64> {
        Ok(self
            .all_connections()
            .await?
            .iter()
            .filter(|c| c.owner_user_id == owner.0)
            .count() as u64)
    }

    async fn add_owner_chat(&self, owner: UserId, chat_id: ChatId, now: i64) -> Result<bool> {
        let path = format!("owner_chats/{}/{}", owner.0, chat_id.0);
        if !self.get(&path).await?.is_null() {
            return Ok(false);
        }
        self.put(&path, &json!({ "created_at": now })).await?;
        Ok(true)
    }

    async fn has_owner_chat(&self, owner: UserId, chat_id: ChatId) -> Result<bool> {
        let v = self
            .get(&format!("owner_chats/{}/{}", owner.0, chat_id.0))
            .await?;
        Ok(!v.is_null())
    }

    async fn count_owner_chats(&self, owner: UserId) -> Result<u64> {
        let v = self.get(&format!("owner_chats/{}", owner.0)).await?;
        Ok(children(&v).len() as u64)
    }

    async fn pending_input(&self, user_id: UserId) -> Result<Option<PendingInput>> {
        let v = self.get(&format!("pending_inputs/{}", user_id.0)).await?;
        Ok(str_field(&v, "kind").as_deref().and_then(PendingInput::parse))
    }

    async fn set_pending_input(
        &self,
        user_id: UserId,
        pending: Option<PendingInput>,
        now: i64,
    ) -> Result<()> {
        let path = format!("pending_inputs/{}", user_id.0);
        match pending {
            Some(p) => {
                self.put(&path, &json!({ "kind": p.as_str(), "created_at": now }))
                    .await
            }
            None => self.delete(&path).await,
        }
    }

    async fn log_event(&self, event: &EventRecord) -> Result<()> {
        // POST to a collection appends under a generated push id.
        self.request(Method::POST, "events", Some(&serde_json::to_value(event)?))
            .await
            .map(|_| ())
    }

    async fn action_counts(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        let v = self.get("events").await?;
        Ok(rank_actions(&v, limit))
    }

    async fn export_accounts(&self) -> Result<AccountSnapshot> {
        let mut users = self.all_users().await?;
        users.sort_by_key(|u| u.user_id);

        let subs = self.get("subscriptions").await?;
        let mut subscriptions: Vec<SubscriptionRecord> = children(&subs)
            .into_iter()
            .filter_map(|(k, v)| parse_subscription(&k, v))
            .collect();
        subscriptions.sort_by_key(|s| s.user_id);

        let free = self.get("free_users").await?;
        let mut free_users: Vec<FreeUserRecord> = children(&free)
            .into_iter()
            .filter_map(|(k, v)| {
                Some(FreeUserRecord {
                    user_id: int_field(v, "user_id").or_else(|| k.parse().ok())?,
                    created_at: int_field(v, "created_at").unwrap_or(0),
                })
            })
            .collect();
        free_users.sort_by_key(|f| f.user_id);

        let kv_node = self.get("kv").await?;
        let mut kv: Vec<(String, String)> = children(&kv_node)
            .into_iter()
            .filter_map(|(k, v)| scalar_text(v).map(|s| (k, s)))
            .collect();
        kv.sort();

        Ok(AccountSnapshot {
            users,
            subscriptions,
            free_users,
            kv,
        })
    }

    async fn import_accounts(&self, snapshot: &AccountSnapshot) -> Result<()> {
        let updates = snapshot_updates(snapshot)?;
        if updates.is_empty() {
            return Ok(());
        }
        // One multi-path PATCH at the root.
        self.patch("", &Value::Object(updates)).await
    }
}

/// Flatten a snapshot into `{"users/5": {...}, "kv/paid_mode": "1", ...}`.
pub fn snapshot_updates(snapshot: &AccountSnapshot) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for u in &snapshot.users {
        out.insert(format!("users/{}", u.user_id), serde_json::to_value(u)?);
    }
    for s in &snapshot.subscriptions {
        out.insert(
            format!("subscriptions/{}", s.user_id),
            serde_json::to_value(s)?,
        );
    }
    for f in &snapshot.free_users {
        out.insert(format!("free_users/{}", f.user_id), serde_json::to_value(f)?);
    }
    for (k, v) in &snapshot.kv {
        out.insert(format!("kv/{}", key_segment(k)), json!(v));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_ignore_stray_slashes() {
        assert_eq!(
            node_url("https://x.firebaseio.com/", "/users/5"),
            "https://x.firebaseio.com/users/5.json"
        );
        assert_eq!(node_url("https://x.firebaseio.com", ""), "https://x.firebaseio.com/.json");
    }

    #[test]
    fn forbidden_key_chars_are_escaped() {
        assert_eq!(key_segment("abc-_DEF"), "abc-_DEF");
        assert_eq!(key_segment("a.b/c"), "a_2Eb_2Fc");
    }

    #[test]
    fn integer_keyed_collections_may_be_arrays() {
        let v = json!([null, {"user_id": 1}, null, {"user_id": 3}]);
        let keys: Vec<String> = children(&v).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["1", "3"]);
        assert!(children(&Value::Null).is_empty());
    }

    #[test]
    fn legacy_integer_flags_are_read() {
        let v = json!({"username": "ann", "first_seen": 1, "last_seen": "2", "blocked": 1, "bot_user": 0});
        let u = parse_user("5", &v).unwrap();
        assert_eq!(u.user_id, 5);
        assert_eq!(u.last_seen, 2);
        assert!(u.blocked);
        assert!(!u.bot_user);
        assert_eq!(u.display(), "@ann");
        assert!(parse_user("x", &json!({"name": "no id"})).is_none());
    }

    #[test]
    fn kv_scalars_read_as_text() {
        assert_eq!(scalar_text(&json!("1")).as_deref(), Some("1"));
        assert_eq!(scalar_text(&json!(42)).as_deref(), Some("42"));
        assert_eq!(scalar_text(&Value::Null), None);
    }

    #[test]
    fn actions_rank_by_count_then_name() {
        let events = json!({
            "-a": {"action": "start"},
            "-b": {"action": "edited_message"},
            "-c": {"action": "deleted_message"},
            "-d": {"action": "edited_message"},
            "-e": {"action": "deleted_message"},
            "-f": {"no_action": true},
        });
        assert_eq!(
            rank_actions(&events, 2),
            vec![
                ("deleted_message".to_string(), 2),
                ("edited_message".to_string(), 2)
            ]
        );
    }

    #[test]
    fn snapshot_flattens_to_multi_path_update() {
        let snap = AccountSnapshot {
            users: vec![UserRecord {
                user_id: 5,
                username: None,
                name: Some("Ann".into()),
                first_seen: 1,
                last_seen: 2,
                blocked: false,
                bot_user: true,
            }],
            subscriptions: vec![SubscriptionRecord {
                user_id: 5,
                paid_until: 100,
                created_at: 1,
                updated_at: 1,
            }],
            free_users: vec![],
            kv: vec![("paid_mode".into(), "1".into())],
        };
        let updates = snapshot_updates(&snap).unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates["kv/paid_mode"], json!("1"));
        assert_eq!(updates["subscriptions/5"]["paid_until"], json!(100));
        assert_eq!(
            parse_user("5", &updates["users/5"]),
            Some(snap.users[0].clone())
        );
    }
}
