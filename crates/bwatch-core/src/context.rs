use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::{
    access::AccessGate,
    config::Config,
    dedup::{NotifyDedup, NotifyKey},
    domain::UserId,
    messaging::port::NotifierPort,
    ownership::OwnershipResolver,
    ports::{Clock, MediaFetcher},
    store::{AccountStore, CacheStore, EventRecord, KV_OWNER_ID},
    vault::MediaVault,
    Result,
};

/// Everything a handler needs, built once at startup.
pub struct AppContext {
    pub cfg: Arc<Config>,
    pub accounts: Arc<dyn AccountStore>,
    pub gate: Arc<AccessGate>,
    pub ownership: OwnershipResolver,
    pub vault: MediaVault,
    pub notifier: Arc<dyn NotifierPort>,
    pub clock: Arc<dyn Clock>,
    bot_username: String,
    owner_id: RwLock<Option<UserId>>,
    dedup: Mutex<NotifyDedup>,
}

/// Collaborators handed to [`AppContext::new`].
pub struct Collaborators {
    pub accounts: Arc<dyn AccountStore>,
    pub cache: Arc<dyn CacheStore>,
    pub notifier: Arc<dyn NotifierPort>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub clock: Arc<dyn Clock>,
}

impl AppContext {
    /// Wire the components and load the owner identity from settings.
    pub async fn new(cfg: Arc<Config>, parts: Collaborators, bot_username: String) -> Self {
        let gate = Arc::new(AccessGate::new(parts.accounts.clone(), &cfg));
        let ownership = OwnershipResolver::new(parts.accounts.clone(), gate.clone());
        let vault = MediaVault::new(
            parts.cache,
            parts.fetcher,
            cfg.media_dir.clone(),
            cfg.max_messages_per_chat,
            cfg.max_media_files,
        );
        let owner_id = match parts.accounts.kv_get(KV_OWNER_ID).await {
            Ok(v) => v.and_then(|s| s.trim().parse::<i64>().ok()).map(UserId),
            Err(e) => {
                warn!(error = %e, "Failed to load owner id");
                None
            }
        };
        Self {
            dedup: Mutex::new(NotifyDedup::new(cfg.notify_dedup_ttl)),
            cfg,
            accounts: parts.accounts,
            gate,
            ownership,
            vault,
            notifier: parts.notifier,
            clock: parts.clock,
            bot_username,
            owner_id: RwLock::new(owner_id),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn admin_id(&self) -> UserId {
        self.cfg.admin_id
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        user == self.cfg.admin_id
    }

    pub fn bot_username(&self) -> &str {
        &self.bot_username
    }

    pub fn owner_id(&self) -> Option<UserId> {
        match self.owner_id.read() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    /// Persist and cache the global owner identity.
    pub async fn set_owner_id(&self, owner: UserId) -> Result<()> {
        self.accounts
            .kv_set(KV_OWNER_ID, &owner.0.to_string())
            .await?;
        match self.owner_id.write() {
            Ok(mut g) => *g = Some(owner),
            Err(p) => *p.into_inner() = Some(owner),
        }
        info!(owner_id = owner.0, "Owner identity registered");
        Ok(())
    }

    /// `true` when this notification was not sent within the dedup window.
    pub fn should_notify(&self, key: NotifyKey) -> bool {
        let now = self.now();
        match self.dedup.lock() {
            Ok(mut d) => d.check_at(key, now),
            Err(p) => p.into_inner().check_at(key, now),
        }
    }

    /// Append to the audit log; failures are logged only.
    pub async fn log_event(
        &self,
        user: Option<UserId>,
        action: &str,
        chat_id: Option<i64>,
        message_id: Option<i32>,
    ) {
        let event = EventRecord {
            user_id: user.map(|u| u.0),
            action: action.to_string(),
            chat_id,
            message_id,
            created_at: self.now(),
        };
        if let Err(e) = self.accounts.log_event(&event).await {
            warn!(action, error = %e, "Failed to log event");
        }
    }
}
