use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{ChatId, UserId},
    errors::Error,
    Result,
};

/// Firebase Realtime Database endpoint used as the remote account store.
#[derive(Clone, Debug)]
pub struct FirebaseConfig {
    pub url: String,
    pub token: Option<String>,
}

/// Typed configuration for the monitor.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub telegram_api_url: String,
    pub admin_id: UserId,
    pub support_chat_id: Option<ChatId>,

    // Storage
    pub db_path: PathBuf,
    pub media_dir: PathBuf,
    pub firebase: Option<FirebaseConfig>,

    // Cache retention (0 = unlimited)
    pub max_messages_per_chat: usize,
    pub max_media_files: usize,

    // Payments
    pub payment_currency: String,
    pub stars_price_7d: u32,
    pub stars_price_14d: u32,
    pub stars_price_30d: u32,

    // Runtime constants
    pub notify_dedup_ttl: Duration,
    pub poll_timeout: Duration,
    pub broadcast_delay: Duration,
}

impl Config {
    /// Defaults for everything except the two required values.
    pub fn new(telegram_bot_token: impl Into<String>, admin_id: UserId) -> Self {
        Self {
            telegram_bot_token: telegram_bot_token.into(),
            telegram_api_url: "https://api.telegram.org".to_string(),
            admin_id,
            support_chat_id: None,
            db_path: PathBuf::from("bot.db"),
            media_dir: PathBuf::from("media"),
            firebase: None,
            max_messages_per_chat: 0,
            max_media_files: 0,
            payment_currency: "XTR".to_string(),
            stars_price_7d: 15,
            stars_price_14d: 25,
            stars_price_30d: 45,
            notify_dedup_ttl: Duration::from_secs(120),
            poll_timeout: Duration::from_secs(50),
            broadcast_delay: Duration::from_millis(50),
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let admin_id = match env_str("ADMIN_ID").and_then(non_empty) {
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                Error::Config(format!("ADMIN_ID must be a numeric user id, got {raw:?}"))
            })?,
            None => {
                return Err(Error::Config(
                    "ADMIN_ID environment variable is required".to_string(),
                ))
            }
        };

        let mut cfg = Self::new(telegram_bot_token.trim(), UserId(admin_id));

        if let Some(url) = env_str("TELEGRAM_API_URL").and_then(non_empty) {
            cfg.telegram_api_url = url.trim().trim_end_matches('/').to_string();
        }
        cfg.support_chat_id = env_i64("SUPPORT_CHAT_ID").map(ChatId);

        if let Some(p) = env_path("DB_PATH") {
            cfg.db_path = p;
        }
        if let Some(p) = env_path("MEDIA_DIR") {
            cfg.media_dir = p;
        }
        fs::create_dir_all(&cfg.media_dir)?;

        let firebase_url = env_str("FIREBASE_DB_URL")
            .and_then(non_empty)
            .or_else(|| env_str("FIREBASE_DATABASE_URL").and_then(non_empty));
        let firebase_token = env_str("FIREBASE_DB_TOKEN")
            .and_then(non_empty)
            .or_else(|| env_str("FIREBASE_DATABASE_SECRET").and_then(non_empty));
        cfg.firebase = firebase_url.map(|url| FirebaseConfig {
            url: url.trim().trim_end_matches('/').to_string(),
            token: firebase_token.map(|t| t.trim().to_string()),
        });

        cfg.max_messages_per_chat = env_usize("MAX_MESSAGES_PER_CHAT").unwrap_or(0);
        cfg.max_media_files = env_usize("MAX_MEDIA_FILES").unwrap_or(0);

        if let Some(cur) = env_str("PAYMENT_CURRENCY").and_then(non_empty) {
            cfg.payment_currency = cur.trim().to_uppercase();
        }
        cfg.stars_price_7d = env_u32("STARS_PRICE_7D").unwrap_or(cfg.stars_price_7d);
        cfg.stars_price_14d = env_u32("STARS_PRICE_14D").unwrap_or(cfg.stars_price_14d);
        cfg.stars_price_30d = env_u32("STARS_PRICE_30D").unwrap_or(cfg.stars_price_30d);

        cfg.notify_dedup_ttl =
            Duration::from_secs(env_u64("NOTIFY_DEDUP_TTL_SECS").unwrap_or(120));
        cfg.poll_timeout = Duration::from_secs(env_u64("POLL_TIMEOUT_SECS").unwrap_or(50));
        cfg.broadcast_delay = Duration::from_millis(env_u64("BROADCAST_DELAY_MS").unwrap_or(50));

        Ok(cfg)
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        user_id == self.admin_id
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_str(key).and_then(non_empty).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::new("t", UserId(7));
        assert_eq!(cfg.payment_currency, "XTR");
        assert_eq!(
            (cfg.stars_price_7d, cfg.stars_price_14d, cfg.stars_price_30d),
            (15, 25, 45)
        );
        assert_eq!(cfg.notify_dedup_ttl, Duration::from_secs(120));
        assert_eq!(cfg.max_messages_per_chat, 0);
        assert!(cfg.is_admin(UserId(7)));
        assert!(!cfg.is_admin(UserId(8)));
    }

    #[test]
    fn unquote_strips_matching_quotes_only() {
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("'abc'"), "abc");
        assert_eq!(unquote("\"abc'"), "\"abc'");
        assert_eq!(unquote("x"), "x");
    }
}
