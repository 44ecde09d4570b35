//! Fakes shared by the unit tests.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::Config,
    context::{AppContext, Collaborators},
    domain::{ChatId, MediaKind, MessageId, UserId},
    errors::Error,
    formatting::RichText,
    messaging::{
        port::NotifierPort,
        types::{Invoice, Keyboard, SendOutcome},
    },
    ports::{ManualClock, MediaFetcher},
    store::memory::MemoryStore,
    update::Update,
    Result,
};

pub fn tmp_dir(prefix: &str) -> PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let pid = std::process::id();
    PathBuf::from(format!("/tmp/bwatch-{prefix}-{pid}-{ts}"))
}

/// Writes a few bytes instead of downloading.
#[derive(Default)]
pub struct FakeFetcher {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, file_id: &str, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::External("download failed".to_string()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, file_id.as_bytes()).await?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Rich {
        chat: ChatId,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Html {
        chat: ChatId,
        text: String,
        keyboard: Option<Keyboard>,
    },
    Media {
        chat: ChatId,
        kind: MediaKind,
        caption: Option<String>,
    },
    Callback {
        id: String,
        text: Option<String>,
        alert: bool,
    },
    PreCheckout {
        id: String,
        ok: bool,
        error: Option<String>,
    },
    Invoice {
        chat: ChatId,
        invoice: Invoice,
    },
    Copy {
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
    },
}

impl Sent {
    pub fn chat(&self) -> Option<ChatId> {
        match self {
            Sent::Rich { chat, .. }
            | Sent::Html { chat, .. }
            | Sent::Media { chat, .. }
            | Sent::Invoice { chat, .. } => Some(*chat),
            Sent::Copy { to, .. } => Some(*to),
            Sent::Callback { .. } | Sent::PreCheckout { .. } => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Sent::Rich { text, .. } | Sent::Html { text, .. } => Some(text),
            Sent::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }
}

/// Records every outbound call.
#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<Sent>>,
    unavailable: Mutex<HashSet<i64>>,
    fail_media: AtomicBool,
}

impl FakeNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat: i64) -> Vec<Sent> {
        self.sent()
            .into_iter()
            .filter(|s| s.chat() == Some(ChatId(chat)))
            .collect()
    }

    pub fn texts_to(&self, chat: i64) -> Vec<String> {
        self.sent_to(chat)
            .iter()
            .filter_map(|s| s.text().map(str::to_string))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Sends to `chat` report `RecipientUnavailable` (bot blocked).
    pub fn make_unavailable(&self, chat: i64) {
        self.unavailable.lock().unwrap().insert(chat);
    }

    pub fn set_fail_media(&self, fail: bool) {
        self.fail_media.store(fail, Ordering::SeqCst);
    }

    fn record(&self, chat: Option<ChatId>, s: Sent) -> SendOutcome {
        if let Some(c) = chat {
            if self.unavailable.lock().unwrap().contains(&c.0) {
                return SendOutcome::RecipientUnavailable;
            }
        }
        self.sent.lock().unwrap().push(s);
        SendOutcome::Delivered
    }
}

#[async_trait]
impl NotifierPort for FakeNotifier {
    async fn send_rich(
        &self,
        chat_id: ChatId,
        text: &RichText,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome {
        self.record(
            Some(chat_id),
            Sent::Rich {
                chat: chat_id,
                text: text.text().to_string(),
                keyboard: keyboard.cloned(),
            },
        )
    }

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome {
        self.record(
            Some(chat_id),
            Sent::Html {
                chat: chat_id,
                text: html.to_string(),
                keyboard: keyboard.cloned(),
            },
        )
    }

    async fn send_media(
        &self,
        chat_id: ChatId,
        kind: MediaKind,
        _path: &Path,
        caption: Option<&RichText>,
    ) -> SendOutcome {
        if self.fail_media.load(Ordering::SeqCst) {
            return SendOutcome::TransientFailure("upload failed".to_string());
        }
        self.record(
            Some(chat_id),
            Sent::Media {
                chat: chat_id,
                kind,
                caption: caption.map(|c| c.text().to_string()),
            },
        )
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> SendOutcome {
        self.record(
            None,
            Sent::Callback {
                id: callback_id.to_string(),
                text: text.map(str::to_string),
                alert: show_alert,
            },
        )
    }

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        ok: bool,
        error: Option<&str>,
    ) -> SendOutcome {
        self.record(
            None,
            Sent::PreCheckout {
                id: query_id.to_string(),
                ok,
                error: error.map(str::to_string),
            },
        )
    }

    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> SendOutcome {
        self.record(
            Some(chat_id),
            Sent::Invoice {
                chat: chat_id,
                invoice: invoice.clone(),
            },
        )
    }

    async fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> SendOutcome {
        self.record(
            Some(to),
            Sent::Copy {
                to,
                from,
                message_id,
            },
        )
    }
}

pub const ADMIN: i64 = 1;

/// A fully wired context over in-memory fakes.
pub struct Harness {
    pub ctx: AppContext,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<FakeNotifier>,
    pub fetcher: Arc<FakeFetcher>,
    pub clock: Arc<ManualClock>,
    pub dir: PathBuf,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tmp_dir("router");
        let mut cfg = Config::new("token", UserId(ADMIN));
        cfg.media_dir = dir.clone();
        cfg.broadcast_delay = Duration::ZERO;
        cfg.support_chat_id = Some(ChatId(-100));
        tweak(&mut cfg);

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(FakeNotifier::default());
        let fetcher = Arc::new(FakeFetcher::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ctx = AppContext::new(
            Arc::new(cfg),
            Collaborators {
                accounts: store.clone(),
                cache: store.clone(),
                notifier: notifier.clone(),
                fetcher: fetcher.clone(),
                clock: clock.clone(),
            },
            "watch_bot".to_string(),
        )
        .await;
        Self {
            ctx,
            store,
            notifier,
            fetcher,
            clock,
            dir,
        }
    }

    pub async fn feed(&self, v: Value) {
        let upd = Update::decode(v).unwrap();
        crate::router::dispatch(&self.ctx, upd).await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
