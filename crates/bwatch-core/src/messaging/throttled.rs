use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MediaKind, MessageId},
    formatting::RichText,
    messaging::{
        port::NotifierPort,
        types::{Invoice, Keyboard, SendOutcome},
    },
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* Telegram API calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls per chat (Telegram 1 msg/sec style limits).
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// NotifierPort decorator that rate-limits outbound calls.
///
/// Notification bursts (a batch of deletes, a broadcast) would otherwise hit
/// Telegram 429s. The adapter still retries once on `RetryAfter`.
pub struct ThrottledNotifier {
    inner: Arc<dyn NotifierPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledNotifier {
    pub fn new(inner: Arc<dyn NotifierPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id.0).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl NotifierPort for ThrottledNotifier {
    async fn send_rich(
        &self,
        chat_id: ChatId,
        text: &RichText,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome {
        self.throttle_chat(chat_id).await;
        self.inner.send_rich(chat_id, text, keyboard).await
    }

    async fn send_html(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: Option<&Keyboard>,
    ) -> SendOutcome {
        self.throttle_chat(chat_id).await;
        self.inner.send_html(chat_id, html, keyboard).await
    }

    async fn send_media(
        &self,
        chat_id: ChatId,
        kind: MediaKind,
        path: &Path,
        caption: Option<&RichText>,
    ) -> SendOutcome {
        self.throttle_chat(chat_id).await;
        self.inner.send_media(chat_id, kind, path, caption).await
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> SendOutcome {
        // No chat_id available here; apply global throttling only.
        self.throttle_global().await;
        self.inner
            .answer_callback(callback_id, text, show_alert)
            .await
    }

    async fn answer_pre_checkout(
        &self,
        query_id: &str,
        ok: bool,
        error: Option<&str>,
    ) -> SendOutcome {
        // Telegram gives 10 seconds to answer; never queue this behind a chat.
        self.inner.answer_pre_checkout(query_id, ok, error).await
    }

    async fn send_invoice(&self, chat_id: ChatId, invoice: &Invoice) -> SendOutcome {
        self.throttle_chat(chat_id).await;
        self.inner.send_invoice(chat_id, invoice).await
    }

    async fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> SendOutcome {
        self.throttle_chat(to).await;
        self.inner.copy_message(to, from, message_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_spaces_back_to_back_reservations() {
        let interval = Duration::from_millis(500);
        let mut lim = IntervalLimiter::new(interval);
        assert!(lim.reserve().is_zero());
        let second = lim.reserve();
        assert!(second > Duration::ZERO);
        assert!(second <= interval);
        let third = lim.reserve();
        assert!(third > interval);
    }
}
