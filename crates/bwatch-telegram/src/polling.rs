//! Raw `getUpdates` long polling.
//!
//! teloxide's typed updates predate the business kinds, so updates are pulled
//! as JSON and decoded by `bwatch-core`.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bwatch_core::{context::AppContext, errors::Error, router, Result};

pub const ALLOWED_UPDATES: [&str; 7] = [
    "message",
    "callback_query",
    "pre_checkout_query",
    "business_connection",
    "business_message",
    "edited_business_message",
    "deleted_business_messages",
];

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct LongPoller {
    http: reqwest::Client,
    base: String,
    timeout: Duration,
    offset: i64,
}

impl LongPoller {
    pub fn new(api_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout + Duration::from_secs(15))
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            base: format!("{}/bot{token}", api_url.trim_end_matches('/')),
            timeout,
            offset: 0,
        })
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Remote(format!("{method} request error: {e}")))?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::Remote(format!("{method} json error: {e}")))?;
        api_result(method, v)
    }

    /// Drops any webhook (and its backlog) so `getUpdates` is allowed.
    pub async fn delete_webhook(&self) -> Result<()> {
        self.call("deleteWebhook", &json!({"drop_pending_updates": true}))
            .await?;
        Ok(())
    }

    /// One `getUpdates` round; advances the offset past the returned batch.
    pub async fn poll(&mut self) -> Result<Vec<Value>> {
        let body = poll_request(self.offset, self.timeout);
        let result = self.call("getUpdates", &body).await?;
        let updates = match result {
            Value::Array(items) => items,
            other => {
                return Err(Error::Decode(format!(
                    "getUpdates result is not an array: {other}"
                )))
            }
        };
        self.offset = next_offset(self.offset, &updates);
        Ok(updates)
    }
}

pub fn poll_request(offset: i64, timeout: Duration) -> Value {
    json!({
        "timeout": timeout.as_secs(),
        "offset": offset,
        "allowed_updates": ALLOWED_UPDATES,
    })
}

/// `max(update_id) + 1`, never moving backwards.
pub fn next_offset(current: i64, updates: &[Value]) -> i64 {
    updates
        .iter()
        .filter_map(|u| u.get("update_id").and_then(Value::as_i64))
        .map(|id| id + 1)
        .fold(current, i64::max)
}

/// Unwrap the Bot API envelope `{ok, result, description}`.
pub fn api_result(method: &str, v: Value) -> Result<Value> {
    if v.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(v.get("result").cloned().unwrap_or(Value::Null));
    }
    let description = v
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    Err(Error::Remote(format!("{method} failed: {description}")))
}

/// Pull and dispatch updates until `shutdown` fires.
///
/// Updates are handled one at a time in arrival order. A failed poll sleeps
/// and retries.
pub async fn run_polling(ctx: &AppContext, mut poller: LongPoller, shutdown: CancellationToken) {
    info!(timeout_secs = poller.timeout.as_secs(), "Polling started");
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = poller.poll() => r,
        };
        match batch {
            Ok(updates) => {
                if !updates.is_empty() {
                    debug!(count = updates.len(), offset = poller.offset(), "Received updates");
                }
                for update in updates {
                    router::dispatch_raw(ctx, update).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "getUpdates failed; retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    info!("Polling stopped");
}

/// Cancel `token` on Ctrl-C or SIGTERM.
pub fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_moves_past_highest_update() {
        let batch = vec![
            json!({"update_id": 7}),
            json!({"update_id": 9}),
            json!({"no_id": true}),
        ];
        assert_eq!(next_offset(0, &batch), 10);
        assert_eq!(next_offset(12, &batch), 12);
        assert_eq!(next_offset(5, &[]), 5);
    }

    #[test]
    fn request_lists_business_kinds() {
        let body = poll_request(42, Duration::from_secs(50));
        assert_eq!(body["offset"], 42);
        assert_eq!(body["timeout"], 50);
        let kinds = body["allowed_updates"].as_array().unwrap();
        assert!(kinds.iter().any(|k| k == "deleted_business_messages"));
        assert_eq!(kinds.len(), 7);
    }

    #[test]
    fn envelope_errors_carry_description() {
        let ok = api_result("getUpdates", json!({"ok": true, "result": [1]})).unwrap();
        assert_eq!(ok, json!([1]));

        let err = api_result(
            "getUpdates",
            json!({"ok": false, "description": "Conflict: terminated by other getUpdates"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Conflict"));
    }
}
