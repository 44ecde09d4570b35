//! Message snapshots and the on-disk media vault.
//!
//! A media row and its file go together: every path that deletes a row
//! unlinks the file first.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    domain::{ChatId, MessageId},
    ports::MediaFetcher,
    store::{CacheStore, CachedMedia},
    update::Message,
    utils::unix_micros,
    Result,
};

/// Counts reported by a manual purge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub messages: u64,
    pub media: u64,
    pub forwarded: u64,
    pub files: u64,
}

pub struct MediaVault {
    cache: Arc<dyn CacheStore>,
    fetcher: Arc<dyn MediaFetcher>,
    media_dir: PathBuf,
    max_messages_per_chat: usize,
    max_media_files: usize,
}

impl MediaVault {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        fetcher: Arc<dyn MediaFetcher>,
        media_dir: impl Into<PathBuf>,
        max_messages_per_chat: usize,
        max_media_files: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            media_dir: media_dir.into(),
            max_messages_per_chat,
            max_media_files,
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Cache the message's media (if any), then store its snapshot.
    ///
    /// A failed download is logged; the snapshot is still written.
    pub async fn store(&self, msg: &mut Message, now: i64) -> Result<()> {
        if let Err(e) = self.capture(msg, now).await {
            warn!(
                chat_id = msg.chat.id,
                message_id = msg.message_id,
                error = %e,
                "Failed to cache media"
            );
        }
        self.store_snapshot(msg, now).await
    }

    /// Store the snapshot without touching its attachment.
    pub async fn store_snapshot(&self, msg: &Message, now: i64) -> Result<()> {
        self.cache
            .put_message(msg.chat_id(), msg.id(), &msg.raw, now)
            .await
    }

    /// Download the attachment unless it is already on disk.
    pub async fn capture(&self, msg: &mut Message, now: i64) -> Result<Option<CachedMedia>> {
        if msg.media_marker().is_some() {
            return Ok(None);
        }
        let Some(att) = msg.attachment() else {
            return Ok(None);
        };
        if let Some(existing) = self.cache.get_media(msg.chat_id(), msg.id()).await? {
            if tokio::fs::try_exists(&existing.path).await.unwrap_or(false) {
                msg.set_media_marker(existing.kind, &existing.path.to_string_lossy());
                return Ok(None);
            }
        }

        let path = self.media_dir.join(format!(
            "{}_{}",
            unix_micros(),
            file_name_safe(&att.file_unique_id)
        ));
        self.fetcher.fetch(&att.file_id, &path).await?;

        msg.set_media_marker(att.kind, &path.to_string_lossy());
        let media = CachedMedia {
            chat_id: msg.chat_id(),
            message_id: msg.id(),
            kind: att.kind,
            path,
            created_at: now,
        };
        self.cache.put_media(&media).await?;
        Ok(Some(media))
    }

    pub async fn media(&self, chat_id: ChatId, message_id: MessageId) -> Result<Option<CachedMedia>> {
        self.cache.get_media(chat_id, message_id).await
    }

    /// Drop the snapshot and media of one message (file included).
    pub async fn forget(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        self.release_media(chat_id, message_id).await?;
        self.cache.delete_message(chat_id, message_id).await
    }

    /// Drop the media row and its file; the snapshot stays.
    pub async fn release_media(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        if let Some(m) = self.cache.get_media(chat_id, message_id).await? {
            remove_file_quiet(&m.path).await;
            self.cache.delete_media(chat_id, message_id).await?;
        }
        Ok(())
    }

    /// Keep only the newest `MAX_MESSAGES_PER_CHAT` snapshots of `chat_id`.
    pub async fn trim_chat(&self, chat_id: ChatId) -> Result<usize> {
        if self.max_messages_per_chat == 0 {
            return Ok(0);
        }
        let evicted = self
            .cache
            .messages_beyond(chat_id, self.max_messages_per_chat)
            .await?;
        for mid in &evicted {
            self.forget(chat_id, *mid).await?;
        }
        Ok(evicted.len())
    }

    /// Keep only the newest `MAX_MEDIA_FILES` media rows across all chats.
    pub async fn trim_media(&self) -> Result<usize> {
        if self.max_media_files == 0 {
            return Ok(0);
        }
        let evicted = self.cache.media_beyond(self.max_media_files).await?;
        for m in &evicted {
            remove_file_quiet(&m.path).await;
            self.cache.delete_media(m.chat_id, m.message_id).await?;
        }
        Ok(evicted.len())
    }

    /// Per-chat limit first, then the global media limit.
    pub async fn enforce_limits(&self, chat_id: ChatId) {
        if let Err(e) = self.trim_chat(chat_id).await {
            warn!(chat_id = chat_id.0, error = %e, "Failed to trim chat cache");
        }
        if let Err(e) = self.trim_media().await {
            warn!(error = %e, "Failed to trim media");
        }
    }

    /// Remove every file in the media dir and every cache row.
    pub async fn purge(&self) -> Result<PurgeReport> {
        let files = self.clear_media_dir().await;
        let rows = self.cache.clear().await?;
        let report = PurgeReport {
            messages: rows.messages,
            media: rows.media,
            forwarded: rows.forwarded,
            files,
        };
        info!(?report, "Cache purged");
        Ok(report)
    }

    async fn clear_media_dir(&self) -> u64 {
        let mut entries = match tokio::fs::read_dir(&self.media_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(dir = %self.media_dir.display(), error = %e, "Failed to list media dir");
                return 0;
            }
        };
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read media dir entry");
                    break;
                }
            };
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove file"),
            }
        }
        removed
    }
}

/// Unlink a file; a missing file is not an error.
pub async fn remove_file_quiet(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove media file"),
    }
}

fn file_name_safe(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        domain::MediaKind,
        store::memory::MemoryStore,
        testkit::{tmp_dir, FakeFetcher},
    };

    fn vault(dir: &Path, per_chat: usize, media: usize) -> (Arc<MemoryStore>, Arc<FakeFetcher>, MediaVault) {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(FakeFetcher::default());
        let v = MediaVault::new(store.clone(), fetcher.clone(), dir, per_chat, media);
        (store, fetcher, v)
    }

    fn photo(mid: i32) -> Message {
        Message::from_value(json!({
            "message_id": mid,
            "chat": {"id": 10, "type": "private"},
            "photo": [{"file_id": format!("f{mid}"), "file_unique_id": format!("u{mid}")}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn capture_sets_marker_and_skips_second_time() {
        let dir = tmp_dir("vault-capture");
        let (store, fetcher, v) = vault(&dir, 0, 0);
        let mut m = photo(1);
        v.store(&mut m, 100).await.unwrap();

        let media = store.get_media(ChatId(10), MessageId(1)).await.unwrap().unwrap();
        assert_eq!(media.kind, MediaKind::Photo);
        assert!(media.path.exists());
        assert!(media.path.to_string_lossy().ends_with("_u1"));
        assert_eq!(m.media_marker(), Some(media.path.to_string_lossy().as_ref()));

        let snap = store.get_message(ChatId(10), MessageId(1)).await.unwrap().unwrap();
        assert_eq!(snap["_media_kind"], "photo");

        v.store(&mut m, 101).await.unwrap();
        let mut again = photo(1);
        v.capture(&mut again, 102).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn per_chat_eviction_keeps_newest_and_unlinks_files() {
        let dir = tmp_dir("vault-evict");
        let (store, _f, v) = vault(&dir, 3, 0);
        let mut paths = Vec::new();
        for mid in 1..=5 {
            let mut m = photo(mid);
            v.store(&mut m, 100 + i64::from(mid)).await.unwrap();
            paths.push(store.get_media(ChatId(10), MessageId(mid)).await.unwrap().unwrap().path);
            v.enforce_limits(ChatId(10)).await;
        }

        assert_eq!(store.message_count(), 3);
        for mid in 1..=2 {
            assert!(store.get_message(ChatId(10), MessageId(mid)).await.unwrap().is_none());
            assert!(store.get_media(ChatId(10), MessageId(mid)).await.unwrap().is_none());
            assert!(!paths[(mid - 1) as usize].exists());
        }
        for mid in 3..=5 {
            assert!(store.get_message(ChatId(10), MessageId(mid)).await.unwrap().is_some());
            assert!(paths[(mid - 1) as usize].exists());
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn global_media_limit_keeps_snapshots() {
        let dir = tmp_dir("vault-global");
        let (store, _f, v) = vault(&dir, 0, 1);
        for mid in 1..=2 {
            let mut m = photo(mid);
            v.store(&mut m, 100).await.unwrap();
        }
        assert_eq!(v.trim_media().await.unwrap(), 1);
        assert!(store.get_media(ChatId(10), MessageId(1)).await.unwrap().is_none());
        assert!(store.get_media(ChatId(10), MessageId(2)).await.unwrap().is_some());
        assert_eq!(store.message_count(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn purge_reports_rows_and_files() {
        let dir = tmp_dir("vault-purge");
        let (store, _f, v) = vault(&dir, 0, 0);
        let mut m = photo(1);
        v.store(&mut m, 100).await.unwrap();
        store
            .set_forwarded(crate::domain::UserId(1), MessageId(1), "ephemeral", 100)
            .await
            .unwrap();

        let report = v.purge().await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                messages: 1,
                media: 1,
                forwarded: 1,
                files: 1
            }
        );
        assert_eq!(store.message_count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unsafe_file_name_chars_are_replaced() {
        assert_eq!(file_name_safe("AQAD/x..y"), "AQAD_x__y");
    }
}
