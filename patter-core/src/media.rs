//! Media resolution: logical file ids → platform-native file ids.
//!
//! Uploads go through the adapter at most once per (asset, platform): the
//! platform id is written through to the store before it is returned, and a
//! per-asset mutex keeps concurrent conversations from racing the upload.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::adapter::{PlatformAdapter, with_retries};
use crate::store::Store;
use crate::types::{MediaRef, OutboundMedia, Platform, SendError};

/// One media reference that could not be resolved. The caller downgrades
/// the message to text-only, prefixed with `description`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFailure {
    pub logical_id: String,
    pub description: String,
    pub detail: String,
}

pub struct MediaManager {
    store: Arc<Store>,
    /// Per-asset upload locks, keyed by asset id.
    upload_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_retries: u32,
}

impl MediaManager {
    pub fn new(store: Arc<Store>, max_retries: u32) -> Self {
        Self {
            store,
            upload_locks: Mutex::new(HashMap::new()),
            max_retries,
        }
    }

    /// Resolve each reference to a platform file id, uploading on the first
    /// use per platform. Outcomes keep the input order.
    pub async fn resolve<A: PlatformAdapter>(
        &self,
        adapter: &A,
        bot_id: &str,
        platform: Platform,
        refs: &[MediaRef],
    ) -> Vec<Result<OutboundMedia, MediaFailure>> {
        let mut outcomes = Vec::with_capacity(refs.len());
        for media_ref in refs {
            outcomes.push(self.resolve_one(adapter, bot_id, platform, media_ref).await);
        }
        outcomes
    }

    async fn resolve_one<A: PlatformAdapter>(
        &self,
        adapter: &A,
        bot_id: &str,
        platform: Platform,
        media_ref: &MediaRef,
    ) -> Result<OutboundMedia, MediaFailure> {
        let failure = |detail: String| MediaFailure {
            logical_id: media_ref.file_id.clone(),
            description: media_ref.description.clone(),
            detail,
        };

        let asset = self
            .store
            .get_media_asset(bot_id, &media_ref.file_id)
            .map_err(|e| failure(e.to_string()))?
            .ok_or_else(|| failure("no such media asset".into()))?;

        // Fast path: already uploaded to this platform.
        if let Some(file_id) = asset.platform_ids.get(&platform) {
            return Ok(OutboundMedia {
                kind: media_ref.kind,
                file_id: file_id.clone(),
            });
        }

        let lock = self.lock_for(&asset.id).await;
        let _guard = lock.lock().await;

        // Re-check under the lock: another conversation may have finished
        // the upload while we waited.
        let asset = self
            .store
            .get_media_asset(bot_id, &media_ref.file_id)
            .map_err(|e| failure(e.to_string()))?
            .ok_or_else(|| failure("no such media asset".into()))?;
        if let Some(file_id) = asset.platform_ids.get(&platform) {
            return Ok(OutboundMedia {
                kind: media_ref.kind,
                file_id: file_id.clone(),
            });
        }

        let uploaded = with_retries(self.max_retries, || {
            adapter.upload_media(&asset.bytes, &asset.mime)
        })
        .await
        .map_err(|e: SendError| {
            log::warn!(
                "media upload failed for asset '{}' on {platform}: {e}",
                media_ref.file_id
            );
            failure(e.to_string())
        })?;

        // Write through before returning so every subsequent resolve in the
        // process observes the id. Write-once: a concurrent winner's id is
        // returned unchanged.
        let final_id = self
            .store
            .set_media_platform_id(&asset.id, platform, &uploaded)
            .map_err(|e| failure(e.to_string()))?;

        Ok(OutboundMedia {
            kind: media_ref.kind,
            file_id: final_id,
        })
    }

    async fn lock_for(&self, asset_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.upload_locks.lock().await;
        locks
            .entry(asset_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockAdapter;
    use crate::types::MediaKind;

    fn media_ref(logical: &str, description: &str) -> MediaRef {
        MediaRef {
            kind: MediaKind::Image,
            description: description.to_string(),
            file_id: logical.to_string(),
        }
    }

    fn setup() -> (Arc<Store>, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bot = store.create_bot("acct", "bot").unwrap();
        (store, bot.id)
    }

    #[tokio::test]
    async fn uploads_once_then_reuses_platform_id() {
        let (store, bot_id) = setup();
        store
            .create_media_asset(&bot_id, "menu", "image/jpeg", b"jpegbytes")
            .unwrap();

        let manager = MediaManager::new(store.clone(), 2);
        let adapter = MockAdapter::new();
        adapter.push_upload_result(Ok("tg-file-9".into()));

        let refs = [media_ref("menu", "the menu")];
        let first = manager
            .resolve(&adapter, &bot_id, Platform::Telegram, &refs)
            .await;
        assert_eq!(
            first[0].as_ref().unwrap(),
            &OutboundMedia { kind: MediaKind::Image, file_id: "tg-file-9".into() }
        );
        assert_eq!(adapter.upload_count(), 1);

        // Second resolve takes the fast path: no more uploads are scripted,
        // so an upload attempt would fail the test.
        let second = manager
            .resolve(&adapter, &bot_id, Platform::Telegram, &refs)
            .await;
        assert_eq!(second[0].as_ref().unwrap().file_id, "tg-file-9");
        assert_eq!(adapter.upload_count(), 1);

        // And the id is durable.
        let asset = store.get_media_asset(&bot_id, "menu").unwrap().unwrap();
        assert_eq!(
            asset.platform_ids.get(&Platform::Telegram),
            Some(&"tg-file-9".to_string())
        );
    }

    #[tokio::test]
    async fn transient_upload_failures_are_retried() {
        let (store, bot_id) = setup();
        store
            .create_media_asset(&bot_id, "menu", "image/jpeg", b"jpegbytes")
            .unwrap();

        let manager = MediaManager::new(store, 2);
        let adapter = MockAdapter::new();
        adapter.push_upload_result(Err(SendError::Transient("timeout".into())));
        adapter.push_upload_result(Err(SendError::Transient("timeout".into())));
        adapter.push_upload_result(Ok("tg-file-1".into()));

        let refs = [media_ref("menu", "the menu")];
        let outcomes = manager
            .resolve(&adapter, &bot_id, Platform::Telegram, &refs)
            .await;
        assert_eq!(outcomes[0].as_ref().unwrap().file_id, "tg-file-1");
        assert_eq!(adapter.upload_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure_and_leave_id_unset() {
        let (store, bot_id) = setup();
        store
            .create_media_asset(&bot_id, "menu", "image/jpeg", b"jpegbytes")
            .unwrap();

        let manager = MediaManager::new(store.clone(), 2);
        let adapter = MockAdapter::new();
        for _ in 0..3 {
            adapter.push_upload_result(Err(SendError::Transient("down".into())));
        }

        let refs = [media_ref("menu", "A photo of the menu")];
        let outcomes = manager
            .resolve(&adapter, &bot_id, Platform::Telegram, &refs)
            .await;
        let failure = outcomes[0].as_ref().unwrap_err();
        assert_eq!(failure.logical_id, "menu");
        assert_eq!(failure.description, "A photo of the menu");

        let asset = store.get_media_asset(&bot_id, "menu").unwrap().unwrap();
        assert!(asset.platform_ids.is_empty());
    }

    #[tokio::test]
    async fn unknown_asset_is_a_failure() {
        let (store, bot_id) = setup();
        let manager = MediaManager::new(store, 0);
        let adapter = MockAdapter::new();

        let refs = [media_ref("ghost", "missing picture")];
        let outcomes = manager
            .resolve(&adapter, &bot_id, Platform::Telegram, &refs)
            .await;
        let failure = outcomes[0].as_ref().unwrap_err();
        assert_eq!(failure.logical_id, "ghost");
        assert_eq!(adapter.upload_count(), 0);
    }

    #[tokio::test]
    async fn outcomes_preserve_input_order() {
        let (store, bot_id) = setup();
        store
            .create_media_asset(&bot_id, "one", "image/png", b"1")
            .unwrap();
        store
            .create_media_asset(&bot_id, "two", "image/png", b"2")
            .unwrap();

        let manager = MediaManager::new(store, 0);
        let adapter = MockAdapter::new();
        adapter.push_upload_result(Ok("id-one".into()));
        adapter.push_upload_result(Ok("id-two".into()));

        let refs = [media_ref("one", ""), media_ref("two", "")];
        let outcomes = manager
            .resolve(&adapter, &bot_id, Platform::Telegram, &refs)
            .await;
        assert_eq!(outcomes[0].as_ref().unwrap().file_id, "id-one");
        assert_eq!(outcomes[1].as_ref().unwrap().file_id, "id-two");
    }
}
