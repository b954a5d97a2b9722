//! Content-addressed store of synthesized segments.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<key[0..2]>/<key>.wav    audio
//! <root>/<key[0..2]>/<key>.json   sidecar, written last (commit marker)
//! <root>/<key[0..2]>/<key>.regen  pending regeneration
//! ```
//!
//! An entry exists exactly when its sidecar exists. Generation for one key is
//! single-flight: concurrent callers share one generator run and its result.

use crate::core::error::{CacheCorruptionError, SynthesisError};
use crate::core::io::{self, Storage};
use crate::core::model::{hash_hex, normalize_text, CacheKey, SynthesisParams};
use crate::utils::audio::WavInfo;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type Generation = Shared<BoxFuture<'static, Result<CacheEntry, SynthesisError>>>;

/// What a segment's audio is made from.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRequest {
    pub key: CacheKey,
    pub speaker_id: String,
    pub voice_id: String,
    pub params: SynthesisParams,
    pub text: String,
}

impl CacheRequest {
    pub fn new(text: &str, speaker_id: &str, voice_id: &str, params: &SynthesisParams) -> Self {
        Self {
            key: CacheKey::compute(text, speaker_id, voice_id, params),
            speaker_id: speaker_id.to_string(),
            voice_id: voice_id.to_string(),
            params: params.clone(),
            text: text.to_string(),
        }
    }
}

/// Sidecar contents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntryMetadata {
    pub key: CacheKey,
    pub speaker_id: String,
    pub voice_id: String,
    pub params: SynthesisParams,
    pub text_hash: String,
    pub source_text: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub regenerated: bool,
    pub duration_ms: u64,
    pub audio_bytes: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub audio_path: String,
    pub metadata: EntryMetadata,
}

struct CacheInner {
    storage: Arc<dyn Storage>,
    root: String,
    in_flight: Mutex<HashMap<CacheKey, Generation>>,
}

#[derive(Clone)]
pub struct SegmentCache {
    inner: Arc<CacheInner>,
}

impl SegmentCache {
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                storage,
                root: root.into(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the entry for `request.key`, running `generator` to produce
    /// the audio on a miss. Concurrent calls for the same key share a single
    /// generator run and all observe its result, success or failure.
    pub async fn get_or_create<G, Fut>(
        &self,
        request: CacheRequest,
        generator: G,
    ) -> Result<CacheEntry, SynthesisError>
    where
        G: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, SynthesisError>> + Send + 'static,
    {
        let key = request.key.clone();
        let generation = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight generation for {}", key);
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let generation = async move { inner.load_or_generate(request, generator).await }
                        .boxed()
                        .shared();
                    in_flight.insert(key.clone(), generation.clone());
                    generation
                }
            }
        };

        let result = generation.clone().await;
        self.inner.forget(&key, &generation);
        result
    }

    /// Read-only lookup. Never generates.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheCorruptionError> {
        self.inner.lookup(key).await
    }

    pub async fn read_audio(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        self.inner.storage.read(&entry.audio_path).await
    }

    /// Invalidates one entry so the next `get_or_create` generates it again.
    /// Waits for an in-flight generation of the key first. Returns whether an
    /// entry existed.
    pub async fn regenerate(&self, key: &CacheKey) -> Result<bool> {
        let pending = self.inner.in_flight.lock().get(key).cloned();
        if let Some(generation) = pending {
            info!("Waiting for in-flight generation of {} before regenerating", key);
            let _ = generation.clone().await;
            self.inner.forget(key, &generation);
        }

        let storage = &self.inner.storage;
        let sidecar = self.inner.sidecar_path(key);
        let existed = storage.exists(&sidecar).await?;
        storage
            .write_atomic(&self.inner.marker_path(key), Utc::now().to_rfc3339().as_bytes())
            .await?;
        // Uncommit before removing the audio.
        storage.delete(&sidecar).await?;
        storage.delete(&self.inner.audio_path(key)).await?;
        info!("Invalidated cache entry {}", key);
        Ok(existed)
    }
}

impl CacheInner {
    fn path(&self, key: &CacheKey, ext: &str) -> String {
        io::join(&self.root, &[key.shard(), &format!("{}.{}", key, ext)])
    }

    fn audio_path(&self, key: &CacheKey) -> String {
        self.path(key, "wav")
    }

    fn sidecar_path(&self, key: &CacheKey) -> String {
        self.path(key, "json")
    }

    fn marker_path(&self, key: &CacheKey) -> String {
        self.path(key, "regen")
    }

    /// Drops the in-flight slot if it still holds `generation`.
    fn forget(&self, key: &CacheKey, generation: &Generation) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|g| g.ptr_eq(generation)) {
            in_flight.remove(key);
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheCorruptionError> {
        let corrupt = |reason: String| CacheCorruptionError {
            key: key.to_string(),
            reason,
        };

        let sidecar = self.sidecar_path(key);
        if !self.storage.exists(&sidecar).await.map_err(|e| corrupt(e.to_string()))? {
            return Ok(None);
        }
        let metadata: EntryMetadata = io::read_json(self.storage.as_ref(), &sidecar)
            .await
            .map_err(|e| corrupt(format!("unreadable sidecar: {:#}", e)))?;

        let audio_path = self.audio_path(key);
        let audio = self
            .storage
            .read(&audio_path)
            .await
            .map_err(|e| corrupt(format!("audio missing: {:#}", e)))?;
        if audio.len() != metadata.audio_bytes {
            return Err(corrupt(format!(
                "audio is {} bytes, sidecar says {}",
                audio.len(),
                metadata.audio_bytes
            )));
        }
        WavInfo::parse(&audio).map_err(|e| corrupt(format!("audio unreadable: {}", e)))?;

        Ok(Some(CacheEntry {
            key: key.clone(),
            audio_path,
            metadata,
        }))
    }

    async fn load_or_generate<G, Fut>(
        &self,
        request: CacheRequest,
        generator: G,
    ) -> Result<CacheEntry, SynthesisError>
    where
        G: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, SynthesisError>>,
    {
        let key = &request.key;
        match self.lookup(key).await {
            Ok(Some(entry)) => return Ok(entry),
            Ok(None) => {}
            Err(e) => warn!("Cache anomaly, treating as a miss: {}", e),
        }

        let storage_err = |e: anyhow::Error| SynthesisError::Storage(format!("{:#}", e));
        let marker = self.marker_path(key);
        let regenerated = self.storage.exists(&marker).await.map_err(storage_err)?;

        let audio = generator().await?;
        let info = WavInfo::parse(&audio).map_err(|e| SynthesisError::MalformedAudio(e.to_string()))?;

        let audio_path = self.audio_path(key);
        self.storage
            .write_atomic(&audio_path, &audio)
            .await
            .map_err(storage_err)?;

        let metadata = EntryMetadata {
            key: key.clone(),
            speaker_id: request.speaker_id.clone(),
            voice_id: request.voice_id.clone(),
            params: request.params.clone(),
            text_hash: hash_hex(normalize_text(&request.text).as_bytes()),
            source_text: request.text.clone(),
            generated_at: Utc::now(),
            regenerated,
            duration_ms: info.duration().as_millis() as u64,
            audio_bytes: audio.len(),
        };
        io::write_json(self.storage.as_ref(), &self.sidecar_path(key), &metadata)
            .await
            .map_err(storage_err)?;

        if regenerated {
            self.storage.delete(&marker).await.map_err(storage_err)?;
        }
        debug!("Cached {} ({} ms, voice {})", key, metadata.duration_ms, metadata.voice_id);

        Ok(CacheEntry {
            key: key.clone(),
            audio_path,
            metadata,
        })
    }
}
