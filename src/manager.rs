use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::AppConfig;
use crate::download::Downloader;
use crate::metadata::{now_unix, CacheRecord, MetadataStore};
use crate::provider::{extract_video_id, ProviderResolver, TrackRef};
use crate::{log_error, log_info, log_warn};

/// How long a second caller waits for a download another caller owns.
const IN_FLIGHT_WAIT: Duration = Duration::from_millis(250);
const IN_FLIGHT_WAIT_LIMIT: u32 = 600;

/// Summary of on-disk cache usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub track_count: usize,
    pub total_bytes: u64,
}

/// Owns the cache directory: resolution, download, metadata, and
/// eviction flow through here. Shared behind an `Arc`; internal state
/// is mutex-guarded so callers never coordinate externally.
pub struct CacheManager {
    cache_dir: PathBuf,
    max_cache_bytes: u64,
    resolver: ProviderResolver,
    downloader: Downloader,
    store: MetadataStore,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// URL the player is currently on; its file is never evicted.
    active_url: Mutex<Option<String>>,
}

/// Marks a URL in flight for its lifetime. Removal happens in `Drop`,
/// so an early return or panic in the download path cannot leave the
/// URL stuck in the set.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    url: String,
}

impl InFlightGuard {
    /// `None` if the URL is already owned by another caller.
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, url: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap();
        if !guard.insert(url.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            url: url.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.url);
    }
}

impl CacheManager {
    pub fn new(config: &AppConfig) -> Result<Self, String> {
        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|e| format!("failed to create cache dir: {}", e))?;

        Ok(Self {
            cache_dir: config.cache_dir.clone(),
            max_cache_bytes: config.max_cache_bytes(),
            resolver: ProviderResolver::new(config),
            downloader: Downloader::new(config),
            store: MetadataStore::load(&config.metadata_file()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            active_url: Mutex::new(None),
        })
    }

    pub fn resolver(&self) -> &ProviderResolver {
        &self.resolver
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Tell eviction which track is playing right now.
    pub fn set_active_url(&self, url: Option<&str>) {
        *self.active_url.lock().unwrap() = url.map(str::to_string);
    }

    /// Cache-hit check: the record must exist AND its file must still
    /// be on disk. A record pointing at a missing file is dropped.
    pub fn is_cached(&self, url: &str) -> Option<PathBuf> {
        let filename = self.store.filename(url)?;
        let path = self.cache_dir.join(&filename);
        if path.exists() {
            return Some(path);
        }
        log_warn!("[cache] record for {} points at missing file, dropping", url);
        self.store.delete(url);
        None
    }

    /// Path where `url`'s audio lives or would live. Prefers the
    /// filename recorded in metadata; unknown URLs fall back to the
    /// bare hash name used before provenance tagging.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        match self.store.filename(url) {
            Some(name) => self.cache_dir.join(name),
            None => self.cache_dir.join(format!("{}.m4a", hash_url(url))),
        }
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.in_flight.lock().unwrap().contains(url)
    }

    /// Make `track` available locally and return its file path.
    /// Idempotent: a cache hit returns immediately, and concurrent
    /// calls for the same URL perform exactly one download (late
    /// callers wait on the owner and read its result).
    pub async fn ensure_cached(&self, track: &TrackRef) -> Result<PathBuf, String> {
        if let Some(path) = self.is_cached(&track.url) {
            return Ok(path);
        }

        let guard = match InFlightGuard::acquire(&self.in_flight, &track.url) {
            Some(guard) => guard,
            None => return self.wait_for_owner(&track.url).await,
        };

        let result = self.download(track).await;
        drop(guard);

        match &result {
            Ok(path) => log_info!("[cache] cached {} -> {}", track.url, path.display()),
            Err(e) => log_error!("[cache] failed to cache {}: {}", track.url, e),
        }
        if result.is_ok() {
            self.enforce_limit();
        }
        result
    }

    /// Poll until the owning download settles, then report its outcome
    /// from the metadata it left behind.
    async fn wait_for_owner(&self, url: &str) -> Result<PathBuf, String> {
        for _ in 0..IN_FLIGHT_WAIT_LIMIT {
            tokio::time::sleep(IN_FLIGHT_WAIT).await;
            if !self.is_in_flight(url) {
                return self
                    .is_cached(url)
                    .ok_or_else(|| "concurrent download failed".to_string());
            }
        }
        Err("timed out waiting for concurrent download".to_string())
    }

    async fn download(&self, track: &TrackRef) -> Result<PathBuf, String> {
        let hash = hash_url(&track.url);
        let part_path = self.cache_dir.join(format!("{}.m4a.part", hash));

        // direct path: resolve a CDN stream URL and fetch it ourselves
        if let Some(video_id) = track
            .video_id
            .clone()
            .or_else(|| extract_video_id(&track.url))
        {
            if let Some(stream_url) = self.resolver.resolve_stream_url(&video_id).await {
                if self.downloader.download_direct(&stream_url, &part_path).await {
                    return self.finalize(track, &hash, &part_path, "direct");
                }
            }
        }

        // tool fallback works from the page URL and names its own file
        let tool_dest = self.cache_dir.join(&hash);
        if let Some(produced) = self.downloader.download_via_tool(&track.url, &tool_dest).await {
            return self.finalize(track, &hash, &produced, "ytdlp");
        }

        if part_path.exists() {
            let _ = std::fs::remove_file(&part_path);
        }
        Err("all download methods failed".to_string())
    }

    /// Rename the fetched file to its tagged final name and record it.
    /// The record is written only after the rename succeeds, so a
    /// record never points at a partial file.
    fn finalize(
        &self,
        track: &TrackRef,
        hash: &str,
        fetched: &Path,
        download_method: &str,
    ) -> Result<PathBuf, String> {
        let ext = fetched
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| *e != "part")
            .unwrap_or("m4a")
            .to_string();
        let search_tag = method_tag(&track.search_method);
        let filename = format!("{}_[S-{}]_[D-{}].{}", hash, search_tag, download_method, ext);
        let final_path = self.cache_dir.join(&filename);

        std::fs::rename(fetched, &final_path)
            .map_err(|e| format!("failed to finalize {}: {}", final_path.display(), e))?;

        self.store.put(
            &track.url,
            CacheRecord {
                title: track.title.clone(),
                uploader: track.uploader.clone(),
                duration: track.duration,
                cached_at: now_unix(),
                filename,
                search_method: track.search_method.clone(),
                download_method: download_method.to_string(),
                play_count: 0,
                is_liked: false,
                is_disliked: false,
                last_played_at: None,
            },
        );
        Ok(final_path)
    }

    /// Delete one cached track. Best effort on both sides: a failed
    /// file removal still drops the record, and vice versa. True if
    /// either side removed something.
    pub fn delete(&self, url: &str) -> bool {
        let mut file_removed = false;
        if let Some(filename) = self.store.filename(url) {
            let path = self.cache_dir.join(filename);
            match std::fs::remove_file(&path) {
                Ok(()) => file_removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log_error!("[cache] failed to delete {}: {}", path.display(), e),
            }
        }
        let record_removed = self.store.delete(url);
        file_removed || record_removed
    }

    /// Wipe every cached file and all metadata.
    pub fn clear(&self) {
        for (url, record) in self.store.records() {
            let path = self.cache_dir.join(&record.filename);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    log_error!("[cache] failed to delete {}: {}", path.display(), e);
                }
            }
            self.store.delete(&url);
        }
        log_info!("[cache] cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for (_, record) in self.store.records() {
            let path = self.cache_dir.join(&record.filename);
            if let Ok(meta) = std::fs::metadata(&path) {
                stats.track_count += 1;
                stats.total_bytes += meta.len();
            }
        }
        stats
    }

    /// Evict least-recently-relevant tracks until on-disk usage fits
    /// the configured limit. Ordering is fully deterministic: oldest
    /// effective timestamp first, then smaller file, then URL. The
    /// active track is never evicted even when it is the oldest.
    pub fn enforce_limit(&self) {
        let active = self.active_url.lock().unwrap().clone();

        let mut entries: Vec<(String, u64, u64)> = Vec::new();
        let mut total: u64 = 0;
        for (url, record) in self.store.records() {
            let path = self.cache_dir.join(&record.filename);
            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            total += size;
            entries.push((url, record.effective_timestamp(), size));
        }

        if total <= self.max_cache_bytes {
            return;
        }

        entries.sort_by(|a, b| {
            a.1.cmp(&b.1)
                .then(a.2.cmp(&b.2))
                .then(a.0.cmp(&b.0))
        });

        for (url, _, size) in entries {
            if total <= self.max_cache_bytes {
                break;
            }
            if active.as_deref() == Some(url.as_str()) {
                continue;
            }
            if self.delete(&url) {
                total = total.saturating_sub(size);
                log_info!("[cache] evicted {} ({} bytes)", url, size);
            }
        }
    }
}

/// Stable cache key for a track URL.
pub fn hash_url(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..32].to_string()
}

fn method_tag(method: &str) -> String {
    let tag: String = method
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if tag.is_empty() {
        "unknown".to_string()
    } else {
        tag
    }
}
