use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::provider::TrackRef;
use crate::{log_error, log_warn};

/// One cached track. A record is created only on a successful download;
/// a record whose file is missing on disk is stale and must never be
/// trusted as a cache hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub title: String,
    pub uploader: String,
    /// Seconds; `None` is the unknown/live sentinel, distinct from 0.
    #[serde(default)]
    pub duration: Option<u64>,
    /// Unix seconds at download completion.
    pub cached_at: u64,
    pub filename: String,
    pub search_method: String,
    pub download_method: String,
    #[serde(default)]
    pub play_count: u32,
    #[serde(default)]
    pub is_liked: bool,
    #[serde(default)]
    pub is_disliked: bool,
    /// Unix seconds of the most recent play, if any.
    #[serde(default)]
    pub last_played_at: Option<u64>,
}

impl CacheRecord {
    /// Eviction rank: a file played recently is protected ahead of a
    /// file merely downloaded recently.
    pub fn effective_timestamp(&self) -> u64 {
        self.cached_at.max(self.last_played_at.unwrap_or(0))
    }
}

/// Play/feedback counters for one URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackStats {
    pub play_count: u32,
    pub is_liked: bool,
    pub is_disliked: bool,
}

/// Snapshot of the last playback session, for resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub playlist: Vec<TrackRef>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub files: HashMap<String, CacheRecord>,
    #[serde(default)]
    pub last_session: Option<SessionSnapshot>,
}

/// Durable URL -> record mapping. Holds the single authoritative
/// in-memory copy; every mutation is written through to disk before the
/// mutating call returns. Writes are not crash-atomic; a torn write is
/// recovered on the next `load` via the corruption backup path.
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<CacheMetadata>,
}

impl MetadataStore {
    /// Load the metadata file. Any read or parse failure moves the file
    /// aside as a `.corrupted.json` backup and yields a fresh empty
    /// store. Never errors to the caller.
    pub fn load(path: &Path) -> Self {
        let state = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<CacheMetadata>(&text) {
                Ok(meta) => meta,
                Err(e) => {
                    log_warn!("[metadata] failed to parse {}: {}", path.display(), e);
                    Self::quarantine(path);
                    CacheMetadata::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => CacheMetadata::default(),
            Err(e) => {
                log_warn!("[metadata] failed to read {}: {}", path.display(), e);
                Self::quarantine(path);
                CacheMetadata::default()
            }
        };

        Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        }
    }

    /// Move an unreadable metadata file aside so the next save starts
    /// clean while keeping the bytes around for inspection.
    fn quarantine(path: &Path) {
        let backup = path.with_extension("corrupted.json");
        match fs::rename(path, &backup) {
            Ok(()) => log_warn!("[metadata] corrupted file moved to {}", backup.display()),
            Err(e) => log_warn!("[metadata] could not back up corrupted file: {}", e),
        }
    }

    /// Serialize the current state to disk. Write errors are logged and
    /// swallowed; the in-memory copy stays authoritative.
    fn persist(&self, state: &CacheMetadata) {
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    log_error!("[metadata] failed to write {}: {}", self.path.display(), e);
                }
            }
            Err(e) => log_error!("[metadata] failed to serialize metadata: {}", e),
        }
    }

    pub fn get(&self, url: &str) -> Option<CacheRecord> {
        self.state.lock().unwrap().files.get(url).cloned()
    }

    /// Insert or replace the record for `url`. Merge semantics: the
    /// play/feedback fields of an existing record survive a re-download.
    pub fn put(&self, url: &str, mut record: CacheRecord) {
        let mut state = self.state.lock().unwrap();
        if let Some(prev) = state.files.get(url) {
            record.play_count = prev.play_count;
            record.is_liked = prev.is_liked;
            record.is_disliked = prev.is_disliked;
            record.last_played_at = prev.last_played_at;
        }
        state.files.insert(url.to_string(), record);
        self.persist(&state);
    }

    /// Remove the record for `url`; true if a record existed.
    pub fn delete(&self, url: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let removed = state.files.remove(url).is_some();
        if removed {
            self.persist(&state);
        }
        removed
    }

    /// Filename recorded for `url`, if any.
    pub fn filename(&self, url: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(url)
            .map(|r| r.filename.clone())
    }

    /// Snapshot of all records, for eviction and listing.
    pub fn records(&self) -> Vec<(String, CacheRecord)> {
        self.state
            .lock()
            .unwrap()
            .files
            .iter()
            .map(|(url, record)| (url.clone(), record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Increment the play counter and stamp the last play time.
    pub fn mark_played(&self, url: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.files.get_mut(url) {
            record.play_count += 1;
            record.last_played_at = Some(now_unix());
            self.persist(&state);
        }
    }

    /// Toggle the like flag; liking clears a dislike. Returns the new
    /// like state (false for unknown URLs).
    pub fn toggle_like(&self, url: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.files.get_mut(url) else {
            return false;
        };
        record.is_liked = !record.is_liked;
        if record.is_liked {
            record.is_disliked = false;
        }
        let liked = record.is_liked;
        self.persist(&state);
        liked
    }

    /// Toggle the dislike flag; disliking clears a like. Returns the new
    /// dislike state (false for unknown URLs).
    pub fn toggle_dislike(&self, url: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.files.get_mut(url) else {
            return false;
        };
        record.is_disliked = !record.is_disliked;
        if record.is_disliked {
            record.is_liked = false;
        }
        let disliked = record.is_disliked;
        self.persist(&state);
        disliked
    }

    pub fn track_stats(&self, url: &str) -> TrackStats {
        self.state
            .lock()
            .unwrap()
            .files
            .get(url)
            .map(|r| TrackStats {
                play_count: r.play_count,
                is_liked: r.is_liked,
                is_disliked: r.is_disliked,
            })
            .unwrap_or_default()
    }

    pub fn set_last_session(&self, session: SessionSnapshot) {
        let mut state = self.state.lock().unwrap();
        state.last_session = Some(session);
        self.persist(&state);
    }

    pub fn last_session(&self) -> Option<SessionSnapshot> {
        self.state.lock().unwrap().last_session.clone()
    }

    /// Drop every record (files are the caller's problem).
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.files.clear();
        self.persist(&state);
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
