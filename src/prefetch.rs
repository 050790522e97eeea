use std::sync::Arc;

use crate::manager::CacheManager;
use crate::provider::TrackRef;
use crate::worker::CacheWorkerPool;
use crate::{log_debug, log_info};

/// Fraction of the current track after which the next one is fetched.
const PREFETCH_THRESHOLD: f64 = 0.8;
/// Bounds on how many upcoming tracks are cached at playlist start.
const FRONT_LOAD_MIN: usize = 3;
const FRONT_LOAD_MAX: usize = 5;

/// Decides when upcoming playlist entries should be cached and hands
/// the work to the pool. Stateless between calls: dedup lives in the
/// cache manager and the pool, so repeated polls are harmless.
pub struct PrefetchScheduler {
    manager: Arc<CacheManager>,
    pool: Arc<CacheWorkerPool>,
    front_load: usize,
}

impl PrefetchScheduler {
    pub fn new(
        manager: Arc<CacheManager>,
        pool: Arc<CacheWorkerPool>,
        precache_count: usize,
    ) -> Self {
        Self {
            manager,
            pool,
            front_load: precache_count.clamp(FRONT_LOAD_MIN, FRONT_LOAD_MAX),
        }
    }

    /// Queue the next few tracks as soon as a playlist starts, so early
    /// skips land on warm files. Returns how many were queued.
    pub fn on_playlist_start(&self, playlist: &[TrackRef], current: usize) -> usize {
        let mut queued = 0;
        for track in playlist.iter().skip(current + 1).take(self.front_load) {
            if self.request(track) {
                queued += 1;
            }
        }
        if queued > 0 {
            log_info!("[prefetch] front-loaded {} upcoming tracks", queued);
        }
        queued
    }

    /// One playback tick. Queues the next track once the current one
    /// has passed the prefetch threshold; true if a request was queued.
    /// Tracks of unknown duration never trigger.
    pub fn poll(
        &self,
        playlist: &[TrackRef],
        current: usize,
        position_secs: f64,
        duration_secs: Option<f64>,
    ) -> bool {
        let Some(duration) = duration_secs.filter(|d| *d > 0.0) else {
            return false;
        };
        if position_secs / duration < PREFETCH_THRESHOLD {
            return false;
        }
        let Some(next) = playlist.get(current + 1) else {
            return false;
        };
        if self.request(next) {
            log_info!("[prefetch] queued next track {}", next.title);
            return true;
        }
        false
    }

    /// Extend a playlist with related tracks, skipping anything already
    /// listed. Used when the final track nears its end so playback does
    /// not run dry. Returns how many were added.
    pub fn extend_playlist(
        &self,
        playlist: &mut Vec<TrackRef>,
        recommendations: Vec<TrackRef>,
    ) -> usize {
        let mut added = 0;
        for track in recommendations {
            if playlist.iter().any(|t| t.url == track.url) {
                continue;
            }
            playlist.push(track);
            added += 1;
        }
        if added > 0 {
            log_info!("[prefetch] playlist extended with {} related tracks", added);
        }
        added
    }

    /// False when the track is already cached, queued, or mid-download.
    fn request(&self, track: &TrackRef) -> bool {
        if self.manager.is_cached(&track.url).is_some() {
            return false;
        }
        if self.manager.is_in_flight(&track.url) {
            log_debug!("[prefetch] {} already downloading", track.title);
            return false;
        }
        self.pool.enqueue(track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::manager::hash_url;
    use crate::metadata::{now_unix, CacheRecord};

    fn track(id: u32) -> TrackRef {
        TrackRef {
            url: format!("https://t.example/{}", id),
            title: format!("track {}", id),
            uploader: "Artist".to_string(),
            duration: Some(200),
            search_method: "API".to_string(),
            video_id: None,
        }
    }

    /// Pool with zero workers: nothing ever leaves the pending set, so
    /// dedup decisions are observable.
    fn fixture(dir: &std::path::Path) -> (Arc<CacheManager>, Arc<CacheWorkerPool>) {
        let config = AppConfig {
            cache_dir: dir.to_path_buf(),
            fast_mode: true,
            ..AppConfig::default()
        };
        let manager = Arc::new(CacheManager::new(&config).unwrap());
        let pool = Arc::new(CacheWorkerPool::spawn(Arc::clone(&manager), 0));
        (manager, pool)
    }

    fn mark_cached(manager: &CacheManager, track: &TrackRef) {
        let filename = format!("{}.m4a", hash_url(&track.url));
        std::fs::write(manager.cache_dir().join(&filename), b"audio").unwrap();
        manager.store().put(
            &track.url,
            CacheRecord {
                title: track.title.clone(),
                uploader: track.uploader.clone(),
                duration: track.duration,
                cached_at: now_unix(),
                filename,
                search_method: "API".into(),
                download_method: "direct".into(),
                play_count: 0,
                is_liked: false,
                is_disliked: false,
                last_played_at: None,
            },
        );
    }

    #[tokio::test]
    async fn threshold_gates_the_next_track_request() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let scheduler = PrefetchScheduler::new(manager, Arc::clone(&pool), 4);
        let playlist = vec![track(1), track(2)];

        // 79% of a 200s track: below threshold
        assert!(!scheduler.poll(&playlist, 0, 158.0, Some(200.0)));
        assert_eq!(pool.pending_count(), 0);

        // 85%: queued exactly once, repeat polls are no-ops
        assert!(scheduler.poll(&playlist, 0, 170.0, Some(200.0)));
        assert!(pool.is_pending("https://t.example/2"));
        assert!(!scheduler.poll(&playlist, 0, 175.0, Some(200.0)));
        assert_eq!(pool.pending_count(), 1);
    }

    #[tokio::test]
    async fn unknown_duration_never_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let scheduler = PrefetchScheduler::new(manager, Arc::clone(&pool), 4);
        let playlist = vec![track(1), track(2)];

        assert!(!scheduler.poll(&playlist, 0, 5000.0, None));
        assert!(!scheduler.poll(&playlist, 0, 5000.0, Some(0.0)));
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn last_track_has_nothing_to_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let scheduler = PrefetchScheduler::new(manager, Arc::clone(&pool), 4);
        let playlist = vec![track(1)];

        assert!(!scheduler.poll(&playlist, 0, 190.0, Some(200.0)));
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn playlist_start_front_loads_upcoming_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let scheduler = PrefetchScheduler::new(Arc::clone(&manager), Arc::clone(&pool), 4);
        let playlist: Vec<TrackRef> = (1..=8).map(track).collect();

        assert_eq!(scheduler.on_playlist_start(&playlist, 0), 4);
        for id in 2..=5 {
            assert!(pool.is_pending(&format!("https://t.example/{}", id)));
        }
        assert!(!pool.is_pending("https://t.example/6"));
        // the playing track itself is never queued
        assert!(!pool.is_pending("https://t.example/1"));
    }

    #[tokio::test]
    async fn front_load_count_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let playlist: Vec<TrackRef> = (1..=12).map(track).collect();

        let wide = PrefetchScheduler::new(Arc::clone(&manager), Arc::clone(&pool), 50);
        assert_eq!(wide.on_playlist_start(&playlist, 0), 5);
    }

    #[tokio::test]
    async fn playlist_extension_skips_tracks_already_listed() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let scheduler = PrefetchScheduler::new(manager, pool, 4);

        let mut playlist = vec![track(1), track(2)];
        let added = scheduler.extend_playlist(&mut playlist, vec![track(2), track(3), track(4)]);

        assert_eq!(added, 2);
        let urls: Vec<&str> = playlist.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://t.example/1",
                "https://t.example/2",
                "https://t.example/3",
                "https://t.example/4",
            ]
        );

        // nothing new: no growth
        assert_eq!(scheduler.extend_playlist(&mut playlist, vec![track(3)]), 0);
        assert_eq!(playlist.len(), 4);
    }

    #[tokio::test]
    async fn cached_tracks_are_skipped_at_front_load() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, pool) = fixture(dir.path());
        let scheduler = PrefetchScheduler::new(Arc::clone(&manager), Arc::clone(&pool), 4);
        let playlist: Vec<TrackRef> = (1..=6).map(track).collect();
        mark_cached(&manager, &playlist[1]);

        // track 2 is already on disk, only 3..=5 get queued
        assert_eq!(scheduler.on_playlist_start(&playlist, 0), 3);
        assert!(!pool.is_pending("https://t.example/2"));
    }
}
