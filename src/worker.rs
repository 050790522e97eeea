use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::manager::CacheManager;
use crate::provider::TrackRef;
use crate::{log_debug, log_info, log_warn};

/// FIFO background caching pool. Requests enter an unbounded queue and
/// a fixed set of workers drains it in arrival order.
///
/// A URL joins the pending set at enqueue time, not at dequeue time, so
/// a second enqueue between submit and pickup is rejected rather than
/// racing. The URL leaves the set only when its job settles.
pub struct CacheWorkerPool {
    tx: mpsc::UnboundedSender<TrackRef>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TrackRef>>>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl CacheWorkerPool {
    /// Start `workers` drain tasks over a shared queue. Zero workers is
    /// legal: jobs queue up and stay pending until a worker exists.
    pub fn spawn(manager: Arc<CacheManager>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<TrackRef>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(Mutex::new(HashSet::new()));

        for id in 0..workers {
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                loop {
                    let track = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(track) = track else {
                        log_debug!("[worker] {} shutting down, queue closed", id);
                        break;
                    };

                    log_info!("[worker] {} caching {}", id, track.title);
                    match manager.ensure_cached(&track).await {
                        Ok(_) => log_info!("[worker] {} finished {}", id, track.title),
                        Err(e) => log_warn!("[worker] {} failed {}: {}", id, track.title, e),
                    }
                    pending.lock().unwrap().remove(&track.url);
                }
            });
        }

        Self { tx, rx, pending }
    }

    /// Submit a caching request; false when the URL is already queued
    /// or being worked on.
    pub fn enqueue(&self, track: &TrackRef) -> bool {
        {
            let mut pending = self.pending.lock().unwrap();
            if !pending.insert(track.url.clone()) {
                return false;
            }
        }
        if self.tx.send(track.clone()).is_err() {
            self.pending.lock().unwrap().remove(&track.url);
            log_warn!("[worker] queue closed, dropping {}", track.title);
            return false;
        }
        true
    }

    /// True between enqueue and the job settling.
    pub fn is_pending(&self, url: &str) -> bool {
        self.pending.lock().unwrap().contains(url)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Requests sitting in the queue, not yet picked up. A worker
    /// parked on the queue holds its lock, which reads as empty here.
    pub fn queued(&self) -> usize {
        match self.rx.try_lock() {
            Ok(rx) => rx.len(),
            Err(_) => 0,
        }
    }

    /// Hand the shared queue to an externally spawned drain task. Used
    /// by tests that need to observe the queue directly.
    #[cfg(test)]
    fn receiver(&self) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TrackRef>>> {
        Arc::clone(&self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn track(url: &str) -> TrackRef {
        TrackRef {
            url: url.to_string(),
            title: "t".to_string(),
            uploader: "u".to_string(),
            duration: Some(60),
            search_method: "API".to_string(),
            video_id: None,
        }
    }

    fn idle_pool() -> CacheWorkerPool {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            cache_dir: dir.path().to_path_buf(),
            fast_mode: true,
            ..AppConfig::default()
        };
        let manager = Arc::new(CacheManager::new(&config).unwrap());
        CacheWorkerPool::spawn(manager, 0)
    }

    #[tokio::test]
    async fn enqueue_marks_pending_and_rejects_duplicates() {
        let pool = idle_pool();
        let t = track("https://a.example/1");

        assert!(pool.enqueue(&t));
        assert!(pool.is_pending(&t.url));
        // second submit of the same URL is rejected while pending
        assert!(!pool.enqueue(&t));
        assert_eq!(pool.pending_count(), 1);

        assert!(pool.enqueue(&track("https://b.example/2")));
        assert_eq!(pool.pending_count(), 2);
    }

    #[tokio::test]
    async fn queue_preserves_arrival_order() {
        let pool = idle_pool();
        pool.enqueue(&track("https://a.example/1"));
        pool.enqueue(&track("https://b.example/2"));
        pool.enqueue(&track("https://c.example/3"));
        assert_eq!(pool.queued(), 3);

        let rx = pool.receiver();
        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().url, "https://a.example/1");
        assert_eq!(rx.recv().await.unwrap().url, "https://b.example/2");
        assert_eq!(rx.recv().await.unwrap().url, "https://c.example/3");
    }
}
