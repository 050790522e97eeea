use futures_util::StreamExt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::AppConfig;
use crate::{log_debug, log_error, log_info, log_warn};

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

/// Fetches audio bytes to disk. Direct CDN streaming first; yt-dlp is
/// the heavier fallback and is skipped entirely in fast mode.
pub struct Downloader {
    client: reqwest::Client,
    ytdlp_bin: PathBuf,
    audio_quality: String,
    fast_mode: bool,
}

impl Downloader {
    pub fn new(config: &AppConfig) -> Self {
        // CDN hosts reject compressed-range requests; ask for identity
        // and keep decompression off so byte counts stay honest.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(BROWSER_UA)
            .gzip(false)
            .brotli(false)
            .build()
            .unwrap_or_default();

        Self {
            client,
            ytdlp_bin: config.ytdlp_bin.clone(),
            audio_quality: config.audio_quality.clone(),
            fast_mode: config.fast_mode,
        }
    }

    /// Stream `stream_url` into `dest`, replacing any previous partial
    /// file. Returns `false` on any failure; a failed attempt never
    /// leaves bytes behind at `dest`.
    pub async fn download_direct(&self, stream_url: &str, dest: &Path) -> bool {
        match self.stream_to_file(stream_url, dest).await {
            Ok(bytes) => {
                log_info!("[download] direct fetch complete ({} bytes)", bytes);
                true
            }
            Err(e) => {
                log_warn!("[download] direct fetch failed: {}", e);
                if dest.exists() {
                    let _ = std::fs::remove_file(dest);
                }
                false
            }
        }
    }

    async fn stream_to_file(&self, stream_url: &str, dest: &Path) -> Result<u64, String> {
        let resp = self
            .client
            .get(stream_url)
            .header("Accept-Encoding", "identity")
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        if !resp.status().is_success() {
            return Err(format!("HTTP status {}", resp.status()));
        }

        let total = resp.content_length().unwrap_or(0);
        let file = std::fs::File::create(dest)
            .map_err(|e| format!("failed to create {}: {}", dest.display(), e))?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        let mut written: u64 = 0;
        let mut last_logged_pct: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| format!("stream error: {}", e))?;
            writer
                .write_all(&chunk)
                .map_err(|e| format!("write error: {}", e))?;
            written += chunk.len() as u64;

            if total > 0 {
                let pct = written * 100 / total;
                if pct >= last_logged_pct + 20 {
                    last_logged_pct = pct;
                    log_debug!("[download] {}% ({}/{} bytes)", pct, written, total);
                }
            }
        }

        writer.flush().map_err(|e| format!("flush error: {}", e))?;

        if written == 0 {
            return Err("empty response body".to_string());
        }
        if total > 0 && written < total {
            return Err(format!("truncated body ({}/{} bytes)", written, total));
        }
        Ok(written)
    }

    /// Fetch via yt-dlp, which handles pages the direct path cannot.
    /// `page_url` is the watch page, not a CDN URL. Skipped in fast
    /// mode. yt-dlp picks the output extension itself, so `dest` is
    /// passed without one and the realized file is returned.
    pub async fn download_via_tool(&self, page_url: &str, dest: &Path) -> Option<PathBuf> {
        if self.fast_mode {
            log_debug!("[download] fast mode set, skipping yt-dlp fallback");
            return None;
        }

        let template = format!("{}.%(ext)s", dest.display());
        let result = tokio::process::Command::new(&self.ytdlp_bin)
            .args([
                "-x",
                "--audio-format",
                "m4a",
                "--audio-quality",
                &self.audio_quality,
                "--no-playlist",
                "-o",
                &template,
                page_url,
            ])
            .output()
            .await;

        let output = match result {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log_warn!("[download] yt-dlp not available, tool fallback disabled");
                return None;
            }
            Err(e) => {
                log_error!("[download] failed to run yt-dlp: {}", e);
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log_warn!(
                "[download] yt-dlp exit {}: {}",
                output.status,
                stderr.trim()
            );
            return None;
        }

        find_tool_output(dest)
    }
}

/// Locate the file yt-dlp actually produced for the `dest.%(ext)s`
/// template.
fn find_tool_output(dest: &Path) -> Option<PathBuf> {
    let parent = dest.parent()?;
    let stem = dest.file_name()?.to_str()?;
    let entries = std::fs::read_dir(parent).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_str()?;
        if let Some(ext) = name.strip_prefix(stem).and_then(|r| r.strip_prefix('.')) {
            if !ext.ends_with(".part") && !ext.is_empty() {
                return Some(entry.path());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write as IoWrite};
    use std::net::TcpListener;

    fn spawn_stub(status: u16, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let header = format!(
                    "HTTP/1.1 {} STUB\r\nContent-Type: audio/mp4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        format!("http://{}", addr)
    }

    fn downloader() -> Downloader {
        Downloader::new(&AppConfig::default())
    }

    #[tokio::test]
    async fn direct_download_writes_all_bytes() {
        let payload = vec![0xAAu8; 200_000];
        let base = spawn_stub(200, payload.clone());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("track.m4a.part");

        assert!(downloader().download_direct(&base, &dest).await);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[tokio::test]
    async fn http_error_leaves_no_partial_file() {
        let base = spawn_stub(403, b"denied".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("track.m4a.part");

        assert!(!downloader().download_direct(&base, &dest).await);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn empty_body_is_a_failure() {
        let base = spawn_stub(200, Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("track.m4a.part");

        assert!(!downloader().download_direct(&base, &dest).await);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn fast_mode_disables_tool_fallback() {
        let config = AppConfig {
            fast_mode: true,
            ..AppConfig::default()
        };
        let dl = Downloader::new(&config);
        let dir = tempfile::tempdir().unwrap();
        let out = dl
            .download_via_tool("https://www.youtube.com/watch?v=x", &dir.path().join("t"))
            .await;
        assert!(out.is_none());
    }

    #[test]
    fn tool_output_lookup_matches_template_extension() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc123");
        std::fs::write(dir.path().join("abc123.m4a"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated.m4a"), b"x").unwrap();

        assert_eq!(
            find_tool_output(&dest),
            Some(dir.path().join("abc123.m4a"))
        );
    }
}
