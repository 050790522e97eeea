use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::config::AppConfig;
use crate::log_debug;

/// Property reads are best-effort; a stalled player must not stall the
/// poll loop.
const IPC_TIMEOUT: Duration = Duration::from_millis(200);

/// One reply line on the IPC socket.
#[derive(Debug, Deserialize)]
struct IpcReply {
    #[serde(default)]
    error: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    request_id: Option<u64>,
}

/// Player state sampled by one poll tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackSnapshot {
    pub position_secs: f64,
    pub duration_secs: Option<f64>,
    pub paused: bool,
    /// Path of the file mpv is playing, if any.
    pub path: Option<String>,
}

/// Client for mpv's JSON IPC socket. Commands are newline-delimited
/// JSON objects; each call opens its own connection, so a crashed
/// player only fails the call that hit it.
pub struct PlayerClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl PlayerClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Launch mpv pointed at our IPC socket with `target` as the first
    /// playlist entry.
    pub fn spawn(&self, config: &AppConfig, target: &str) -> Result<tokio::process::Child, String> {
        // a stale socket from a dead player blocks the new instance
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        let mut command = tokio::process::Command::new("mpv");
        command
            .arg(format!("--input-ipc-server={}", self.socket_path.display()))
            .args(&config.player_args)
            .arg(target)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        command
            .spawn()
            .map_err(|e| format!("failed to launch mpv: {}", e))
    }

    /// Run one command and return its `data` payload.
    pub async fn send_command(&self, command: &[Value]) -> Result<Option<Value>, String> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({ "command": command, "request_id": id });

        let exchange = async {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| format!("socket connect failed: {}", e))?;
            let (read_half, mut write_half) = stream.into_split();

            let mut line = serde_json::to_string(&request)
                .map_err(|e| format!("bad command payload: {}", e))?;
            line.push('\n');
            write_half
                .write_all(line.as_bytes())
                .await
                .map_err(|e| format!("socket write failed: {}", e))?;

            // events arrive interleaved with replies; skip until our id
            let mut reader = BufReader::new(read_half).lines();
            while let Some(line) = reader
                .next_line()
                .await
                .map_err(|e| format!("socket read failed: {}", e))?
            {
                let Ok(reply) = serde_json::from_str::<IpcReply>(&line) else {
                    continue;
                };
                if reply.request_id != Some(id) {
                    continue;
                }
                if reply.error != "success" {
                    return Err(format!("player refused command: {}", reply.error));
                }
                return Ok(reply.data);
            }
            Err("socket closed before reply".to_string())
        };

        match tokio::time::timeout(IPC_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err("player reply timed out".to_string()),
        }
    }

    pub async fn get_property(&self, name: &str) -> Result<Option<Value>, String> {
        self.send_command(&[json!("get_property"), json!(name)]).await
    }

    async fn get_f64(&self, name: &str) -> Option<f64> {
        self.get_property(name).await.ok().flatten()?.as_f64()
    }

    /// Sample position, duration, pause state and current path in one
    /// tick. Missing properties degrade to defaults rather than erroring,
    /// since mpv reports no position between tracks.
    pub async fn snapshot(&self) -> PlaybackSnapshot {
        let position_secs = self.get_f64("time-pos").await.unwrap_or(0.0);
        let duration_secs = self.get_f64("duration").await.filter(|d| *d > 0.0);
        let paused = self
            .get_property("pause")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let path = self
            .get_property("path")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string));

        PlaybackSnapshot {
            position_secs,
            duration_secs,
            paused,
            path,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.get_property("pid").await.is_ok()
    }

    /// Ramp volume to zero over ~0.5s, then quit. Failures past the
    /// first step are ignored; the player may already be gone.
    pub async fn fade_out_and_stop(&self) {
        for volume in (0..=90).rev().step_by(10) {
            if self
                .send_command(&[json!("set_property"), json!("volume"), json!(volume)])
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if let Err(e) = self.send_command(&[json!("quit")]).await {
            log_debug!("[player] quit after fade failed: {}", e);
        }
    }
}
