use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;
use crate::provider::{ProviderInstance, ProviderKind};

/// Environment toggle that disables the slowest fallback tier (yt-dlp)
/// for both search and download.
pub const FAST_MODE_ENV: &str = "TUNESTASH_FAST_MODE";

/// Engine configuration, constructed once at startup and passed to every
/// component that needs it. No component reads config files or the
/// environment on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding cached audio files and the metadata file.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Ordered list of API mirrors used for resolution and search.
    #[serde(default = "default_api_instances")]
    pub api_instances: Vec<ProviderInstance>,

    /// Cache size budget in megabytes.
    #[serde(default = "default_max_cache_mb")]
    pub max_cache_mb: u64,

    /// Drop search results longer than this many seconds. Tracks with
    /// unknown duration always pass.
    #[serde(default)]
    pub max_duration: Option<u64>,

    /// Quality hint passed to the external extraction tool.
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,

    /// Skip the yt-dlp tier entirely (search tier 4 and the download
    /// fallback).
    #[serde(default)]
    pub fast_mode: bool,

    /// How many tracks to front-load when a playlist starts.
    #[serde(default = "default_precache_count")]
    pub precache_count: usize,

    /// Number of cache worker tasks. One is sufficient; more increases
    /// download parallelism.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// IPC socket of the external player process.
    #[serde(default = "default_player_socket")]
    pub player_socket: PathBuf,

    /// Arguments for spawning the external player.
    #[serde(default = "default_player_args")]
    pub player_args: Vec<String>,

    /// Aggregated-search CLI script (Node). Absent or missing on disk
    /// means the aggregator tier is skipped.
    #[serde(default)]
    pub aggregator_script: Option<PathBuf>,

    /// Name or path of the external extraction binary.
    #[serde(default = "default_ytdlp_bin")]
    pub ytdlp_bin: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunestash")
        .join("music_cache")
}

fn default_api_instances() -> Vec<ProviderInstance> {
    vec![
        ProviderInstance {
            kind: ProviderKind::Invidious,
            url: "https://iv.melmac.space".to_string(),
        },
        ProviderInstance {
            kind: ProviderKind::Invidious,
            url: "https://invidious.reallyaweso.me".to_string(),
        },
        ProviderInstance {
            kind: ProviderKind::Piped,
            url: "https://pipedapi.kavin.rocks".to_string(),
        },
    ]
}

fn default_max_cache_mb() -> u64 {
    500
}

fn default_audio_quality() -> String {
    "128k".to_string()
}

fn default_precache_count() -> usize {
    4
}

fn default_workers() -> usize {
    1
}

fn default_player_socket() -> PathBuf {
    std::env::temp_dir().join("tunestash-mpv.sock")
}

fn default_player_args() -> Vec<String> {
    vec![
        "--no-video".to_string(),
        "--ytdl-format=bestaudio/best".to_string(),
        "--force-window=no".to_string(),
    ]
}

fn default_ytdlp_bin() -> PathBuf {
    PathBuf::from("yt-dlp")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            api_instances: default_api_instances(),
            max_cache_mb: default_max_cache_mb(),
            max_duration: None,
            audio_quality: default_audio_quality(),
            fast_mode: false,
            precache_count: default_precache_count(),
            workers: default_workers(),
            player_socket: default_player_socket(),
            player_args: default_player_args(),
            aggregator_script: None,
            ytdlp_bin: default_ytdlp_bin(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location
    /// (`<config dir>/tunestash/config.json`), falling back to defaults,
    /// then apply environment overrides.
    pub fn load() -> Self {
        let path = dirs::config_dir().map(|d| d.join("tunestash").join("config.json"));
        let mut config = match path {
            Some(ref p) if p.exists() => Self::load_from(p),
            _ => Self::default(),
        };
        config.apply_env();
        config
    }

    /// Load configuration from an explicit file. Unreadable or malformed
    /// config is non-fatal and yields defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    log_warn!("[config] bad config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log_warn!("[config] cannot read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(FAST_MODE_ENV) {
            self.fast_mode = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.cache_dir.join("cache_metadata.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    pub fn crash_file(&self) -> PathBuf {
        self.log_dir().join("crash.log")
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_mb * 1024 * 1024
    }
}
