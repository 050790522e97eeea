use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::AppConfig;
use crate::{log_debug, log_info, log_warn};

/// Per-request timeout for API mirrors. Expired requests are abandoned,
/// never retried against the same instance.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for the aggregated-search CLI tier.
const AGGREGATOR_TIMEOUT: Duration = Duration::from_secs(10);

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

const YOUTUBEI_SEARCH_URL: &str = "https://www.youtube.com/youtubei/v1/search";

/// A third-party API mirror used for resolution and search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Invidious,
    Piped,
}

/// A track as produced by search. Transient: discarded once played or
/// cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRef {
    pub url: String,
    pub title: String,
    pub uploader: String,
    /// Seconds; `None` means unknown or live.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub search_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}

/// Resolves track identifiers to direct media URLs and runs tiered
/// multi-source search over a rotating list of API mirrors.
///
/// The rotation cursor is process-local and sticky: it stays on the
/// last instance that succeeded and advances only on failure.
pub struct ProviderResolver {
    client: reqwest::Client,
    instances: Vec<ProviderInstance>,
    cursor: Mutex<usize>,
    max_duration: Option<u64>,
    fast_mode: bool,
    aggregator_script: Option<PathBuf>,
    ytdlp_bin: PathBuf,
}

impl ProviderResolver {
    pub fn new(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(BROWSER_UA)
            .build()
            .unwrap_or_default();

        Self {
            client,
            instances: config.api_instances.clone(),
            cursor: Mutex::new(0),
            max_duration: config.max_duration,
            fast_mode: config.fast_mode,
            aggregator_script: config.aggregator_script.clone(),
            ytdlp_bin: config.ytdlp_bin.clone(),
        }
    }

    /// Index of the instance the rotation cursor currently points at.
    pub fn current_instance_index(&self) -> usize {
        *self.cursor.lock().unwrap()
    }

    fn advance_cursor(&self) {
        let mut cursor = self.cursor.lock().unwrap();
        *cursor = (*cursor + 1) % self.instances.len().max(1);
    }

    /// Resolve a video id to the direct URL of its highest-bitrate audio
    /// stream. Tries each instance at most once, starting at the cursor;
    /// any failure rotates to the next instance. Returns `None` only
    /// after every instance has failed in this call.
    pub async fn resolve_stream_url(&self, video_id: &str) -> Option<String> {
        for _ in 0..self.instances.len() {
            let index = self.current_instance_index();
            let instance = self.instances[index].clone();
            match self.fetch_stream_url(&instance, video_id).await {
                Ok(url) => return Some(url),
                Err(e) => {
                    log_warn!("[provider] {} failed for {}: {}", instance.url, video_id, e);
                    self.advance_cursor();
                }
            }
        }
        None
    }

    async fn fetch_stream_url(
        &self,
        instance: &ProviderInstance,
        video_id: &str,
    ) -> Result<String, String> {
        let base = instance.url.trim_end_matches('/');
        let streams = match instance.kind {
            ProviderKind::Piped => {
                let url = format!("{}/streams/{}", base, video_id);
                let body: PipedStreams = self.get_json(&url).await?;
                body.audio_streams
            }
            ProviderKind::Invidious => {
                let url = format!("{}/api/v1/videos/{}", base, video_id);
                let body: InvidiousVideo = self.get_json(&url).await?;
                body.adaptive_formats
                    .into_iter()
                    .filter(|f| {
                        f.kind
                            .as_deref()
                            .map(|t| t.starts_with("audio"))
                            .unwrap_or(false)
                    })
                    .collect()
            }
        };

        pick_highest_bitrate(&streams).ok_or_else(|| "no audio streams in payload".to_string())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP status {}", resp.status()));
        }
        resp.json::<T>()
            .await
            .map_err(|e| format!("malformed payload: {}", e))
    }

    /// Tiered search: aggregator CLI, then the rotating instance list,
    /// then a direct YouTubei call, then yt-dlp (skipped in fast mode).
    /// The first tier returning a non-empty list wins.
    pub async fn search(&self, query: &str, max_results: usize) -> Vec<TrackRef> {
        if let Some(results) = self.search_aggregator(query, max_results).await {
            if !results.is_empty() {
                log_info!("[provider] aggregator search found {}", results.len());
                return results;
            }
        }

        let results = self.search_instances(query, max_results).await;
        if !results.is_empty() {
            log_info!("[provider] instance search found {}", results.len());
            return results;
        }

        let results = self.search_youtubei(query, max_results).await;
        if !results.is_empty() {
            log_info!("[provider] youtubei search found {}", results.len());
            return results;
        }

        if self.fast_mode {
            log_debug!("[provider] fast mode set, skipping yt-dlp search tier");
            return Vec::new();
        }

        let results = self.search_ytdlp(query, max_results).await;
        if !results.is_empty() {
            log_info!("[provider] yt-dlp search found {}", results.len());
        }
        results
    }

    /// Tier 1: external aggregated-search CLI. `None` when the script is
    /// not configured, missing, or failed; `Some(vec![])` when it ran
    /// but found nothing.
    async fn search_aggregator(&self, query: &str, max_results: usize) -> Option<Vec<TrackRef>> {
        let script = self.aggregator_script.as_ref()?;
        if !script.exists() {
            return None;
        }

        let command = tokio::process::Command::new("node")
            .arg(script)
            .args(["search", query, "--json"])
            .output();
        let output = match tokio::time::timeout(AGGREGATOR_TIMEOUT, command).await {
            Ok(Ok(out)) if out.status.success() => out,
            Ok(Ok(out)) => {
                log_warn!("[provider] aggregator exit {}", out.status);
                return None;
            }
            Ok(Err(e)) => {
                log_warn!("[provider] aggregator failed to run: {}", e);
                return None;
            }
            Err(_) => {
                log_warn!("[provider] aggregator timed out");
                return None;
            }
        };

        let items: Vec<AggregatorItem> = match serde_json::from_slice(&output.stdout) {
            Ok(items) => items,
            Err(e) => {
                log_warn!("[provider] bad aggregator JSON: {}", e);
                return None;
            }
        };

        let tracks = items
            .into_iter()
            .filter_map(|item| item.into_track_ref())
            .collect();
        Some(self.apply_duration_filter(tracks, max_results))
    }

    /// Tier 2: rotating instance search, same rotation discipline as
    /// stream resolution.
    async fn search_instances(&self, query: &str, max_results: usize) -> Vec<TrackRef> {
        for _ in 0..self.instances.len() {
            let index = self.current_instance_index();
            let instance = self.instances[index].clone();
            match self.fetch_search(&instance, query).await {
                Ok(tracks) => return self.apply_duration_filter(tracks, max_results),
                Err(e) => {
                    log_warn!("[provider] {} search failed: {}", instance.url, e);
                    self.advance_cursor();
                }
            }
        }
        Vec::new()
    }

    async fn fetch_search(
        &self,
        instance: &ProviderInstance,
        query: &str,
    ) -> Result<Vec<TrackRef>, String> {
        let base = instance.url.trim_end_matches('/');
        let encoded = urlencoding::encode(query);
        match instance.kind {
            ProviderKind::Piped => {
                let url = format!("{}/search?q={}&filter=music_songs", base, encoded);
                let body: PipedSearchResponse = self.get_json(&url).await?;
                Ok(body
                    .items
                    .into_iter()
                    .filter_map(|item| item.into_track_ref())
                    .collect())
            }
            ProviderKind::Invidious => {
                let url = format!("{}/api/v1/search?q={}&type=video", base, encoded);
                let body: Vec<InvidiousSearchItem> = self.get_json(&url).await?;
                Ok(body
                    .into_iter()
                    .filter_map(|item| item.into_track_ref())
                    .collect())
            }
        }
    }

    /// Tier 3: direct first-party search. Single attempt, no rotation.
    async fn search_youtubei(&self, query: &str, max_results: usize) -> Vec<TrackRef> {
        let payload = serde_json::json!({
            "context": {
                "client": {
                    "clientName": "WEB",
                    "clientVersion": "2.20230522.01.00",
                    "hl": "en",
                    "gl": "US"
                }
            },
            "query": query
        });

        let resp = match self
            .client
            .post(YOUTUBEI_SEARCH_URL)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                log_warn!("[provider] youtubei HTTP status {}", resp.status());
                return Vec::new();
            }
            Err(e) => {
                log_warn!("[provider] youtubei request failed: {}", e);
                return Vec::new();
            }
        };

        let body: YtiResponse = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                log_warn!("[provider] bad youtubei payload: {}", e);
                return Vec::new();
            }
        };

        let tracks = body
            .video_renderers()
            .filter_map(YtiVideo::into_track_ref)
            .collect();
        self.apply_duration_filter(tracks, max_results)
    }

    /// Tier 4: yt-dlp search, the slowest fallback.
    async fn search_ytdlp(&self, query: &str, max_results: usize) -> Vec<TrackRef> {
        let target = format!("ytsearch{}:{}", max_results, query);
        let output = tokio::process::Command::new(&self.ytdlp_bin)
            .args([
                "--dump-json",
                "--default-search",
                "ytsearch",
                "--skip-download",
                &target,
            ])
            .output()
            .await;

        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                log_warn!("[provider] yt-dlp search exit {}", out.status);
                return Vec::new();
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log_warn!("[provider] yt-dlp not available, skipping search tier");
                return Vec::new();
            }
            Err(e) => {
                log_warn!("[provider] failed to run yt-dlp: {}", e);
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let tracks = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<YtdlpEntry>(line).ok())
            .filter_map(YtdlpEntry::into_track_ref)
            .collect();
        self.apply_duration_filter(tracks, max_results)
    }

    /// Build a related-music query from a track and reuse the tiered
    /// search for it.
    pub async fn recommendations(&self, track: &TrackRef, max_results: usize) -> Vec<TrackRef> {
        let query = if !track.uploader.is_empty() && track.uploader != "Unknown" {
            format!("{} similar music", track.uploader)
        } else {
            track
                .title
                .split_whitespace()
                .take(3)
                .collect::<Vec<_>>()
                .join(" ")
        };
        self.search(&query, max_results).await
    }

    /// Drop tracks exceeding the configured maximum duration. Unknown
    /// duration always passes.
    fn apply_duration_filter(&self, tracks: Vec<TrackRef>, max_results: usize) -> Vec<TrackRef> {
        let mut tracks = match self.max_duration {
            None => tracks,
            Some(max) => tracks
                .into_iter()
                .filter(|t| t.duration.map_or(true, |d| d <= max))
                .collect(),
        };
        tracks.truncate(max_results);
        tracks
    }
}

/// Highest bitrate wins; ties keep the earliest candidate in payload
/// order. Streams without a parseable bitrate rank lowest.
fn pick_highest_bitrate(streams: &[AudioStream]) -> Option<String> {
    let mut best: Option<&AudioStream> = None;
    for stream in streams {
        match best {
            None => best = Some(stream),
            Some(current) if stream.bitrate.unwrap_or(0) > current.bitrate.unwrap_or(0) => {
                best = Some(stream);
            }
            _ => {}
        }
    }
    best.map(|s| s.url.clone())
}

/// Normalize a loosely-typed duration value to whole seconds. Numbers
/// pass through with fractions truncated; `"H:MM:SS"` / `"M:SS"` and
/// bare digit strings are parsed; anything else is the unknown sentinel.
pub fn normalize_duration(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(n) = value.as_f64() {
        if n < 0.0 {
            return None;
        }
        return Some(n.trunc() as u64);
    }
    value.as_str().and_then(parse_duration_text)
}

/// Parse `"H:MM:SS"`, `"M:SS"` or a bare seconds string.
pub fn parse_duration_text(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let parts: Vec<&str> = text.split(':').collect();
    match parts.len() {
        1 => parts[0].parse().ok(),
        2 => {
            let minutes: u64 = parts[0].parse().ok()?;
            let seconds: u64 = parts[1].parse().ok()?;
            Some(minutes * 60 + seconds)
        }
        3 => {
            let hours: u64 = parts[0].parse().ok()?;
            let minutes: u64 = parts[1].parse().ok()?;
            let seconds: u64 = parts[2].parse().ok()?;
            Some(hours * 3600 + minutes * 60 + seconds)
        }
        _ => None,
    }
}

/// Extract an 11-character video id from a watch URL or a bare id.
pub fn extract_video_id(url: &str) -> Option<String> {
    if url.len() == 11
        && url
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Some(url.to_string());
    }
    if let Some(start) = url.find("v=") {
        let rest = &url[start + 2..];
        let end = rest.find('&').unwrap_or(rest.len());
        return Some(rest[..end].to_string());
    }
    if let Some(start) = url.find("youtu.be/") {
        let rest = &url[start + 9..];
        let end = rest.find('?').unwrap_or(rest.len());
        return Some(rest[..end].to_string());
    }
    None
}

fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

// ---- typed provider responses, validated at the network boundary ----

/// One audio stream candidate. Piped reports `bitrate` as a number,
/// Invidious as a string; both shapes deserialize here.
#[derive(Debug, Deserialize)]
struct AudioStream {
    url: String,
    #[serde(default, deserialize_with = "bitrate_from_number_or_string")]
    bitrate: Option<u64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

fn bitrate_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) if n >= 0.0 => Some(n.trunc() as u64),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStreams {
    #[serde(default)]
    audio_streams: Vec<AudioStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousVideo {
    #[serde(default)]
    adaptive_formats: Vec<AudioStream>,
}

#[derive(Debug, Deserialize)]
struct PipedSearchResponse {
    #[serde(default)]
    items: Vec<PipedSearchItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedSearchItem {
    #[serde(default)]
    title: Option<String>,
    /// Relative watch URL, e.g. `/watch?v=abc123`.
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    uploader_name: Option<String>,
}

impl PipedSearchItem {
    fn into_track_ref(self) -> Option<TrackRef> {
        let relative = self.url?;
        let video_id = extract_video_id(&relative)?;
        Some(TrackRef {
            url: watch_url(&video_id),
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            uploader: self.uploader_name.unwrap_or_else(|| "Unknown".to_string()),
            // Piped reports -1 for live streams
            duration: self.duration.filter(|d| *d >= 0).map(|d| d as u64),
            search_method: "API".to_string(),
            video_id: Some(video_id),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousSearchItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    video_id: Option<String>,
    #[serde(default)]
    length_seconds: Option<i64>,
    #[serde(default)]
    author: Option<String>,
}

impl InvidiousSearchItem {
    fn into_track_ref(self) -> Option<TrackRef> {
        let video_id = self.video_id?;
        Some(TrackRef {
            url: watch_url(&video_id),
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            uploader: self.author.unwrap_or_else(|| "Unknown".to_string()),
            // 0 means live/unknown on Invidious search results
            duration: self.length_seconds.filter(|d| *d > 0).map(|d| d as u64),
            search_method: "API".to_string(),
            video_id: Some(video_id),
        })
    }
}

/// One result line from the aggregator CLI. Sources disagree on field
/// types, so duration stays loosely typed until normalization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatorItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration: Option<Value>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    video_id: Option<String>,
}

impl AggregatorItem {
    fn into_track_ref(self) -> Option<TrackRef> {
        let source = self.source.unwrap_or_else(|| "AGG".to_string());
        let url = match (self.url, self.video_id.as_deref()) {
            (Some(url), _) => url,
            (None, Some(id)) => match source.as_str() {
                "AM" => format!("https://audiomack.com/song/{}", id),
                "SC" => format!("https://soundcloud.com/{}", id),
                _ => watch_url(id),
            },
            (None, None) => return None,
        };
        Some(TrackRef {
            url,
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            uploader: self.uploader.unwrap_or_else(|| "Unknown".to_string()),
            duration: normalize_duration(self.duration.as_ref()),
            search_method: source,
            video_id: self.video_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct YtdlpEntry {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
}

impl YtdlpEntry {
    fn into_track_ref(self) -> Option<TrackRef> {
        let url = self.webpage_url?;
        let video_id = extract_video_id(&url);
        Some(TrackRef {
            title: self.title.unwrap_or_else(|| "Unknown".to_string()),
            uploader: self.uploader.unwrap_or_else(|| "Unknown".to_string()),
            duration: self.duration.filter(|d| *d >= 0.0).map(|d| d.trunc() as u64),
            search_method: "YTDLP".to_string(),
            video_id,
            url,
        })
    }
}

// Minimal typed slice of the YouTubei search payload; only the path
// down to videoRenderer entries is modeled.
#[derive(Debug, Default, Deserialize)]
struct YtiResponse {
    #[serde(default)]
    contents: Option<YtiContents>,
}

impl YtiResponse {
    fn video_renderers(self) -> impl Iterator<Item = YtiVideo> {
        self.contents
            .and_then(|c| c.two_column_search_results_renderer)
            .and_then(|c| c.primary_contents)
            .and_then(|c| c.section_list_renderer)
            .map(|s| s.contents)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|section| section.item_section_renderer)
            .flat_map(|section| section.contents)
            .filter_map(|item| item.video_renderer)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiContents {
    #[serde(default)]
    two_column_search_results_renderer: Option<YtiTwoColumn>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiTwoColumn {
    #[serde(default)]
    primary_contents: Option<YtiPrimaryContents>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiPrimaryContents {
    #[serde(default)]
    section_list_renderer: Option<YtiSectionList>,
}

#[derive(Debug, Default, Deserialize)]
struct YtiSectionList {
    #[serde(default)]
    contents: Vec<YtiSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiSection {
    #[serde(default)]
    item_section_renderer: Option<YtiItemSection>,
}

#[derive(Debug, Default, Deserialize)]
struct YtiItemSection {
    #[serde(default)]
    contents: Vec<YtiItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiItem {
    #[serde(default)]
    video_renderer: Option<YtiVideo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiVideo {
    #[serde(default)]
    video_id: Option<String>,
    #[serde(default)]
    title: Option<YtiRuns>,
    #[serde(default)]
    length_text: Option<YtiText>,
    #[serde(default)]
    owner_text: Option<YtiRuns>,
}

impl YtiVideo {
    fn into_track_ref(self) -> Option<TrackRef> {
        let video_id = self.video_id?;
        let title = self
            .title
            .and_then(YtiRuns::first_text)
            .unwrap_or_else(|| "Unknown".to_string());
        let uploader = self
            .owner_text
            .and_then(YtiRuns::first_text)
            .unwrap_or_else(|| "Unknown".to_string());
        let duration = self
            .length_text
            .and_then(|t| t.simple_text)
            .as_deref()
            .and_then(parse_duration_text);
        Some(TrackRef {
            url: watch_url(&video_id),
            title,
            uploader,
            duration,
            search_method: "YTI".to_string(),
            video_id: Some(video_id),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct YtiRuns {
    #[serde(default)]
    runs: Vec<YtiRun>,
}

impl YtiRuns {
    fn first_text(self) -> Option<String> {
        self.runs.into_iter().next().map(|r| r.text)
    }
}

#[derive(Debug, Default, Deserialize)]
struct YtiRun {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YtiText {
    #[serde(default)]
    simple_text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve a fixed HTTP response for every connection on a fresh local
    /// port; returns the base URL.
    fn spawn_stub(status: u16, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let resp = format!(
                    "HTTP/1.1 {} STUB\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    fn resolver_with(instances: Vec<ProviderInstance>) -> ProviderResolver {
        let config = AppConfig {
            api_instances: instances,
            fast_mode: true,
            ..AppConfig::default()
        };
        ProviderResolver::new(&config)
    }

    #[test]
    fn duration_normalization_grid() {
        assert_eq!(normalize_duration(Some(&json!("3:30"))), Some(210));
        assert_eq!(normalize_duration(Some(&json!("1:01:01"))), Some(3661));
        assert_eq!(normalize_duration(Some(&json!(120))), Some(120));
        assert_eq!(normalize_duration(Some(&json!(120.5))), Some(120));
        assert_eq!(normalize_duration(None), None);
        assert_eq!(normalize_duration(Some(&json!("invalid"))), None);
        assert_eq!(normalize_duration(Some(&json!("10"))), Some(10));
        assert_eq!(normalize_duration(Some(&json!(null))), None);
    }

    #[test]
    fn highest_bitrate_wins_and_ties_keep_payload_order() {
        let streams = vec![
            AudioStream {
                url: "low".into(),
                bitrate: Some(64_000),
                kind: None,
            },
            AudioStream {
                url: "first-high".into(),
                bitrate: Some(128_000),
                kind: None,
            },
            AudioStream {
                url: "second-high".into(),
                bitrate: Some(128_000),
                kind: None,
            },
        ];
        assert_eq!(pick_highest_bitrate(&streams), Some("first-high".into()));
        assert_eq!(pick_highest_bitrate(&[]), None);
    }

    #[test]
    fn bitrate_deserializes_from_number_or_string() {
        let piped: AudioStream =
            serde_json::from_value(json!({"url": "u", "bitrate": 128000})).unwrap();
        assert_eq!(piped.bitrate, Some(128_000));

        let invidious: AudioStream =
            serde_json::from_value(json!({"url": "u", "bitrate": "64000", "type": "audio/mp4"}))
                .unwrap();
        assert_eq!(invidious.bitrate, Some(64_000));

        let missing: AudioStream = serde_json::from_value(json!({"url": "u"})).unwrap();
        assert_eq!(missing.bitrate, None);
    }

    #[test]
    fn video_id_extraction() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=1"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://youtu.be/dQw4w9WgXcQ?si=x"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(extract_video_id("https://example.com/nope"), None);
    }

    #[tokio::test]
    async fn failing_instance_rotates_and_cursor_sticks_on_success() {
        let broken = spawn_stub(500, "{}".to_string());
        let body = json!({
            "audioStreams": [
                {"url": "https://cdn.example/64", "bitrate": 64000},
                {"url": "https://cdn.example/128", "bitrate": 128000}
            ]
        });
        let healthy = spawn_stub(200, body.to_string());

        let resolver = resolver_with(vec![
            ProviderInstance {
                kind: ProviderKind::Piped,
                url: broken,
            },
            ProviderInstance {
                kind: ProviderKind::Piped,
                url: healthy,
            },
        ]);

        let url = resolver.resolve_stream_url("abc12345678").await;
        assert_eq!(url, Some("https://cdn.example/128".to_string()));
        // cursor stays on the instance that answered
        assert_eq!(resolver.current_instance_index(), 1);

        // a second call starts at the healthy instance and succeeds again
        let url = resolver.resolve_stream_url("abc12345678").await;
        assert_eq!(url, Some("https://cdn.example/128".to_string()));
        assert_eq!(resolver.current_instance_index(), 1);
    }

    #[tokio::test]
    async fn all_instances_failing_returns_none() {
        let broken_a = spawn_stub(503, "{}".to_string());
        let broken_b = spawn_stub(500, "not json at all".to_string());

        let resolver = resolver_with(vec![
            ProviderInstance {
                kind: ProviderKind::Invidious,
                url: broken_a,
            },
            ProviderInstance {
                kind: ProviderKind::Piped,
                url: broken_b,
            },
        ]);

        assert_eq!(resolver.resolve_stream_url("abc12345678").await, None);
        // full rotation ends back at the start
        assert_eq!(resolver.current_instance_index(), 0);
    }

    #[tokio::test]
    async fn invidious_resolution_filters_non_audio_formats() {
        let body = json!({
            "adaptiveFormats": [
                {"url": "https://cdn.example/video", "bitrate": "900000", "type": "video/mp4"},
                {"url": "https://cdn.example/audio", "bitrate": "128000", "type": "audio/mp4; codecs=\"mp4a\""}
            ]
        });
        let instance = spawn_stub(200, body.to_string());
        let resolver = resolver_with(vec![ProviderInstance {
            kind: ProviderKind::Invidious,
            url: instance,
        }]);

        assert_eq!(
            resolver.resolve_stream_url("abc12345678").await,
            Some("https://cdn.example/audio".to_string())
        );
    }

    #[tokio::test]
    async fn instance_search_maps_items_and_filters_duration() {
        let body = json!({
            "items": [
                {"title": "Short", "url": "/watch?v=aaaaaaaaaaa", "duration": 120, "uploaderName": "A"},
                {"title": "Long", "url": "/watch?v=bbbbbbbbbbb", "duration": 4000, "uploaderName": "B"},
                {"title": "Live", "url": "/watch?v=ccccccccccc", "duration": -1, "uploaderName": "C"},
                {"title": "Playlist", "url": "/playlist?list=xyz", "duration": 300, "uploaderName": "D"}
            ]
        });
        let instance = spawn_stub(200, body.to_string());
        let config = AppConfig {
            api_instances: vec![ProviderInstance {
                kind: ProviderKind::Piped,
                url: instance,
            }],
            max_duration: Some(600),
            fast_mode: true,
            ..AppConfig::default()
        };
        let resolver = ProviderResolver::new(&config);

        let results = resolver.search("whatever", 10).await;
        let titles: Vec<&str> = results.iter().map(|t| t.title.as_str()).collect();
        // the long track is dropped, the live (unknown duration) one
        // passes, and an entry without a video id is never fabricated
        assert_eq!(titles, vec!["Short", "Live"]);
        assert_eq!(results[0].duration, Some(120));
        assert_eq!(results[1].duration, None);
        assert_eq!(results[0].search_method, "API");
        assert_eq!(results[0].video_id.as_deref(), Some("aaaaaaaaaaa"));
    }

    #[tokio::test]
    async fn recommendations_query_related_music_by_uploader() {
        let body = json!({
            "items": [
                {"title": "Deep Cut", "url": "/watch?v=ddddddddddd", "duration": 240, "uploaderName": "Artist"}
            ]
        });
        let instance = spawn_stub(200, body.to_string());
        let resolver = resolver_with(vec![ProviderInstance {
            kind: ProviderKind::Piped,
            url: instance,
        }]);

        let seed = TrackRef {
            url: "https://www.youtube.com/watch?v=aaaaaaaaaaa".to_string(),
            title: "Hit Single".to_string(),
            uploader: "Artist".to_string(),
            duration: Some(180),
            search_method: "API".to_string(),
            video_id: Some("aaaaaaaaaaa".to_string()),
        };
        let related = resolver.recommendations(&seed, 5).await;
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].title, "Deep Cut");
        assert_eq!(related[0].uploader, "Artist");
    }

    #[test]
    fn youtubei_payload_parses_down_to_video_renderers() {
        let payload = json!({
            "contents": {"twoColumnSearchResultsRenderer": {"primaryContents": {"sectionListRenderer": {"contents": [
                {"itemSectionRenderer": {"contents": [
                    {"videoRenderer": {
                        "videoId": "abc12345678",
                        "title": {"runs": [{"text": "Some Song"}]},
                        "lengthText": {"simpleText": "3:30"},
                        "ownerText": {"runs": [{"text": "Some Artist"}]}
                    }},
                    {"somethingElse": {}}
                ]}}
            ]}}}}
        });
        let body: YtiResponse = serde_json::from_value(payload).unwrap();
        let tracks: Vec<TrackRef> = body
            .video_renderers()
            .filter_map(YtiVideo::into_track_ref)
            .collect();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].title, "Some Song");
        assert_eq!(tracks[0].uploader, "Some Artist");
        assert_eq!(tracks[0].duration, Some(210));
        assert_eq!(tracks[0].search_method, "YTI");
    }
}
