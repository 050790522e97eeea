use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;

use tunestash::config::AppConfig;
use tunestash::log_info;
use tunestash::manager::CacheManager;
use tunestash::metadata::SessionSnapshot;
use tunestash::provider::TrackRef;

const DEFAULT_SEARCH_RESULTS: usize = 10;

fn usage() -> &'static str {
    "usage: tunestash <command> [args]\n\
     \n\
     commands:\n\
     \x20 search <query>     search without playing\n\
     \x20 play <query>       search, cache and play a playlist\n\
     \x20 resume             continue the last session\n\
     \x20 fetch <url>        cache one track\n\
     \x20 stats [url]        cache totals, or counters for one track\n\
     \x20 like <url>         toggle like\n\
     \x20 dislike <url>      toggle dislike\n\
     \x20 delete <url>       drop one cached track\n\
     \x20 gc                 enforce the cache size limit now\n\
     \x20 clear              wipe the cache"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load();

    tunestash::logging::FileLogger::init(&config.log_dir()).map_err(|e| anyhow!(e))?;

    let crash_file = config.crash_file();
    std::panic::set_hook(Box::new(move |info| {
        let details = format!("{}\n{}", info, std::backtrace::Backtrace::force_capture());
        tunestash::logging::log_crash(&crash_file, &details);
    }));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!("{}", usage());
    };

    let manager = Arc::new(CacheManager::new(&config).map_err(|e| anyhow!(e))?);

    match command.as_str() {
        "search" => {
            let query = join_args(&args[1..])?;
            let results = manager.resolver().search(&query, DEFAULT_SEARCH_RESULTS).await;
            if results.is_empty() {
                println!("no results for '{}'", query);
            }
            for (i, track) in results.iter().enumerate() {
                println!(
                    "{:2}. {} - {} [{}] {}",
                    i + 1,
                    track.uploader,
                    track.title,
                    format_duration(track.duration),
                    track.url
                );
            }
        }
        "fetch" => {
            let url = single_arg(&args[1..], "fetch <url>")?;
            let track = track_from_url(&url);
            let path = manager
                .ensure_cached(&track)
                .await
                .map_err(|e| anyhow!(e))?;
            println!("cached: {}", path.display());
        }
        "play" => {
            let query = join_args(&args[1..])?;
            let playlist = manager.resolver().search(&query, DEFAULT_SEARCH_RESULTS).await;
            if playlist.is_empty() {
                bail!("no results for '{}'", query);
            }
            manager.store().set_last_session(SessionSnapshot {
                query: query.clone(),
                playlist: playlist.clone(),
            });
            run_playback(&config, manager, playlist).await?;
        }
        "resume" => {
            let session = manager
                .store()
                .last_session()
                .context("no previous session to resume")?;
            if session.playlist.is_empty() {
                bail!("last session had an empty playlist");
            }
            log_info!("[main] resuming session '{}'", session.query);
            run_playback(&config, manager, session.playlist).await?;
        }
        "stats" => match args.get(1) {
            Some(url) => {
                let stats = manager.store().track_stats(url);
                println!(
                    "plays: {}  liked: {}  disliked: {}",
                    stats.play_count, stats.is_liked, stats.is_disliked
                );
            }
            None => {
                let stats = manager.stats();
                println!(
                    "{} tracks, {:.1} MB",
                    stats.track_count,
                    stats.total_bytes as f64 / (1024.0 * 1024.0)
                );
            }
        },
        "like" => {
            let url = single_arg(&args[1..], "like <url>")?;
            let liked = manager.store().toggle_like(&url);
            println!("{}", if liked { "liked" } else { "like removed" });
        }
        "dislike" => {
            let url = single_arg(&args[1..], "dislike <url>")?;
            let disliked = manager.store().toggle_dislike(&url);
            println!("{}", if disliked { "disliked" } else { "dislike removed" });
        }
        "delete" => {
            let url = single_arg(&args[1..], "delete <url>")?;
            if manager.delete(&url) {
                println!("deleted");
            } else {
                println!("not cached");
            }
        }
        "gc" => {
            manager.enforce_limit();
            let stats = manager.stats();
            println!(
                "{} tracks, {:.1} MB",
                stats.track_count,
                stats.total_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        "clear" => {
            manager.clear();
            println!("cache cleared");
        }
        other => bail!("unknown command '{}'\n{}", other, usage()),
    }

    Ok(())
}

fn join_args(rest: &[String]) -> Result<String> {
    if rest.is_empty() {
        bail!("missing query\n{}", usage());
    }
    Ok(rest.join(" "))
}

fn single_arg(rest: &[String], shape: &str) -> Result<String> {
    match rest {
        [arg] => Ok(arg.clone()),
        _ => bail!("expected: tunestash {}", shape),
    }
}

fn format_duration(duration: Option<u64>) -> String {
    match duration {
        Some(secs) if secs >= 3600 => {
            format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        Some(secs) => format!("{}:{:02}", secs / 60, secs % 60),
        None => "live/unknown".to_string(),
    }
}

/// Build a minimal track for a bare URL. The real title and uploader
/// arrive only through search, so the URL stands in for both.
fn track_from_url(url: &str) -> TrackRef {
    TrackRef {
        url: url.to_string(),
        title: url.to_string(),
        uploader: "Unknown".to_string(),
        duration: None,
        search_method: "direct".to_string(),
        video_id: tunestash::provider::extract_video_id(url),
    }
}

/// Sequential playlist playback: cache the current track, hand it to
/// mpv, poll once a second for prefetch and play accounting, advance
/// when the player exits. The playlist grows at the tail: once the
/// final track nears its end, related tracks are appended so playback
/// does not run dry. Ctrl-C fades the player out instead of cutting it.
#[cfg(unix)]
async fn run_playback(
    config: &AppConfig,
    manager: Arc<CacheManager>,
    mut playlist: Vec<TrackRef>,
) -> Result<()> {
    use tunestash::log_error;
    use tunestash::player::PlayerClient;
    use tunestash::prefetch::PrefetchScheduler;
    use tunestash::worker::CacheWorkerPool;

    let pool = Arc::new(CacheWorkerPool::spawn(Arc::clone(&manager), config.workers.max(1)));
    let scheduler = PrefetchScheduler::new(Arc::clone(&manager), pool, config.precache_count);
    let client = PlayerClient::new(&config.player_socket);

    scheduler.on_playlist_start(&playlist, 0);

    let mut index = 0;
    while index < playlist.len() {
        let track = playlist[index].clone();
        let path = match manager.ensure_cached(&track).await {
            Ok(path) => path,
            Err(e) => {
                log_error!("[main] skipping {}: {}", track.title, e);
                index += 1;
                continue;
            }
        };

        println!("playing: {} - {}", track.uploader, track.title);
        manager.set_active_url(Some(&track.url));
        manager.store().mark_played(&track.url);

        let mut child = client
            .spawn(config, &path.to_string_lossy())
            .map_err(|e| anyhow!(e))?;
        let mut extended = false;

        loop {
            if child.try_wait().context("player wait failed")?.is_some() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("\nstopping");
                    client.fade_out_and_stop().await;
                    let _ = child.wait().await;
                    manager.set_active_url(None);
                    return Ok(());
                }
            }

            let snap = client.snapshot().await;
            scheduler.poll(&playlist, index, snap.position_secs, snap.duration_secs);

            let near_end = snap
                .duration_secs
                .map_or(false, |d| snap.position_secs / d >= 0.8);
            if near_end && !extended && index + 1 == playlist.len() {
                extended = true;
                let related = manager
                    .resolver()
                    .recommendations(&track, DEFAULT_SEARCH_RESULTS)
                    .await;
                if scheduler.extend_playlist(&mut playlist, related) > 0 {
                    scheduler.on_playlist_start(&playlist, index);
                }
            }
        }

        index += 1;
    }

    manager.set_active_url(None);
    manager.enforce_limit();
    Ok(())
}

#[cfg(not(unix))]
async fn run_playback(
    _config: &AppConfig,
    _manager: Arc<CacheManager>,
    _playlist: Vec<TrackRef>,
) -> Result<()> {
    bail!("playback requires a unix socket capable platform; use 'fetch' to cache tracks")
}
