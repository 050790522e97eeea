pub mod config;
pub mod download;
pub mod logging;
pub mod manager;
pub mod metadata;
#[cfg(unix)]
pub mod player;
pub mod prefetch;
pub mod provider;
pub mod worker;
