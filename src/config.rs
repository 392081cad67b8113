use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::settings::PersistentSettings;

/// report-sync: keeps a live copy of an interactive test report in sync
/// with the remote test runner and serves it to local viewers.
#[derive(Parser, Debug, Clone)]
#[command(name = "report-sync")]
pub struct CliArgs {
    /// Base URL of the interactive backend (scheme, host and port)
    #[arg(short = 'b', long = "base-url")]
    pub base_url: Option<String>,

    /// Quiet gap between a completed poll and the next one
    #[arg(short = 'i', long = "poll-interval-ms")]
    pub poll_interval_ms: Option<u64>,

    /// View server HTTP port
    #[arg(long = "port", default_value_t = DEFAULT_VIEW_PORT)]
    pub port: u16,

    /// JSON settings file, overridden by explicit flags
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// Run the sync engine without the view server
    #[arg(long = "no-serve")]
    pub no_serve: bool,

    /// Serve a built-in sample report instead of contacting a backend
    #[arg(long = "demo")]
    pub demo: bool,

    /// Write the resolved settings back to the settings file
    #[arg(long = "save-settings", requires = "settings")]
    pub save_settings: bool,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    pub poll_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    pub port: u16,
    pub serve: bool,
    pub demo: bool,
}

// Backend constants
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:38861";
pub const API_PREFIX: &str = "/api/v1/interactive";
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

// Poll loop constants
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const INITIAL_BACKOFF_MS: u64 = 500;
pub const MAX_BACKOFF_MS: u64 = 60_000;
/// Consecutive poll failures after which they are surfaced to viewers.
pub const FAILURE_SURFACE_THRESHOLD: u32 = 3;

// View server constants
pub const DEFAULT_VIEW_PORT: u16 = 9885;

// Event constants
pub const EVENT_BUFFER_SIZE: usize = 500;

impl SyncConfig {
    /// Flags given on the command line win over the settings file, which
    /// wins over the built-in defaults.
    pub fn resolve(args: CliArgs, settings: PersistentSettings) -> Self {
        let base_url = args
            .base_url
            .or(settings.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let poll_interval_ms = args
            .poll_interval_ms
            .or(settings.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        SyncConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            initial_backoff: Duration::from_millis(
                settings.initial_backoff_ms.unwrap_or(INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(settings.max_backoff_ms.unwrap_or(MAX_BACKOFF_MS)),
            request_timeout: Duration::from_secs(
                settings.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS),
            ),
            port: args.port,
            serve: !args.no_serve,
            demo: args.demo,
        }
    }

    /// The persistable part of this config, as written by `--save-settings`.
    pub fn to_settings(&self) -> PersistentSettings {
        PersistentSettings {
            base_url: Some(self.base_url.clone()),
            poll_interval_ms: Some(self.poll_interval.as_millis() as u64),
            initial_backoff_ms: Some(self.initial_backoff.as_millis() as u64),
            max_backoff_ms: Some(self.max_backoff.as_millis() as u64),
            request_timeout_secs: Some(self.request_timeout.as_secs()),
        }
    }

    /// Root of every report resource, e.g. `http://host:port/api/v1/interactive`.
    pub fn api_root(&self) -> String {
        format!("{}{}", self.base_url, API_PREFIX)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            port: DEFAULT_VIEW_PORT,
            serve: true,
            demo: false,
        }
    }
}
