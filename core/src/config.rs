/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: u32 = 30;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Id of the signed-in user; used for `mine` and typing filtering
    pub self_user_id: String,

    /// History page size requested from the backend
    pub page_size: u32,

    /// How long a typing indicator lives without a refresh
    pub typing_timeout: Duration,

    /// Confirmation window for messages sent over the live channel
    pub pending_timeout: Duration,

    /// First reconnect delay; doubled per attempt
    pub reconnect_base_delay: Duration,

    /// Upper bound for a single reconnect delay
    pub reconnect_max_delay: Duration,

    /// Random extra delay added to each reconnect attempt
    pub reconnect_jitter: Duration,

    /// Attempts per externally triggered reconnect
    pub max_reconnect_attempts: u32,

    /// Re-fetch the newest page of loaded conversations after a reconnect
    pub gap_fill_on_reconnect: bool,

    /// Capacity of the `SyncEvent` broadcast channel
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            self_user_id: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            typing_timeout: Duration::from_secs(3),
            pending_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_jitter: Duration::from_millis(250),
            max_reconnect_attempts: 8,
            gap_fill_on_reconnect: true,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Default configuration for the given user
    pub fn for_user(self_user_id: impl Into<String>) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user-id> [--page-size <n>] [--typing-timeout-ms <ms>] [--pending-timeout-ms <ms>] [--max-reconnect-attempts <n>] [--no-gap-fill]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let mut config = Self::for_user(args[1].clone());

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--page-size" => {
                    config.page_size = parse_flag(args, i, "--page-size")?;
                    i += 2;
                }
                "--typing-timeout-ms" => {
                    config.typing_timeout =
                        Duration::from_millis(parse_flag(args, i, "--typing-timeout-ms")?);
                    i += 2;
                }
                "--pending-timeout-ms" => {
                    config.pending_timeout =
                        Duration::from_millis(parse_flag(args, i, "--pending-timeout-ms")?);
                    i += 2;
                }
                "--max-reconnect-attempts" => {
                    config.max_reconnect_attempts =
                        parse_flag(args, i, "--max-reconnect-attempts")?;
                    i += 2;
                }
                "--no-gap-fill" => {
                    config.gap_fill_on_reconnect = false;
                    i += 1;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Some(n) = env_parse::<u32>("CHATSYNC_PAGE_SIZE") {
            config.page_size = n;
        }
        if let Some(ms) = env_parse::<u64>("CHATSYNC_TYPING_TIMEOUT_MS") {
            config.typing_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CHATSYNC_PENDING_TIMEOUT_MS") {
            config.pending_timeout = Duration::from_millis(ms);
        }
        if std::env::var("CHATSYNC_NO_GAP_FILL").is_ok() {
            config.gap_fill_on_reconnect = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.self_user_id.trim().is_empty() {
            return Err(SyncError::Config("self_user_id must not be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        if self.typing_timeout.is_zero() || self.pending_timeout.is_zero() {
            return Err(SyncError::Config("timeouts must be non-zero".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event_buffer must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_flag<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T> {
    let raw = args
        .get(i + 1)
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", flag)))?;
    raw.parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid number", flag)))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
