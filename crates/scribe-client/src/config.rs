use std::time::Duration;

use scribe_types::{CHUNK_SIZE, DEFAULT_ENDPOINT, MAX_FILE_SIZE};

/// Delay between reconnect attempts after the channel drops.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the WebSocket handshake and on how long an upload waits for
/// the channel to open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Full client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub channel: ChannelConfig,
    pub upload: UploadConfig,
}

/// Connection lifecycle settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `ws://` URL of the transcription service
    pub endpoint: String,
    pub reconnect_delay: Duration,
    /// Bound on a single WebSocket handshake
    pub open_timeout: Duration,
    /// Consecutive failed reconnects before giving up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            max_reconnect_attempts: None,
        }
    }
}

/// Per-transfer settings.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub chunk_size: usize,
    pub max_file_size: u64,
    /// Accepted MIME types, compared case-insensitively
    pub accepted_types: Vec<String>,
    /// Extensions accepted when no MIME type can be determined
    pub accepted_extensions: Vec<String>,
    /// How long an upload waits for the channel to report open
    pub connect_wait: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            accepted_types: vec!["video/mp4".to_string()],
            accepted_extensions: vec!["mp4".to_string()],
            connect_wait: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Build a config from `SCRIBE_*` environment variables. Missing or
    /// unparseable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(endpoint) = lookup("SCRIBE_ENDPOINT").filter(|v| !v.trim().is_empty()) {
            config.channel.endpoint = endpoint.trim().to_string();
        }
        if let Some(ms) = parsed("SCRIBE_RECONNECT_DELAY_MS") {
            config.channel.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed("SCRIBE_OPEN_TIMEOUT_MS") {
            config.channel.open_timeout = Duration::from_millis(ms);
            config.upload.connect_wait = Duration::from_millis(ms);
        }
        if let Some(max) = parsed("SCRIBE_MAX_RECONNECT_ATTEMPTS") {
            config.channel.max_reconnect_attempts = u32::try_from(max).ok();
        }
        if let Some(size) = parsed("SCRIBE_CHUNK_SIZE").filter(|&n| n > 0) {
            config.upload.chunk_size = size as usize;
        }
        if let Some(max) = parsed("SCRIBE_MAX_FILE_SIZE") {
            config.upload.max_file_size = max;
        }
        if let Some(types) = lookup("SCRIBE_ACCEPTED_TYPES").map(|v| split_list(&v)).filter(|l| !l.is_empty()) {
            config.upload.accepted_types = types;
        }
        if let Some(exts) = lookup("SCRIBE_ACCEPTED_EXTENSIONS")
            .map(|v| split_list(&v))
            .filter(|l| !l.is_empty())
        {
            config.upload.accepted_extensions = exts
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect();
        }

        config
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
