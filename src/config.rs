use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    /// Un token por identidad; el primero es la primaria
    pub discord_tokens: Vec<String>,

    // Audio
    pub default_volume: u32,
    pub max_queue_size: usize,
    pub audio_format: String,
    pub bitrate_limit_kbps: Option<u32>,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_max_bytes: u64,

    // Herramientas externas
    pub ytdlp_path: String,
    pub ffmpeg_path: String,

    // Tiempos (segundos)
    pub idle_timeout_secs: u64,
    pub voice_connect_timeout_secs: u64,
    pub presence_mirror_secs: u64,
    pub snapshot_interval_secs: u64,
    pub notice_ttl_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            // Discord
            discord_tokens: parse_tokens(
                &std::env::var("DISCORD_TOKENS").context("DISCORD_TOKENS no está definido")?,
            ),

            // Audio
            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            audio_format: std::env::var("AUDIO_FORMAT").unwrap_or(defaults.audio_format),
            bitrate_limit_kbps: match std::env::var("BITRATE_LIMIT_KBPS") {
                Ok(val) if !val.trim().is_empty() => Some(
                    val.trim()
                        .parse()
                        .context("BITRATE_LIMIT_KBPS debe ser un número")?,
                ),
                _ => None,
            },

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_max_bytes: env_or("CACHE_MAX_BYTES", defaults.cache_max_bytes)?,

            // Herramientas externas
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),

            // Tiempos
            idle_timeout_secs: env_or("IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            voice_connect_timeout_secs: env_or(
                "VOICE_CONNECT_TIMEOUT_SECS",
                defaults.voice_connect_timeout_secs,
            )?,
            presence_mirror_secs: env_or("PRESENCE_MIRROR_SECS", defaults.presence_mirror_secs)?,
            snapshot_interval_secs: env_or(
                "SNAPSHOT_INTERVAL_SECS",
                defaults.snapshot_interval_secs,
            )?,
            notice_ttl_secs: env_or("NOTICE_TTL_SECS", defaults.notice_ttl_secs)?,
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - At least one Discord token, none of them empty
    /// - Volume must be between 0 and 200 percent
    /// - Queue size, cache size and every interval must be greater than 0
    pub fn validate(&self) -> Result<()> {
        if self.discord_tokens.is_empty() {
            anyhow::bail!("At least one Discord token is required");
        }

        if self.default_volume > 200 {
            anyhow::bail!("Default volume must be between 0 and 200, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.cache_max_bytes == 0 {
            anyhow::bail!("Cache size must be greater than 0");
        }

        if self.bitrate_limit_kbps == Some(0) {
            anyhow::bail!("Bitrate limit must be greater than 0 when set");
        }

        for (name, value) in [
            ("IDLE_TIMEOUT_SECS", self.idle_timeout_secs),
            ("VOICE_CONNECT_TIMEOUT_SECS", self.voice_connect_timeout_secs),
            ("PRESENCE_MIRROR_SECS", self.presence_mirror_secs),
            ("SNAPSHOT_INTERVAL_SECS", self.snapshot_interval_secs),
            ("NOTICE_TTL_SECS", self.notice_ttl_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Tokens are never included, only how many identities are configured.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: {} identities\n  \
            Audio: {}% vol, format '{}', bitrate {}\n  \
            Queue: {} max songs, {}s idle timeout\n  \
            Cache: {} MiB in {}\n  \
            Timers: connect {}s, presence {}s, snapshot {}s, notices {}s",
            self.discord_tokens.len(),
            self.default_volume,
            self.audio_format,
            self.bitrate_limit_kbps
                .map_or("unlimited".to_string(), |kbps| format!("{}kbps", kbps)),
            self.max_queue_size,
            self.idle_timeout_secs,
            self.cache_max_bytes / (1024 * 1024),
            self.cache_dir.display(),
            self.voice_connect_timeout_secs,
            self.presence_mirror_secs,
            self.snapshot_interval_secs,
            self.notice_ttl_secs
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn voice_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.voice_connect_timeout_secs)
    }

    pub fn presence_mirror_interval(&self) -> Duration {
        Duration::from_secs(self.presence_mirror_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn notice_ttl(&self) -> Duration {
        Duration::from_secs(self.notice_ttl_secs)
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_tokens: Vec::new(),

            // Audio defaults
            default_volume: 100,
            max_queue_size: 1000,
            audio_format: "bestaudio/best".to_string(),
            bitrate_limit_kbps: None,

            // Path defaults
            data_dir: "/app/data".into(),
            cache_dir: "/app/cache".into(),
            cache_max_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB

            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),

            // Timer defaults
            idle_timeout_secs: 300,
            voice_connect_timeout_secs: 15,
            presence_mirror_secs: 60,
            snapshot_interval_secs: 30,
            notice_ttl_secs: 15,
        }
    }
}

fn parse_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("{} tiene un valor inválido: {}", name, val)),
        _ => Ok(default),
    }
}
