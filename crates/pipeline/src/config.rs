use std::{path::PathBuf, time::Duration};

pub const DEFAULT_KIE_BASE_URL: &str = "https://api.kie.ai";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5-20250929";

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub port: u16,
    pub provider: ProviderConfig,
    pub llm: LlmConfig,
    pub poll: PollConfig,
    /// Clip length used when a submission does not name one.
    pub default_video_seconds: u32,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub video_model: String,
    pub character_model: String,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Clone, Debug)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// A task still non-terminal after this long is marked stalled and no longer polled.
    pub max_duration: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            interval: Duration::from_secs(5),
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "data"));
        let port = parse_env("ADGEN_PORT", 6792)?;

        let provider = ProviderConfig {
            base_url: env_or("KIE_BASE_URL", DEFAULT_KIE_BASE_URL),
            api_key: env_or("KIE_API_KEY", ""),
            video_model: env_or("KIE_VIDEO_MODEL", "sora-2-text-to-video"),
            character_model: env_or("KIE_CHARACTER_MODEL", "sora-2-characters-pro"),
        };

        let llm = LlmConfig {
            base_url: env_or("ANTHROPIC_BASE_URL", DEFAULT_ANTHROPIC_BASE_URL),
            api_key: env_or("ANTHROPIC_API_KEY", ""),
            model: env_or("ANTHROPIC_MODEL", DEFAULT_ANTHROPIC_MODEL),
        };

        let defaults = PollConfig::default();
        let poll = PollConfig {
            initial_delay: Duration::from_millis(parse_env(
                "POLL_INITIAL_DELAY_MS",
                defaults.initial_delay.as_millis() as u64,
            )?),
            interval: Duration::from_millis(parse_env(
                "POLL_INTERVAL_MS",
                defaults.interval.as_millis() as u64,
            )?),
            max_duration: Duration::from_secs(60 * parse_env::<u64>("POLL_MAX_MINUTES", 30)?),
        };

        let default_video_seconds = parse_env("DEFAULT_VIDEO_SECONDS", 15)?;

        Ok(Self {
            data_dir,
            port,
            provider,
            llm,
            poll,
            default_video_seconds,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("adreel.sqlite3")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
        _ => Ok(default),
    }
}
