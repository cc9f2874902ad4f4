use std::time::Duration;

use anyhow::{bail, Context};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FLUX_API_BASE: &str = "https://api.bfl.ml";
pub const DEFAULT_SORA_API_VERSION: &str = "preview";
pub const DEFAULT_AOAI_API_VERSION: &str = "2025-04-01-preview";

/// Bounds of one blocking wait. The interval is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    max_wait: Duration,
    interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollPolicy {
    pub fn new(max_wait: Duration, interval: Duration) -> anyhow::Result<Self> {
        if interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        Ok(Self { max_wait, interval })
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn with_max_wait(self, max_wait: Option<Duration>) -> Self {
        Self {
            max_wait: max_wait.unwrap_or(self.max_wait),
            ..self
        }
    }

    pub fn with_interval(self, interval: Option<Duration>) -> anyhow::Result<Self> {
        Self::new(self.max_wait, interval.unwrap_or(self.interval))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxSettings {
    pub api_base: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoraSettings {
    pub base_url: String,
    pub deployment: String,
    pub api_key: String,
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerSettings {
    pub endpoint: String,
    pub deployment: String,
    pub api_key: String,
    pub api_version: String,
}

impl AnalyzerSettings {
    pub fn chat_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

/// Everything the engine reads from the environment, resolved once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub flux: Option<FluxSettings>,
    pub sora: Option<SoraSettings>,
    pub analyzer: Option<AnalyzerSettings>,
    pub poll: PollPolicy,
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flux: None,
            sora: None,
            analyzer: None,
            poll: PollPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let flux = get("BFL_API_KEY").map(|api_key| FluxSettings {
            api_base: get("BFL_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_FLUX_API_BASE.to_string()),
            api_key,
        });

        let sora = match (
            get("SORA_AOAI_RESOURCE"),
            get("SORA_DEPLOYMENT"),
            get("SORA_AOAI_API_KEY"),
        ) {
            (Some(resource), Some(deployment), Some(api_key)) => Some(SoraSettings {
                base_url: get("SORA_API_BASE")
                    .map(|value| value.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| {
                        format!("https://{resource}.openai.azure.com/openai/v1/video")
                    }),
                deployment,
                api_key,
                api_version: get("SORA_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_SORA_API_VERSION.to_string()),
            }),
            _ => None,
        };

        let analyzer = match (
            get("LLM_AOAI_RESOURCE"),
            get("LLM_DEPLOYMENT"),
            get("LLM_AOAI_API_KEY"),
        ) {
            (Some(resource), Some(deployment), Some(api_key)) => Some(AnalyzerSettings {
                endpoint: format!("https://{resource}.openai.azure.com"),
                deployment,
                api_key,
                api_version: get("AOAI_API_VERSION")
                    .unwrap_or_else(|| DEFAULT_AOAI_API_VERSION.to_string()),
            }),
            _ => None,
        };

        let seconds = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            let Some(raw) = get(key) else {
                return Ok(default);
            };
            let value: f64 = raw
                .parse()
                .with_context(|| format!("{key} must be a number of seconds, got '{raw}'"))?;
            if !value.is_finite() || value < 0.0 {
                bail!("{key} must be a non-negative number of seconds, got '{raw}'");
            }
            Ok(Duration::from_secs_f64(value))
        };

        Ok(Self {
            flux,
            sora,
            analyzer,
            poll: PollPolicy::new(
                seconds("ATELIER_MAX_WAIT_SECS", DEFAULT_MAX_WAIT)?,
                seconds("ATELIER_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL)?,
            )
            .context("ATELIER_POLL_INTERVAL_SECS")?,
            request_timeout: seconds("ATELIER_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT)?,
        })
    }
}
