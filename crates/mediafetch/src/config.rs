use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;
use crate::throttle::ThrottleConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

// --- HTTP Configuration ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// Headers sent with every request. Per-stream headers take precedence.
    pub headers: BTreeMap<String, String>,
    /// Time allowed to establish a connection.
    pub connect_timeout_ms: u64,
    /// Maximum silence between two body chunks before the request is
    /// considered stalled. Treated as a transient error.
    pub read_timeout_ms: u64,
    pub follow_redirects: bool,
    pub proxy: Option<ProxyConfig>,
    /// Whether to use system proxy settings when no explicit proxy is set
    pub use_system_proxy: bool,
    pub danger_accept_invalid_certs: bool,
    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: Self::default_headers(),
            connect_timeout_ms: 30_000,
            read_timeout_ms: 30_000,
            follow_redirects: true,
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
            pool_idle_timeout_ms: 30_000,
        }
    }
}

impl HttpConfig {
    pub fn default_headers() -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), "*/*".to_string());
        headers.insert(
            "accept-language".to_string(),
            "en-US,en;q=0.5".to_string(),
        );
        headers
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }
}

// --- Fragment Configuration ---
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Max concurrent fragment downloads per job.
    pub concurrency: usize,
    /// Max completed-but-unflushed fragments held in memory. Fetching pauses
    /// while the reorder buffer is this far ahead of the write cursor.
    pub max_buffered_fragments: usize,
    /// Overrides `RetryPolicy::max_retries` for single fragments.
    pub fragment_retries: Option<u32>,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_buffered_fragments: 16,
            fragment_retries: None,
        }
    }
}

// --- Progress Configuration ---
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum interval between two progress events for the same job.
    pub min_interval_ms: u64,
    /// Weight of the newest sample in the smoothed transfer rate (0..=1).
    pub rate_smoothing: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 250,
            rate_smoothing: 0.3,
        }
    }
}

// --- Staging Configuration ---
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Root directory for partial downloads and resume sidecars.
    pub staging_dir: PathBuf,
    /// Directory receiving promoted / merged files.
    pub output_dir: PathBuf,
    /// Reuse partial staging state from earlier runs.
    pub resume: bool,
    /// Container of merged outputs. Defaults to the video member's container.
    pub merge_container: Option<String>,
    /// Keep the staging directory after a successful finalization.
    pub keep_staging_on_success: bool,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(".mediafetch"),
            output_dir: PathBuf::from("."),
            resume: true,
            merge_container: None,
            keep_staging_on_success: false,
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub retry: RetryPolicy,
    pub throttle: ThrottleConfig,
    pub fragment: FragmentConfig,
    pub progress: ProgressConfig,
    pub staging: StagingConfig,
    /// Overall wall-clock limit per group download. Terminal when exceeded.
    pub job_timeout_secs: Option<u64>,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    /// Load a JSON configuration; missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::configuration(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.fragment.concurrency == 0 {
            return Err(EngineError::configuration(
                "fragment.concurrency must be at least 1",
            ));
        }
        if self.fragment.max_buffered_fragments < self.fragment.concurrency {
            return Err(EngineError::configuration(
                "fragment.max_buffered_fragments must not be below fragment.concurrency",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(EngineError::configuration(
                "retry.base_delay_ms exceeds retry.max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.progress.rate_smoothing) {
            return Err(EngineError::configuration(
                "progress.rate_smoothing must be within 0..=1",
            ));
        }
        if self.throttle.rate_limit_bytes_per_sec == Some(0) {
            return Err(EngineError::configuration(
                "throttle.rate_limit_bytes_per_sec must be positive; use null for unlimited",
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .http
            .headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.http.proxy = Some(proxy);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.read_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.config.throttle.rate_limit_bytes_per_sec = Some(bytes_per_sec);
        self
    }

    pub fn with_host_rate_limit(mut self, host: impl Into<String>, bytes_per_sec: u64) -> Self {
        self.config
            .throttle
            .per_host
            .insert(host.into(), bytes_per_sec);
        self
    }

    pub fn with_fragment_concurrency(mut self, concurrency: usize) -> Self {
        self.config.fragment.concurrency = concurrency;
        self.config.fragment.max_buffered_fragments =
            self.config.fragment.max_buffered_fragments.max(concurrency);
        self
    }

    pub fn with_fragment_retries(mut self, retries: u32) -> Self {
        self.config.fragment.fragment_retries = Some(retries);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress.min_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging.staging_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging.output_dir = dir.into();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.config.staging.resume = resume;
        self
    }

    pub fn with_merge_container(mut self, container: impl Into<String>) -> Self {
        self.config.staging.merge_container = Some(container.into());
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
