use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the ffmpeg supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Optional file that receives a copy of ffmpeg's stderr for every attempt
    pub stderr_path: Option<PathBuf>,
    /// Consecutive non-advancing samples tolerated before the run is declared stalled (0 disables)
    pub max_stall: u64,
    /// Duplicate frame ceiling; reaching it is treated as a frozen input (0 disables)
    pub max_dup: u64,
    /// Seconds between periodic status events
    pub status_interval_secs: f64,
    /// Expected output duration in seconds, used for progress (0 = unset)
    pub target_duration_secs: f64,
    /// Expected number of encoded frames, used for progress when no duration is set (0 = unset)
    pub target_frames: u64,
    /// Number of simultaneous outputs; scales fps and speed
    pub outputs: u32,
    /// Initial retry counter
    pub retry: u32,
    /// Retry budget for transient GPU memory exhaustion
    pub max_retry: u32,
    /// Escalate zero-exit runs with fatal-looking stderr to failures
    pub strict_errors: bool,
    /// Ceiling for the -extra_hw_frames value when retrying on surface exhaustion
    pub max_extra_hw_frames: u32,
    /// Sleep before retrying after GPU memory exhaustion
    pub vram_backoff_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl SupervisorConfig {
    /// Create a default configuration with the values the wrapper has always used
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            stderr_path: None,
            max_stall: 1000,
            max_dup: 0,
            status_interval_secs: 3.0,
            target_duration_secs: 0.0,
            target_frames: 0,
            outputs: 1,
            retry: 0,
            max_retry: 60,
            strict_errors: false,
            max_extra_hw_frames: 64,
            vram_backoff_secs: 2,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.normalize();
        Ok(config)
    }

    /// Overlay the process environment (MAXSTALL, MAXDUP, LOGFREQ, ...)
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Overlay variables from an arbitrary lookup. Values that fail to parse are ignored.
    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bin) = lookup("FFMPEG_BIN").filter(|v| !v.is_empty()) {
            self.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Some(path) = lookup("STDERR").filter(|v| !v.is_empty()) {
            self.stderr_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parse_var(&lookup, "MAXSTALL") {
            self.max_stall = v;
        }
        if let Some(v) = parse_var(&lookup, "MAXDUP") {
            self.max_dup = v;
        }
        if let Some(v) = parse_var(&lookup, "LOGFREQ") {
            self.status_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "DUR") {
            self.target_duration_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "FRAMES") {
            self.target_frames = v;
        }
        if let Some(v) = parse_var(&lookup, "OUTPUTS") {
            self.outputs = v;
        }
        if let Some(v) = parse_var(&lookup, "RETRY") {
            self.retry = v;
        }
        if let Some(v) = parse_var(&lookup, "MAXRETRY") {
            self.max_retry = v;
        }
        if let Some(v) = parse_var(&lookup, "MAXEXTRAHWFRAMES") {
            self.max_extra_hw_frames = v;
        }
        if let Some(v) = lookup("STRICT_ERRORS") {
            self.strict_errors = !(v.is_empty() || v == "0");
        }
        self.normalize();
    }

    /// Zero means "use the default" for these settings
    pub fn normalize(&mut self) {
        let defaults = Self::default_config();
        if self.max_stall == 0 {
            self.max_stall = defaults.max_stall;
        }
        if positive_secs(self.status_interval_secs).is_none() {
            self.status_interval_secs = defaults.status_interval_secs;
        }
        if self.outputs == 0 {
            self.outputs = 1;
        }
        if self.max_retry == 0 {
            self.max_retry = defaults.max_retry;
        }
        if self.max_extra_hw_frames == 0 {
            self.max_extra_hw_frames = defaults.max_extra_hw_frames;
        }
        if positive_secs(self.target_duration_secs).is_none() {
            self.target_duration_secs = 0.0;
        }
    }

    /// Never zero; an unusable value reads as the default
    pub fn status_interval(&self) -> Duration {
        positive_secs(self.status_interval_secs)
            .or_else(|| positive_secs(Self::default_config().status_interval_secs))
            .unwrap_or(Duration::from_secs(3))
    }

    /// Zero when unset or unusable
    pub fn target_duration(&self) -> Duration {
        positive_secs(self.target_duration_secs).unwrap_or(Duration::ZERO)
    }

    pub fn vram_backoff(&self) -> Duration {
        Duration::from_secs(self.vram_backoff_secs)
    }
}

/// Seconds as a non-zero `Duration`; None for NaN, negatives, overflow and sub-nanosecond values
fn positive_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}
