use crate::error::{RemedyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_priority")]
    pub default_priority: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
    /// How often time-based schedules are checked for due runs.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// How often the queue processor admits work.
    #[serde(default = "default_queue_interval_ms")]
    pub queue_interval_ms: u64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_queue_size() -> usize {
    100
}

fn default_priority() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_worker_timeout_ms() -> u64 {
    300_000
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_queue_interval_ms() -> u64 {
    1000
}

fn default_max_history() -> usize {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            default_priority: default_priority(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            worker_timeout_ms: default_worker_timeout_ms(),
            tick_interval_secs: default_tick_interval_secs(),
            queue_interval_ms: default_queue_interval_ms(),
            max_history: default_max_history(),
        }
    }
}

impl SchedulerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// PatternConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default = "default_min_pattern_length")]
    pub min_pattern_length: usize,
    #[serde(default = "default_max_pattern_length")]
    pub max_pattern_length: usize,
    #[serde(default = "default_min_support")]
    pub min_support: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,
    #[serde(default = "default_max_time_gap_secs")]
    pub max_time_gap_secs: u64,
    /// Alerts older than this fall out of the mining window.
    #[serde(default = "default_window_retention_secs")]
    pub window_retention_secs: u64,
    #[serde(default = "default_max_window_alerts")]
    pub max_window_alerts: usize,
    #[serde(default = "default_detection_interval_secs")]
    pub detection_interval_secs: u64,
}

fn default_min_pattern_length() -> usize {
    2
}

fn default_max_pattern_length() -> usize {
    5
}

fn default_min_support() -> f64 {
    0.1
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_time_window_secs() -> u64 {
    3600
}

fn default_max_time_gap_secs() -> u64 {
    300
}

fn default_window_retention_secs() -> u64 {
    86_400
}

fn default_max_window_alerts() -> usize {
    10_000
}

fn default_detection_interval_secs() -> u64 {
    300
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_pattern_length: default_min_pattern_length(),
            max_pattern_length: default_max_pattern_length(),
            min_support: default_min_support(),
            min_confidence: default_min_confidence(),
            time_window_secs: default_time_window_secs(),
            max_time_gap_secs: default_max_time_gap_secs(),
            window_retention_secs: default_window_retention_secs(),
            max_window_alerts: default_max_window_alerts(),
            detection_interval_secs: default_detection_interval_secs(),
        }
    }
}

/// Longest accepted window or retention span: one hundred years.
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 86_400;

/// Longest accepted pause between retry attempts: one day.
pub const MAX_RETRY_DELAY_MS: u64 = 86_400_000;

fn span(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

impl PatternConfig {
    pub fn time_window(&self) -> chrono::Duration {
        span(self.time_window_secs)
    }

    pub fn max_time_gap(&self) -> chrono::Duration {
        span(self.max_time_gap_secs)
    }

    pub fn window_retention(&self) -> chrono::Duration {
        span(self.window_retention_secs)
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.detection_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// StateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
    #[serde(default = "default_validate_transitions")]
    pub validate_transitions: bool,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_history_retention_secs() -> u64 {
    7 * 86_400
}

fn default_validate_transitions() -> bool {
    true
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            history_retention_secs: default_history_retention_secs(),
            validate_transitions: default_validate_transitions(),
            max_history: default_max_history(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl StateConfig {
    pub fn history_retention(&self) -> chrono::Duration {
        span(self.history_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_max_metric_samples")]
    pub max_metric_samples: usize,
}

fn default_max_metric_samples() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            max_metric_samples: default_max_metric_samples(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Fail with the first `Error`-level finding, if any.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(RemedyError::Validation(w.message)),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        let s = &self.scheduler;
        if s.max_concurrent == 0 {
            error("scheduler.max_concurrent must be at least 1".into());
        }
        if s.max_queue_size == 0 {
            error("scheduler.max_queue_size must be at least 1".into());
        }
        if s.max_retries == 0 {
            error("scheduler.max_retries must be at least 1 (it counts attempts)".into());
        }
        if s.worker_timeout_ms == 0 {
            error("scheduler.worker_timeout_ms must be positive".into());
        }
        if s.tick_interval_secs == 0 || s.queue_interval_ms == 0 {
            error("scheduler tick and queue intervals must be positive".into());
        }

        let p = &self.patterns;
        if p.min_pattern_length == 0 {
            error("patterns.min_pattern_length must be at least 1".into());
        }
        if p.min_pattern_length > p.max_pattern_length {
            error(format!(
                "patterns.min_pattern_length ({}) exceeds max_pattern_length ({})",
                p.min_pattern_length, p.max_pattern_length
            ));
        }
        for (name, v) in [
            ("min_support", p.min_support),
            ("min_confidence", p.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&v) {
                error(format!("patterns.{name} must be within [0, 1], got {v}"));
            }
        }
        if p.time_window_secs == 0 {
            error("patterns.time_window_secs must be positive".into());
        }

        if self.state.history_retention_secs == 0 {
            error("state.history_retention_secs must be positive".into());
        }
        if s.retry_delay_ms > MAX_RETRY_DELAY_MS {
            error(format!(
                "scheduler.retry_delay_ms must not exceed {MAX_RETRY_DELAY_MS}, got {}",
                s.retry_delay_ms
            ));
        }
        for (name, v) in [
            ("patterns.time_window_secs", p.time_window_secs),
            ("patterns.max_time_gap_secs", p.max_time_gap_secs),
            ("patterns.window_retention_secs", p.window_retention_secs),
            ("state.history_retention_secs", self.state.history_retention_secs),
        ] {
            if v > MAX_SPAN_SECS {
                error(format!("{name} must not exceed {MAX_SPAN_SECS}, got {v}"));
            }
        }

        if s.max_retries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "scheduler.max_retries={} (>10 is unusual; retries are unbounded in wall time)",
                    s.max_retries
                ),
            });
        }
        if !self.state.validate_transitions {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "state.validate_transitions is off: any transition will be accepted"
                    .into(),
            });
        }
        if p.max_time_gap_secs > p.time_window_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "patterns.max_time_gap_secs is larger than time_window_secs".into(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
