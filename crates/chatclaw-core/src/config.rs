//! ChatClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChatClawError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatClawConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub interruption: InterruptionConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
}

impl ChatClawConfig {
    /// Load config from the default path (~/.chatclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChatClawError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ChatClawError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChatClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the ChatClaw home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chatclaw")
    }

    /// Reject malformed values before anything is built from them.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        positive_secs("scheduler.tick_interval_secs", s.tick_interval_secs)?;
        positive_secs("scheduler.execution_timeout_secs", s.execution_timeout_secs)?;
        non_negative_secs("scheduler.interrupt_ack_timeout_secs", s.interrupt_ack_timeout_secs)?;
        positive_secs("scheduler.stream_idle_ttl_secs", s.stream_idle_ttl_secs)?;
        if s.tick_interval_secs < MIN_TICK_SECS {
            return Err(ChatClawError::Config(format!(
                "scheduler.tick_interval_secs must be at least {MIN_TICK_SECS}, got {}",
                s.tick_interval_secs
            )));
        }

        let d = &self.dispatch;
        positive_secs("dispatch.distribution_interval", d.distribution_interval)?;
        non_negative_secs("dispatch.min_interval", d.min_interval)?;
        positive_secs("dispatch.max_interval", d.max_interval)?;
        non_negative_secs("dispatch.force_dispatch_min_interval", d.force_dispatch_min_interval)?;
        if d.min_interval > d.max_interval {
            return Err(ChatClawError::Config(format!(
                "dispatch.min_interval ({}) exceeds dispatch.max_interval ({})",
                d.min_interval, d.max_interval
            )));
        }
        if d.force_dispatch_unread_threshold == 0 {
            return Err(ChatClawError::Config(
                "dispatch.force_dispatch_unread_threshold must be at least 1".into(),
            ));
        }
        if let Some(every) = d.idle_follow_up_interval {
            positive_secs("dispatch.idle_follow_up_interval", every)?;
        }

        let i = &self.interruption;
        if !i.interruption_probability.is_finite() || !(0.0..=1.0).contains(&i.interruption_probability) {
            return Err(ChatClawError::Config(format!(
                "interruption.interruption_probability must be within [0, 1], got {}",
                i.interruption_probability
            )));
        }

        let e = &self.energy;
        non_negative("energy.unread_weight", e.unread_weight)?;
        non_negative("energy.staleness_weight", e.staleness_weight)?;
        positive("energy.max_energy", e.max_energy)?;
        if e.max_energy < 1.0 {
            return Err(ChatClawError::Config(format!(
                "energy.max_energy must be at least 1.0, got {}",
                e.max_energy
            )));
        }
        Ok(())
    }
}

/// Longest interval or timeout accepted anywhere in the config (one year).
pub const MAX_SECS: f64 = 365.0 * 86_400.0;

/// Shortest registry scan period.
pub const MIN_TICK_SECS: f64 = 0.001;

fn positive_secs(key: &str, value: f64) -> Result<()> {
    positive(key, value)?;
    within_max(key, value)
}

fn non_negative_secs(key: &str, value: f64) -> Result<()> {
    non_negative(key, value)?;
    within_max(key, value)
}

fn within_max(key: &str, value: f64) -> Result<()> {
    if value <= MAX_SECS {
        Ok(())
    } else {
        Err(ChatClawError::Config(format!("{key} must be at most {MAX_SECS} seconds, got {value}")))
    }
}

fn positive(key: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ChatClawError::Config(format!("{key} must be a positive number, got {value}")))
    }
}

fn non_negative(key: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ChatClawError::Config(format!("{key} must not be negative, got {value}")))
    }
}

/// Scheduler engine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the engine scans the timer registry.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: f64,
    /// Upper bound for a single activation call.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: f64,
    /// How long an interrupting message waits for the in-flight activation to stop.
    #[serde(default = "default_interrupt_ack_timeout")]
    pub interrupt_ack_timeout_secs: f64,
    /// Idle streams older than this are dropped by the janitor.
    #[serde(default = "default_stream_idle_ttl")]
    pub stream_idle_ttl_secs: f64,
}

fn default_tick_interval() -> f64 { 0.5 }
fn default_execution_timeout() -> f64 { 60.0 }
fn default_interrupt_ack_timeout() -> f64 { 2.0 }
fn default_stream_idle_ttl() -> f64 { 86_400.0 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            execution_timeout_secs: default_execution_timeout(),
            interrupt_ack_timeout_secs: default_interrupt_ack_timeout(),
            stream_idle_ttl_secs: default_stream_idle_ttl(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.execution_timeout_secs)
    }

    pub fn interrupt_ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.interrupt_ack_timeout_secs)
    }

    pub fn stream_idle_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.stream_idle_ttl_secs)
    }
}

/// Dispatch interval and forced-dispatch thresholds. All intervals are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Baseline delay before energy scaling.
    #[serde(default = "default_distribution_interval")]
    pub distribution_interval: f64,
    #[serde(default = "default_min_interval")]
    pub min_interval: f64,
    #[serde(default = "default_max_interval")]
    pub max_interval: f64,
    /// Unread count that can force an immediate dispatch.
    #[serde(default = "default_force_threshold")]
    pub force_dispatch_unread_threshold: u32,
    /// Minimum time since the last dispatch before a forced dispatch is allowed.
    #[serde(default = "default_force_min_interval")]
    pub force_dispatch_min_interval: f64,
    /// When set, a stream is re-triggered at this cadence even without new messages.
    #[serde(default)]
    pub idle_follow_up_interval: Option<f64>,
}

fn default_distribution_interval() -> f64 { 5.0 }
fn default_min_interval() -> f64 { 0.5 }
fn default_max_interval() -> f64 { 30.0 }
fn default_force_threshold() -> u32 { 20 }
fn default_force_min_interval() -> f64 { 10.0 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            distribution_interval: default_distribution_interval(),
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            force_dispatch_unread_threshold: default_force_threshold(),
            force_dispatch_min_interval: default_force_min_interval(),
            idle_follow_up_interval: None,
        }
    }
}

/// Interruption switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptionConfig {
    #[serde(default = "bool_true")]
    pub interruption_enabled: bool,
    /// Also allow interrupting an activation that is already running.
    #[serde(default)]
    pub allow_reply_interruption: bool,
    /// Interruptions allowed per dispatch cycle.
    #[serde(default = "default_interruption_max_limit")]
    pub interruption_max_limit: u32,
    /// Chance that an allowed interruption actually happens.
    #[serde(default = "default_interruption_probability")]
    pub interruption_probability: f64,
}

fn bool_true() -> bool { true }
fn default_interruption_max_limit() -> u32 { 3 }
fn default_interruption_probability() -> f64 { 0.8 }

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            interruption_enabled: true,
            allow_reply_interruption: false,
            interruption_max_limit: default_interruption_max_limit(),
            interruption_probability: default_interruption_probability(),
        }
    }
}

/// Weights of the default activity-energy model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// Energy added per unread message beyond the first.
    #[serde(default = "default_unread_weight")]
    pub unread_weight: f64,
    /// Energy added once a full base interval has passed since the last dispatch.
    #[serde(default = "default_staleness_weight")]
    pub staleness_weight: f64,
    #[serde(default = "default_max_energy")]
    pub max_energy: f64,
}

fn default_unread_weight() -> f64 { 0.5 }
fn default_staleness_weight() -> f64 { 0.5 }
fn default_max_energy() -> f64 { 8.0 }

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            unread_weight: default_unread_weight(),
            staleness_weight: default_staleness_weight(),
            max_energy: default_max_energy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChatClawConfig::default();
        assert!((config.dispatch.distribution_interval - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.dispatch.force_dispatch_unread_threshold, 20);
        assert!(config.interruption.interruption_enabled);
        assert!(!config.interruption.allow_reply_interruption);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [dispatch]
            distribution_interval = 30.0
            force_dispatch_unread_threshold = 5
            force_dispatch_min_interval = 10.0

            [interruption]
            interruption_enabled = false
            interruption_max_limit = 2
        "#;

        let config = ChatClawConfig::from_toml(toml_str).unwrap();
        assert!((config.dispatch.distribution_interval - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.dispatch.force_dispatch_unread_threshold, 5);
        assert!(!config.interruption.interruption_enabled);
        assert_eq!(config.interruption.interruption_max_limit, 2);
        // Untouched sections keep their defaults
        assert!((config.scheduler.tick_interval_secs - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config = ChatClawConfig::from_toml("").unwrap();
        assert_eq!(config.interruption.interruption_max_limit, 3);
        assert!(config.dispatch.idle_follow_up_interval.is_none());
    }

    #[test]
    fn test_negative_interval_rejected() {
        let err = ChatClawConfig::from_toml("[dispatch]\nmin_interval = -1.0\n").unwrap_err();
        assert!(matches!(err, ChatClawError::Config(msg) if msg.contains("min_interval")));
    }

    #[test]
    fn test_inverted_clamps_rejected() {
        let toml_str = "[dispatch]\nmin_interval = 40.0\nmax_interval = 10.0\n";
        assert!(ChatClawConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_probability_out_of_range_rejected() {
        let toml_str = "[interruption]\ninterruption_probability = 1.5\n";
        assert!(ChatClawConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_zero_tick_rejected() {
        let mut config = ChatClawConfig::default();
        config.scheduler.tick_interval_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let mut config = ChatClawConfig::default();
        config.scheduler.tick_interval_secs = 1e20;
        assert!(matches!(config.validate(), Err(ChatClawError::Config(_))));

        let mut config = ChatClawConfig::default();
        config.scheduler.tick_interval_secs = 1e-12;
        assert!(config.validate().is_err());

        let toml_str = "[dispatch]\nmax_interval = 1e300\n";
        assert!(ChatClawConfig::from_toml(toml_str).is_err());

        let mut config = ChatClawConfig::default();
        config.dispatch.idle_follow_up_interval = Some(MAX_SECS * 2.0);
        assert!(config.validate().is_err());

        // Everything accepted converts to a Duration without panicking.
        let mut config = ChatClawConfig::default();
        config.scheduler.stream_idle_ttl_secs = MAX_SECS;
        config.scheduler.execution_timeout_secs = MAX_SECS;
        config.validate().unwrap();
        assert_eq!(config.scheduler.stream_idle_ttl().as_secs(), 31_536_000);
        assert_eq!(config.scheduler.execution_timeout().as_secs(), 31_536_000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("chatclaw-test-config");
        let path = dir.join("config.toml");
        let mut config = ChatClawConfig::default();
        config.dispatch.force_dispatch_unread_threshold = 7;
        config.save_to(&path).unwrap();

        let loaded = ChatClawConfig::load_from(&path).unwrap();
        assert_eq!(loaded.dispatch.force_dispatch_unread_threshold, 7);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = ChatClawConfig::home_dir();
        assert!(home.to_string_lossy().contains("chatclaw"));
    }
}
