//! TOML configuration for the AutoHeal daemon.
//!
//! A layered configuration model with sensible defaults, environment
//! variable override for the config file path, and a standard filesystem
//! location.  All tunables (windows, caps, cooldowns, autonomy mode) live
//! here so components can be constructed against independent configs in
//! tests.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::govern::AutonomyMode;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the autoheal process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutohealConfig {
    pub correlation: CorrelationConfig,
    pub decision: DecisionConfig,
    pub safety: SafetyConfig,
    pub execution: ExecutionConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl AutohealConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded autoheal configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `AUTOHEAL_CONFIG` environment variable.
    /// 2. `/etc/autoheal/autoheal.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        // 1. Environment variable override.
        if let Ok(env_path) = std::env::var("AUTOHEAL_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "AUTOHEAL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        // 2. Standard system location.
        let system_path = Path::new("/etc/autoheal/autoheal.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        // 3. Defaults.
        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Incident correlation and lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Anomaly events for the same correlation key within this many seconds
    /// of the incident's latest event merge into that incident.
    pub correlation_window_sec: u64,
    /// After a successful plan, the incident stays `mitigating` for this
    /// long; it resolves only if no new qualifying event arrives.
    pub observation_window_sec: u64,
    /// Maximum remediation attempts per incident before escalation.
    pub max_attempts: u32,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            correlation_window_sec: 300,
            observation_window_sec: 120,
            max_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Decision engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum top-hypothesis confidence required to propose any plan.
    /// Below this the engine abstains rather than guessing.
    pub confidence_floor: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

/// Guardrails enforced by the safety governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Minimum cooldown after a plan completes before the same target may
    /// be remediated again (seconds).
    pub cooldown_sec: u64,
    /// Maximum number of plans in flight across the whole system.
    pub max_concurrent_plans: u32,
    /// Maximum fraction of a service's replicas a single action may touch.
    pub blast_radius_limit: f64,
    /// Ceiling on how much risk may be auto-executed.
    pub autonomy_mode: AutonomyMode,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cooldown_sec: 600,
            max_concurrent_plans: 3,
            blast_radius_limit: 1.0,
            autonomy_mode: AutonomyMode::SemiAuto,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// External action executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Base URL of the external action executor.
    pub executor_url: String,
    /// Per-action dispatch timeout (seconds).  There is no unbounded wait
    /// anywhere in the pipeline.
    pub action_timeout_sec: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            executor_url: "http://k8s-executor:8004".to_string(),
            action_timeout_sec: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Ingestion API listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address and port for the HTTP ingestion / query API.
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging and audit trail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Path to the append-only JSON-lines audit log.
    pub audit_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit_log_path: PathBuf::from("data/audit.jsonl"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
