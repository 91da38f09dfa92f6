//! TOML Configuration File Support
//!
//! Centralized configuration for the router, loaded from
//! `~/.config/switchyard/router.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon)
//! 2. Environment variables (`SWITCHYARD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [registry]
//! ema_alpha = 0.2
//! failure_threshold = 3
//! cooldown_secs = 30
//!
//! [selector.weights]
//! capability = 0.35
//! latency = 0.20
//! success = 0.20
//! satisfaction = 0.15
//! affinity = 0.10
//!
//! [dispatch]
//! timeout_ms = 15000
//! max_retries = 2
//!
//! [[models]]
//! id = "llama3-local"
//! latency_class = "fast"
//! capabilities = { general = 0.7, code = 0.5 }
//! backend = { kind = "ollama", model = "llama3" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendSpec;
use crate::registry::health::HealthConfig;
use crate::registry::{CostClass, LatencyClass, ModelDescriptor};
use crate::selector::ScoreWeights;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// A model's backend could not be constructed
    #[error("backend for model {model_id} could not be built: {message}")]
    BackendError {
        /// Model the backend belongs to
        model_id: String,
        /// Adapter error text
        message: String,
    },
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Performance tracking and health thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Smoothing factor for every moving average (0.0 - 1.0]
    pub ema_alpha: f64,
    /// Success rate below which a healthy model becomes degraded
    pub degraded_success_rate: f64,
    /// Success rate at which a degraded model recovers
    pub recovery_success_rate: f64,
    /// Consecutive failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Window the failure streak must fit in, in seconds
    pub failure_window_secs: u64,
    /// Time an unavailable model waits before one probe is admitted
    pub cooldown_secs: u64,
    /// Streak weight of a cancelled request
    pub cancellation_weight: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.2,
            degraded_success_rate: 0.6,
            recovery_success_rate: 0.75,
            failure_threshold: 3,
            failure_window_secs: 60,
            cooldown_secs: 30,
            cancellation_weight: 0.25,
        }
    }
}

impl RegistryConfig {
    /// Health monitor thresholds derived from this section
    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            degraded_success_rate: self.degraded_success_rate,
            recovery_success_rate: self.recovery_success_rate,
            failure_threshold: f64::from(self.failure_threshold),
            failure_window: Duration::from_secs(self.failure_window_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            cancellation_weight: self.cancellation_weight,
        }
    }
}

/// Scoring weights
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Composite score weights; must sum to 1
    pub weights: ScoreWeights,
}

/// Context memory graph limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum live nodes before eviction
    pub max_nodes: usize,
    /// Most similar existing nodes auto-linked to a new node
    pub auto_link_k: usize,
    /// Minimum similarity for an auto-link
    pub min_similarity: f64,
    /// Half-life of the recency score, in seconds
    pub recency_half_life_secs: u64,
    /// Nodes retrieved per query
    pub retrieve_max_nodes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_nodes: 1000,
            auto_link_k: 3,
            min_similarity: 0.2,
            recency_half_life_secs: 3600,
            retrieve_max_nodes: 5,
        }
    }
}

/// Dispatch timeouts and retry behavior
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to backoff delays
    pub use_jitter: bool,
    /// Max tokens requested from backends (0 = backend default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
            max_tokens: 0,
            temperature: 0.7,
        }
    }
}

impl DispatchConfig {
    /// Per-call timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Calculate backoff duration before retry number `attempt` (0-based)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }
}

/// Decision retention
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Decisions kept for feedback and explanation
    pub max_decisions: usize,
    /// Age after which a decision can no longer be referenced, in seconds
    pub decision_ttl_secs: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_decisions: 10_000,
            decision_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Background advisor loop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Whether the daemon starts the advisor
    pub enabled: bool,
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Satisfaction below which a model is flagged
    pub low_satisfaction: f64,
    /// Health probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Suggestions retained
    pub max_suggestions: usize,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            low_satisfaction: 0.3,
            probe_timeout_ms: 5_000,
            max_suggestions: 64,
        }
    }
}

/// State file location
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Where learned state is saved; `None` uses the XDG data dir
    pub state_path: Option<PathBuf>,
}

/// One configured model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Unique model id used in routing decisions
    pub id: String,
    /// Capability tag -> proficiency in [0, 1]
    #[serde(default)]
    pub capabilities: BTreeMap<String, f64>,
    /// Expected latency band
    #[serde(default)]
    pub latency_class: LatencyClass,
    /// Relative cost
    #[serde(default)]
    pub cost_class: CostClass,
    /// How to reach the model
    pub backend: BackendSpec,
}

impl ModelEntry {
    /// Build the runtime descriptor, instantiating the backend adapter
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BackendError`] if the adapter cannot be built.
    pub fn to_descriptor(&self) -> Result<ModelDescriptor, ConfigError> {
        let backend = self.backend.build().map_err(|e| ConfigError::BackendError {
            model_id: self.id.clone(),
            message: e.to_string(),
        })?;

        Ok(ModelDescriptor::new(self.id.clone(), backend)
            .with_capabilities(self.capabilities.clone())
            .with_latency_class(self.latency_class)
            .with_cost_class(self.cost_class))
    }
}

// =============================================================================
// Router Configuration
// =============================================================================

/// Complete router configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Performance tracking and health
    pub registry: RegistryConfig,
    /// Scoring
    pub selector: SelectorConfig,
    /// Context memory graph
    pub graph: GraphConfig,
    /// Dispatch and retry
    pub dispatch: DispatchConfig,
    /// Decision retention
    pub feedback: FeedbackConfig,
    /// Background advisor
    pub advisor: AdvisorConfig,
    /// State persistence
    pub persistence: PersistenceConfig,
    /// Models registered at startup
    pub models: Vec<ModelEntry>,

    /// Path to the config file that was loaded (if any)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,

    #[serde(skip)]
    source: ConfigSource,
}

impl RouterConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        self.selector
            .weights
            .validate()
            .map_err(ConfigError::ValidationError)?;

        let r = &self.registry;
        if !(r.ema_alpha > 0.0 && r.ema_alpha <= 1.0) {
            return invalid(format!("registry.ema_alpha must be in (0, 1], got {}", r.ema_alpha));
        }
        for (name, value) in [
            ("degraded_success_rate", r.degraded_success_rate),
            ("recovery_success_rate", r.recovery_success_rate),
            ("cancellation_weight", r.cancellation_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("registry.{name} must be in [0, 1], got {value}"));
            }
        }
        if r.degraded_success_rate > r.recovery_success_rate {
            return invalid(
                "registry.degraded_success_rate must not exceed recovery_success_rate".to_string(),
            );
        }
        if r.failure_threshold == 0 {
            return invalid("registry.failure_threshold must be at least 1".to_string());
        }

        if self.graph.max_nodes == 0 {
            return invalid("graph.max_nodes must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.graph.min_similarity) {
            return invalid("graph.min_similarity must be in [0, 1]".to_string());
        }
        if self.graph.recency_half_life_secs == 0 {
            return invalid("graph.recency_half_life_secs must be positive".to_string());
        }

        if self.dispatch.timeout_ms == 0 {
            return invalid("dispatch.timeout_ms must be positive".to_string());
        }
        if self.dispatch.backoff_multiplier < 1.0 {
            return invalid("dispatch.backoff_multiplier must be at least 1".to_string());
        }

        if self.feedback.max_decisions == 0 {
            return invalid("feedback.max_decisions must be at least 1".to_string());
        }
        if self.advisor.interval_secs == 0 {
            return invalid("advisor.interval_secs must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                return invalid(format!("duplicate model id: {}", model.id));
            }
            for (tag, proficiency) in &model.capabilities {
                if !(0.0..=1.0).contains(proficiency) {
                    return invalid(format!(
                        "model {} capability {tag} must be in [0, 1], got {proficiency}",
                        model.id
                    ));
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchyard/router.toml` or
/// `~/.config/switchyard/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchyard").join("router.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration fails validation. A missing config file is not
/// an error (defaults are used).
pub fn load_config() -> Result<RouterConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RouterConfig, ConfigError> {
    let mut config = RouterConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            config = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                models = config.models.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RouterConfig) {
    if let Some(alpha) = env_parse::<f64>("SWITCHYARD_EMA_ALPHA") {
        config.registry.ema_alpha = alpha;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env_parse::<u64>("SWITCHYARD_DISPATCH_TIMEOUT_MS") {
        config.dispatch.timeout_ms = timeout;
        config.source = ConfigSource::Env;
    }
    if let Some(retries) = env_parse::<u32>("SWITCHYARD_MAX_RETRIES") {
        config.dispatch.max_retries = retries;
        config.source = ConfigSource::Env;
    }
    if let Some(max_nodes) = env_parse::<usize>("SWITCHYARD_GRAPH_MAX_NODES") {
        config.graph.max_nodes = max_nodes;
        config.source = ConfigSource::Env;
    }
    if let Some(interval) = env_parse::<u64>("SWITCHYARD_ADVISOR_INTERVAL_SECS") {
        config.advisor.interval_secs = interval;
        config.source = ConfigSource::Env;
    }
    if let Ok(path) = std::env::var("SWITCHYARD_STATE_PATH") {
        config.persistence.state_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
}
