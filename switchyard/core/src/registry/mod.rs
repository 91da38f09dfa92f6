//! Model Registry and Health Monitor
//!
//! Catalogue of routable models and their rolling performance.
//!
//! # Concurrency
//!
//! ```text
//!  models:  DashMap<id, Arc<ModelSlot>>          descriptor + in-flight counter
//!  records: DashMap<id, Arc<Mutex<Record>>>      EMAs, pending window, circuit
//! ```
//!
//! Each record has its own lock, so outcomes for different models never
//! contend. Readers get an owned [`RegistrySnapshot`]; every model's stats
//! in it were read under that model's lock, so no half-updated record is
//! ever observed.
//!
//! Records outlive their descriptors: removing and re-registering a model
//! keeps what was learned about it.

pub mod health;
mod record;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::CompletionBackend;
use crate::config::RegistryConfig;
use crate::error::RouterError;

pub use health::{Admission, CircuitTracker, Eligibility, HealthConfig, HealthMonitor, HealthState};
pub use record::PerformanceRecord;

// ============================================================================
// Model Descriptor
// ============================================================================

/// Expected latency band of a model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Fast,
    #[default]
    Medium,
    Slow,
}

impl LatencyClass {
    /// Latency EMA a fresh record starts from
    #[must_use]
    pub fn baseline_ms(self) -> f64 {
        match self {
            Self::Fast => 400.0,
            Self::Medium => 1_500.0,
            Self::Slow => 6_000.0,
        }
    }
}

/// Relative cost of a model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    /// Local or otherwise free
    #[default]
    Free,
    Low,
    Medium,
    High,
}

/// A routable model
#[derive(Clone)]
pub struct ModelDescriptor {
    /// Unique id
    pub id: String,
    /// Capability tag -> proficiency in [0, 1]
    pub capabilities: BTreeMap<String, f64>,
    pub latency_class: LatencyClass,
    pub cost_class: CostClass,
    /// Adapter used to reach the model
    pub backend: Arc<dyn CompletionBackend>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeMap::new(),
            latency_class: LatencyClass::default(),
            cost_class: CostClass::default(),
            backend,
        }
    }

    /// Add one capability; proficiency is clamped to [0, 1]
    #[must_use]
    pub fn with_capability(mut self, tag: impl Into<String>, proficiency: f64) -> Self {
        self.capabilities
            .insert(tag.into(), proficiency.clamp(0.0, 1.0));
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: BTreeMap<String, f64>) -> Self {
        for (tag, proficiency) in capabilities {
            self = self.with_capability(tag, proficiency);
        }
        self
    }

    #[must_use]
    pub fn with_latency_class(mut self, latency_class: LatencyClass) -> Self {
        self.latency_class = latency_class;
        self
    }

    #[must_use]
    pub fn with_cost_class(mut self, cost_class: CostClass) -> Self {
        self.cost_class = cost_class;
        self
    }
}

impl fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .field("latency_class", &self.latency_class)
            .field("cost_class", &self.cost_class)
            .field("backend", &self.backend.name())
            .finish()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Stats for one model at snapshot time
#[derive(Clone, Debug, PartialEq)]
pub struct ModelStats {
    pub model_id: String,
    pub capabilities: BTreeMap<String, f64>,
    pub latency_class: LatencyClass,
    pub latency_ema_ms: f64,
    pub success_rate: f64,
    pub satisfaction_avg: f64,
    pub sample_count: u64,
    pub health: HealthState,
    pub eligibility: Eligibility,
    /// Requests currently dispatched to this model
    pub in_flight: usize,
}

impl ModelStats {
    /// Stats of a model nobody has used yet
    pub fn new(model_id: impl Into<String>) -> Self {
        let latency_class = LatencyClass::default();
        Self {
            model_id: model_id.into(),
            capabilities: BTreeMap::new(),
            latency_class,
            latency_ema_ms: latency_class.baseline_ms(),
            success_rate: 1.0,
            satisfaction_avg: 0.5,
            sample_count: 0,
            health: HealthState::Unknown,
            eligibility: Eligibility::Eligible,
            in_flight: 0,
        }
    }

    #[must_use]
    pub fn with_capability(mut self, tag: impl Into<String>, proficiency: f64) -> Self {
        self.capabilities.insert(tag.into(), proficiency);
        self
    }

    #[must_use]
    pub fn with_latency_ms(mut self, latency_ema_ms: f64) -> Self {
        self.latency_ema_ms = latency_ema_ms;
        self
    }

    #[must_use]
    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate;
        self
    }

    #[must_use]
    pub fn with_satisfaction(mut self, satisfaction_avg: f64) -> Self {
        self.satisfaction_avg = satisfaction_avg;
        self
    }

    #[must_use]
    pub fn with_health(mut self, health: HealthState, eligibility: Eligibility) -> Self {
        self.health = health;
        self.eligibility = eligibility;
        self
    }

    #[must_use]
    pub fn with_in_flight(mut self, in_flight: usize) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Whether the selector may rank this model
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.eligibility.allows_selection()
    }

    fn from_record(
        descriptor: &ModelDescriptor,
        record: &PerformanceRecord,
        eligibility: Eligibility,
        in_flight: usize,
    ) -> Self {
        Self {
            model_id: descriptor.id.clone(),
            capabilities: descriptor.capabilities.clone(),
            latency_class: descriptor.latency_class,
            latency_ema_ms: record.latency_ema_ms,
            success_rate: record.success_rate,
            satisfaction_avg: record.satisfaction_avg,
            sample_count: record.sample_count,
            health: record.health(),
            eligibility,
            in_flight,
        }
    }
}

/// Owned, consistent view of every registered model
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySnapshot {
    models: BTreeMap<String, ModelStats>,
}

impl RegistrySnapshot {
    pub fn from_stats(stats: impl IntoIterator<Item = ModelStats>) -> Self {
        Self {
            models: stats
                .into_iter()
                .map(|s| (s.model_id.clone(), s))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<&ModelStats> {
        self.models.get(model_id)
    }

    /// Models in id order
    pub fn iter(&self) -> impl Iterator<Item = &ModelStats> {
        self.models.values()
    }

    /// Selectable models in id order
    pub fn eligible(&self) -> impl Iterator<Item = &ModelStats> {
        self.models.values().filter(|s| s.is_eligible())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

// ============================================================================
// In-flight tracking
// ============================================================================

struct ModelSlot {
    descriptor: ModelDescriptor,
    in_flight: AtomicUsize,
}

/// Counts a request against a model's load until dropped
pub struct InFlightGuard {
    slot: Arc<ModelSlot>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registered models plus their performance records
pub struct ModelRegistry {
    models: DashMap<String, Arc<ModelSlot>>,
    records: DashMap<String, Arc<Mutex<PerformanceRecord>>>,
    monitor: HealthMonitor,
    ema_alpha: f64,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

impl ModelRegistry {
    #[must_use]
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            models: DashMap::new(),
            records: DashMap::new(),
            monitor: HealthMonitor::new(config.health_config()),
            ema_alpha: config.ema_alpha,
        }
    }

    /// Health thresholds in effect
    #[must_use]
    pub fn health_config(&self) -> &HealthConfig {
        self.monitor.config()
    }

    /// Add a model
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateModel`] if the id is taken.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<(), RouterError> {
        match self.models.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => Err(RouterError::DuplicateModel(descriptor.id)),
            Entry::Vacant(slot) => {
                info!(
                    model_id = %descriptor.id,
                    backend = descriptor.backend.name(),
                    capabilities = descriptor.capabilities.len(),
                    "Registered model"
                );
                slot.insert(Arc::new(ModelSlot {
                    descriptor,
                    in_flight: AtomicUsize::new(0),
                }));
                Ok(())
            }
        }
    }

    /// Remove a model; its performance record is kept
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownModel`] if nothing is registered under `model_id`.
    pub fn remove(&self, model_id: &str) -> Result<ModelDescriptor, RouterError> {
        let (_, slot) = self
            .models
            .remove(model_id)
            .ok_or_else(|| RouterError::UnknownModel(model_id.to_string()))?;
        info!(model_id = %model_id, "Removed model");
        Ok(slot.descriptor.clone())
    }

    #[must_use]
    pub fn descriptor(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.models.get(model_id).map(|slot| slot.descriptor.clone())
    }

    #[must_use]
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn record_cell(&self, model_id: &str) -> Arc<Mutex<PerformanceRecord>> {
        if let Some(cell) = self.records.get(model_id) {
            return Arc::clone(cell.value());
        }
        let latency_class = self
            .models
            .get(model_id)
            .map(|slot| slot.descriptor.latency_class)
            .unwrap_or_default();
        let cell = self.records.entry(model_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(PerformanceRecord::seeded(model_id, latency_class)))
        });
        Arc::clone(cell.value())
    }

    /// Record a completed request
    pub fn record_outcome(&self, model_id: &str, latency: Duration, success: bool) {
        if !self.contains(model_id) {
            debug!(model_id = %model_id, "Outcome for unregistered model");
        }
        let cell = self.record_cell(model_id);
        let mut record = cell.lock();
        record.push_outcome(latency, success);
        if success {
            self.monitor.on_success(&mut record);
        } else {
            self.monitor.on_failure(&mut record, Instant::now());
        }
    }

    /// Record a request its caller abandoned
    ///
    /// Cancelled requests never enter the latency or success averages.
    pub fn record_cancelled(&self, model_id: &str) {
        let cell = self.record_cell(model_id);
        let mut record = cell.lock();
        self.monitor.on_cancelled(&mut record, Instant::now());
    }

    /// Apply one satisfaction score; returns the new average
    ///
    /// Scores are clamped to [0, 1]; non-finite scores are ignored.
    pub fn record_feedback(&self, model_id: &str, score: f64) -> Option<f64> {
        if !score.is_finite() {
            warn!(model_id = %model_id, "Ignoring non-finite feedback score");
            return None;
        }
        let cell = self.record_cell(model_id);
        let mut record = cell.lock();
        Some(record.apply_feedback(score.clamp(0.0, 1.0), self.ema_alpha))
    }

    fn fold_locked(&self, record: &mut PerformanceRecord) -> bool {
        let folded = record.fold(self.ema_alpha);
        if folded {
            self.monitor.on_success_rate(record);
        }
        folded
    }

    /// Fold every pending window; returns how many records moved
    pub fn tick(&self) -> usize {
        let cells: Vec<_> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        cells
            .iter()
            .filter(|cell| self.fold_locked(&mut cell.lock()))
            .count()
    }

    /// Consistent view of every registered model
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let slots: Vec<Arc<ModelSlot>> = self.models.iter().map(|e| Arc::clone(e.value())).collect();
        let now = Instant::now();

        RegistrySnapshot::from_stats(slots.iter().map(|slot| {
            let cell = self.record_cell(&slot.descriptor.id);
            let mut record = cell.lock();
            self.fold_locked(&mut record);
            let eligibility = self.monitor.eligibility(&record.circuit, now);
            ModelStats::from_record(
                &slot.descriptor,
                &record,
                eligibility,
                slot.in_flight.load(Ordering::Acquire),
            )
        }))
    }

    /// Folded copy of one model's record
    #[must_use]
    pub fn record(&self, model_id: &str) -> Option<PerformanceRecord> {
        let cell = self.records.get(model_id).map(|c| Arc::clone(c.value()))?;
        let mut record = cell.lock();
        self.fold_locked(&mut record);
        Some(record.clone())
    }

    #[must_use]
    pub fn health(&self, model_id: &str) -> Option<HealthState> {
        if !self.contains(model_id) {
            return None;
        }
        Some(self.record_cell(model_id).lock().health())
    }

    #[must_use]
    pub fn eligibility(&self, model_id: &str) -> Option<Eligibility> {
        if !self.contains(model_id) {
            return None;
        }
        let cell = self.record_cell(model_id);
        let record = cell.lock();
        Some(self.monitor.eligibility(&record.circuit, Instant::now()))
    }

    /// Let one request through to `model_id`, reserving the probe slot if needed
    ///
    /// Returns `None` when the model is unknown, cooling down, or already probing.
    pub fn admit(&self, model_id: &str) -> Option<Admission> {
        if !self.contains(model_id) {
            return None;
        }
        let cell = self.record_cell(model_id);
        let mut record = cell.lock();
        let admission = self.monitor.admit(&mut record.circuit, Instant::now());
        if admission == Some(Admission::Probe) {
            info!(model_id = %model_id, "Admitting probe request");
        }
        admission
    }

    /// Count a request against `model_id` until the guard drops
    #[must_use]
    pub fn begin_request(&self, model_id: &str) -> Option<InFlightGuard> {
        let slot = Arc::clone(self.models.get(model_id)?.value());
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(InFlightGuard { slot })
    }

    #[must_use]
    pub fn in_flight(&self, model_id: &str) -> usize {
        self.models
            .get(model_id)
            .map_or(0, |slot| slot.in_flight.load(Ordering::Acquire))
    }

    /// Folded copies of every record, sorted by model id
    #[must_use]
    pub fn export_records(&self) -> Vec<PerformanceRecord> {
        let cells: Vec<_> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        let mut records: Vec<PerformanceRecord> = cells
            .iter()
            .map(|cell| {
                let mut record = cell.lock();
                self.fold_locked(&mut record);
                record.clone()
            })
            .collect();
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        records
    }

    /// Replace records with previously exported ones
    pub fn restore_records(&self, records: Vec<PerformanceRecord>) {
        let now = Instant::now();
        let count = records.len();
        for mut record in records {
            self.monitor.restore(&mut record.circuit, now);
            self.records
                .insert(record.model_id.clone(), Arc::new(Mutex::new(record)));
        }
        info!(records = count, "Restored performance records");
    }
}
