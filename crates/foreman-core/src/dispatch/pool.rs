//! Worker pool: capacity, cooldowns and provider usage ratios.
//!
//! Selection among available workers (cooldown over, spare capacity):
//! 1. the provider furthest below its target share, i.e. the lowest
//!    `(dispatched + 1) / weight`;
//! 2. within it, the least recently used worker;
//! 3. ties by worker id.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::WorkerConfig;
use crate::domain::KernelError;
use crate::ports::WorkerProvider;

struct WorkerSlot {
    id: String,
    provider: String,
    capacity: u32,
    in_flight: u32,
    cooldown_until: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
    worker: Arc<dyn WorkerProvider>,
}

impl WorkerSlot {
    fn available(&self, now: DateTime<Utc>) -> bool {
        self.in_flight < self.capacity && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// A worker handed out for one task. Give it back with [`WorkerPool::release`].
#[derive(Clone)]
pub struct WorkerLease {
    pub worker_id: String,
    pub provider: String,
    pub worker: Arc<dyn WorkerProvider>,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub provider: String,
    pub capacity: u32,
    pub in_flight: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    provider_weights: BTreeMap<String, u32>,
    dispatched: BTreeMap<String, u64>,
}

impl WorkerPool {
    pub fn new(provider_weights: BTreeMap<String, u32>) -> Self {
        Self {
            slots: Vec::new(),
            provider_weights,
            dispatched: BTreeMap::new(),
        }
    }

    pub fn add(
        &mut self,
        config: &WorkerConfig,
        worker: Arc<dyn WorkerProvider>,
    ) -> Result<(), KernelError> {
        if config.capacity == 0 {
            return Err(KernelError::Config(format!(
                "worker {} must have capacity > 0",
                config.id
            )));
        }
        if self.slots.iter().any(|s| s.id == config.id) {
            return Err(KernelError::Config(format!("duplicate worker {}", config.id)));
        }
        self.slots.push(WorkerSlot {
            id: config.id.clone(),
            provider: config.provider.clone(),
            capacity: config.capacity,
            in_flight: 0,
            cooldown_until: None,
            last_used: None,
            worker,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn provider_score(&self, provider: &str) -> f64 {
        let weight = self.provider_weights.get(provider).copied().unwrap_or(0);
        if weight == 0 {
            return f64::INFINITY;
        }
        let used = self.dispatched.get(provider).copied().unwrap_or(0);
        (used + 1) as f64 / f64::from(weight)
    }

    pub fn acquire(&mut self, now: DateTime<Utc>) -> Option<WorkerLease> {
        let idx = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.available(now))
            .min_by(|(_, a), (_, b)| {
                self.provider_score(&a.provider)
                    .total_cmp(&self.provider_score(&b.provider))
                    .then_with(|| a.provider.cmp(&b.provider))
                    // `None` (never used) sorts first.
                    .then_with(|| a.last_used.cmp(&b.last_used))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(idx, _)| idx)?;

        let slot = self.slots.get_mut(idx)?;
        slot.in_flight += 1;
        slot.last_used = Some(now);
        *self.dispatched.entry(slot.provider.clone()).or_default() += 1;
        Some(WorkerLease {
            worker_id: slot.id.clone(),
            provider: slot.provider.clone(),
            worker: Arc::clone(&slot.worker),
        })
    }

    pub fn release(&mut self, worker_id: &str) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }

    pub fn cool_down(&mut self, worker_id: &str, until: DateTime<Utc>) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == worker_id) {
            slot.cooldown_until = Some(slot.cooldown_until.map_or(until, |u| u.max(until)));
        }
    }

    /// Earliest moment a cooling worker with spare capacity comes back.
    pub fn next_available_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.slots
            .iter()
            .filter(|s| s.in_flight < s.capacity)
            .filter_map(|s| s.cooldown_until)
            .filter(|until| *until > now)
            .min()
    }

    pub fn has_available(&self, now: DateTime<Utc>) -> bool {
        self.slots.iter().any(|s| s.available(now))
    }

    pub fn dispatched(&self) -> &BTreeMap<String, u64> {
        &self.dispatched
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.slots
            .iter()
            .map(|s| WorkerStatus {
                id: s.id.clone(),
                provider: s.provider.clone(),
                capacity: s.capacity,
                in_flight: s.in_flight,
                cooldown_until: s.cooldown_until,
                last_used: s.last_used,
            })
            .collect()
    }
}
