//! IdempotencyCache - 再試行下での at-most-once effect
//!
//! # 設計
//! - One entry per derived key: `processing` -> `completed` | `failed`.
//! - A caller that finds a `processing` entry waits for the first caller's
//!   outcome instead of executing again (bounded by `processing_wait`).
//! - Expired entries count as absent; the entry count is capped with
//!   oldest-first eviction (terminal entries go before in-flight ones).

pub mod key;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

pub use self::key::{canonical_json, derive_key};
use crate::config::IdempotencyConfig;
use crate::domain::KernelError;
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: String,
    pub state: EntryState,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StartResult {
    /// The caller owns the request and must record its outcome.
    pub is_new: bool,
    pub cached_response: Option<Value>,
    pub cached_error: Option<String>,
}

impl StartResult {
    fn fresh() -> Self {
        Self {
            is_new: true,
            ..Self::default()
        }
    }

    fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Completed(response) => Self {
                is_new: false,
                cached_response: Some(response.clone()),
                cached_error: None,
            },
            Outcome::Failed(error) | Outcome::Reopened(error) => Self {
                is_new: false,
                cached_response: None,
                cached_error: Some(error.clone()),
            },
        }
    }
}

/// What waiters on a `processing` entry are woken with.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Completed(Value),
    Failed(String),
    /// Failed, but the key is open again for the next fresh start.
    Reopened(String),
}

struct Slot {
    seq: u64,
    entry: IdempotencyEntry,
    done: watch::Sender<Option<Outcome>>,
}

struct CacheState {
    slots: HashMap<String, Slot>,
    /// Insertion order as `(seq, key)`; records whose seq no longer matches
    /// the live slot are stale and skipped.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl CacheState {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.slots.retain(|_, slot| slot.entry.expires_at > now);
    }

    fn insert(&mut self, key: String, entry: IdempotencyEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (done, _) = watch::channel(None);
        self.order.push_back((seq, key.clone()));
        self.slots.insert(key, Slot { seq, entry, done });
    }

    fn evict(&mut self, max_entries: usize) {
        while self.slots.len() > max_entries {
            let slots = &self.slots;
            self.order
                .retain(|(seq, key)| slots.get(key).is_some_and(|s| s.seq == *seq));
            let victim = self
                .order
                .iter()
                .position(|(_, key)| {
                    slots
                        .get(key)
                        .is_some_and(|s| s.entry.state != EntryState::Processing)
                })
                .unwrap_or(0);
            let Some((_, key)) = self.order.remove(victim) else {
                break;
            };
            debug!(key = %key, "idempotency entry evicted");
            self.slots.remove(&key);
        }
    }
}

pub struct IdempotencyCache {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyCache {
    pub fn new(config: IdempotencyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
            clock,
            config,
        }
    }

    /// Claims the key, or returns the outcome of whoever claimed it first.
    ///
    /// When the existing entry is still `processing` this waits for its
    /// terminal outcome, up to `processing_wait`.
    pub async fn start_request(
        &self,
        tool: &str,
        input: &Value,
        explicit_key: Option<&str>,
    ) -> Result<StartResult, KernelError> {
        let key = derive_key(tool, input, explicit_key);
        loop {
            let mut waiter = {
                let mut state = self.state.lock().await;
                let now = self.clock.now();
                state.purge_expired(now);

                match state.slots.get(&key) {
                    None => {
                        let entry = IdempotencyEntry {
                            key: key.clone(),
                            state: EntryState::Processing,
                            response: None,
                            error: None,
                            created_at: now,
                            expires_at: now + self.config.ttl(),
                        };
                        state.insert(key.clone(), entry);
                        state.evict(self.config.max_entries);
                        debug!(tool, key = %key, "idempotency key claimed");
                        return Ok(StartResult::fresh());
                    }
                    Some(slot) => match slot.entry.state {
                        EntryState::Completed => {
                            return Ok(StartResult {
                                is_new: false,
                                cached_response: slot.entry.response.clone(),
                                cached_error: None,
                            });
                        }
                        EntryState::Failed => {
                            return Ok(StartResult {
                                is_new: false,
                                cached_response: None,
                                cached_error: slot.entry.error.clone(),
                            });
                        }
                        EntryState::Processing => slot.done.subscribe(),
                    },
                }
            }; // Lock released here

            debug!(tool, key = %key, "waiting on in-flight request");
            let wait = self.config.processing_wait();
            match tokio::time::timeout(wait, waiter.wait_for(Option::is_some)).await {
                Ok(Ok(outcome)) => {
                    if let Some(outcome) = outcome.as_ref() {
                        return Ok(StartResult::from_outcome(outcome));
                    }
                }
                // The entry vanished (expired or evicted) without an outcome.
                Ok(Err(_)) => continue,
                Err(_) => {
                    warn!(tool, key = %key, "gave up waiting on in-flight request");
                    return Err(KernelError::Timeout {
                        operation: format!("idempotent {tool}"),
                        after: wait,
                    });
                }
            }
        }
    }

    pub async fn record_success(
        &self,
        tool: &str,
        input: &Value,
        response: Value,
        explicit_key: Option<&str>,
    ) {
        let key = derive_key(tool, input, explicit_key);
        self.finish(key, EntryState::Completed, Some(response), None)
            .await;
    }

    /// Caches a terminal failure; later starts get the error back.
    pub async fn record_failure(
        &self,
        tool: &str,
        input: &Value,
        error: &str,
        explicit_key: Option<&str>,
    ) {
        let key = derive_key(tool, input, explicit_key);
        self.finish(key, EntryState::Failed, None, Some(error.to_string()))
            .await;
    }

    /// Wakes current waiters with `error` and frees the key so the next
    /// fresh `start_request` re-attempts.
    pub async fn record_transient_failure(
        &self,
        tool: &str,
        input: &Value,
        error: &str,
        explicit_key: Option<&str>,
    ) {
        let key = derive_key(tool, input, explicit_key);
        let mut state = self.state.lock().await;
        if let Some(slot) = state.slots.remove(&key) {
            slot.done
                .send_replace(Some(Outcome::Reopened(error.to_string())));
        }
        debug!(tool, key = %key, "idempotency key reopened");
    }

    async fn finish(
        &self,
        key: String,
        to: EntryState,
        response: Option<Value>,
        error: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let expires_at = now + self.config.ttl();
        let outcome = match to {
            EntryState::Completed => Outcome::Completed(response.clone().unwrap_or(Value::Null)),
            _ => Outcome::Failed(error.clone().unwrap_or_default()),
        };

        match state.slots.get_mut(&key) {
            Some(slot) => {
                slot.entry.state = to;
                slot.entry.response = response;
                slot.entry.error = error;
                slot.entry.expires_at = expires_at;
                slot.done.send_replace(Some(outcome));
            }
            None => {
                // Expired or evicted while running; keep the outcome anyway.
                let entry = IdempotencyEntry {
                    key: key.clone(),
                    state: to,
                    response,
                    error,
                    created_at: now,
                    expires_at,
                };
                state.insert(key, entry);
                state.evict(self.config.max_entries);
            }
        }
    }

    /// Live (unexpired) entry for a derived key.
    pub async fn entry(&self, key: &str) -> Option<IdempotencyEntry> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        state
            .slots
            .get(key)
            .filter(|slot| slot.entry.expires_at > now)
            .map(|slot| slot.entry.clone())
    }

    pub async fn len(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.purge_expired(now);
        state.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
