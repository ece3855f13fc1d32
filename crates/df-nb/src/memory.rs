//! In-memory key-value backend.
//!
//! Keeps a bounded suffix of the mutation history so that watch resumption
//! and cursor expiry behave like a real store. Used by tests and by
//! single-node setups without an external store; a watcher that falls more
//! than the history limit behind gets `CursorExpired` and must resync.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{KvBackend, KvEntry, KvListing, Mutation, MutationAction};
use crate::error::BackendError;

const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_millis(200);

/// Mutations retained for watchers by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Default)]
struct State {
    index: u64,
    data: BTreeMap<String, (Vec<u8>, u64)>,
    history: VecDeque<Mutation>,
    /// Highest index dropped from `history`.
    compacted: u64,
}

impl State {
    fn record(&mut self, key: &str, value: Option<Vec<u8>>, history_limit: usize) -> u64 {
        self.index += 1;
        let index = self.index;
        let action = match &value {
            Some(v) => {
                self.data.insert(key.to_string(), (v.clone(), index));
                MutationAction::Upsert
            }
            None => {
                self.data.remove(key);
                MutationAction::Delete
            }
        };
        self.history.push_back(Mutation {
            key: key.to_string(),
            value,
            action,
            index,
        });
        while self.history.len() > history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.index;
            }
        }
        index
    }
}

/// In-memory backend with watch history.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    notify: Notify,
    watch_timeout: Duration,
    history_limit: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Sets how long `watch` waits for a change before timing out.
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Retains at most `limit` mutations in the watch history.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Current store index.
    pub fn index(&self) -> u64 {
        self.state.lock().index
    }

    /// Drops every history entry with an index below `keep_from`.
    pub fn compact(&self, keep_from: u64) {
        let mut state = self.state.lock();
        while state.history.front().is_some_and(|m| m.index < keep_from) {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.index;
            }
        }
        debug!("Compacted history up to index {}", state.compacted);
    }

    fn next_mutation(&self, from_index: u64) -> Result<Option<Mutation>, BackendError> {
        let state = self.state.lock();
        if from_index <= state.compacted {
            return Err(BackendError::CursorExpired {
                current_index: state.index,
            });
        }
        Ok(state.history.iter().find(|m| m.index >= from_index).cloned())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<KvEntry>, BackendError> {
        let state = self.state.lock();
        Ok(state.data.get(key).map(|(value, modified_index)| KvEntry {
            key: key.to_string(),
            value: value.clone(),
            modified_index: *modified_index,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<KvListing, BackendError> {
        let state = self.state.lock();
        let entries = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, modified_index))| KvEntry {
                key: key.clone(),
                value: value.clone(),
                modified_index: *modified_index,
            })
            .collect();
        Ok(KvListing {
            entries,
            index: state.index,
        })
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<u64, BackendError> {
        let index = self.state.lock().record(key, Some(value), self.history_limit);
        self.notify.notify_waiters();
        Ok(index)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        prev_index: u64,
    ) -> Result<u64, BackendError> {
        let index = {
            let mut state = self.state.lock();
            match state.data.get(key) {
                Some((_, current)) if *current == prev_index => {}
                _ => {
                    return Err(BackendError::Conflict {
                        key: key.to_string(),
                    })
                }
            }
            state.record(key, Some(value), self.history_limit)
        };
        self.notify.notify_waiters();
        Ok(index)
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        {
            let mut state = self.state.lock();
            if !state.data.contains_key(key) {
                return Ok(());
            }
            state.record(key, None, self.history_limit);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn watch(&self, from_index: u64) -> Result<Mutation, BackendError> {
        let deadline = tokio::time::Instant::now() + self.watch_timeout;
        loop {
            // Register before checking so a write in between is not missed.
            let notified = self.notify.notified();
            if let Some(mutation) = self.next_mutation(from_index)? {
                return Ok(mutation);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BackendError::Timeout);
            }
        }
    }
}
