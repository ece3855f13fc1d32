//! The store watch loop.
//!
//! One loop runs per controller process. It owns the resume cursor and the
//! local cache of decoded entities, and it is the only source of events, so
//! events are delivered strictly one at a time in backend order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use df_model::{DecodeError, Entity, EntityKind, ModelRegistry};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::api::{deliver_delete, deliver_upsert, NbEventSink};
use crate::backend::{KvBackend, Mutation, MutationAction};
use crate::error::{classify, BackendError, ErrorClass, NbError, Result};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Splits a store key into its kind and entity id.
///
/// The namespace must match a registered kind exactly; `lports/x` is not
/// an `lport` key.
pub fn parse_key(key: &str) -> Option<(EntityKind, &str)> {
    let (namespace, id) = key.trim_start_matches('/').split_once('/')?;
    if id.is_empty() {
        return None;
    }
    Some((EntityKind::from_namespace(namespace)?, id))
}

/// Cursor-based watch loop over a [`KvBackend`].
pub struct WatchLoop {
    backend: Arc<dyn KvBackend>,
    registry: Arc<ModelRegistry>,
    cursor: u64,
    cache: HashMap<EntityKind, BTreeMap<String, Entity>>,
    resync_pending: bool,
    retry_delay: Duration,
}

impl WatchLoop {
    pub fn new(backend: Arc<dyn KvBackend>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            backend,
            registry,
            cursor: 1,
            cache: HashMap::new(),
            resync_pending: true,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Skips the initial full listing and watches from `index` instead.
    pub fn starting_at(mut self, index: u64) -> Self {
        self.cursor = index;
        self.resync_pending = false;
        self
    }

    /// Pause after a retryable error.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Index of the next mutation to observe.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn cached(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.cache.get(&kind).and_then(|entries| entries.get(id))
    }

    pub fn cached_count(&self, kind: EntityKind) -> usize {
        self.cache.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Runs until a fatal error or until `shutdown` is cancelled.
    pub async fn run(&mut self, sink: &dyn NbEventSink, shutdown: CancellationToken) -> Result<()> {
        info!("Watch loop starting at index {}", self.cursor);
        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = self.step(sink) => Some(result),
            };
            let Some(result) = result else {
                info!("Watch loop stopped at index {}", self.cursor);
                return Ok(());
            };

            let Err(err) = result else {
                continue;
            };
            match classify(&err) {
                ErrorClass::Retryable => {
                    if !matches!(err, NbError::Backend(BackendError::Timeout)) {
                        warn!("Retrying from index {}: {}", self.cursor, err);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                ErrorClass::CursorExpired => {
                    warn!("{}; resynchronizing", err);
                    self.resync_pending = true;
                }
                ErrorClass::Fatal => {
                    error!("Watch loop failed at index {}: {}", self.cursor, err);
                    return Err(err);
                }
            }
        }
    }

    async fn step(&mut self, sink: &dyn NbEventSink) -> Result<()> {
        if self.resync_pending {
            self.resync(sink).await
        } else {
            self.poll_once(sink).await
        }
    }

    /// Waits for the next mutation at or after the cursor and handles it.
    pub async fn poll_once(&mut self, sink: &dyn NbEventSink) -> Result<()> {
        let mutation = self.backend.watch(self.cursor).await?;
        if mutation.index < self.cursor {
            debug!(
                "Ignoring mutation {} below cursor {}",
                mutation.index, self.cursor
            );
            return Ok(());
        }
        sink.sync().await?;
        let index = mutation.index;
        self.handle(sink, mutation).await;
        self.cursor = index + 1;
        Ok(())
    }

    async fn handle(&mut self, sink: &dyn NbEventSink, mutation: Mutation) {
        let Some((kind, id)) = parse_key(&mutation.key) else {
            debug!("Ignoring key outside known namespaces: {}", mutation.key);
            return;
        };
        let id = id.to_string();

        match (mutation.action, mutation.value) {
            (MutationAction::Upsert, Some(value)) => {
                let entity = match self.decode_keyed(kind, &id, &value) {
                    Ok(entity) => entity,
                    Err(e) => {
                        error!(
                            "Skipping {} at index {}: {}",
                            mutation.key, mutation.index, e
                        );
                        return;
                    }
                };
                debug!("{} {} {} (index {})", kind, kind.upsert_event(), id, mutation.index);
                self.cache
                    .entry(kind)
                    .or_default()
                    .insert(id, entity.clone());
                deliver_upsert(sink, entity).await;
            }
            (MutationAction::Upsert, None) => {
                error!(
                    "Skipping {} at index {}: upsert without a value",
                    mutation.key, mutation.index
                );
            }
            (MutationAction::Delete, _) => {
                debug!("{} deleted {} (index {})", kind, id, mutation.index);
                if let Some(entries) = self.cache.get_mut(&kind) {
                    entries.remove(&id);
                }
                deliver_delete(sink, kind, &id).await;
            }
        }
    }

    /// Decodes a stored value, requiring its id field to match the key.
    /// Deletes carry only the key, so a record stored under another id
    /// could never be removed.
    fn decode_keyed(
        &self,
        kind: EntityKind,
        key_id: &str,
        value: &[u8],
    ) -> std::result::Result<Entity, DecodeError> {
        let entity = self.registry.decode(kind, value)?;
        if entity.id() != key_id {
            return Err(DecodeError::IdMismatch {
                kind,
                key_id: key_id.to_string(),
                record_id: entity.id().to_string(),
            });
        }
        Ok(entity)
    }

    /// Replaces the cache with a full listing of the store.
    ///
    /// Upserts are delivered for every listed entity in kind registration
    /// order, then deletes for cached entities that are gone, in reverse
    /// order. The cursor moves to just after the listing's index.
    pub async fn resync(&mut self, sink: &dyn NbEventSink) -> Result<()> {
        let listing = self.backend.list("").await?;
        info!(
            "Resynchronizing {} entries at index {}",
            listing.entries.len(),
            listing.index
        );

        let mut fresh: HashMap<EntityKind, BTreeMap<String, Entity>> = HashMap::new();
        let mut undecodable: Vec<(EntityKind, String)> = Vec::new();
        for entry in listing.entries {
            let Some((kind, id)) = parse_key(&entry.key) else {
                continue;
            };
            match self.decode_keyed(kind, id, &entry.value) {
                Ok(entity) => {
                    fresh.entry(kind).or_default().insert(id.to_string(), entity);
                }
                Err(e) => {
                    error!("Skipping {} during resync: {}", entry.key, e);
                    undecodable.push((kind, id.to_string()));
                }
            }
        }

        sink.sync().await?;

        let kinds: Vec<EntityKind> = self.registry.kinds().collect();
        for kind in &kinds {
            if let Some(entries) = fresh.get(kind) {
                for entity in entries.values() {
                    deliver_upsert(sink, entity.clone()).await;
                }
            }
        }

        for kind in kinds.iter().rev() {
            let Some(old) = self.cache.get(kind) else {
                continue;
            };
            let current = fresh.get(kind);
            for id in old.keys() {
                let still_present = current.is_some_and(|entries| entries.contains_key(id))
                    || undecodable.iter().any(|(k, i)| k == kind && i == id);
                if !still_present {
                    deliver_delete(sink, *kind, id).await;
                }
            }
        }

        // Entries that failed to decode keep their last good value.
        for (kind, id) in undecodable {
            if let Some(entity) = self.cache.get(&kind).and_then(|entries| entries.get(&id)) {
                let entity = entity.clone();
                fresh.entry(kind).or_default().insert(id, entity);
            }
        }

        self.cache = fresh;
        self.cursor = listing.index + 1;
        self.resync_pending = false;
        Ok(())
    }
}
