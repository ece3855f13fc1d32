//! Parking of work that waits on entities not yet seen.
//!
//! A rule that references a port or switch the store has not delivered yet
//! is parked here with one constraint per missing entity. When an event for
//! that entity arrives the constraint is satisfied, and work with no
//! constraints left is handed back for another attempt.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use df_model::EntityKind;

/// Dependency on one entity, written `<namespace>:<id>` (`lport:p1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub kind: EntityKind,
    pub id: String,
}

impl Constraint {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Parses the `<namespace>:<id>` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, id) = s.split_once(':')?;
        Some(Self::new(EntityKind::from_namespace(namespace)?, id))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.namespace(), self.id)
    }
}

#[derive(Debug)]
struct Parked<T> {
    item: T,
    pending: HashSet<Constraint>,
}

/// Work items waiting on constraints.
#[derive(Debug)]
pub struct RetryCache<K, T> {
    parked: HashMap<K, Parked<T>>,
    /// constraint -> keys waiting on it
    waiters: HashMap<Constraint, HashSet<K>>,
}

impl<K, T> Default for RetryCache<K, T>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            parked: HashMap::new(),
            waiters: HashMap::new(),
        }
    }
}

impl<K, T> RetryCache<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.parked.contains_key(key)
    }

    pub fn constraints(&self, key: &K) -> Option<&HashSet<Constraint>> {
        self.parked.get(key).map(|p| &p.pending)
    }

    /// Parks `item` under `key`, replacing whatever was parked there.
    pub fn park(&mut self, key: K, item: T, constraints: impl IntoIterator<Item = Constraint>) {
        self.remove(&key);
        let pending: HashSet<Constraint> = constraints.into_iter().collect();
        for constraint in &pending {
            self.waiters
                .entry(constraint.clone())
                .or_default()
                .insert(key.clone());
        }
        self.parked.insert(key, Parked { item, pending });
    }

    pub fn remove(&mut self, key: &K) -> Option<T> {
        let parked = self.parked.remove(key)?;
        for constraint in &parked.pending {
            if let Some(keys) = self.waiters.get_mut(constraint) {
                keys.remove(key);
                if keys.is_empty() {
                    self.waiters.remove(constraint);
                }
            }
        }
        Some(parked.item)
    }

    /// Marks a constraint satisfied and takes out every item that has no
    /// constraints left.
    pub fn satisfy(&mut self, constraint: &Constraint) -> Vec<(K, T)> {
        let Some(keys) = self.waiters.remove(constraint) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for key in keys {
            let now_ready = self.parked.get_mut(&key).is_some_and(|parked| {
                parked.pending.remove(constraint);
                parked.pending.is_empty()
            });
            if now_ready {
                if let Some(parked) = self.parked.remove(&key) {
                    ready.push((key, parked.item));
                }
            }
        }
        ready
    }

    pub fn clear(&mut self) {
        self.parked.clear();
        self.waiters.clear();
    }
}
