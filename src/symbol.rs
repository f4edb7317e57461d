use crate::command::CommandBuffer;
use crate::types::{Bounds, ProjectionView};
use std::collections::HashMap;
use std::sync::Arc;

/// Logical identity of a reusable shape: which model, seen from which
/// projection, under which style revision. Equality and hashing are
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    pub model: String,
    pub view: ProjectionView,
    pub style_version: u32,
}

impl SymbolKey {
    pub fn new(model: impl Into<String>, view: ProjectionView, style_version: u32) -> Self {
        Self {
            model: model.into(),
            view,
            style_version,
        }
    }
}

/// A self-contained sub-buffer of commands in local coordinates, with the
/// model-space bounds the geometry covers. Owned by the cache; call sites
/// hold the stable integer id.
#[derive(Debug)]
pub struct SymbolDefinition {
    pub key: SymbolKey,
    pub id: u32,
    pub bounds: Bounds,
    pub buffer: CommandBuffer,
}

/// Content store for reusable symbols, indexed both by key and by the stable
/// integer id handed out at creation. Mutated only by the capture thread.
#[derive(Debug, Default)]
pub struct SymbolCache {
    by_key: HashMap<SymbolKey, u32>,
    by_id: HashMap<u32, Arc<SymbolDefinition>>,
    next_id: u32,
    hits: u64,
    misses: u64,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the definition for `key`, materializing it through `builder`
    /// on the first request. The builder receives the key and the id the
    /// definition will be stored under.
    pub fn get_or_create<F>(&mut self, key: &SymbolKey, builder: F) -> Arc<SymbolDefinition>
    where
        F: FnOnce(&SymbolKey, u32) -> SymbolDefinition,
    {
        if let Some(id) = self.by_key.get(key) {
            self.hits += 1;
            return Arc::clone(&self.by_id[id]);
        }

        self.misses += 1;
        let id = self.next_id;
        self.next_id += 1;
        let definition = Arc::new(builder(key, id));
        self.by_key.insert(key.clone(), id);
        self.by_id.insert(id, Arc::clone(&definition));
        definition
    }

    pub fn get(&self, key: &SymbolKey) -> Option<&Arc<SymbolDefinition>> {
        self.by_key.get(key).and_then(|id| self.by_id.get(id))
    }

    pub fn get_by_id(&self, id: u32) -> Option<&Arc<SymbolDefinition>> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Copies the current index out into an immutable view that an export
    /// pass can read while the live cache keeps being mutated. Definitions
    /// are immutable once created, so the snapshot shares them; the index
    /// itself is copied at snapshot time.
    pub fn snapshot(&self) -> SymbolSnapshot {
        SymbolSnapshot {
            by_id: self.by_id.clone(),
        }
    }
}

/// Immutable view of the cache taken at a point in time.
#[derive(Debug, Clone, Default)]
pub struct SymbolSnapshot {
    by_id: HashMap<u32, Arc<SymbolDefinition>>,
}

impl SymbolSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get_by_id(&self, id: u32) -> Option<&Arc<SymbolDefinition>> {
        self.by_id.get(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SymbolDefinition>> {
        self.by_id.values()
    }
}
