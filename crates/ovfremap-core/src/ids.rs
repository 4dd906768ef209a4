//! Identity allocation and run-scoped remapping state.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

/// Source of candidate identifiers.
pub trait IdSource {
    /// Produce the next candidate id.
    fn next_id(&mut self) -> String;
}

/// Random (v4) UUIDs, the production id source.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn next_id(&mut self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Predictable ids (`<prefix>-0001`, `<prefix>-0002`, ...) for tests and dry runs.
#[derive(Debug, Clone)]
pub struct SequentialIds {
    prefix: String,
    counter: u64,
}

impl SequentialIds {
    /// Create a sequence with the given prefix, starting at 1.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{:04}", self.prefix, self.counter)
    }
}

/// Hands out fresh ids and keeps the old-group → new-group mapping.
///
/// Every id handed out is distinct from every id previously issued and from
/// every id registered with [`reserve`](Self::reserve).
#[derive(Debug)]
pub struct IdAllocator<S = UuidSource> {
    source: S,
    taken: HashSet<String>,
    groups: BTreeMap<String, String>,
}

impl Default for IdAllocator<UuidSource> {
    fn default() -> Self {
        Self::new(UuidSource)
    }
}

impl<S: IdSource> IdAllocator<S> {
    /// Create an allocator drawing candidates from `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            taken: HashSet::new(),
            groups: BTreeMap::new(),
        }
    }

    /// Mark an existing id as in use so it is never handed out.
    pub fn reserve(&mut self, id: impl Into<String>) {
        self.taken.insert(id.into());
    }

    /// A fresh id, unique within this run.
    pub fn new_image_id(&mut self) -> String {
        self.fresh()
    }

    /// A fresh id for the descriptor itself.
    pub fn new_descriptor_id(&mut self) -> String {
        self.fresh()
    }

    /// The new group id for `old_group_id`, allocated on first sight.
    pub fn new_group_id(&mut self, old_group_id: &str) -> String {
        if let Some(existing) = self.groups.get(old_group_id) {
            debug!(old = old_group_id, new = %existing, "reusing group id");
            return existing.clone();
        }

        let fresh = self.fresh();
        self.groups.insert(old_group_id.to_string(), fresh.clone());
        fresh
    }

    /// The old-group → new-group mapping built so far.
    pub fn group_map(&self) -> &BTreeMap<String, String> {
        &self.groups
    }

    fn fresh(&mut self) -> String {
        loop {
            let candidate = self.source.next_id();
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            warn!(id = %candidate, "id source produced a duplicate, drawing again");
        }
    }
}

/// Mutable state threaded through every remapping pass of one run.
#[derive(Debug)]
pub struct RemapContext<S = UuidSource> {
    /// Allocator for new ids and the group map.
    pub ids: IdAllocator<S>,
    /// Old image id → new image id, in the order disks were visited.
    pub image_map: Vec<(String, String)>,
    /// New composite id of the snapshot chain root, if one was seen.
    pub chain_root: Option<String>,
}

impl Default for RemapContext<UuidSource> {
    fn default() -> Self {
        Self::new(UuidSource)
    }
}

impl<S: IdSource> RemapContext<S> {
    /// Start a run with ids drawn from `source`.
    pub fn new(source: S) -> Self {
        Self {
            ids: IdAllocator::new(source),
            image_map: Vec::new(),
            chain_root: None,
        }
    }

    /// Record that `old` was remapped to `new`.
    pub fn record_image(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.image_map.push((old.into(), new.into()));
    }

    /// The new image id for `old`, if it was remapped in this run.
    pub fn mapped_image(&self, old: &str) -> Option<&str> {
        self.image_map
            .iter()
            .find(|(from, _)| from == old)
            .map(|(_, to)| to.as_str())
    }

    /// Record the chain root; a later root replaces an earlier one.
    pub fn set_chain_root(&mut self, composite: impl Into<String>) {
        let composite = composite.into();
        if let Some(previous) = &self.chain_root {
            warn!(
                previous = %previous,
                new = %composite,
                "more than one snapshot chain root; keeping the last one"
            );
        }
        self.chain_root = Some(composite);
    }
}
