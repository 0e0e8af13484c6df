use crate::translate::{ResourceSet, ResourceType, Resources};
use gantry_controller_core::GroupId;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::watch;

/// Holds the latest [`Snapshot`] of every group.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    groups: RwLock<HashMap<GroupId, Entry>>,
}

/// Observes a group's snapshots. `None` until the group is first published
/// and after it is removed.
pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// An immutable, internally consistent set of resources for one group.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    group: GroupId,
    version: u64,
    types: [TypeSnapshot; 5],
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeSnapshot {
    /// The snapshot version at which this type's content last changed.
    pub version: u64,
    pub set: ResourceSet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Publish {
    Updated { version: u64 },
    Unchanged { version: u64 },
}

#[derive(Debug)]
struct Entry {
    tx: watch::Sender<Option<Arc<Snapshot>>>,

    /// Survives removal so that a re-created group continues from the last
    /// version it published.
    version: AtomicU64,
}

// === impl SnapshotCache ===

impl SnapshotCache {
    /// Publishes a group's resources. The version only advances when the
    /// content of at least one resource type changed.
    pub fn publish(&self, group: &GroupId, resources: Resources) -> Publish {
        if let Some(entry) = self.groups.read().get(group) {
            return entry.publish(group, &resources);
        }
        let mut groups = self.groups.write();
        groups
            .entry(group.clone())
            .or_insert_with(Entry::new)
            .publish(group, &resources)
    }

    /// Subscribes to a group's snapshots, whether or not it has been
    /// published yet.
    ///
    /// Watching an unknown group creates an entry for it. Entries that were
    /// never published are dropped once their last watcher goes away, so
    /// proxies naming arbitrary groups cannot grow the cache.
    pub fn watch(&self, group: &GroupId) -> SnapshotRx {
        if let Some(entry) = self.groups.read().get(group) {
            return entry.tx.subscribe();
        }
        let mut groups = self.groups.write();
        let before = groups.len();
        groups.retain(|_, e| e.is_published() || e.tx.receiver_count() > 0);
        if groups.len() < before {
            tracing::trace!(pruned = before - groups.len(), "Pruned unwatched groups");
        }
        groups
            .entry(group.clone())
            .or_insert_with(Entry::new)
            .tx
            .subscribe()
    }

    pub fn get(&self, group: &GroupId) -> Option<Arc<Snapshot>> {
        self.groups.read().get(group)?.tx.borrow().clone()
    }

    /// Clears a group's snapshot. Watchers observe `None`; the group's last
    /// version is retained.
    pub fn remove(&self, group: &GroupId) {
        if let Some(entry) = self.groups.read().get(group) {
            if entry.tx.send_replace(None).is_some() {
                tracing::debug!(%group, "Removed snapshot");
            }
        }
    }

    /// Returns the groups that currently have a snapshot.
    pub fn groups(&self) -> Vec<GroupId> {
        let mut groups = self
            .groups
            .read()
            .iter()
            .filter(|(_, e)| e.tx.borrow().is_some())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        groups.sort();
        groups
    }
}

// === impl Entry ===

impl Entry {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            version: AtomicU64::new(0),
        }
    }

    fn is_published(&self) -> bool {
        self.version.load(Ordering::Acquire) > 0
    }

    fn publish(&self, group: &GroupId, resources: &Resources) -> Publish {
        let prior = self.tx.borrow().clone();
        let last = self.version.load(Ordering::Acquire);
        let version = last + 1;

        let mut changed = prior.is_none();
        let types = ResourceType::ALL.map(|ty| {
            let set = resources.get(ty);
            match prior.as_deref().map(|s| s.get(ty)) {
                Some(prev) if prev.set.hash == set.hash => prev.clone(),
                _ => {
                    changed = true;
                    TypeSnapshot {
                        version,
                        set: set.clone(),
                    }
                }
            }
        });
        if !changed {
            return Publish::Unchanged { version: last };
        }

        self.version.store(version, Ordering::Release);
        self.tx.send_replace(Some(Arc::new(Snapshot {
            group: group.clone(),
            version,
            types,
        })));
        tracing::debug!(%group, version, "Published snapshot");
        Publish::Updated { version }
    }
}

// === impl Snapshot ===

impl Snapshot {
    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, ty: ResourceType) -> &TypeSnapshot {
        &self.types[ty as usize]
    }
}

// === impl Publish ===

impl Publish {
    pub fn version(&self) -> u64 {
        match self {
            Self::Updated { version } | Self::Unchanged { version } => *version,
        }
    }
}

#[cfg(test)]
mod tests;
