//! Change tracking: decide, per category, what a commit does with each object.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::logutil::escape_log;
use crate::store::errors::StoreResult;
use crate::store::property::{PropertySet, RecordFlags};
use crate::store::schema::Category;
use crate::store::serial::Serial;
use crate::store::world::World;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Dirty, live and saved on exit: insert or update.
    Persist,
    /// Clean and live: nothing to do.
    Unchanged,
    /// Orphaned, or not saved on exit: remove from the store.
    Delete,
}

impl Disposition {
    pub fn classify(flags: &RecordFlags) -> Self {
        if flags.orphan || !flags.save_on_exit {
            Disposition::Delete
        } else if flags.dirty {
            Disposition::Persist
        } else {
            Disposition::Unchanged
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub set: PropertySet,
    /// Owning area for storage records.
    pub area: Option<String>,
}

/// One category's working sets for a single commit cycle.
#[derive(Debug)]
pub struct ChangeSet {
    pub category: Category,
    pub areas: Vec<String>,
    pub writes: Vec<PendingWrite>,
    pub deletes: BTreeSet<Serial>,
    pub unchanged: Vec<Serial>,
    /// Every serial accounted for this cycle; reconciliation ignores these.
    pub touched: HashSet<Serial>,
}

impl ChangeSet {
    fn new(category: Category) -> Self {
        Self {
            category,
            areas: Vec::new(),
            writes: Vec::new(),
            deletes: BTreeSet::new(),
            unchanged: Vec::new(),
            touched: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Bookkeeping from commits that ran inside a caller's transaction. It only takes
/// effect once that transaction commits.
#[derive(Debug, Default)]
pub struct Settlement {
    /// Objects written and already marked clean.
    pub persisted: Vec<Serial>,
    /// Orphans whose records were deleted.
    pub orphans: Vec<Serial>,
    pub findings: HashMap<Category, BTreeSet<Serial>>,
}

/// Collects change sets from the world and carries reconciliation findings from one
/// cycle to the next.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    scheduled: HashMap<Category, BTreeSet<Serial>>,
    pending: Option<Settlement>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serials queued for deletion from `category` on the next cycle.
    pub fn scheduled(&self, category: Category) -> Vec<Serial> {
        self.scheduled
            .get(&category)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replace the carried deletions for `category` once a cycle has applied the
    /// previous ones.
    pub fn settle(&mut self, category: Category, findings: BTreeSet<Serial>) {
        if findings.is_empty() {
            self.scheduled.remove(&category);
        } else {
            self.scheduled.insert(category, findings);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Hold a joined commit's bookkeeping. Later commits in the same transaction add
    /// to it; their findings replace earlier ones.
    pub fn hold(&mut self, settlement: Settlement) {
        let pending = self.pending.get_or_insert_with(Settlement::default);
        pending.persisted.extend(settlement.persisted);
        pending.orphans.extend(settlement.orphans);
        pending.findings.extend(settlement.findings);
    }

    /// The caller's transaction committed: queue the findings and reap the orphans.
    /// Returns the number reaped.
    pub fn confirm(&mut self, world: &mut World) -> usize {
        let Some(pending) = self.pending.take() else {
            return 0;
        };
        for (category, findings) in pending.findings {
            self.settle(category, findings);
        }
        world.reap(&pending.orphans)
    }

    /// The caller's transaction rolled back: everything written has to be written
    /// again. Orphans and carried deletions are untouched, so the next cycle redoes them.
    pub fn abandon(&mut self, world: &mut World) {
        if let Some(pending) = self.pending.take() {
            log::debug!(
                "transaction rolled back, {} object(s) dirty again",
                pending.persisted.len()
            );
            world.mark_dirty(&pending.persisted);
        }
    }

    pub fn collect(&self, world: &World, category: Category) -> StoreResult<ChangeSet> {
        let mut changes = ChangeSet::new(category);
        if category == Category::Storage {
            changes.areas = world.area_names();
        }

        for (serial, area) in world.walk(category) {
            let Some(object) = world.get(serial) else {
                continue;
            };
            match Disposition::classify(object.flags()) {
                Disposition::Persist => {
                    let set = object.to_property_set(&world.catalog)?;
                    changes.writes.push(PendingWrite { set, area });
                }
                Disposition::Unchanged => {
                    log::debug!(
                        "{} {} '{}' unchanged",
                        category,
                        serial,
                        escape_log(object.name())
                    );
                    changes.unchanged.push(serial);
                }
                Disposition::Delete => {
                    changes.deletes.insert(serial);
                }
            }
            changes.touched.insert(serial);
        }

        for (serial, orphan) in world.orphans() {
            if orphan.location.as_ref().map(|l| l.category) == Some(category) {
                changes.deletes.insert(*serial);
                changes.touched.insert(*serial);
            }
        }

        let written: HashSet<Serial> = changes.writes.iter().map(|w| w.set.serial()).collect();
        for serial in self.scheduled(category) {
            if written.contains(&serial) || changes.unchanged.contains(&serial) {
                continue;
            }
            changes.deletes.insert(serial);
            changes.touched.insert(serial);
        }
        Ok(changes)
    }
}
