//! Commit and reconciliation.
//!
//! Categories are committed one after another. Each gets its own transaction: new
//! areas, then inserts/updates, then deletions. Any failure rolls the transaction
//! back and surfaces as an integrity error. Once a category's transaction is in,
//! the serials left in its table that nothing touched are checked against the world;
//! records that moved elsewhere or belong to destroyed objects are queued for
//! deletion on the next cycle.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::store::errors::{StoreError, StoreResult};
use crate::store::schema::Category;
use crate::store::serial::Serial;
use crate::store::session::StoreSession;
use crate::store::tracker::{ChangeSet, ChangeTracker, Settlement};
use crate::store::world::{Residency, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub areas_created: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Stale records found by reconciliation, deleted on the next cycle.
    pub scheduled: usize,
}

impl CategoryReport {
    fn new(category: Category) -> Self {
        Self {
            category,
            areas_created: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            scheduled: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub categories: Vec<CategoryReport>,
    pub reaped: usize,
}

impl CommitReport {
    fn sum(&self, f: impl Fn(&CategoryReport) -> usize) -> usize {
        self.categories.iter().map(f).sum()
    }

    pub fn inserted(&self) -> usize {
        self.sum(|c| c.inserted)
    }

    pub fn updated(&self) -> usize {
        self.sum(|c| c.updated)
    }

    pub fn deleted(&self) -> usize {
        self.sum(|c| c.deleted)
    }

    pub fn unchanged(&self) -> usize {
        self.sum(|c| c.unchanged)
    }

    pub fn scheduled(&self) -> usize {
        self.sum(|c| c.scheduled)
    }

    /// True when the cycle wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.inserted() == 0
            && self.updated() == 0
            && self.deleted() == 0
            && self.sum(|c| c.areas_created) == 0
    }

    pub fn category(&self, category: Category) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| c.category == category)
    }
}

pub struct CommitEngine<'a> {
    session: &'a StoreSession,
    tracker: &'a mut ChangeTracker,
}

impl<'a> CommitEngine<'a> {
    pub fn new(session: &'a StoreSession, tracker: &'a mut ChangeTracker) -> Self {
        Self { session, tracker }
    }

    /// Run one full cycle over every category. On success written objects are marked
    /// clean and orphans are reaped; on failure the world is left as it was.
    ///
    /// Inside a caller's transaction nothing is final yet: reaping and the carried
    /// deletions wait in the tracker until the caller ends or rolls back.
    pub fn commit(&mut self, world: &mut World) -> StoreResult<CommitReport> {
        let joined = self.session.in_transaction();
        if !joined && self.tracker.has_pending() {
            log::warn!("transaction ended outside the store, redoing its writes");
            self.tracker.abandon(world);
        }

        let mut report = CommitReport::default();
        let mut settlement = Settlement::default();
        if let Err(err) = self.run(world, joined, &mut report, &mut settlement) {
            if joined {
                if let Err(rollback_err) = self.session.rollback() {
                    log::error!("rollback of joined transaction failed: {}", rollback_err);
                }
                self.tracker.abandon(world);
            }
            return Err(err);
        }

        world.mark_clean(&settlement.persisted);
        if joined {
            settlement.orphans = world.orphans().map(|(serial, _)| *serial).collect();
            self.tracker.hold(settlement);
        } else {
            report.reaped = world.reap_orphans();
        }
        log::info!(
            "commit{}: {} inserted, {} updated, {} deleted, {} unchanged, {} scheduled",
            if joined { " (joined)" } else { "" },
            report.inserted(),
            report.updated(),
            report.deleted(),
            report.unchanged(),
            report.scheduled()
        );
        Ok(report)
    }

    fn run(
        &mut self,
        world: &World,
        joined: bool,
        report: &mut CommitReport,
        settlement: &mut Settlement,
    ) -> StoreResult<()> {
        for category in Category::ALL {
            let changes = self.tracker.collect(world, category)?;
            let mut cat_report = self.apply(&changes)?;
            let findings = self.reconcile(world, &changes)?;
            cat_report.scheduled = findings.len();
            if joined {
                settlement.findings.insert(category, findings);
            } else {
                self.tracker.settle(category, findings);
            }
            settlement
                .persisted
                .extend(changes.writes.iter().map(|w| w.set.serial()));
            report.categories.push(cat_report);
        }
        Ok(())
    }

    /// Apply one category's changes atomically. Inside a caller's transaction the
    /// writes join it and the caller decides when to commit.
    fn apply(&self, changes: &ChangeSet) -> StoreResult<CategoryReport> {
        let owned = !self.session.in_transaction();
        if owned {
            self.session.begin()?;
        }
        let result = self
            .apply_steps(changes)
            .and_then(|report| if owned { self.session.commit().map(|_| report) } else { Ok(report) });
        match result {
            Ok(report) => Ok(report),
            Err(err) => {
                if let Err(rollback_err) = self.session.rollback() {
                    log::error!("rollback of {} failed: {}", changes.category, rollback_err);
                }
                log::error!("commit of {} rolled back: {}", changes.category, err);
                Err(StoreError::Integrity(format!(
                    "commit of {} failed: {}",
                    changes.category, err
                )))
            }
        }
    }

    fn apply_steps(&self, changes: &ChangeSet) -> StoreResult<CategoryReport> {
        let category = changes.category;
        let mut report = CategoryReport::new(category);
        report.unchanged = changes.unchanged.len();

        let mut area_ids: HashMap<&str, i64> = HashMap::new();
        for area in &changes.areas {
            let id = match self.session.area_id(area)? {
                Some(id) => id,
                None => {
                    report.areas_created += 1;
                    self.session.insert_area(area)?
                }
            };
            area_ids.insert(area.as_str(), id);
        }

        for write in &changes.writes {
            let area_id = match write.area.as_deref() {
                Some(name) => Some(match area_ids.get(name) {
                    Some(id) => *id,
                    None => self.session.ensure_area(name)?,
                }),
                None => None,
            };
            if self.session.serial_exists(category, write.set.serial())? {
                self.session.update_record(category, &write.set, area_id)?;
                report.updated += 1;
            } else {
                self.session.insert_record(category, &write.set, area_id)?;
                report.inserted += 1;
            }
        }

        for &serial in &changes.deletes {
            report.deleted += self.session.delete_record(category, serial)?;
        }
        Ok(report)
    }

    /// Stale serials in the category's table: moved elsewhere, resident outside any
    /// category, or destroyed. Records the world has simply never loaded stay put.
    fn reconcile(&self, world: &World, changes: &ChangeSet) -> StoreResult<BTreeSet<Serial>> {
        let category = changes.category;
        let mut findings = BTreeSet::new();
        for serial in self.session.list_serials(category)? {
            if changes.touched.contains(&serial) {
                continue;
            }
            match world.residency(serial) {
                Residency::Live(Some(current)) if current == category => {}
                Residency::Live(current) => {
                    log::debug!(
                        "{} {} now lives in {}",
                        category,
                        serial,
                        current.map_or_else(|| "no category".to_string(), |c| c.to_string())
                    );
                    findings.insert(serial);
                }
                Residency::Orphaned => {
                    log::debug!("{} {} belongs to a destroyed object", category, serial);
                    findings.insert(serial);
                }
                Residency::Absent => {}
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::objects::{Item, ItemDescriptor, TypeCatalog};
    use crate::store::session::SessionOptions;

    fn setup() -> (StoreSession, ChangeTracker, World) {
        let session = StoreSession::open_in_memory(SessionOptions::default()).expect("session");
        (session, ChangeTracker::new(), World::new(TypeCatalog::new()))
    }

    fn chest(serial: u32, name: &str) -> Item {
        let mut item = Item::new(Serial(serial), &ItemDescriptor::generic(0x0E40));
        item.name = name.to_string();
        item
    }

    #[test]
    fn first_commit_inserts_second_is_noop() {
        let (session, mut tracker, mut world) = setup();
        world.insert_root_item("bank", chest(0x4000_0001, "chest")).unwrap();

        let report = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert_eq!(report.inserted(), 1);
        assert_eq!(report.category(Category::Storage).unwrap().areas_created, 1);

        let again = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.unchanged(), 1);
    }

    #[test]
    fn dirty_object_is_updated() {
        let (session, mut tracker, mut world) = setup();
        let serial = Serial(0x4000_0001);
        world.insert_root_item("bank", chest(serial.raw(), "chest")).unwrap();
        CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();

        world.item_mut(serial).unwrap().set_cprop("owner", "bob");
        let report = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert_eq!(report.updated(), 1);
        assert_eq!(session.prop_count(Category::Storage, serial).unwrap(), 1);
    }

    #[test]
    fn destroyed_object_is_deleted_and_reaped() {
        let (session, mut tracker, mut world) = setup();
        let serial = Serial(0x4000_0001);
        world.insert_root_item("bank", chest(serial.raw(), "chest")).unwrap();
        CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();

        world.destroy(serial).unwrap();
        let report = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert_eq!(report.deleted(), 1);
        assert_eq!(report.reaped, 1);
        assert!(!session.serial_exists(Category::Storage, serial).unwrap());
    }

    #[test]
    fn joined_commit_settles_only_when_confirmed() {
        let (session, mut tracker, mut world) = setup();
        let serial = Serial(0x4000_0001);
        world.insert_root_item("bank", chest(serial.raw(), "chest")).unwrap();
        CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();

        world.destroy(serial).unwrap();
        session.begin().unwrap();
        let report = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert_eq!(report.deleted(), 1);
        assert_eq!(report.reaped, 0);
        assert!(tracker.has_pending());
        assert_eq!(world.residency(serial), Residency::Orphaned);

        session.rollback().unwrap();
        tracker.abandon(&mut world);
        assert!(!tracker.has_pending());
        assert!(session.serial_exists(Category::Storage, serial).unwrap());

        session.begin().unwrap();
        let report = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert_eq!(report.deleted(), 1);
        session.commit().unwrap();
        assert_eq!(tracker.confirm(&mut world), 1);
        assert_eq!(world.residency(serial), Residency::Absent);
        assert!(!session.serial_exists(Category::Storage, serial).unwrap());
    }

    #[test]
    fn pending_work_is_redone_when_the_transaction_ends_elsewhere() {
        let (session, mut tracker, mut world) = setup();
        let serial = Serial(0x4000_0001);
        world.insert_root_item("bank", chest(serial.raw(), "chest")).unwrap();

        session.begin().unwrap();
        CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert!(!world.get(serial).unwrap().flags().dirty);
        session.rollback().unwrap();

        let report = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap();
        assert_eq!(report.inserted(), 1);
        assert!(!tracker.has_pending());
        assert!(session.serial_exists(Category::Storage, serial).unwrap());
    }

    #[test]
    fn failed_category_rolls_back_and_keeps_dirty_flags() {
        let (session, mut tracker, mut world) = setup();
        let serial = Serial(0x4000_0001);
        world.insert_root_item("bank", chest(serial.raw(), "chest")).unwrap();
        session
            .connection()
            .execute_batch("CREATE TRIGGER refuse BEFORE INSERT ON storage_main BEGIN SELECT RAISE(ABORT, 'refused'); END;")
            .unwrap();

        let err = CommitEngine::new(&session, &mut tracker).commit(&mut world).unwrap_err();
        assert!(err.is_integrity());
        assert!(!session.in_transaction());
        assert!(session.list_areas().unwrap().is_empty());
        assert!(world.get(serial).unwrap().flags().dirty);
    }
}
