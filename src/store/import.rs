//! Bulk population of an empty or existing store from legacy data.
//!
//! The importer drops secondary indexes, relaxes durability and runs every insert
//! inside one transaction. `finish` checks container references, commits, and puts
//! the indexes and pragmas back. Dropping an unfinished importer rolls everything
//! back and restores the connection the same way.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::logutil::escape_log;
use crate::store::errors::{StoreError, StoreResult};
use crate::store::property::PropertySet;
use crate::store::schema::{self, Category};
use crate::store::serial::Serial;
use crate::store::session::StoreSession;
use crate::validation::{validate_area_name, validate_property_name};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub areas: usize,
    pub storage: usize,
    pub characters: usize,
    pub held: usize,
    pub equipped: usize,
    /// Records rejected and skipped because load errors are ignored.
    pub skipped: usize,
    /// Records dropped at the end because their container never arrived.
    pub orphans_discarded: usize,
    pub elapsed_ms: u128,
}

impl ImportReport {
    pub fn records(&self) -> usize {
        self.storage + self.characters + self.held + self.equipped
    }
}

pub struct Importer<'a> {
    session: &'a StoreSession,
    area_ids: HashMap<String, i64>,
    report: ImportReport,
    started: Instant,
    finished: bool,
}

/// Records whose container is missing from where it has to be, per category.
fn dangling_sql(category: Category) -> &'static str {
    match category {
        Category::Storage => {
            "SELECT Serial FROM storage_main WHERE Container IS NOT NULL \
             AND Container NOT IN (SELECT Serial FROM storage_main)"
        }
        Category::Pcs => {
            "SELECT Serial FROM pcs_main WHERE Container IS NOT NULL \
             AND Container NOT IN (SELECT Serial FROM pcs_main) \
             AND Container NOT IN (SELECT Serial FROM pcequip_main)"
        }
        Category::PcEquip => {
            "SELECT Serial FROM pcequip_main WHERE Container IS NULL \
             OR Container NOT IN (SELECT Serial FROM pcs_main)"
        }
    }
}

impl<'a> Importer<'a> {
    pub(crate) fn begin(session: &'a StoreSession) -> StoreResult<Self> {
        if session.in_transaction() {
            return Err(StoreError::Integrity(
                "cannot import inside an open transaction".to_string(),
            ));
        }
        schema::drop_indexes(session.connection())?;
        schema::apply_import_pragmas(session.connection())?;
        if let Err(err) = session.begin() {
            restore(session);
            return Err(err);
        }
        log::info!("import started");
        Ok(Self {
            session,
            area_ids: HashMap::new(),
            report: ImportReport::default(),
            started: Instant::now(),
            finished: false,
        })
    }

    /// Apply the ignore-load-errors policy to one record's result.
    fn accept(&mut self, what: &str, result: StoreResult<()>) -> StoreResult<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.is_integrity() && self.session.options().ignore_load_errors => {
                log::warn!("import skipped {}: {}", what, err);
                self.report.skipped += 1;
                Ok(false)
            }
            Err(err) => {
                log::error!("import failed on {}: {}", what, err);
                Err(err)
            }
        }
    }

    /// Declare an area, reusing it when the store already has one by that name.
    pub fn declare_area(&mut self, name: &str) -> StoreResult<i64> {
        validate_area_name(name)?;
        if let Some(id) = self.area_ids.get(name) {
            return Ok(*id);
        }
        let id = match self.session.area_id(name)? {
            Some(id) => id,
            None => {
                self.report.areas += 1;
                self.session.insert_area(name)?
            }
        };
        self.area_ids.insert(name.to_string(), id);
        Ok(id)
    }

    fn check_record(set: &PropertySet, character: bool) -> StoreResult<Serial> {
        let serial = set.serial();
        let ok = if character {
            serial.is_character()
        } else {
            serial.is_item()
        };
        if !ok {
            return Err(StoreError::Integrity(format!(
                "record '{}' has unusable serial {}",
                escape_log(set.name().unwrap_or_default()),
                serial
            )));
        }
        for name in set.custom.keys() {
            if let Err(err) = validate_property_name(name) {
                return Err(StoreError::Integrity(format!(
                    "record {} property '{}': {}",
                    serial,
                    escape_log(name),
                    err
                )));
            }
        }
        Ok(serial)
    }

    /// An item in an area: a root, or nested in another storage item.
    pub fn insert_storage(&mut self, area: &str, set: &PropertySet) -> StoreResult<bool> {
        let area_id = self.declare_area(area)?;
        let result = Self::check_record(set, false)
            .and_then(|_| self.session.insert_record(Category::Storage, set, Some(area_id)));
        let accepted = self.accept(&format!("storage item {}", set.serial()), result)?;
        if accepted {
            self.report.storage += 1;
        }
        Ok(accepted)
    }

    pub fn insert_character(&mut self, set: &PropertySet) -> StoreResult<bool> {
        let result = Self::check_record(set, true).and_then(|_| {
            if set.container().is_some() {
                return Err(StoreError::Integrity(format!(
                    "character {} declares a container",
                    set.serial()
                )));
            }
            self.session.insert_record(Category::Pcs, set, None)
        });
        let accepted = self.accept(&format!("character {}", set.serial()), result)?;
        if accepted {
            self.report.characters += 1;
        }
        Ok(accepted)
    }

    /// An item nested in something a character carries.
    pub fn insert_held(&mut self, set: &PropertySet) -> StoreResult<bool> {
        let result = Self::check_record(set, false).and_then(|serial| match set.container() {
            Some(_) => self.session.insert_record(Category::Pcs, set, None),
            None => Err(StoreError::Integrity(format!(
                "held item {serial} has no container"
            ))),
        });
        let accepted = self.accept(&format!("held item {}", set.serial()), result)?;
        if accepted {
            self.report.held += 1;
        }
        Ok(accepted)
    }

    /// An item worn directly by a character.
    pub fn insert_equipped(&mut self, set: &PropertySet) -> StoreResult<bool> {
        let result = Self::check_record(set, false).and_then(|serial| match set.container() {
            Some(owner) if owner.is_character() => {
                self.session.insert_record(Category::PcEquip, set, None)
            }
            _ => Err(StoreError::Integrity(format!(
                "equipped item {serial} is not on a character"
            ))),
        });
        let accepted = self.accept(&format!("equipped item {}", set.serial()), result)?;
        if accepted {
            self.report.equipped += 1;
        }
        Ok(accepted)
    }

    fn dangling(&self, category: Category) -> StoreResult<Vec<Serial>> {
        let mut stmt = self.session.connection().prepare(dangling_sql(category))?;
        let rows = stmt.query_map([], |row| row.get::<_, Serial>(0))?;
        let serials = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(serials)
    }

    /// Records whose container never showed up are fatal, or discarded when load
    /// errors are ignored. Discarding one can strand its own contents, so repeat.
    fn sweep_dangling(&mut self) -> StoreResult<()> {
        for category in Category::ALL {
            loop {
                let dangling = self.dangling(category)?;
                if dangling.is_empty() {
                    break;
                }
                if !self.session.options().ignore_load_errors {
                    log::error!(
                        "{} {} record(s) reference a missing container, first {}",
                        dangling.len(),
                        category,
                        dangling[0]
                    );
                    return Err(StoreError::Integrity(format!(
                        "{} record {} references a missing container",
                        category, dangling[0]
                    )));
                }
                // Cascades remove nested storage records too, so count the table.
                let before = self.session.count(category)?;
                for serial in dangling {
                    log::warn!("discarding {} {}: container missing", category, serial);
                    self.session.delete_record(category, serial)?;
                }
                let after = self.session.count(category)?;
                self.report.orphans_discarded += usize::try_from(before - after).unwrap_or(0);
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> StoreResult<ImportReport> {
        self.sweep_dangling()?;
        self.session.commit()?;
        self.finished = true;
        restore(self.session);
        self.report.elapsed_ms = self.started.elapsed().as_millis();
        log::info!(
            "import finished: {} areas, {} records, {} skipped, {} orphans discarded in {} ms",
            self.report.areas,
            self.report.records(),
            self.report.skipped,
            self.report.orphans_discarded,
            self.report.elapsed_ms
        );
        Ok(std::mem::take(&mut self.report))
    }
}

/// Durable pragmas and indexes back on.
fn restore(session: &StoreSession) {
    if let Err(err) = schema::apply_connection_pragmas(session.connection()) {
        log::error!("failed to restore pragmas after import: {}", err);
    }
    if let Err(err) = schema::create_indexes(session.connection()) {
        log::error!("failed to rebuild indexes after import: {}", err);
    }
}

impl Drop for Importer<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("import abandoned, rolling back");
        if let Err(err) = self.session.rollback() {
            log::error!("import rollback failed: {}", err);
        }
        restore(self.session);
    }
}
