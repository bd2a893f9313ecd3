//! # World Store - Persistence for the World Server
//!
//! Keeps world objects in a single SQLite file and brings them back on demand.
//!
//! ## Categories
//!
//! Records live in three categories, each with a *main* table (one column per known
//! field) and a *prop* table (everything else, one row per property):
//!
//! - **storage** - root items grouped into named areas, and everything inside them
//! - **pcs** - characters and the items nested in containers they carry
//! - **pcequip** - items worn directly by a character
//!
//! ## Usage
//!
//! ```rust,no_run
//! use worldstore::store::{World, WorldStoreBuilder};
//! use worldstore::store::objects::TypeCatalog;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut store = WorldStoreBuilder::new("./data/storage.db").open()?;
//!     let mut world = World::new(TypeCatalog::new());
//!     store.boot(&mut world)?;
//!
//!     if let Some(chest) = store.load_root(&mut world, "bank", "chest")? {
//!         if let Some(item) = world.item_mut(chest) {
//!             item.set_cprop("owner", "bob");
//!         }
//!     }
//!     let report = store.commit(&mut world)?;
//!     println!("{} updated", report.updated());
//!     Ok(())
//! }
//! ```
//!
//! ## Lifecycle
//!
//! Open (schema created and bound, file locked) → [`WorldStore::boot`] (serial floor
//! raised, areas listed) → loads on demand → [`WorldStore::commit`] per save cycle →
//! close. A store built with `enabled(false)` accepts every call and does nothing.

pub mod backup;
pub mod binder;
pub mod commit;
pub mod dump;
pub mod errors;
pub mod filter;
pub mod import;
pub mod loader;
pub mod objects;
pub mod property;
pub mod schema;
pub mod serial;
pub mod session;
pub mod tracker;
pub mod world;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::StoreConfig;
use commit::CommitEngine;
use dump::StoreDump;
use import::Importer;
use loader::LazyLoader;
use schema::Category;
use serial::{SerialAllocator, SerialKind};
use session::{SessionOptions, StoreSession};
use tracker::ChangeTracker;

pub use commit::{CategoryReport, CommitReport};
pub use errors::{StoreError, StoreResult};
pub use import::ImportReport;
pub use property::{PropertySet, Value};
pub use serial::Serial;
pub use world::World;

/// Highest persisted serial found by each allocator scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FloorReport {
    pub storage_items: Option<Serial>,
    pub characters: Option<Serial>,
    pub held_items: Option<Serial>,
    pub equipped_items: Option<Serial>,
    /// Whether any mark moved.
    pub raised: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub floor: FloorReport,
    pub areas: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaStatus {
    pub name: String,
    pub records: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub path: Option<PathBuf>,
    pub areas: Vec<AreaStatus>,
    pub storage: i64,
    pub pcs: i64,
    pub pcequip: i64,
    pub floor: FloorReport,
}

pub struct WorldStoreBuilder {
    path: PathBuf,
    options: SessionOptions,
    enabled: bool,
}

impl WorldStoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: SessionOptions::default(),
            enabled: true,
        }
    }

    pub fn ignore_load_errors(mut self, ignore: bool) -> Self {
        self.options.ignore_load_errors = ignore;
        self
    }

    pub fn check_integrity(mut self, check: bool) -> Self {
        self.options.check_integrity = check;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn statement_cache(mut self, capacity: usize) -> Self {
        self.options.statement_cache = capacity;
        self
    }

    pub fn open(self) -> StoreResult<WorldStore> {
        if !self.enabled {
            log::info!("store disabled, persistence calls are no-ops");
            return Ok(WorldStore::disabled());
        }
        let session = StoreSession::open(&self.path, self.options)?;
        Ok(WorldStore::with_session(session))
    }
}

/// The persistence layer as the rest of the server sees it.
pub struct WorldStore {
    session: Option<StoreSession>,
    tracker: ChangeTracker,
}

impl WorldStore {
    fn with_session(session: StoreSession) -> Self {
        Self {
            session: Some(session),
            tracker: ChangeTracker::new(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        WorldStoreBuilder::new(config.database_path())
            .enabled(config.enabled)
            .ignore_load_errors(config.ignore_load_errors)
            .check_integrity(config.check_integrity)
            .statement_cache(config.statement_cache)
            .open()
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open_in_memory_with(SessionOptions::default())
    }

    pub fn open_in_memory_with(options: SessionOptions) -> StoreResult<Self> {
        Ok(Self::with_session(StoreSession::open_in_memory(options)?))
    }

    /// A store that does nothing.
    pub fn disabled() -> Self {
        Self {
            session: None,
            tracker: ChangeTracker::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&StoreSession> {
        self.session.as_ref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.session.as_ref().and_then(StoreSession::path)
    }

    pub fn close(self) -> StoreResult<()> {
        match self.session {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }

    // ---- startup ------------------------------------------------------------------

    /// Raise the world's serial floor and declare every stored area in it.
    pub fn boot(&mut self, world: &mut World) -> StoreResult<BootReport> {
        let floor = self.raise_serial_floor(&mut world.allocator)?;
        let areas = self.list_areas()?;
        for area in &areas {
            world.create_area(area)?;
        }
        log::info!("store booted: {} areas", areas.len());
        Ok(BootReport { floor, areas })
    }

    /// Make sure the allocator never issues a serial that is already persisted,
    /// resident or not. Never lowers a mark; safe to repeat.
    pub fn raise_serial_floor(&self, allocator: &mut SerialAllocator) -> StoreResult<FloorReport> {
        let Some(session) = &self.session else {
            return Ok(FloorReport::default());
        };
        let mut report = FloorReport {
            storage_items: session.max_serial(Category::Storage, Some(SerialKind::Item))?,
            characters: session.max_serial(Category::Pcs, Some(SerialKind::Character))?,
            held_items: session.max_serial(Category::Pcs, Some(SerialKind::Item))?,
            equipped_items: session.max_serial(Category::PcEquip, Some(SerialKind::Item))?,
            raised: false,
        };
        for found in [
            report.storage_items,
            report.characters,
            report.held_items,
            report.equipped_items,
        ]
        .into_iter()
        .flatten()
        {
            report.raised |= allocator.raise_floor(found);
        }
        if report.raised {
            log::info!(
                "serial floor raised: characters {}, items {}",
                allocator.high_water(SerialKind::Character),
                allocator.high_water(SerialKind::Item)
            );
        }
        Ok(report)
    }

    // ---- areas and lookups --------------------------------------------------------

    pub fn list_areas(&self) -> StoreResult<Vec<String>> {
        match &self.session {
            Some(session) => session.list_areas(),
            None => Ok(Vec::new()),
        }
    }

    pub fn area_exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.area_id(name)?.is_some())
    }

    pub fn area_id(&self, name: &str) -> StoreResult<Option<i64>> {
        match &self.session {
            Some(session) => session.area_id(name),
            None => Ok(None),
        }
    }

    pub fn root_exists(&self, area: &str, name: &str) -> StoreResult<bool> {
        match &self.session {
            Some(session) => session.root_exists(area, name),
            None => Ok(false),
        }
    }

    pub fn serial_exists(&self, category: Category, serial: Serial) -> StoreResult<bool> {
        match &self.session {
            Some(session) => session.serial_exists(category, serial),
            None => Ok(false),
        }
    }

    /// Whether anything in any category names `container` as its container.
    pub fn container_has_contents(&self, container: Serial) -> StoreResult<bool> {
        let Some(session) = &self.session else {
            return Ok(false);
        };
        for category in Category::ALL {
            if session.has_contents(category, container)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- loading ------------------------------------------------------------------

    pub fn load_root(&self, world: &mut World, area: &str, name: &str) -> StoreResult<Option<Serial>> {
        match &self.session {
            Some(session) => LazyLoader::new(session, world).load_root(area, name),
            None => Ok(None),
        }
    }

    pub fn load_toplevel_owner(&self, world: &mut World, serial: Serial) -> StoreResult<Option<Serial>> {
        match &self.session {
            Some(session) => LazyLoader::new(session, world).load_toplevel_owner(serial),
            None => Ok(None),
        }
    }

    pub fn load_contents(&self, world: &mut World, container: Serial) -> StoreResult<Vec<Serial>> {
        match &self.session {
            Some(session) => LazyLoader::new(session, world).load_contents(container),
            None => Ok(Vec::new()),
        }
    }

    pub fn load_character(&self, world: &mut World, serial: Serial) -> StoreResult<Option<Serial>> {
        match &self.session {
            Some(session) => LazyLoader::new(session, world).load_character(serial),
            None => Ok(None),
        }
    }

    /// Load the character registered in an account slot.
    pub fn find_character(
        &self,
        world: &mut World,
        account: &str,
        index: u8,
    ) -> StoreResult<Option<Serial>> {
        match &self.session {
            Some(session) => LazyLoader::new(session, world).find_character(account, index),
            None => Ok(None),
        }
    }

    /// Matches for `predicate` in `area`, loading any that are not resident yet.
    pub fn search_area(&self, world: &mut World, area: &str, predicate: &str) -> StoreResult<Vec<Serial>> {
        match &self.session {
            Some(session) => LazyLoader::new(session, world).search_area(area, predicate),
            None => Ok(Vec::new()),
        }
    }

    // ---- commit and transactions --------------------------------------------------

    pub fn commit(&mut self, world: &mut World) -> StoreResult<CommitReport> {
        match &self.session {
            Some(session) => CommitEngine::new(session, &mut self.tracker).commit(world),
            None => Ok(CommitReport::default()),
        }
    }

    /// Serials queued for deletion from `category` by the last reconciliation.
    pub fn scheduled_deletions(&self, category: Category) -> Vec<Serial> {
        self.tracker.scheduled(category)
    }

    pub fn begin_transaction(&self) -> StoreResult<()> {
        match &self.session {
            Some(session) => session.begin(),
            None => Ok(()),
        }
    }

    /// Commit the caller's transaction, then settle the commits that ran inside it:
    /// their orphans are reaped and their stale records queued. Returns the number of
    /// orphans reaped.
    pub fn end_transaction(&mut self, world: &mut World) -> StoreResult<usize> {
        match &self.session {
            Some(session) if session.in_transaction() => {
                session.commit()?;
                Ok(self.tracker.confirm(world))
            }
            _ => Ok(0),
        }
    }

    /// Roll back the caller's transaction. Objects written inside it are dirty again
    /// and destroyed objects stay queued, so the next commit repeats the work.
    pub fn rollback_transaction(&mut self, world: &mut World) -> StoreResult<()> {
        match &self.session {
            Some(session) => {
                session.rollback()?;
                self.tracker.abandon(world);
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ---- bulk paths ---------------------------------------------------------------

    /// Start a bulk import. There is nothing to import into when the store is
    /// disabled, so that is the one call that fails with [`StoreError::Disabled`].
    pub fn begin_import(&self) -> StoreResult<Importer<'_>> {
        match &self.session {
            Some(session) => Importer::begin(session),
            None => Err(StoreError::Disabled),
        }
    }

    pub fn export_dump(&self) -> StoreResult<StoreDump> {
        match &self.session {
            Some(session) => dump::export(session),
            None => Ok(StoreDump::default()),
        }
    }

    pub fn import_dump(&self, dump: &StoreDump) -> StoreResult<ImportReport> {
        if self.session.is_none() {
            return Ok(ImportReport::default());
        }
        let mut importer = self.begin_import()?;
        dump::replay(&mut importer, dump)?;
        importer.finish()
    }

    /// Consistent copy of the live store at `dest`.
    pub fn backup_to(&self, dest: &Path) -> StoreResult<()> {
        match &self.session {
            Some(session) => session.snapshot_to(dest),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> StoreResult<StoreStatus> {
        let mut allocator = SerialAllocator::new();
        let floor = self.raise_serial_floor(&mut allocator)?;
        let Some(session) = &self.session else {
            return Ok(StoreStatus {
                path: None,
                areas: Vec::new(),
                storage: 0,
                pcs: 0,
                pcequip: 0,
                floor,
            });
        };
        let mut stmt = session.connection().prepare(
            "SELECT a.Name, COUNT(m.Serial) FROM storage_area a \
             LEFT JOIN storage_main m ON m.AreaId = a.AreaId \
             GROUP BY a.AreaId ORDER BY a.AreaId",
        )?;
        let areas = stmt
            .query_map([], |row| {
                Ok(AreaStatus {
                    name: row.get(0)?,
                    records: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoreStatus {
            path: session.path().map(Path::to_path_buf),
            areas,
            storage: session.count(Category::Storage)?,
            pcs: session.count(Category::Pcs)?,
            pcequip: session.count(Category::PcEquip)?,
            floor,
        })
    }
}
