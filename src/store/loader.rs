//! Lazy loading: bring a root and everything nested in it into the world on demand.
//!
//! Contents are resolved breadth-first. Each pass asks the store for every record
//! whose container is in the current seed set, attaches what it finds, and uses those
//! serials as the next seed set until a pass comes back empty.

use std::collections::HashSet;

use crate::logutil::escape_log;
use crate::store::errors::{StoreError, StoreResult};
use crate::store::filter;
use crate::store::objects::{Character, Item};
use crate::store::property::PropertySet;
use crate::store::schema::Category;
use crate::store::serial::Serial;
use crate::store::session::StoreSession;
use crate::store::world::World;

pub struct LazyLoader<'a> {
    session: &'a StoreSession,
    world: &'a mut World,
}

impl<'a> LazyLoader<'a> {
    pub fn new(session: &'a StoreSession, world: &'a mut World) -> Self {
        Self { session, world }
    }

    /// Swallow an integrity failure when load errors are ignored, otherwise raise it.
    fn tolerate<T>(&self, what: &str, result: StoreResult<T>) -> StoreResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_integrity() && self.session.options().ignore_load_errors => {
                log::warn!("discarding {}: {}", what, err);
                Ok(None)
            }
            Err(err) => {
                log::error!("load failed on {}: {}", what, err);
                Err(err)
            }
        }
    }

    fn convert_item(&self, set: &PropertySet) -> StoreResult<Option<Item>> {
        let what = format!("item {}", set.serial());
        self.tolerate(&what, Item::from_property_set(set, &self.world.catalog))
    }

    /// Load the root named `name` in `area` and its contents. A missing root is `None`.
    pub fn load_root(&mut self, area: &str, name: &str) -> StoreResult<Option<Serial>> {
        if let Some(serial) = self.world.area(area).and_then(|a| a.find(name)) {
            return Ok(Some(serial));
        }
        let Some(area_id) = self.session.area_id(area)? else {
            return Ok(None);
        };
        let Some(set) = self.session.read_root(area_id, name)? else {
            return Ok(None);
        };
        let serial = set.serial();
        if self.world.is_known(serial) {
            log::debug!(
                "root '{}' in {} is {} which already lives elsewhere",
                escape_log(name),
                area,
                serial
            );
            return Ok(None);
        }
        let Some(item) = self.convert_item(&set)? else {
            return Ok(None);
        };
        self.world.insert_root_item(area, item)?;
        let loaded = self.resolve_contents(Category::Storage, vec![serial])?;
        log::debug!(
            "loaded root '{}' ({}) from {} with {} nested objects",
            escape_log(name),
            serial,
            area,
            loaded.len()
        );
        Ok(Some(serial))
    }

    /// Breadth-first resolution of everything inside `seeds`. Returns the serials
    /// materialized, in load order.
    pub fn resolve_contents(
        &mut self,
        category: Category,
        seeds: Vec<Serial>,
    ) -> StoreResult<Vec<Serial>> {
        let mut accumulated: HashSet<Serial> = seeds.iter().copied().collect();
        let mut loaded = Vec::new();
        let mut seeds = seeds;
        while !seeds.is_empty() {
            let rows = self.session.read_contents(category, &seeds)?;
            let mut next = Vec::new();
            for set in rows {
                let serial = set.serial();
                if !accumulated.insert(serial) {
                    log::warn!("{} listed twice in one load, skipping", serial);
                    continue;
                }
                if self.world.is_known(serial) {
                    log::debug!("{} already resident, skipping stale record", serial);
                    continue;
                }
                let Some(item) = self.convert_item(&set)? else {
                    continue;
                };
                self.world.attach(item)?;
                next.push(serial);
                loaded.push(serial);
            }
            seeds = next;
        }
        Ok(loaded)
    }

    /// Load a character, its equipped items and everything they hold.
    pub fn load_character(&mut self, serial: Serial) -> StoreResult<Option<Serial>> {
        if self.world.contains(serial) {
            return Ok(Some(serial));
        }
        let Some(set) = self.session.read_record(Category::Pcs, serial)? else {
            return Ok(None);
        };
        let what = format!("character {serial}");
        let converted = Character::from_property_set(&set, &self.world.catalog);
        let Some(chr) = self.tolerate(&what, converted)? else {
            return Ok(None);
        };
        self.world.add_character(chr)?;

        let mut seeds = Vec::new();
        for set in self.session.read_contents(Category::PcEquip, &[serial])? {
            let item_serial = set.serial();
            if self.world.is_known(item_serial) {
                continue;
            }
            if let Some(item) = self.convert_item(&set)? {
                self.world.attach(item)?;
                seeds.push(item_serial);
            }
        }
        let held = self.resolve_contents(Category::Pcs, seeds.clone())?;
        log::debug!(
            "loaded character {} with {} equipped and {} held objects",
            serial,
            seeds.len(),
            held.len()
        );
        Ok(Some(serial))
    }

    pub fn find_character(&mut self, account: &str, index: u8) -> StoreResult<Option<Serial>> {
        match self.session.find_character(account, index)? {
            Some(serial) => self.load_character(serial),
            None => Ok(None),
        }
    }

    fn unresolved_container(&self, serial: Serial, container: Serial) -> StoreResult<Option<Serial>> {
        let err = StoreError::Integrity(format!(
            "container {container} of {serial} not found in the store"
        ));
        self.tolerate(&format!("item {serial}"), Err::<Serial, _>(err))
    }

    /// Walk `Container` links upward from `serial` to its root record, then load that
    /// root (by name for storage, through the character path otherwise). Returns the
    /// root serial, or `None` if `serial` is not in the store.
    pub fn load_toplevel_owner(&mut self, serial: Serial) -> StoreResult<Option<Serial>> {
        if self.world.contains(serial) {
            return Ok(self.world.toplevel_owner(serial));
        }
        let Some(mut category) = self.session.locate(serial)? else {
            return Ok(None);
        };
        let mut current = serial;
        let mut visited = HashSet::from([serial]);
        loop {
            match self.session.container_of(category, current)? {
                None => return self.unresolved_container(serial, current),
                Some(None) => break,
                Some(Some(container)) => {
                    if container.is_character() {
                        return self.load_character(container);
                    }
                    if !visited.insert(container) {
                        return self.tolerate(
                            &format!("item {serial}"),
                            Err(StoreError::Integrity(format!(
                                "container cycle through {container}"
                            ))),
                        );
                    }
                    if self.world.contains(container) {
                        // Loading the resident container's contents picks up `serial`.
                        self.resolve_contents(category, vec![container])?;
                        return Ok(self.world.toplevel_owner(container));
                    }
                    match self.session.locate(container)? {
                        Some(found) => category = found,
                        None => return self.unresolved_container(current, container),
                    }
                    current = container;
                }
            }
        }

        match category {
            Category::Storage => {
                let Some(area) = self.session.area_of(current)? else {
                    return self.tolerate(
                        &format!("item {current}"),
                        Err(StoreError::Integrity(format!(
                            "storage record {current} has no area"
                        ))),
                    );
                };
                let name = self
                    .session
                    .read_record(Category::Storage, current)?
                    .and_then(|set| set.name().map(str::to_string))
                    .unwrap_or_default();
                self.load_root(&area, &name)
            }
            _ if current.is_character() => self.load_character(current),
            _ => self.tolerate(
                &format!("item {current}"),
                Err(StoreError::Integrity(format!(
                    "{category} record {current} has no owner"
                ))),
            ),
        }
    }

    /// Load everything inside `container`. When the container itself is not resident
    /// the results queue on it and attach once it loads.
    pub fn load_contents(&mut self, container: Serial) -> StoreResult<Vec<Serial>> {
        if self.world.character(container).is_some() {
            let mut loaded = Vec::new();
            for set in self.session.read_contents(Category::PcEquip, &[container])? {
                let serial = set.serial();
                if self.world.is_known(serial) {
                    continue;
                }
                if let Some(item) = self.convert_item(&set)? {
                    self.world.attach(item)?;
                    loaded.push(serial);
                }
            }
            let held = self.resolve_contents(Category::Pcs, loaded.clone())?;
            loaded.extend(held);
            return Ok(loaded);
        }
        let category = match self.world.location_of(container) {
            Some(location) if location.category == Category::Storage => Category::Storage,
            Some(_) => Category::Pcs,
            None => match self.session.locate(container)? {
                Some(Category::Storage) => Category::Storage,
                Some(_) => Category::Pcs,
                None => return Ok(Vec::new()),
            },
        };
        self.resolve_contents(category, vec![container])
    }

    /// Serials in `area` matching `predicate`. Matches that are not resident are
    /// loaded through their toplevel owner first.
    pub fn search_area(&mut self, area: &str, predicate: &str) -> StoreResult<Vec<Serial>> {
        let compiled = filter::compile(predicate, self.session.binding(Category::Storage))?;
        let Some(area_id) = self.session.area_id(area)? else {
            return Ok(Vec::new());
        };
        let matches = filter::search(self.session, area_id, &compiled)?;
        let mut found = Vec::with_capacity(matches.len());
        for serial in matches {
            if !self.world.contains(serial) {
                self.load_toplevel_owner(serial)?;
            }
            if self.world.contains(serial) {
                found.push(serial);
            }
        }
        Ok(found)
    }
}
