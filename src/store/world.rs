//! The resident object graph: storage areas and their roots, container membership,
//! characters, objects waiting for their container to load, and destroyed objects
//! waiting for the next commit to remove them from the store.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::store::errors::{StoreError, StoreResult};
use crate::store::objects::{Character, Item, TypeCatalog, WorldObject};
use crate::store::schema::Category;
use crate::store::serial::{Serial, SerialAllocator};
use crate::validation::validate_area_name;

/// A named namespace of root items. Root names are unique ignoring case.
#[derive(Debug, Clone, Default)]
pub struct StorageArea {
    name: String,
    roots: BTreeMap<String, Serial>,
}

/// ASCII-only folding, matching SQLite's `COLLATE NOCASE`.
fn root_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl StorageArea {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roots: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn find(&self, name: &str) -> Option<Serial> {
        self.roots.get(&root_key(name)).copied()
    }

    pub fn roots(&self) -> impl Iterator<Item = Serial> + '_ {
        self.roots.values().copied()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Where a resident object persists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub category: Category,
    /// Set for storage records.
    pub area: Option<String>,
}

impl Location {
    fn storage(area: &str) -> Self {
        Self {
            category: Category::Storage,
            area: Some(area.to_string()),
        }
    }

    fn of(category: Category) -> Self {
        Self {
            category,
            area: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residency {
    /// Resident; `None` when it sits outside every persisted category.
    Live(Option<Category>),
    /// Destroyed this session, not yet reaped.
    Orphaned,
    /// Not in memory at all.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Placed,
    Deferred,
}

/// A destroyed object and where it used to persist.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub object: WorldObject,
    pub location: Option<Location>,
}

#[derive(Debug, Default)]
pub struct World {
    objects: HashMap<Serial, WorldObject>,
    contents: HashMap<Serial, Vec<Serial>>,
    areas: BTreeMap<String, StorageArea>,
    root_area: HashMap<Serial, String>,
    characters: BTreeSet<Serial>,
    deferred: HashMap<Serial, Vec<Item>>,
    deferred_serials: HashSet<Serial>,
    orphans: HashMap<Serial, Orphan>,
    pub allocator: SerialAllocator,
    pub catalog: TypeCatalog,
}

impl World {
    pub fn new(catalog: TypeCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    // ---- areas --------------------------------------------------------------------

    /// Declare an area. Existing areas are left alone. Returns whether it was created.
    pub fn create_area(&mut self, name: &str) -> StoreResult<bool> {
        if self.areas.contains_key(name) {
            return Ok(false);
        }
        validate_area_name(name)?;
        self.areas
            .insert(name.to_string(), StorageArea::new(name));
        Ok(true)
    }

    pub fn area(&self, name: &str) -> Option<&StorageArea> {
        self.areas.get(name)
    }

    pub fn area_names(&self) -> Vec<String> {
        self.areas.keys().cloned().collect()
    }

    // ---- lookup -------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.objects.contains_key(&serial)
    }

    /// Resident, waiting on a container, or destroyed but not yet reaped.
    pub fn is_known(&self, serial: Serial) -> bool {
        self.contains(serial)
            || self.orphans.contains_key(&serial)
            || self.deferred_serials.contains(&serial)
    }

    pub fn get(&self, serial: Serial) -> Option<&WorldObject> {
        self.objects.get(&serial)
    }

    pub fn item(&self, serial: Serial) -> Option<&Item> {
        self.objects.get(&serial).and_then(WorldObject::as_item)
    }

    pub fn character(&self, serial: Serial) -> Option<&Character> {
        self.objects.get(&serial).and_then(WorldObject::as_character)
    }

    /// Mutable access. Handing out the reference marks the item dirty.
    pub fn item_mut(&mut self, serial: Serial) -> Option<&mut Item> {
        match self.objects.get_mut(&serial) {
            Some(WorldObject::Item(item)) => {
                item.flags.dirty = true;
                Some(item)
            }
            _ => None,
        }
    }

    /// Mutable access. Handing out the reference marks the character dirty.
    pub fn character_mut(&mut self, serial: Serial) -> Option<&mut Character> {
        match self.objects.get_mut(&serial) {
            Some(WorldObject::Character(chr)) => {
                chr.flags.dirty = true;
                Some(chr)
            }
            _ => None,
        }
    }

    pub fn contents(&self, container: Serial) -> &[Serial] {
        self.contents
            .get(&container)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn characters(&self) -> impl Iterator<Item = Serial> + '_ {
        self.characters.iter().copied()
    }

    /// `serial` and everything nested under it, breadth-first, root first.
    pub fn subtree(&self, serial: Serial) -> Vec<Serial> {
        let mut out = Vec::new();
        if !self.contains(serial) {
            return out;
        }
        let mut queue = VecDeque::from([serial]);
        let mut seen = HashSet::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            out.push(next);
            queue.extend(self.contents(next).iter().copied());
        }
        out
    }

    /// Walk containers upward to the object with no container.
    pub fn toplevel_owner(&self, serial: Serial) -> Option<Serial> {
        let mut current = self.objects.get(&serial)?;
        let mut steps = 0usize;
        while let Some(container) = current.container() {
            current = self.objects.get(&container)?;
            steps += 1;
            if steps > self.objects.len() {
                return None;
            }
        }
        Some(current.serial())
    }

    /// Category (and area) a resident object persists in, if any.
    pub fn location_of(&self, serial: Serial) -> Option<Location> {
        let object = self.objects.get(&serial)?;
        if object.is_character() {
            return Some(Location::of(Category::Pcs));
        }
        if let Some(container) = object.container() {
            if self.character(container).is_some() {
                return Some(Location::of(Category::PcEquip));
            }
        }
        let top = self.toplevel_owner(serial)?;
        if self.characters.contains(&top) {
            return Some(Location::of(Category::Pcs));
        }
        self.root_area.get(&top).map(|area| Location::storage(area))
    }

    pub fn residency(&self, serial: Serial) -> Residency {
        if self.contains(serial) {
            Residency::Live(self.location_of(serial).map(|l| l.category))
        } else if self.orphans.contains_key(&serial) {
            Residency::Orphaned
        } else {
            Residency::Absent
        }
    }

    /// Every resident object persisting in `category`, with its area for storage.
    pub fn walk(&self, category: Category) -> Vec<(Serial, Option<String>)> {
        let mut out = Vec::new();
        match category {
            Category::Storage => {
                for (name, area) in &self.areas {
                    for root in area.roots() {
                        for serial in self.subtree(root) {
                            out.push((serial, Some(name.clone())));
                        }
                    }
                }
            }
            Category::Pcs | Category::PcEquip => {
                for &chr in &self.characters {
                    if category == Category::Pcs {
                        out.push((chr, None));
                    }
                    for &equipped in self.contents(chr) {
                        if category == Category::PcEquip {
                            out.push((equipped, None));
                        }
                        if category == Category::Pcs {
                            out.extend(
                                self.subtree(equipped)
                                    .into_iter()
                                    .skip(1)
                                    .map(|serial| (serial, None)),
                            );
                        }
                    }
                }
            }
        }
        out
    }

    // ---- placement ----------------------------------------------------------------

    fn check_new(&self, serial: Serial) -> StoreResult<()> {
        if !serial.is_assigned() {
            return Err(StoreError::InvalidPlacement(
                "object has no serial".to_string(),
            ));
        }
        if self.contains(serial) || self.orphans.contains_key(&serial) {
            return Err(StoreError::DuplicateSerial(serial));
        }
        Ok(())
    }

    pub fn new_item(&mut self, objtype: u32) -> StoreResult<Item> {
        let serial = self.allocator.next_item()?;
        let desc = self.catalog.descriptor(objtype)?;
        Ok(Item::new(serial, &desc))
    }

    pub fn new_character(
        &mut self,
        name: &str,
        account: &str,
        char_index: u8,
    ) -> StoreResult<Character> {
        let serial = self.allocator.next_character()?;
        Ok(Character::new(serial, name, account, char_index))
    }

    /// Put an item at the root of an area, creating the area on first reference.
    pub fn insert_root_item(&mut self, area: &str, mut item: Item) -> StoreResult<()> {
        self.check_new(item.serial)?;
        self.create_area(area)?;
        let key = root_key(&item.name);
        if let Some(existing) = self.areas.get(area).and_then(|a| a.roots.get(&key)) {
            return Err(StoreError::InvalidPlacement(format!(
                "area '{area}' already has a root named '{}' ({existing})",
                item.name
            )));
        }
        item.container = None;
        let serial = item.serial;
        if let Some(a) = self.areas.get_mut(area) {
            a.roots.insert(key, serial);
        }
        self.root_area.insert(serial, area.to_string());
        self.objects.insert(serial, WorldObject::Item(item));
        self.flush_deferred(serial);
        Ok(())
    }

    pub fn add_character(&mut self, chr: Character) -> StoreResult<()> {
        self.check_new(chr.serial)?;
        let serial = chr.serial;
        self.characters.insert(serial);
        self.objects.insert(serial, WorldObject::Character(chr));
        self.flush_deferred(serial);
        Ok(())
    }

    /// Attach an item to its declared container, or queue it until the container
    /// becomes resident. Queued items never duplicate.
    pub fn attach(&mut self, item: Item) -> StoreResult<Attachment> {
        let Some(container) = item.container else {
            return Err(StoreError::InvalidPlacement(format!(
                "item {} has no container",
                item.serial
            )));
        };
        self.check_new(item.serial)?;
        if container == item.serial {
            return Err(StoreError::InvalidPlacement(format!(
                "item {container} cannot contain itself"
            )));
        }
        if self.contains(container) {
            let serial = item.serial;
            self.place(item);
            self.flush_deferred(serial);
            Ok(Attachment::Placed)
        } else {
            if self.deferred_serials.insert(item.serial) {
                log::debug!("deferring {} until {} is resident", item.serial, container);
                self.deferred.entry(container).or_default().push(item);
            }
            Ok(Attachment::Deferred)
        }
    }

    fn place(&mut self, item: Item) {
        let serial = item.serial;
        if let Some(container) = item.container {
            let list = self.contents.entry(container).or_default();
            if !list.contains(&serial) {
                list.push(serial);
            }
        }
        self.objects.insert(serial, WorldObject::Item(item));
    }

    /// Attach everything queued on `serial`, then on whatever that attached.
    fn flush_deferred(&mut self, serial: Serial) {
        let mut pending = vec![serial];
        while let Some(container) = pending.pop() {
            let Some(items) = self.deferred.remove(&container) else {
                continue;
            };
            for item in items {
                self.deferred_serials.remove(&item.serial);
                if self.contains(item.serial) {
                    log::debug!("dropping queued duplicate {}", item.serial);
                    continue;
                }
                pending.push(item.serial);
                self.place(item);
            }
        }
    }

    /// Queued `(container, item)` pairs still waiting.
    pub fn pending_deferred(&self) -> Vec<(Serial, Serial)> {
        let mut out: Vec<(Serial, Serial)> = self
            .deferred
            .iter()
            .flat_map(|(&container, items)| items.iter().map(move |i| (container, i.serial)))
            .collect();
        out.sort();
        out
    }

    fn detach(&mut self, serial: Serial) {
        if let Some(area) = self.root_area.remove(&serial) {
            if let Some(a) = self.areas.get_mut(&area) {
                a.roots.retain(|_, s| *s != serial);
            }
        }
        let container = self.objects.get(&serial).and_then(WorldObject::container);
        if let Some(container) = container {
            if let Some(list) = self.contents.get_mut(&container) {
                list.retain(|s| *s != serial);
            }
        }
    }

    fn resident_item(&self, serial: Serial) -> StoreResult<&Item> {
        self.item(serial).ok_or(StoreError::NotResident(serial))
    }

    /// Move a resident item to the root of an area.
    pub fn move_to_area(&mut self, serial: Serial, area: &str) -> StoreResult<()> {
        let item = self.resident_item(serial)?;
        let key = root_key(&item.name);
        self.create_area(area)?;
        if let Some(existing) = self.areas.get(area).and_then(|a| a.roots.get(&key)) {
            if *existing != serial {
                return Err(StoreError::InvalidPlacement(format!(
                    "area '{area}' already has a root named '{key}'"
                )));
            }
        }
        self.detach(serial);
        if let Some(WorldObject::Item(item)) = self.objects.get_mut(&serial) {
            item.container = None;
        }
        if let Some(a) = self.areas.get_mut(area) {
            a.roots.insert(key, serial);
        }
        self.root_area.insert(serial, area.to_string());
        self.mark_subtree_dirty(serial);
        Ok(())
    }

    /// Move a resident item into a resident container (an item or a character).
    pub fn move_into_container(&mut self, serial: Serial, container: Serial) -> StoreResult<()> {
        self.resident_item(serial)?;
        if !self.contains(container) {
            return Err(StoreError::NotResident(container));
        }
        let mut cursor = Some(container);
        while let Some(current) = cursor {
            if current == serial {
                return Err(StoreError::InvalidPlacement(format!(
                    "moving {serial} into {container} would create a cycle"
                )));
            }
            cursor = self.objects.get(&current).and_then(WorldObject::container);
        }
        self.detach(serial);
        if let Some(WorldObject::Item(item)) = self.objects.get_mut(&serial) {
            item.container = Some(container);
        }
        let list = self.contents.entry(container).or_default();
        if !list.contains(&serial) {
            list.push(serial);
        }
        self.mark_subtree_dirty(serial);
        Ok(())
    }

    /// Equip an item directly on a character at `layer`.
    pub fn equip(&mut self, serial: Serial, character: Serial, layer: u8) -> StoreResult<()> {
        if self.character(character).is_none() {
            return Err(StoreError::NotResident(character));
        }
        self.move_into_container(serial, character)?;
        if let Some(WorldObject::Item(item)) = self.objects.get_mut(&serial) {
            item.layer = layer;
        }
        Ok(())
    }

    /// Everything below a moved object changes placement with it.
    fn mark_subtree_dirty(&mut self, serial: Serial) {
        for s in self.subtree(serial) {
            if let Some(object) = self.objects.get_mut(&s) {
                object.flags_mut().dirty = true;
            }
        }
    }

    fn remove_subtree(&mut self, serial: Serial) -> Vec<(WorldObject, Option<Location>)> {
        let serials = self.subtree(serial);
        let locations: Vec<Option<Location>> =
            serials.iter().map(|&s| self.location_of(s)).collect();
        self.detach(serial);
        let mut removed = Vec::with_capacity(serials.len());
        for (s, location) in serials.into_iter().zip(locations) {
            self.contents.remove(&s);
            self.root_area.remove(&s);
            self.characters.remove(&s);
            if let Some(object) = self.objects.remove(&s) {
                removed.push((object, location));
            }
        }
        removed
    }

    /// Destroy a resident object and everything in it. They stay known as orphans so
    /// the next commit deletes their records. Returns how many objects were orphaned.
    pub fn destroy(&mut self, serial: Serial) -> StoreResult<usize> {
        if !self.contains(serial) {
            return Err(StoreError::NotResident(serial));
        }
        let removed = self.remove_subtree(serial);
        let count = removed.len();
        for (mut object, location) in removed {
            object.flags_mut().orphan = true;
            self.orphans
                .insert(object.serial(), Orphan { object, location });
        }
        Ok(count)
    }

    /// Evict a clean root (area root or character) and its subtree from memory
    /// without touching the store. Returns how many objects were evicted.
    pub fn unload(&mut self, serial: Serial) -> StoreResult<usize> {
        if !self.root_area.contains_key(&serial) && !self.characters.contains(&serial) {
            return Err(StoreError::InvalidPlacement(format!(
                "{serial} is not a resident root"
            )));
        }
        if self
            .subtree(serial)
            .iter()
            .any(|s| self.objects.get(s).map_or(false, |o| o.flags().dirty))
        {
            return Err(StoreError::DirtySubtree(serial));
        }
        Ok(self.remove_subtree(serial).len())
    }

    // ---- commit bookkeeping -------------------------------------------------------

    pub fn orphans(&self) -> impl Iterator<Item = (&Serial, &Orphan)> {
        self.orphans.iter()
    }

    pub fn reap_orphans(&mut self) -> usize {
        let count = self.orphans.len();
        self.orphans.clear();
        count
    }

    /// Forget the listed orphans only. Returns how many were still registered.
    pub fn reap(&mut self, serials: &[Serial]) -> usize {
        serials
            .iter()
            .filter(|serial| self.orphans.remove(*serial).is_some())
            .count()
    }

    pub fn mark_clean(&mut self, serials: &[Serial]) {
        self.set_dirty(serials, false);
    }

    pub fn mark_dirty(&mut self, serials: &[Serial]) {
        self.set_dirty(serials, true);
    }

    fn set_dirty(&mut self, serials: &[Serial], dirty: bool) {
        for serial in serials {
            if let Some(object) = self.objects.get_mut(serial) {
                object.flags_mut().dirty = dirty;
            }
        }
    }

    pub fn set_save_on_exit(&mut self, serial: Serial, save: bool) -> StoreResult<()> {
        let object = self
            .objects
            .get_mut(&serial)
            .ok_or(StoreError::NotResident(serial))?;
        object.flags_mut().save_on_exit = save;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::objects::ItemDescriptor;

    fn item(serial: u32, name: &str, container: Option<u32>) -> Item {
        let mut item = Item::new(Serial(serial), &ItemDescriptor::generic(0x0E75));
        item.name = name.to_string();
        item.container = container.map(Serial);
        item
    }

    #[test]
    fn deferred_item_attaches_once_container_arrives() {
        let mut world = World::default();
        let early = item(0x4000_0600, "coin", Some(0x4000_0500));
        assert_eq!(world.attach(early.clone()).unwrap(), Attachment::Deferred);
        assert_eq!(world.attach(early).unwrap(), Attachment::Deferred);
        assert_eq!(
            world.pending_deferred(),
            vec![(Serial(0x4000_0500), Serial(0x4000_0600))]
        );
        assert!(world.is_known(Serial(0x4000_0600)));

        world
            .insert_root_item("bank", item(0x4000_0500, "chest", None))
            .unwrap();
        assert_eq!(world.contents(Serial(0x4000_0500)), &[Serial(0x4000_0600)]);
        assert!(world.pending_deferred().is_empty());
        assert!(world.contains(Serial(0x4000_0600)));
        assert!(!world.is_known(Serial(0x4000_0700)));
    }

    #[test]
    fn a_serial_is_queued_once_across_containers() {
        let mut world = World::default();
        world
            .attach(item(0x4000_0600, "coin", Some(0x4000_0500)))
            .unwrap();
        world
            .attach(item(0x4000_0600, "coin", Some(0x4000_0501)))
            .unwrap();
        assert_eq!(
            world.pending_deferred(),
            vec![(Serial(0x4000_0500), Serial(0x4000_0600))]
        );
    }

    #[test]
    fn deferred_chains_resolve_transitively() {
        let mut world = World::default();
        world
            .attach(item(0x4000_0003, "gem", Some(0x4000_0002)))
            .unwrap();
        world
            .attach(item(0x4000_0002, "pouch", Some(0x4000_0001)))
            .unwrap();
        world
            .insert_root_item("bank", item(0x4000_0001, "chest", None))
            .unwrap();
        assert_eq!(world.subtree(Serial(0x4000_0001)).len(), 3);
        assert_eq!(world.toplevel_owner(Serial(0x4000_0003)), Some(Serial(0x4000_0001)));
    }

    #[test]
    fn root_names_are_unique_ignoring_case() {
        let mut world = World::default();
        world
            .insert_root_item("bank", item(0x4000_0001, "Chest", None))
            .unwrap();
        assert!(world
            .insert_root_item("bank", item(0x4000_0002, "chest", None))
            .is_err());
        assert_eq!(
            world.area("bank").and_then(|a| a.find("CHEST")),
            Some(Serial(0x4000_0001))
        );
    }

    #[test]
    fn root_case_folding_is_ascii_only() {
        let mut world = World::default();
        world
            .insert_root_item("armory", item(0x4000_0001, "Épée", None))
            .unwrap();
        // Same as SQLite NOCASE: É and é are different names.
        world
            .insert_root_item("armory", item(0x4000_0002, "épée", None))
            .unwrap();
        let area = world.area("armory").unwrap();
        assert_eq!(area.find("ÉPéE"), Some(Serial(0x4000_0001)));
        assert_eq!(area.find("épÉe"), None);
        assert_eq!(area.len(), 2);
    }

    #[test]
    fn locations_follow_the_holder() {
        let mut world = World::default();
        let chr = Character::new(Serial(5), "Alice", "alice", 0);
        world.add_character(chr).unwrap();
        world
            .attach(item(0x4000_0010, "backpack", Some(5)))
            .unwrap();
        world
            .attach(item(0x4000_0011, "coin", Some(0x4000_0010)))
            .unwrap();
        world
            .insert_root_item("bank", item(0x4000_0020, "chest", None))
            .unwrap();

        assert_eq!(world.location_of(Serial(5)).unwrap().category, Category::Pcs);
        assert_eq!(
            world.location_of(Serial(0x4000_0010)).unwrap().category,
            Category::PcEquip
        );
        assert_eq!(
            world.location_of(Serial(0x4000_0011)).unwrap().category,
            Category::Pcs
        );
        assert_eq!(
            world.location_of(Serial(0x4000_0020)),
            Some(Location::storage("bank"))
        );

        let pcs: Vec<Serial> = world.walk(Category::Pcs).into_iter().map(|(s, _)| s).collect();
        assert_eq!(pcs, vec![Serial(5), Serial(0x4000_0011)]);
        assert_eq!(world.walk(Category::PcEquip).len(), 1);
        assert_eq!(world.walk(Category::Storage).len(), 1);
    }

    #[test]
    fn destroy_orphans_the_whole_subtree() {
        let mut world = World::default();
        world
            .insert_root_item("bank", item(0x4000_0001, "chest", None))
            .unwrap();
        world
            .attach(item(0x4000_0002, "coin", Some(0x4000_0001)))
            .unwrap();
        assert_eq!(world.destroy(Serial(0x4000_0001)).unwrap(), 2);
        assert!(world.area("bank").unwrap().is_empty());
        assert_eq!(world.residency(Serial(0x4000_0002)), Residency::Orphaned);
        let (_, orphan) = world
            .orphans()
            .find(|(s, _)| **s == Serial(0x4000_0002))
            .unwrap();
        assert!(orphan.object.flags().orphan);
        assert_eq!(orphan.location, Some(Location::storage("bank")));
        assert_eq!(world.reap_orphans(), 2);
        assert_eq!(world.residency(Serial(0x4000_0002)), Residency::Absent);
    }

    #[test]
    fn moves_mark_dirty_and_reject_cycles() {
        let mut world = World::default();
        let mut chest = item(0x4000_0001, "chest", None);
        chest.flags.dirty = false;
        world.insert_root_item("bank", chest).unwrap();
        let mut bag = item(0x4000_0002, "bag", Some(0x4000_0001));
        bag.flags.dirty = false;
        world.attach(bag).unwrap();

        assert!(world
            .move_into_container(Serial(0x4000_0001), Serial(0x4000_0002))
            .is_err());
        world.move_to_area(Serial(0x4000_0002), "vault").unwrap();
        assert!(world.item(Serial(0x4000_0002)).unwrap().flags.dirty);
        assert!(world.contents(Serial(0x4000_0001)).is_empty());
        assert_eq!(
            world.location_of(Serial(0x4000_0002)),
            Some(Location::storage("vault"))
        );
    }

    #[test]
    fn unload_refuses_dirty_subtrees() {
        let mut world = World::default();
        let mut chest = item(0x4000_0001, "chest", None);
        chest.flags.dirty = false;
        world.insert_root_item("bank", chest).unwrap();
        world
            .attach(item(0x4000_0002, "coin", Some(0x4000_0001)))
            .unwrap();
        assert!(matches!(
            world.unload(Serial(0x4000_0001)),
            Err(StoreError::DirtySubtree(_))
        ));
        world.mark_clean(&[Serial(0x4000_0002)]);
        assert_eq!(world.unload(Serial(0x4000_0001)).unwrap(), 2);
        assert_eq!(world.residency(Serial(0x4000_0002)), Residency::Absent);
    }

    #[test]
    fn duplicate_serials_are_rejected() {
        let mut world = World::default();
        world
            .insert_root_item("bank", item(0x4000_0001, "chest", None))
            .unwrap();
        assert!(matches!(
            world.insert_root_item("bank", item(0x4000_0001, "other", None)),
            Err(StoreError::DuplicateSerial(_))
        ));
    }
}
