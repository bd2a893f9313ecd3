//! Resident object types and their property-set conversions.
//!
//! Conversion is symmetric. Writing emits every main field, and an unusual field only
//! when it differs from the type default (so the column stays NULL). Reading starts
//! from the type defaults and overwrites whatever the record carries, then clears the
//! dirty flag since the object now matches the store.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::store::errors::{StoreError, StoreResult};
use crate::store::property::{PropertySet, RecordFlags, Value, CONTAINER_COLUMN, NAME_COLUMN};
use crate::store::schema::ELEMENTS;
use crate::store::serial::Serial;

pub const ACCOUNT_FIELD: &str = "Account";
pub const CHAR_INDEX_FIELD: &str = "CharIdx";
/// Object type used for characters unless a record says otherwise.
pub const CHARACTER_OBJTYPE: u32 = 0x0190;
/// Canonical "no price limit".
pub const UNBOUNDED_PRICE: u32 = u32::MAX;
/// Older stores wrote the unbounded price as `i32::MAX`.
pub const LEGACY_UNBOUNDED_PRICE: i64 = 2_147_483_647;
/// Custom properties with this prefix are runtime-only and never written.
pub const TRANSIENT_PREFIX: char = '#';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub objtype: u32,
    pub name: String,
    pub graphic: u16,
    #[serde(default = "default_true")]
    pub movable: bool,
    #[serde(default)]
    pub invisible: bool,
    #[serde(default)]
    pub newbie: bool,
    #[serde(default)]
    pub insured: bool,
    #[serde(default)]
    pub no_drop: bool,
    #[serde(default = "default_max_hp")]
    pub max_hp: u16,
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default)]
    pub equip_script: String,
    #[serde(default)]
    pub unequip_script: String,
}

fn default_true() -> bool {
    true
}

fn default_max_hp() -> u16 {
    1
}

fn default_quality() -> f64 {
    1.0
}

impl ItemDescriptor {
    /// Defaults for a type nobody registered.
    pub fn generic(objtype: u32) -> Self {
        Self {
            objtype,
            name: format!("item {objtype:#06x}"),
            graphic: (objtype & 0xFFFF) as u16,
            movable: true,
            invisible: false,
            newbie: false,
            insured: false,
            no_drop: false,
            max_hp: default_max_hp(),
            quality: default_quality(),
            equip_script: String::new(),
            unequip_script: String::new(),
        }
    }
}

/// Per-type defaults and the realms records may reference.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    descriptors: HashMap<u32, ItemDescriptor>,
    realms: BTreeSet<String>,
    require_known_types: bool,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ItemDescriptor) {
        self.descriptors.insert(descriptor.objtype, descriptor);
    }

    pub fn register_realm(&mut self, realm: impl Into<String>) {
        self.realms.insert(realm.into());
    }

    /// When set, loading a record of an unregistered type is an integrity error.
    pub fn require_known_types(&mut self, strict: bool) {
        self.require_known_types = strict;
    }

    pub fn descriptor(&self, objtype: u32) -> StoreResult<Cow<'_, ItemDescriptor>> {
        match self.descriptors.get(&objtype) {
            Some(desc) => Ok(Cow::Borrowed(desc)),
            None if self.require_known_types => Err(StoreError::Integrity(format!(
                "unknown object type {objtype:#06x}"
            ))),
            None => Ok(Cow::Owned(ItemDescriptor::generic(objtype))),
        }
    }

    /// An empty realm list accepts every realm.
    pub fn check_realm(&self, realm: &str) -> StoreResult<()> {
        if self.realms.is_empty() || self.realms.contains(realm) {
            Ok(())
        } else {
            Err(StoreError::Integrity(format!("invalid realm '{realm}'")))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Position {
    pub x: u16,
    pub y: u16,
    pub z: i8,
    pub realm: String,
}

impl Position {
    pub fn new(x: u16, y: u16, z: i8, realm: impl Into<String>) -> Self {
        Self {
            x,
            y,
            z,
            realm: realm.into(),
        }
    }
}

/// A base value and a temporary delta on top of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifier {
    pub value: i16,
    pub delta: i16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub serial: Serial,
    pub objtype: u32,
    pub name: String,
    pub graphic: u16,
    pub color: u16,
    pub position: Position,
    pub facing: u8,
    pub revision: u32,
    pub container: Option<Serial>,
    pub amount: u16,
    pub layer: u8,
    pub movable: bool,
    pub invisible: bool,
    pub decay_at: u32,
    pub sell_price: Option<u32>,
    pub buy_price: Option<u32>,
    pub newbie: bool,
    pub insured: bool,
    pub no_drop: bool,
    pub hp: u16,
    pub max_hp_mod: i16,
    pub quality: f64,
    pub name_suffix: String,
    pub on_use_script: String,
    pub equip_script: String,
    pub unequip_script: String,
    /// Indexed like [`ELEMENTS`].
    pub resist: [Modifier; 5],
    pub damage: [Modifier; 5],
    pub cprops: BTreeMap<String, String>,
    pub flags: RecordFlags,
}

fn read_int<T: TryFrom<i64>>(set: &PropertySet, field: &str) -> StoreResult<Option<T>> {
    match set.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let raw = value.as_i64().ok_or_else(|| {
                StoreError::Integrity(format!("field {field} is not an integer: {value:?}"))
            })?;
            T::try_from(raw)
                .map(Some)
                .map_err(|_| StoreError::Integrity(format!("field {field} out of range: {raw}")))
        }
    }
}

fn read_bool(set: &PropertySet, field: &str) -> StoreResult<Option<bool>> {
    Ok(read_int::<i64>(set, field)?.map(|v| v != 0))
}

fn read_text(set: &PropertySet, field: &str) -> Option<String> {
    set.get(field).and_then(Value::to_text)
}

fn read_position(set: &PropertySet, catalog: &TypeCatalog) -> StoreResult<Position> {
    let realm = read_text(set, "Realm").unwrap_or_default();
    catalog.check_realm(&realm)?;
    Ok(Position {
        x: read_int(set, "X")?.unwrap_or(0),
        y: read_int(set, "Y")?.unwrap_or(0),
        z: read_int(set, "Z")?.unwrap_or(0),
        realm,
    })
}

fn write_position(set: &mut PropertySet, position: &Position) {
    set.set_main("X", position.x);
    set.set_main("Y", position.y);
    set.set_main("Z", position.z);
    set.set_main("Realm", position.realm.as_str());
}

fn unless_default<T: PartialEq + Into<Value>>(set: &mut PropertySet, field: &str, value: T, default: T) {
    if value != default {
        set.set_unusual(field, value);
    }
}

fn write_cprops(set: &mut PropertySet, cprops: &BTreeMap<String, String>) {
    for (name, value) in cprops {
        if !name.starts_with(TRANSIENT_PREFIX) {
            set.set_custom(name, value.as_str());
        }
    }
}

fn normalize_price(raw: i64) -> StoreResult<u32> {
    if raw == LEGACY_UNBOUNDED_PRICE {
        return Ok(UNBOUNDED_PRICE);
    }
    u32::try_from(raw).map_err(|_| StoreError::Integrity(format!("price out of range: {raw}")))
}

impl Item {
    /// A fresh item with its type's defaults. New objects start dirty.
    pub fn new(serial: Serial, descriptor: &ItemDescriptor) -> Self {
        Self {
            serial,
            objtype: descriptor.objtype,
            name: descriptor.name.clone(),
            graphic: descriptor.graphic,
            color: 0,
            position: Position::default(),
            facing: 0,
            revision: 0,
            container: None,
            amount: 1,
            layer: 0,
            movable: descriptor.movable,
            invisible: descriptor.invisible,
            decay_at: 0,
            sell_price: None,
            buy_price: None,
            newbie: descriptor.newbie,
            insured: descriptor.insured,
            no_drop: descriptor.no_drop,
            hp: descriptor.max_hp,
            max_hp_mod: 0,
            quality: descriptor.quality,
            name_suffix: String::new(),
            on_use_script: String::new(),
            equip_script: descriptor.equip_script.clone(),
            unequip_script: descriptor.unequip_script.clone(),
            resist: [Modifier::default(); 5],
            damage: [Modifier::default(); 5],
            cprops: BTreeMap::new(),
            flags: RecordFlags {
                dirty: true,
                ..RecordFlags::default()
            },
        }
    }

    pub fn set_cprop(&mut self, name: &str, value: impl Into<String>) {
        self.cprops.insert(name.to_string(), value.into());
        if !name.starts_with(TRANSIENT_PREFIX) {
            self.flags.dirty = true;
        }
    }

    pub fn remove_cprop(&mut self, name: &str) -> Option<String> {
        let old = self.cprops.remove(name);
        if old.is_some() && !name.starts_with(TRANSIENT_PREFIX) {
            self.flags.dirty = true;
        }
        old
    }

    pub fn to_property_set(&self, catalog: &TypeCatalog) -> StoreResult<PropertySet> {
        let desc = catalog.descriptor(self.objtype)?;
        let mut set = PropertySet::new(self.serial);
        set.flags = self.flags;
        set.set_main(NAME_COLUMN, self.name.as_str());
        set.set_main("ObjType", self.objtype);
        set.set_main("Graphic", self.graphic);
        write_position(&mut set, &self.position);
        set.set_main("Revision", self.revision);
        if let Some(container) = self.container {
            set.set_main(CONTAINER_COLUMN, container);
        }

        unless_default(&mut set, "Color", self.color, 0);
        unless_default(&mut set, "Facing", self.facing, 0);
        unless_default(&mut set, "Amount", self.amount, 1);
        unless_default(&mut set, "Layer", self.layer, 0);
        unless_default(&mut set, "Movable", self.movable, desc.movable);
        unless_default(&mut set, "Invisible", self.invisible, desc.invisible);
        unless_default(&mut set, "DecayAt", self.decay_at, 0);
        if let Some(price) = self.sell_price {
            set.set_unusual("SellPrice", price);
        }
        if let Some(price) = self.buy_price {
            set.set_unusual("BuyPrice", price);
        }
        unless_default(&mut set, "Newbie", self.newbie, desc.newbie);
        unless_default(&mut set, "Insured", self.insured, desc.insured);
        unless_default(&mut set, "NoDrop", self.no_drop, desc.no_drop);
        unless_default(&mut set, "Hp", self.hp, desc.max_hp);
        unless_default(&mut set, "MaxHpMod", self.max_hp_mod, 0);
        if (self.quality - desc.quality).abs() > f64::EPSILON {
            set.set_unusual("Quality", self.quality);
        }
        unless_default(&mut set, "NameSuffix", self.name_suffix.as_str(), "");
        unless_default(&mut set, "OnUseScript", self.on_use_script.as_str(), "");
        unless_default(
            &mut set,
            "EquipScript",
            self.equip_script.as_str(),
            desc.equip_script.as_str(),
        );
        unless_default(
            &mut set,
            "UnequipScript",
            self.unequip_script.as_str(),
            desc.unequip_script.as_str(),
        );
        for (i, element) in ELEMENTS.iter().enumerate() {
            unless_default(&mut set, &format!("{element}Resist"), self.resist[i].value, 0);
            unless_default(&mut set, &format!("{element}ResistMod"), self.resist[i].delta, 0);
            unless_default(&mut set, &format!("{element}Damage"), self.damage[i].value, 0);
            unless_default(&mut set, &format!("{element}DamageMod"), self.damage[i].delta, 0);
        }
        write_cprops(&mut set, &self.cprops);
        Ok(set)
    }

    pub fn from_property_set(set: &PropertySet, catalog: &TypeCatalog) -> StoreResult<Self> {
        let serial = set.serial();
        if !serial.is_item() {
            return Err(StoreError::Integrity(format!(
                "record {serial} is not an item serial"
            )));
        }
        let objtype: u32 = read_int(set, "ObjType")?.ok_or_else(|| {
            StoreError::Integrity(format!("item {serial} has no object type"))
        })?;
        let desc = catalog.descriptor(objtype)?;
        let mut item = Item::new(serial, &desc);

        if let Some(name) = read_text(set, NAME_COLUMN) {
            item.name = name;
        }
        if let Some(v) = read_int(set, "Graphic")? {
            item.graphic = v;
        }
        item.position = read_position(set, catalog)?;
        if let Some(v) = read_int(set, "Revision")? {
            item.revision = v;
        }
        item.container = set.container();
        if let Some(v) = read_int(set, "Color")? {
            item.color = v;
        }
        if let Some(v) = read_int(set, "Facing")? {
            item.facing = v;
        }
        if let Some(v) = read_int(set, "Amount")? {
            item.amount = v;
        }
        if let Some(v) = read_int(set, "Layer")? {
            item.layer = v;
        }
        if let Some(v) = read_bool(set, "Movable")? {
            item.movable = v;
        }
        if let Some(v) = read_bool(set, "Invisible")? {
            item.invisible = v;
        }
        if let Some(v) = read_int(set, "DecayAt")? {
            item.decay_at = v;
        }
        if let Some(v) = read_int::<i64>(set, "SellPrice")? {
            item.sell_price = Some(normalize_price(v)?);
        }
        if let Some(v) = read_int::<i64>(set, "BuyPrice")? {
            item.buy_price = Some(normalize_price(v)?);
        }
        if let Some(v) = read_bool(set, "Newbie")? {
            item.newbie = v;
        }
        if let Some(v) = read_bool(set, "Insured")? {
            item.insured = v;
        }
        if let Some(v) = read_bool(set, "NoDrop")? {
            item.no_drop = v;
        }
        if let Some(v) = read_int(set, "Hp")? {
            item.hp = v;
        }
        if let Some(v) = read_int(set, "MaxHpMod")? {
            item.max_hp_mod = v;
        }
        if let Some(v) = set.get("Quality").and_then(Value::as_f64) {
            item.quality = v;
        }
        if let Some(v) = read_text(set, "NameSuffix") {
            item.name_suffix = v;
        }
        if let Some(v) = read_text(set, "OnUseScript") {
            item.on_use_script = v;
        }
        if let Some(v) = read_text(set, "EquipScript") {
            item.equip_script = v;
        }
        if let Some(v) = read_text(set, "UnequipScript") {
            item.unequip_script = v;
        }
        for (i, element) in ELEMENTS.iter().enumerate() {
            if let Some(v) = read_int(set, &format!("{element}Resist"))? {
                item.resist[i].value = v;
            }
            if let Some(v) = read_int(set, &format!("{element}ResistMod"))? {
                item.resist[i].delta = v;
            }
            if let Some(v) = read_int(set, &format!("{element}Damage"))? {
                item.damage[i].value = v;
            }
            if let Some(v) = read_int(set, &format!("{element}DamageMod"))? {
                item.damage[i].delta = v;
            }
        }
        item.cprops = set.custom.clone();
        item.flags.dirty = false;
        Ok(item)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Character {
    pub serial: Serial,
    pub name: String,
    pub account: String,
    pub char_index: u8,
    pub objtype: u32,
    pub graphic: u16,
    pub color: u16,
    pub position: Position,
    pub facing: u8,
    pub revision: u32,
    pub gender: u8,
    pub title: String,
    pub cprops: BTreeMap<String, String>,
    pub flags: RecordFlags,
}

impl Character {
    pub fn new(serial: Serial, name: impl Into<String>, account: impl Into<String>, char_index: u8) -> Self {
        Self {
            serial,
            name: name.into(),
            account: account.into(),
            char_index,
            objtype: CHARACTER_OBJTYPE,
            graphic: CHARACTER_OBJTYPE as u16,
            color: 0,
            position: Position::default(),
            facing: 0,
            revision: 0,
            gender: 0,
            title: String::new(),
            cprops: BTreeMap::new(),
            flags: RecordFlags {
                dirty: true,
                ..RecordFlags::default()
            },
        }
    }

    pub fn set_cprop(&mut self, name: &str, value: impl Into<String>) {
        self.cprops.insert(name.to_string(), value.into());
        if !name.starts_with(TRANSIENT_PREFIX) {
            self.flags.dirty = true;
        }
    }

    pub fn to_property_set(&self, _catalog: &TypeCatalog) -> StoreResult<PropertySet> {
        let mut set = PropertySet::new(self.serial);
        set.flags = self.flags;
        set.set_main(NAME_COLUMN, self.name.as_str());
        set.set_main("ObjType", self.objtype);
        set.set_main("Graphic", self.graphic);
        write_position(&mut set, &self.position);
        set.set_main("Revision", self.revision);
        set.set_main(ACCOUNT_FIELD, self.account.as_str());
        set.set_main(CHAR_INDEX_FIELD, self.char_index);
        unless_default(&mut set, "Color", self.color, 0);
        unless_default(&mut set, "Facing", self.facing, 0);
        unless_default(&mut set, "Gender", self.gender, 0);
        unless_default(&mut set, "Title", self.title.as_str(), "");
        write_cprops(&mut set, &self.cprops);
        Ok(set)
    }

    pub fn from_property_set(set: &PropertySet, catalog: &TypeCatalog) -> StoreResult<Self> {
        let serial = set.serial();
        if !serial.is_character() {
            return Err(StoreError::Integrity(format!(
                "record {serial} is not a character serial"
            )));
        }
        let account = read_text(set, ACCOUNT_FIELD).ok_or_else(|| {
            StoreError::Integrity(format!("character {serial} has no account"))
        })?;
        let char_index = read_int(set, CHAR_INDEX_FIELD)?.unwrap_or(0);
        let name = read_text(set, NAME_COLUMN).unwrap_or_default();
        let mut chr = Character::new(serial, name, account, char_index);
        if let Some(v) = read_int(set, "ObjType")? {
            chr.objtype = v;
        }
        if let Some(v) = read_int(set, "Graphic")? {
            chr.graphic = v;
        }
        chr.position = read_position(set, catalog)?;
        if let Some(v) = read_int(set, "Revision")? {
            chr.revision = v;
        }
        if let Some(v) = read_int(set, "Color")? {
            chr.color = v;
        }
        if let Some(v) = read_int(set, "Facing")? {
            chr.facing = v;
        }
        if let Some(v) = read_int(set, "Gender")? {
            chr.gender = v;
        }
        if let Some(v) = read_text(set, "Title") {
            chr.title = v;
        }
        chr.cprops = set.custom.clone();
        chr.flags.dirty = false;
        Ok(chr)
    }
}

/// Anything the world can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldObject {
    Item(Item),
    Character(Character),
}

impl WorldObject {
    pub fn serial(&self) -> Serial {
        match self {
            WorldObject::Item(item) => item.serial,
            WorldObject::Character(chr) => chr.serial,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WorldObject::Item(item) => &item.name,
            WorldObject::Character(chr) => &chr.name,
        }
    }

    pub fn container(&self) -> Option<Serial> {
        match self {
            WorldObject::Item(item) => item.container,
            WorldObject::Character(_) => None,
        }
    }

    pub fn flags(&self) -> &RecordFlags {
        match self {
            WorldObject::Item(item) => &item.flags,
            WorldObject::Character(chr) => &chr.flags,
        }
    }

    pub fn flags_mut(&mut self) -> &mut RecordFlags {
        match self {
            WorldObject::Item(item) => &mut item.flags,
            WorldObject::Character(chr) => &mut chr.flags,
        }
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            WorldObject::Item(item) => Some(item),
            WorldObject::Character(_) => None,
        }
    }

    pub fn as_character(&self) -> Option<&Character> {
        match self {
            WorldObject::Character(chr) => Some(chr),
            WorldObject::Item(_) => None,
        }
    }

    pub fn is_character(&self) -> bool {
        matches!(self, WorldObject::Character(_))
    }

    pub fn to_property_set(&self, catalog: &TypeCatalog) -> StoreResult<PropertySet> {
        match self {
            WorldObject::Item(item) => item.to_property_set(catalog),
            WorldObject::Character(chr) => chr.to_property_set(catalog),
        }
    }
}
