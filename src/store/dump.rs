//! JSON dumps of the whole store.
//!
//! A dump holds every record as a property set, storage grouped by area. Exporting
//! reads through the session; importing replays the dump through the bulk
//! [`Importer`], so a dump restores exactly like a legacy import.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::store::errors::{StoreError, StoreResult};
use crate::store::import::Importer;
use crate::store::property::{PropertySet, AREA_COLUMN};
use crate::store::schema::Category;
use crate::store::session::StoreSession;

pub const DUMP_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaDump {
    pub name: String,
    #[serde(default)]
    pub items: Vec<PropertySet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDump {
    pub format: u32,
    #[serde(default)]
    pub exported_at: String,
    #[serde(default)]
    pub areas: Vec<AreaDump>,
    #[serde(default)]
    pub characters: Vec<PropertySet>,
    /// Items nested inside what characters carry.
    #[serde(default)]
    pub held: Vec<PropertySet>,
    #[serde(default)]
    pub equipped: Vec<PropertySet>,
}

impl Default for StoreDump {
    fn default() -> Self {
        Self {
            format: DUMP_FORMAT,
            exported_at: String::new(),
            areas: Vec::new(),
            characters: Vec::new(),
            held: Vec::new(),
            equipped: Vec::new(),
        }
    }
}

impl StoreDump {
    pub fn records(&self) -> usize {
        self.areas.iter().map(|a| a.items.len()).sum::<usize>()
            + self.characters.len()
            + self.held.len()
            + self.equipped.len()
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let text = fs::read_to_string(path)?;
        let dump: StoreDump = serde_json::from_str(&text)?;
        if dump.format != DUMP_FORMAT {
            return Err(StoreError::Integrity(format!(
                "unsupported dump format {} (expected {})",
                dump.format, DUMP_FORMAT
            )));
        }
        Ok(dump)
    }

    pub fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub fn export(session: &StoreSession) -> StoreResult<StoreDump> {
    let mut dump = StoreDump {
        exported_at: chrono::Utc::now().to_rfc3339(),
        ..StoreDump::default()
    };

    let mut by_id: BTreeMap<i64, usize> = BTreeMap::new();
    for name in session.list_areas()? {
        if let Some(id) = session.area_id(&name)? {
            by_id.insert(id, dump.areas.len());
        }
        dump.areas.push(AreaDump {
            name,
            items: Vec::new(),
        });
    }
    for mut set in session.read_all(Category::Storage)? {
        let slot = set
            .remove(AREA_COLUMN)
            .and_then(|v| v.as_i64())
            .and_then(|id| by_id.get(&id).copied());
        match slot {
            Some(i) => dump.areas[i].items.push(set),
            None => {
                return Err(StoreError::Integrity(format!(
                    "storage record {} has no area",
                    set.serial()
                )))
            }
        }
    }

    for set in session.read_all(Category::Pcs)? {
        if set.serial().is_character() {
            dump.characters.push(set);
        } else {
            dump.held.push(set);
        }
    }
    dump.equipped = session.read_all(Category::PcEquip)?;
    log::info!("exported {} records in {} areas", dump.records(), dump.areas.len());
    Ok(dump)
}

/// Feed a dump through an open importer. The caller finishes it.
pub fn replay(importer: &mut Importer<'_>, dump: &StoreDump) -> StoreResult<()> {
    for area in &dump.areas {
        importer.declare_area(&area.name)?;
        for set in &area.items {
            importer.insert_storage(&area.name, set)?;
        }
    }
    for set in &dump.characters {
        importer.insert_character(set)?;
    }
    for set in &dump.held {
        importer.insert_held(set)?;
    }
    for set in &dump.equipped {
        importer.insert_equipped(set)?;
    }
    Ok(())
}
