//! Table layout of the store file: categories, DDL, indexes and pragmas.

use std::fmt;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::store::errors::{StoreError, StoreResult};

pub const SCHEMA_VERSION: i64 = 1;
pub const AREA_TABLE: &str = "storage_area";

/// Elements carrying a resistance and a damage value, each with a "mod" delta.
pub const ELEMENTS: [&str; 5] = ["Fire", "Cold", "Energy", "Poison", "Physical"];

/// A persisted record family. Each has its own main and prop table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    /// Root items grouped into named areas, plus everything nested inside them.
    Storage,
    /// Characters and the items nested inside containers they carry.
    Pcs,
    /// Items equipped directly on a character.
    PcEquip,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Storage, Category::Pcs, Category::PcEquip];

    pub fn label(self) -> &'static str {
        match self {
            Category::Storage => "storage",
            Category::Pcs => "pcs",
            Category::PcEquip => "pcequip",
        }
    }

    pub fn main_table(self) -> &'static str {
        match self {
            Category::Storage => "storage_main",
            Category::Pcs => "pcs_main",
            Category::PcEquip => "pcequip_main",
        }
    }

    pub fn prop_table(self) -> &'static str {
        match self {
            Category::Storage => "storage_prop",
            Category::Pcs => "pcs_prop",
            Category::PcEquip => "pcequip_prop",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct ColumnDef {
    name: String,
    sql_type: &'static str,
    not_null: bool,
}

impl ColumnDef {
    fn new(name: impl Into<String>, sql_type: &'static str, not_null: bool) -> Self {
        Self {
            name: name.into(),
            sql_type,
            not_null,
        }
    }
}

fn item_columns() -> Vec<ColumnDef> {
    let mut cols = vec![
        ColumnDef::new("Name", "TEXT", true),
        ColumnDef::new("ObjType", "INTEGER", true),
        ColumnDef::new("Graphic", "INTEGER", true),
        ColumnDef::new("X", "INTEGER", true),
        ColumnDef::new("Y", "INTEGER", true),
        ColumnDef::new("Z", "INTEGER", true),
        ColumnDef::new("Realm", "TEXT", true),
        ColumnDef::new("Revision", "INTEGER", true),
    ];
    for name in [
        "Color", "Facing", "Amount", "Layer", "Movable", "Invisible", "DecayAt", "SellPrice",
        "BuyPrice", "Newbie", "Insured", "NoDrop", "Hp", "MaxHpMod",
    ] {
        cols.push(ColumnDef::new(name, "INTEGER", false));
    }
    cols.push(ColumnDef::new("Quality", "REAL", false));
    for name in ["NameSuffix", "OnUseScript", "EquipScript", "UnequipScript"] {
        cols.push(ColumnDef::new(name, "TEXT", false));
    }
    for element in ELEMENTS {
        for suffix in ["Resist", "ResistMod", "Damage", "DamageMod"] {
            cols.push(ColumnDef::new(format!("{element}{suffix}"), "INTEGER", false));
        }
    }
    cols
}

fn main_table_ddl(category: Category) -> String {
    let table = category.main_table();
    let mut lines = vec!["Serial INTEGER NOT NULL PRIMARY KEY".to_string()];
    if category == Category::Storage {
        lines.push(format!(
            "AreaId INTEGER NOT NULL REFERENCES {AREA_TABLE}(AreaId)"
        ));
    }
    for col in item_columns() {
        let null = if col.not_null { " NOT NULL" } else { "" };
        lines.push(format!("{} {}{}", col.name, col.sql_type, null));
    }
    // Storage containers always live in the same table. Character categories cross
    // tables (a backpack is equipped, its contents are held) so they stay plain integers.
    if category == Category::Storage {
        lines.push(format!(
            "Container INTEGER REFERENCES {table}(Serial) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED"
        ));
    } else {
        lines.push("Container INTEGER".to_string());
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n);\n",
        lines.join(",\n    ")
    )
}

fn prop_table_ddl(category: Category) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {prop} (
    PropId INTEGER PRIMARY KEY,
    Serial INTEGER NOT NULL REFERENCES {main}(Serial) ON DELETE CASCADE,
    PropName TEXT NOT NULL,
    PropValue TEXT,
    IsCustom INTEGER NOT NULL DEFAULT 1
);\n",
        prop = category.prop_table(),
        main = category.main_table()
    )
}

/// Full DDL for a fresh store.
pub fn schema_ddl() -> String {
    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {AREA_TABLE} (\n    AreaId INTEGER PRIMARY KEY,\n    Name TEXT NOT NULL UNIQUE\n);\n"
    );
    for category in Category::ALL {
        ddl.push_str(&main_table_ddl(category));
        ddl.push_str(&prop_table_ddl(category));
    }
    ddl
}

/// Secondary indexes as `(name, create statement)`. Dropped during bulk import.
pub fn secondary_indexes() -> Vec<(String, String)> {
    let mut out = Vec::new();
    for category in Category::ALL {
        let main = category.main_table();
        let prop = category.prop_table();
        out.push((
            format!("idx_{main}_name"),
            format!("CREATE INDEX IF NOT EXISTS idx_{main}_name ON {main}(Name)"),
        ));
        out.push((
            format!("idx_{main}_container"),
            format!("CREATE INDEX IF NOT EXISTS idx_{main}_container ON {main}(Container)"),
        ));
        out.push((
            format!("idx_{prop}_serial"),
            format!("CREATE INDEX IF NOT EXISTS idx_{prop}_serial ON {prop}(Serial)"),
        ));
    }
    out.push((
        "idx_storage_main_area".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_storage_main_area ON storage_main(AreaId, Name)"
            .to_string(),
    ));
    out
}

pub fn create_indexes(conn: &Connection) -> StoreResult<()> {
    for (_, sql) in secondary_indexes() {
        conn.execute_batch(&sql)?;
    }
    Ok(())
}

pub fn drop_indexes(conn: &Connection) -> StoreResult<()> {
    for (name, _) in secondary_indexes() {
        conn.execute_batch(&format!("DROP INDEX IF EXISTS {name}"))?;
    }
    Ok(())
}

/// Create missing tables and indexes, then check the recorded schema version.
pub fn ensure_schema(conn: &Connection) -> StoreResult<()> {
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found != 0 && found != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            found,
        });
    }
    conn.execute_batch(&schema_ddl())?;
    create_indexes(conn)?;
    if found == 0 {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

/// `quick_check` plus `foreign_key_check`. The first finding is reported.
pub fn verify_integrity(conn: &Connection) -> StoreResult<()> {
    let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(StoreError::Integrity(format!("quick_check: {verdict}")));
    }
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    if let Some(row) = rows.next()? {
        let table: String = row.get(0)?;
        let rowid: Option<i64> = row.get(1)?;
        let parent: String = row.get(2)?;
        return Err(StoreError::Integrity(format!(
            "{table} row {} references a missing {parent} row",
            rowid.unwrap_or_default()
        )));
    }
    Ok(())
}

pub fn apply_connection_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Relaxed durability for a one-shot bulk load.
pub fn apply_import_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.pragma_update(None, "journal_mode", "MEMORY")?;
    Ok(())
}
