//! The store session: one connection, its bound statements, and every row-level
//! operation the loader, commit engine and importer run against it.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::store::binder::{quote_ident, TableBinding};
use crate::store::errors::{StoreError, StoreResult};
use crate::store::objects::{ACCOUNT_FIELD, CHAR_INDEX_FIELD};
use crate::store::property::{PropertySet, Value, AREA_COLUMN, SERIAL_COLUMN};
use crate::store::schema::{self, Category, AREA_TABLE};
use crate::store::serial::{Serial, SerialKind, ITEM_SERIAL_BASE};

/// Parameters per `IN (...)` query when resolving container contents.
const CONTENTS_CHUNK: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub ignore_load_errors: bool,
    /// Run SQLite's consistency checks when connecting.
    pub check_integrity: bool,
    pub statement_cache: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ignore_load_errors: false,
            check_integrity: true,
            statement_cache: 64,
        }
    }
}

/// Statements built once per category at bind time.
struct CategoryStatements {
    binding: TableBinding,
    select_by_serial: String,
    select_props: String,
    insert_prop: String,
    delete_props: String,
    delete_record: String,
    exists: String,
    container_of: String,
    has_contents: String,
    list_serials: String,
}

impl CategoryStatements {
    fn bind(conn: &Connection, category: Category) -> StoreResult<Self> {
        let main = category.main_table();
        let prop = category.prop_table();
        let binding = TableBinding::bind(conn, main)?;
        let stmts = Self {
            select_by_serial: format!("{} WHERE Serial = ?1", binding.select_sql()),
            select_props: format!(
                "SELECT PropName, PropValue, IsCustom FROM {prop} WHERE Serial = ?1 ORDER BY PropId"
            ),
            insert_prop: format!(
                "INSERT INTO {prop} (Serial, PropName, PropValue, IsCustom) VALUES (?1, ?2, ?3, ?4)"
            ),
            delete_props: format!("DELETE FROM {prop} WHERE Serial = ?1"),
            delete_record: format!("DELETE FROM {main} WHERE Serial = ?1"),
            exists: format!("SELECT 1 FROM {main} WHERE Serial = ?1"),
            container_of: format!("SELECT Container FROM {main} WHERE Serial = ?1"),
            has_contents: format!("SELECT 1 FROM {main} WHERE Container = ?1 LIMIT 1"),
            list_serials: format!("SELECT Serial FROM {main}"),
            binding,
        };
        for sql in [
            &stmts.select_by_serial,
            &stmts.select_props,
            &stmts.insert_prop,
            &stmts.delete_props,
        ] {
            conn.prepare_cached(sql).map_err(|source| StoreError::Prepare {
                table: main.to_string(),
                source,
            })?;
        }
        Ok(stmts)
    }
}

/// An open store: connection, schema bindings, options and the single-writer lock.
///
/// Lifecycle is connect → bind → operate → commit/rollback → close. Dropping the
/// session closes the connection and releases the lock; bindings never outlive it.
pub struct StoreSession {
    conn: Connection,
    path: Option<PathBuf>,
    statements: Vec<CategoryStatements>,
    options: SessionOptions,
    _lock: Option<File>,
}

fn slot(category: Category) -> usize {
    match category {
        Category::Storage => 0,
        Category::Pcs => 1,
        Category::PcEquip => 2,
    }
}

impl StoreSession {
    /// Open (or create) the store file at `path`, taking an exclusive lock next to it.
    pub fn open(path: impl AsRef<Path>, options: SessionOptions) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StoreError::StoreLocked(path.to_path_buf()));
        }
        let conn = Connection::open(path)?;
        let mut session = Self::connect(conn, options)?;
        session.path = Some(path.to_path_buf());
        session._lock = Some(lock);
        log::info!("store opened at {}", path.display());
        Ok(session)
    }

    pub fn open_in_memory(options: SessionOptions) -> StoreResult<Self> {
        Self::connect(Connection::open_in_memory()?, options)
    }

    fn connect(conn: Connection, options: SessionOptions) -> StoreResult<Self> {
        conn.set_prepared_statement_cache_capacity(options.statement_cache.max(16));
        schema::apply_connection_pragmas(&conn)?;
        schema::ensure_schema(&conn)?;
        if options.check_integrity {
            if let Err(err) = schema::verify_integrity(&conn) {
                if !options.ignore_load_errors {
                    log::error!("store failed its integrity check: {}", err);
                    return Err(err);
                }
                log::warn!("store failed its integrity check, continuing: {}", err);
            }
        }
        let statements = Category::ALL
            .iter()
            .map(|&category| CategoryStatements::bind(&conn, category))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self {
            conn,
            path: None,
            statements,
            options,
            _lock: None,
        })
    }

    /// Close the connection, surfacing any error SQLite reports on shutdown.
    pub fn close(self) -> StoreResult<()> {
        let StoreSession { conn, path, .. } = self;
        conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
        if let Some(path) = path {
            log::info!("store closed at {}", path.display());
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn binding(&self, category: Category) -> &TableBinding {
        &self.statements[slot(category)].binding
    }

    fn stmts(&self, category: Category) -> &CategoryStatements {
        &self.statements[slot(category)]
    }

    // ---- transactions -------------------------------------------------------------

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn begin(&self) -> StoreResult<()> {
        if self.in_transaction() {
            return Err(StoreError::Integrity(
                "transaction already open".to_string(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open transaction, if any.
    pub fn rollback(&self) -> StoreResult<()> {
        if self.in_transaction() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    // ---- storage areas ------------------------------------------------------------

    pub fn area_id(&self, name: &str) -> StoreResult<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT AreaId FROM {AREA_TABLE} WHERE Name = ?1"))?;
        Ok(stmt.query_row([name], |row| row.get(0)).optional()?)
    }

    pub fn list_areas(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT Name FROM {AREA_TABLE} ORDER BY AreaId"))?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Declare a new area. An existing name is an integrity error.
    pub fn insert_area(&self, name: &str) -> StoreResult<i64> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("INSERT INTO {AREA_TABLE} (Name) VALUES (?1)"))?;
        match stmt.execute([name]) {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            Err(err) if StoreError::is_constraint_violation(&err) => Err(StoreError::Integrity(
                format!("storage area '{name}' declared twice"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub fn ensure_area(&self, name: &str) -> StoreResult<i64> {
        match self.area_id(name)? {
            Some(id) => Ok(id),
            None => self.insert_area(name),
        }
    }

    // ---- lookups ------------------------------------------------------------------

    pub fn serial_exists(&self, category: Category, serial: Serial) -> StoreResult<bool> {
        let mut stmt = self.conn.prepare_cached(&self.stmts(category).exists)?;
        Ok(stmt.exists([serial])?)
    }

    /// First category holding `serial`, if any.
    pub fn locate(&self, serial: Serial) -> StoreResult<Option<Category>> {
        for category in Category::ALL {
            if self.serial_exists(category, serial)? {
                return Ok(Some(category));
            }
        }
        Ok(None)
    }

    pub fn root_exists(&self, area: &str, name: &str) -> StoreResult<bool> {
        let Some(area_id) = self.area_id(area)? else {
            return Ok(false);
        };
        let mut stmt = self.conn.prepare_cached(
            "SELECT 1 FROM storage_main WHERE AreaId = ?1 AND Name = ?2 COLLATE NOCASE AND Container IS NULL",
        )?;
        Ok(stmt.exists(params![area_id, name])?)
    }

    pub fn has_contents(&self, category: Category, container: Serial) -> StoreResult<bool> {
        let mut stmt = self.conn.prepare_cached(&self.stmts(category).has_contents)?;
        Ok(stmt.exists([container])?)
    }

    /// `None` when the record does not exist, `Some(None)` for a record without a container.
    pub fn container_of(
        &self,
        category: Category,
        serial: Serial,
    ) -> StoreResult<Option<Option<Serial>>> {
        let mut stmt = self.conn.prepare_cached(&self.stmts(category).container_of)?;
        let row: Option<Option<i64>> = stmt.query_row([serial], |row| row.get(0)).optional()?;
        Ok(row.map(|container| container.and_then(Serial::from_db)))
    }

    /// Area holding a storage record.
    pub fn area_of(&self, serial: Serial) -> StoreResult<Option<String>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT a.Name FROM storage_main m JOIN {AREA_TABLE} a ON a.AreaId = m.AreaId WHERE m.Serial = ?1"
        ))?;
        Ok(stmt.query_row([serial], |row| row.get(0)).optional()?)
    }

    pub fn list_serials(&self, category: Category) -> StoreResult<BTreeSet<Serial>> {
        let mut stmt = self.conn.prepare_cached(&self.stmts(category).list_serials)?;
        let serials = stmt
            .query_map([], |row| row.get::<_, Serial>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(serials)
    }

    pub fn count(&self, category: Category) -> StoreResult<i64> {
        Ok(self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", category.main_table()),
            [],
            |row| row.get(0),
        )?)
    }

    /// Highest serial in a category's main table, optionally restricted to one kind.
    pub fn max_serial(
        &self,
        category: Category,
        kind: Option<SerialKind>,
    ) -> StoreResult<Option<Serial>> {
        let table = category.main_table();
        let max: Option<i64> = match kind {
            None => self
                .conn
                .query_row(&format!("SELECT MAX(Serial) FROM {table}"), [], |row| row.get(0))?,
            Some(SerialKind::Character) => self.conn.query_row(
                &format!("SELECT MAX(Serial) FROM {table} WHERE Serial < ?1"),
                [ITEM_SERIAL_BASE],
                |row| row.get(0),
            )?,
            Some(SerialKind::Item) => self.conn.query_row(
                &format!("SELECT MAX(Serial) FROM {table} WHERE Serial >= ?1"),
                [ITEM_SERIAL_BASE],
                |row| row.get(0),
            )?,
        };
        Ok(max.and_then(Serial::from_db))
    }

    /// Character serial registered for an account slot.
    pub fn find_character(&self, account: &str, index: u8) -> StoreResult<Option<Serial>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.Serial FROM pcs_prop a JOIN pcs_prop b ON a.Serial = b.Serial \
             WHERE a.IsCustom = 0 AND a.PropName = ?1 AND a.PropValue = ?2 \
             AND b.IsCustom = 0 AND b.PropName = ?3 AND b.PropValue = ?4 \
             ORDER BY a.Serial LIMIT 1",
        )?;
        Ok(stmt
            .query_row(
                params![ACCOUNT_FIELD, account, CHAR_INDEX_FIELD, index.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ---- record reads -------------------------------------------------------------

    fn read_sets<P: rusqlite::Params>(
        &self,
        category: Category,
        sql: &str,
        params: P,
        cached: bool,
    ) -> StoreResult<Vec<PropertySet>> {
        let binding = &self.stmts(category).binding;
        let mut sets = if cached {
            let mut stmt = self.conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, |row| binding.extract(row))?;
            let sets = rows.collect::<Result<Vec<_>, _>>()?;
            sets
        } else {
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt.query_map(params, |row| binding.extract(row))?;
            let sets = rows.collect::<Result<Vec<_>, _>>()?;
            sets
        };
        for set in &mut sets {
            self.attach_props(category, set)?;
        }
        Ok(sets)
    }

    fn attach_props(&self, category: Category, set: &mut PropertySet) -> StoreResult<()> {
        let mut stmt = self.conn.prepare_cached(&self.stmts(category).select_props)?;
        let rows = stmt.query_map([set.serial()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (name, value, is_custom) = row?;
            if is_custom != 0 {
                set.custom.insert(name, value.unwrap_or_default());
            } else if let Some(value) = value {
                set.unusual.insert(name, Value::Text(value));
            }
        }
        Ok(())
    }

    pub fn read_record(&self, category: Category, serial: Serial) -> StoreResult<Option<PropertySet>> {
        let sql = self.stmts(category).select_by_serial.clone();
        Ok(self.read_sets(category, &sql, [serial], true)?.pop())
    }

    /// Root record named `name` (case-insensitive) in an area.
    pub fn read_root(&self, area_id: i64, name: &str) -> StoreResult<Option<PropertySet>> {
        let sql = format!(
            "{} WHERE AreaId = ?1 AND Name = ?2 COLLATE NOCASE AND Container IS NULL ORDER BY Serial LIMIT 1",
            self.binding(Category::Storage).select_sql()
        );
        Ok(self
            .read_sets(Category::Storage, &sql, params![area_id, name], true)?
            .pop())
    }

    /// Every record whose container is one of `seeds`, ordered by serial within a chunk.
    pub fn read_contents(&self, category: Category, seeds: &[Serial]) -> StoreResult<Vec<PropertySet>> {
        let mut out = Vec::new();
        for chunk in seeds.chunks(CONTENTS_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "{} WHERE Container IN ({placeholders}) ORDER BY Serial",
                self.binding(category).select_sql()
            );
            out.extend(self.read_sets(category, &sql, params_from_iter(chunk.iter()), false)?);
        }
        Ok(out)
    }

    /// Every record of a category, in serial order.
    pub fn read_all(&self, category: Category) -> StoreResult<Vec<PropertySet>> {
        let sql = format!("{} ORDER BY Serial", self.binding(category).select_sql());
        self.read_sets(category, &sql, [], false)
    }

    // ---- record writes ------------------------------------------------------------

    fn bound_values(
        &self,
        category: Category,
        set: &PropertySet,
        area_id: Option<i64>,
        update: bool,
    ) -> (Vec<Value>, Vec<(String, Value)>) {
        let binding = self.binding(category);
        let (mut values, leftovers) = if update {
            binding.bind_update_values(set)
        } else {
            binding.bind_values(set)
        };
        if let Some(area_id) = area_id {
            if let Some(i) = binding
                .columns()
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(AREA_COLUMN))
            {
                values[i] = Value::Integer(area_id);
            }
        }
        let leftovers = leftovers
            .into_iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(AREA_COLUMN))
            .collect();
        (values, leftovers)
    }

    /// Insert a record and its properties. A serial already in the table is
    /// a `DuplicateSerial` error.
    pub fn insert_record(
        &self,
        category: Category,
        set: &PropertySet,
        area_id: Option<i64>,
    ) -> StoreResult<()> {
        let serial = set.serial();
        if !serial.is_assigned() {
            return Err(StoreError::Integrity(format!(
                "{category} record without a serial"
            )));
        }
        let (values, leftovers) = self.bound_values(category, set, area_id, false);
        let result = self
            .conn
            .prepare_cached(self.binding(category).insert_sql())?
            .execute(params_from_iter(values.iter()));
        match result {
            Ok(_) => {}
            Err(err) if StoreError::is_constraint_violation(&err) => {
                if self.serial_exists(category, serial)? {
                    return Err(StoreError::DuplicateSerial(serial));
                }
                return Err(StoreError::Integrity(format!(
                    "{category} record {serial} rejected: {err}"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        self.write_props(category, serial, &leftovers, set)
    }

    /// Update the main record, then replace its property rows wholesale.
    pub fn update_record(
        &self,
        category: Category,
        set: &PropertySet,
        area_id: Option<i64>,
    ) -> StoreResult<()> {
        let serial = set.serial();
        let (values, leftovers) = self.bound_values(category, set, area_id, true);
        let changed = self
            .conn
            .prepare_cached(self.binding(category).update_sql())?
            .execute(params_from_iter(values.iter()))
            .map_err(|err| {
                if StoreError::is_constraint_violation(&err) {
                    StoreError::Integrity(format!("{category} record {serial} rejected: {err}"))
                } else {
                    err.into()
                }
            })?;
        if changed == 0 {
            return Err(StoreError::Integrity(format!(
                "{category} record {serial} vanished before update"
            )));
        }
        self.conn
            .prepare_cached(&self.stmts(category).delete_props)?
            .execute([serial])?;
        self.write_props(category, serial, &leftovers, set)
    }

    fn write_props(
        &self,
        category: Category,
        serial: Serial,
        leftovers: &[(String, Value)],
        set: &PropertySet,
    ) -> StoreResult<()> {
        let mut stmt = self.conn.prepare_cached(&self.stmts(category).insert_prop)?;
        for (name, value) in leftovers {
            if name.eq_ignore_ascii_case(SERIAL_COLUMN) {
                continue;
            }
            if let Some(text) = value.to_text() {
                stmt.execute(params![serial, name, text, 0])?;
            }
        }
        for (name, value) in &set.custom {
            stmt.execute(params![serial, name, value, 1])?;
        }
        Ok(())
    }

    /// Delete a main record; its property rows (and, for storage, nested records)
    /// go with it through cascading foreign keys. Returns rows removed.
    pub fn delete_record(&self, category: Category, serial: Serial) -> StoreResult<usize> {
        let removed = self
            .conn
            .prepare_cached(&self.stmts(category).delete_record)?
            .execute([serial])?;
        Ok(removed)
    }

    pub fn prop_count(&self, category: Category, serial: Serial) -> StoreResult<i64> {
        Ok(self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE Serial = ?1",
                quote_ident(category.prop_table())
            ),
            [serial],
            |row| row.get(0),
        )?)
    }

    /// Consistent copy of the live database at `dest` (SQLite `VACUUM INTO`).
    pub fn snapshot_to(&self, dest: &Path) -> StoreResult<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        let dest_text = dest.to_string_lossy().into_owned();
        self.conn.execute("VACUUM INTO ?1", [dest_text])?;
        Ok(())
    }
}
