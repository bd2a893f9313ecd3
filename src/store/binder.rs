//! Schema binder: turns a table's declared columns into reusable statement text.
//!
//! Binding happens once per table per connection. The statement strings are then run
//! through the connection's prepared-statement cache, so each is compiled once and
//! executed many times. Rebinding after a reconnect produces fresh handles.

use std::collections::HashMap;

use rusqlite::{Connection, Row};

use crate::store::errors::{StoreError, StoreResult};
use crate::store::property::{PropertySet, Value, CONTAINER_COLUMN, SERIAL_COLUMN};

/// Column affinity as SQLite derives it from the declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Numeric,
}

impl ColumnType {
    pub fn from_declared(decl: &str) -> Self {
        let upper = decl.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ColumnType::Text
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else {
            ColumnType::Numeric
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundColumn {
    pub name: String,
    pub ty: ColumnType,
    /// NOT NULL or part of the primary key. Required columns read into the main tier.
    pub required: bool,
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Statement text and column mapping for one main table.
#[derive(Debug, Clone)]
pub struct TableBinding {
    table: String,
    columns: Vec<BoundColumn>,
    by_name: HashMap<String, usize>,
    insert_sql: String,
    update_sql: String,
    select_sql: String,
}

impl TableBinding {
    /// Introspect `table` and build its statements. Zero columns (missing table) or
    /// statements that fail to prepare are fatal for the connection.
    pub fn bind(conn: &Connection, table: &str) -> StoreResult<Self> {
        let mut stmt = conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
        let columns = stmt
            .query_map([table], |row| {
                let name: String = row.get(0)?;
                let decl: String = row.get(1)?;
                let not_null: i64 = row.get(2)?;
                let pk: i64 = row.get(3)?;
                Ok(BoundColumn {
                    name,
                    ty: ColumnType::from_declared(&decl),
                    required: not_null != 0 || pk != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(StoreError::EmptySchema {
                table: table.to_string(),
            });
        }
        if !columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(SERIAL_COLUMN))
        {
            return Err(StoreError::Integrity(format!(
                "table {table} has no {SERIAL_COLUMN} column"
            )));
        }

        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders
        );
        let assignments: Vec<String> = names.iter().map(|n| format!("{n} = ?")).collect();
        let update_sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(SERIAL_COLUMN)
        );
        let select_sql = format!("SELECT {} FROM {}", names.join(", "), quote_ident(table));

        for sql in [&insert_sql, &update_sql, &select_sql] {
            conn.prepare_cached(sql).map_err(|source| StoreError::Prepare {
                table: table.to_string(),
                source,
            })?;
        }

        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.to_ascii_lowercase(), i))
            .collect();

        log::debug!("bound {} ({} columns)", table, columns.len());
        Ok(Self {
            table: table.to_string(),
            columns,
            by_name,
            insert_sql,
            update_sql,
            select_sql,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[BoundColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&BoundColumn> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.columns[i])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_ascii_lowercase())
    }

    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    /// `UPDATE` with one placeholder per column and a trailing serial placeholder.
    pub fn update_sql(&self) -> &str {
        &self.update_sql
    }

    /// `SELECT <all columns> FROM <table>`; callers append their own `WHERE`.
    pub fn select_sql(&self) -> &str {
        &self.select_sql
    }

    /// Values in column order for `insert_sql`, plus the fields that have no column.
    /// Missing fields bind as NULL, and so does a container of 0.
    pub fn bind_values(&self, set: &PropertySet) -> (Vec<Value>, Vec<(String, Value)>) {
        let mut values = vec![Value::Null; self.columns.len()];
        let mut filled = vec![false; self.columns.len()];
        let mut leftovers = Vec::new();
        for (name, value) in set.main.iter().chain(set.unusual.iter()) {
            match self.by_name.get(&name.to_ascii_lowercase()) {
                Some(&i) if !filled[i] => {
                    values[i] = if self.columns[i].name.eq_ignore_ascii_case(CONTAINER_COLUMN) {
                        set.container().map_or(Value::Null, Value::from)
                    } else {
                        value.clone()
                    };
                    filled[i] = true;
                }
                Some(_) => {}
                None => leftovers.push((name.clone(), value.clone())),
            }
        }
        (values, leftovers)
    }

    /// Values for `update_sql`: the insert values followed by the serial.
    pub fn bind_update_values(&self, set: &PropertySet) -> (Vec<Value>, Vec<(String, Value)>) {
        let (mut values, leftovers) = self.bind_values(set);
        values.push(Value::from(set.serial()));
        (values, leftovers)
    }

    /// Read a row produced by `select_sql` into a property set. NULL columns are
    /// skipped; required columns land in the main tier, the rest in the unusual tier.
    pub fn extract(&self, row: &Row<'_>) -> rusqlite::Result<PropertySet> {
        let mut set = PropertySet::default();
        for (i, col) in self.columns.iter().enumerate() {
            let value = Value::from_sql_ref(row.get_ref(i)?);
            if value.is_null() {
                continue;
            }
            if col.required {
                set.main.insert(col.name.clone(), value);
            } else {
                set.unusual.insert(col.name.clone(), value);
            }
        }
        Ok(set)
    }
}
