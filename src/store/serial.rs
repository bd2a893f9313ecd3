//! Object identifiers and the allocator that hands them out.
//!
//! Serials live in one 31-bit space split in two: values below [`ITEM_SERIAL_BASE`] name
//! mobiles (characters), values at or above it name items. Zero is never issued; it
//! means "unassigned" and, in a `Container` column, "no container".

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};

use crate::store::errors::{StoreError, StoreResult};

/// First item serial. The bit it sets discriminates items from mobiles.
pub const ITEM_SERIAL_BASE: u32 = 0x4000_0000;
/// Last serial either allocator may issue.
pub const MAX_ITEM_SERIAL: u32 = 0x7FFF_FFFF;
pub const MAX_CHARACTER_SERIAL: u32 = ITEM_SERIAL_BASE - 1;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Serial(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialKind {
    Character,
    Item,
}

impl Serial {
    pub const NONE: Serial = Serial(0);

    pub const fn new(raw: u32) -> Self {
        Serial(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    pub fn is_item(self) -> bool {
        self.0 & ITEM_SERIAL_BASE != 0
    }

    pub fn is_character(self) -> bool {
        self.is_assigned() && !self.is_item()
    }

    pub fn kind(self) -> SerialKind {
        if self.is_item() {
            SerialKind::Item
        } else {
            SerialKind::Character
        }
    }

    /// Interpret a stored integer. NULL-equivalent zero and out-of-range values give `None`.
    pub fn from_db(value: i64) -> Option<Serial> {
        match u32::try_from(value) {
            Ok(0) | Err(_) => None,
            Ok(raw) => Some(Serial(raw)),
        }
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for Serial {
    fn from(raw: u32) -> Self {
        Serial(raw)
    }
}

impl ToSql for Serial {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(Value::Integer(i64::from(self.0))))
    }
}

impl FromSql for Serial {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        u32::try_from(raw)
            .map(Serial)
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

/// Hands out fresh serials. Owned by the world; the store raises its floor on connect
/// so nothing it issues collides with a persisted record that is not resident.
#[derive(Debug, Clone)]
pub struct SerialAllocator {
    last_character: u32,
    last_item: u32,
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self {
            last_character: 0,
            last_item: ITEM_SERIAL_BASE - 1,
        }
    }
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_item(&mut self) -> StoreResult<Serial> {
        if self.last_item >= MAX_ITEM_SERIAL {
            return Err(StoreError::SerialSpaceExhausted);
        }
        self.last_item += 1;
        Ok(Serial(self.last_item))
    }

    pub fn next_character(&mut self) -> StoreResult<Serial> {
        if self.last_character >= MAX_CHARACTER_SERIAL {
            return Err(StoreError::SerialSpaceExhausted);
        }
        self.last_character += 1;
        Ok(Serial(self.last_character))
    }

    /// Serial the next call for `kind` would issue, without consuming it.
    pub fn peek_next(&self, kind: SerialKind) -> Serial {
        match kind {
            SerialKind::Character => Serial(self.last_character.saturating_add(1)),
            SerialKind::Item => Serial(self.last_item.saturating_add(1)),
        }
    }

    pub fn high_water(&self, kind: SerialKind) -> Serial {
        match kind {
            SerialKind::Character => Serial(self.last_character),
            SerialKind::Item => Serial(self.last_item),
        }
    }

    /// Raise the high-water mark for the serial's kind. Never lowers it.
    /// Returns whether the mark moved.
    pub fn raise_floor(&mut self, serial: Serial) -> bool {
        let mark = match serial.kind() {
            SerialKind::Character => &mut self.last_character,
            SerialKind::Item => &mut self.last_item,
        };
        if serial.0 > *mark {
            *mark = serial.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_bit_discriminates_kinds() {
        assert!(Serial(ITEM_SERIAL_BASE).is_item());
        assert!(Serial(0x4000_1234).is_item());
        assert!(Serial(1).is_character());
        assert!(!Serial::NONE.is_character());
        assert!(!Serial::NONE.is_assigned());
        assert_eq!(Serial(0x4000_0001).to_string(), "0x40000001");
    }

    #[test]
    fn from_db_treats_zero_as_absent() {
        assert_eq!(Serial::from_db(0), None);
        assert_eq!(Serial::from_db(-5), None);
        assert_eq!(Serial::from_db(42), Some(Serial(42)));
    }

    #[test]
    fn allocator_issues_from_separate_ranges() {
        let mut alloc = SerialAllocator::new();
        assert_eq!(alloc.next_character().unwrap(), Serial(1));
        assert_eq!(alloc.next_item().unwrap(), Serial(ITEM_SERIAL_BASE));
        assert_eq!(alloc.next_item().unwrap(), Serial(ITEM_SERIAL_BASE + 1));
    }

    #[test]
    fn raise_floor_never_lowers() {
        let mut alloc = SerialAllocator::new();
        assert!(alloc.raise_floor(Serial(0x4000_0100)));
        assert!(!alloc.raise_floor(Serial(0x4000_0010)));
        assert!(!alloc.raise_floor(Serial(0x4000_0100)));
        assert_eq!(alloc.next_item().unwrap(), Serial(0x4000_0101));

        assert!(alloc.raise_floor(Serial(77)));
        assert_eq!(alloc.peek_next(SerialKind::Character), Serial(78));
        assert_eq!(alloc.high_water(SerialKind::Item), Serial(0x4000_0101));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut alloc = SerialAllocator::new();
        alloc.raise_floor(Serial(MAX_ITEM_SERIAL));
        assert!(matches!(
            alloc.next_item(),
            Err(StoreError::SerialSpaceExhausted)
        ));
    }
}
