//! Cache item model
//!
//! The snapshot subsystem sees the cache as a flat key space of items. Plain
//! items carry a value; collection items (list, set, map, b-tree) carry a
//! sequence of [`Element`]s that are dumped and replayed separately.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, SnapshotError};

/// Current wall-clock time in seconds since the Unix epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Item type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    /// Plain key-value item
    Kv,
    /// List collection
    List,
    /// Set collection
    Set,
    /// Map collection
    Map,
    /// B-tree collection
    Btree,
}

impl ItemType {
    /// All item types, in code order
    pub const ALL: [ItemType; 5] = [
        ItemType::Kv,
        ItemType::List,
        ItemType::Set,
        ItemType::Map,
        ItemType::Btree,
    ];

    /// Single-letter tag used in key dumps
    pub fn letter(self) -> &'static str {
        match self {
            ItemType::Kv => "K",
            ItemType::List => "L",
            ItemType::Set => "S",
            ItemType::Map => "M",
            ItemType::Btree => "B",
        }
    }

    /// Numeric code used in log records
    pub fn code(self) -> u8 {
        match self {
            ItemType::Kv => 0,
            ItemType::List => 1,
            ItemType::Set => 2,
            ItemType::Map => 3,
            ItemType::Btree => 4,
        }
    }

    /// Decode a numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        ItemType::ALL.get(code as usize).copied()
    }

    /// Whether items of this type hold elements
    pub fn is_collection(self) -> bool {
        !matches!(self, ItemType::Kv)
    }
}

/// Item expiration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expiry {
    /// No expiry set
    Never,
    /// Sticky item, never evicted or expired by time
    Sticky,
    /// Absolute expiry in seconds since the Unix epoch
    At(u64),
}

impl Expiry {
    /// Seconds remaining relative to `now`, floored at 1.
    ///
    /// Returns `None` for `Never` and `Sticky`.
    pub fn remaining(self, now: u64) -> Option<u64> {
        match self {
            Expiry::At(at) if at > now => Some(at - now),
            Expiry::At(_) => Some(1),
            Expiry::Never | Expiry::Sticky => None,
        }
    }

    /// Whether an item with this expiry is dead at `now`
    pub fn is_expired(self, now: u64) -> bool {
        matches!(self, Expiry::At(at) if at < now)
    }
}

/// A cache item as seen by the snapshot subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Item key
    pub key: Vec<u8>,
    /// Item type
    pub item_type: ItemType,
    /// Opaque client flags
    pub flags: u32,
    /// Expiration
    pub expiry: Expiry,
    /// Value bytes (plain items only; empty for collections)
    pub value: Vec<u8>,
}

impl Item {
    /// Create a plain key-value item
    pub fn kv(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Item {
            key: key.into(),
            item_type: ItemType::Kv,
            flags: 0,
            expiry: Expiry::Never,
            value: value.into(),
        }
    }

    /// Create an empty collection item
    pub fn collection(key: impl Into<Vec<u8>>, item_type: ItemType) -> Result<Self> {
        if !item_type.is_collection() {
            return Err(SnapshotError::invalid(format!(
                "{:?} is not a collection type",
                item_type
            )));
        }
        Ok(Item {
            key: key.into(),
            item_type,
            flags: 0,
            expiry: Expiry::Never,
            value: Vec::new(),
        })
    }

    /// Set the expiry
    pub fn with_expiry(mut self, expiry: Expiry) -> Self {
        self.expiry = expiry;
        self
    }

    /// Set the client flags
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this item holds elements
    pub fn is_collection(&self) -> bool {
        self.item_type.is_collection()
    }
}

/// A collection element
///
/// `subkey` holds the map field or b-tree bkey; list and set elements have
/// none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Element {
    /// Map field or b-tree bkey
    pub subkey: Option<Vec<u8>>,
    /// Element value
    pub value: Vec<u8>,
}

impl Element {
    /// List or set element
    pub fn value(value: impl Into<Vec<u8>>) -> Self {
        Element {
            subkey: None,
            value: value.into(),
        }
    }

    /// Map or b-tree element
    pub fn keyed(subkey: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Element {
            subkey: Some(subkey.into()),
            value: value.into(),
        }
    }
}
