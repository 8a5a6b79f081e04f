//! Core types for cachesnap
//!
//! This crate defines the foundational types shared by the durability layer
//! and the snapshot engine:
//! - Item, Element, ItemType, Expiry: the cache item model
//! - SnapshotMode: KEY, DATA, CHKPT
//! - PrefixFilter: all / null / specific prefix
//! - SnapshotError: error taxonomy
//! - limits: defaults and format limits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod item;
pub mod limits;
pub mod mode;
pub mod prefix;

pub use error::{Result, SnapshotError};
pub use item::{now_secs, Element, Expiry, Item, ItemType};
pub use mode::SnapshotMode;
pub use prefix::PrefixFilter;
