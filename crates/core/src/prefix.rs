//! Prefix filter for scoped snapshots

use std::fmt;

/// Which part of the key space a snapshot covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum PrefixFilter {
    /// Every item
    #[default]
    All,
    /// Only items whose key has no prefix
    Null,
    /// Only items under the given prefix
    Prefix(Vec<u8>),
}

impl PrefixFilter {
    /// Build a filter from an optional prefix.
    ///
    /// `None` selects everything; an empty prefix selects keys without one.
    pub fn from_option(prefix: Option<&[u8]>) -> Self {
        match prefix {
            None => PrefixFilter::All,
            Some([]) => PrefixFilter::Null,
            Some(p) => PrefixFilter::Prefix(p.to_vec()),
        }
    }

    /// Whether a key passes the filter, given the prefix delimiter
    pub fn matches(&self, key: &[u8], delimiter: u8) -> bool {
        match self {
            PrefixFilter::All => true,
            PrefixFilter::Null => !key.contains(&delimiter),
            PrefixFilter::Prefix(p) => {
                key.len() > p.len() && key.starts_with(p) && key[p.len()] == delimiter
            }
        }
    }

    /// Human-readable description used in summaries and stats
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PrefixFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixFilter::All => f.write_str("<all>"),
            PrefixFilter::Null => f.write_str("<null>"),
            PrefixFilter::Prefix(p) => f.write_str(&String::from_utf8_lossy(p)),
        }
    }
}
