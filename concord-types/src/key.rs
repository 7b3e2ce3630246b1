//! Entity keys.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The `(item_type, item_id)` pair identifying one reconcilable unit of data.
///
/// The string form is `item_type:item_id`. The type part may not contain a
/// colon; the id part may.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Kind of entity, e.g. `"fund_nav"`.
    pub item_type: String,
    /// Identifier of the entity within its type.
    pub item_id: String,
}

impl ItemKey {
    /// Creates a key, rejecting empty parts and colons in the type.
    pub fn new(item_type: impl Into<String>, item_id: impl Into<String>) -> Result<Self, Error> {
        let item_type = item_type.into();
        let item_id = item_id.into();
        if item_type.is_empty() || item_id.is_empty() {
            return Err(Error::InvalidKey(format!(
                "empty component in '{item_type}:{item_id}'"
            )));
        }
        if item_type.contains(':') {
            return Err(Error::InvalidKey(format!(
                "item type '{item_type}' may not contain ':'"
            )));
        }
        Ok(Self { item_type, item_id })
    }

    /// Storage key used by the persistence layer.
    #[must_use]
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.item_type, self.item_id)
    }
}

impl FromStr for ItemKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (item_type, item_id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidKey(format!("missing ':' in '{s}'")))?;
        Self::new(item_type, item_id)
    }
}
