//! The closed set of synchronized tables.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a synchronized table.
///
/// The set is fixed at compile time. Each table pairs a local store table
/// with the replicated map of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableId {
    Sessions,
    SessionGroups,
    Topics,
    Messages,
    Plugins,
}

impl TableId {
    /// Every table, in bootstrap order.
    pub const ALL: [TableId; 5] = [
        TableId::Sessions,
        TableId::SessionGroups,
        TableId::Topics,
        TableId::Messages,
        TableId::Plugins,
    ];

    /// Name of the replicated map backing this table.
    pub fn as_str(&self) -> &'static str {
        match self {
            TableId::Sessions => "sessions",
            TableId::SessionGroups => "sessionGroups",
            TableId::Topics => "topics",
            TableId::Messages => "messages",
            TableId::Plugins => "plugins",
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TableId::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| Error::UnknownTable(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_tables() {
        for table in TableId::ALL {
            assert_eq!(table.as_str().parse::<TableId>().unwrap(), table);
        }
    }

    #[test]
    fn parse_unknown_table() {
        let err = "users".parse::<TableId>().unwrap_err();
        assert_eq!(err, Error::UnknownTable("users".into()));
    }

    #[test]
    fn serde_matches_map_names() {
        let json = serde_json::to_string(&TableId::SessionGroups).unwrap();
        assert_eq!(json, r#""sessionGroups""#);
    }
}
