//! Version stamps for optimistic concurrency.

use crate::value::{FieldId, FieldValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparable version stamp of one entity.
///
/// A stamp is the ordered list of the entity's version-bearing fields and
/// their values. Types without version-bearing fields report
/// [`VersionInfo::Void`], meaning "not tracked"; two void stamps are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VersionInfo {
    /// Version is not tracked.
    #[default]
    Void,
    /// Ordered (field, value) pairs.
    Fields(Vec<(FieldId, FieldValue)>),
}

impl VersionInfo {
    /// Builds a stamp, collapsing an empty list to [`VersionInfo::Void`].
    pub fn from_pairs(mut pairs: Vec<(FieldId, FieldValue)>) -> Self {
        if pairs.is_empty() {
            return VersionInfo::Void;
        }
        pairs.sort_by_key(|(field, _)| *field);
        VersionInfo::Fields(pairs)
    }

    /// Returns true if the version is not tracked.
    pub fn is_void(&self) -> bool {
        matches!(self, VersionInfo::Void)
    }

    /// Returns the (field, value) pairs.
    pub fn pairs(&self) -> &[(FieldId, FieldValue)] {
        match self {
            VersionInfo::Void => &[],
            VersionInfo::Fields(pairs) => pairs,
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionInfo::Void => f.write_str("void"),
            VersionInfo::Fields(pairs) => {
                f.write_str("{")?;
                for (i, (field, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}={value}")?;
                }
                f.write_str("}")
            }
        }
    }
}
