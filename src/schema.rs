//! HCS schema versions and the table of versions this crate can create against
//!
//! Generation 1 is the legacy per-container document. Generation 2 splits a
//! request into composable hosting-system and container documents.

use serde::{Deserialize, Serialize};
use crate::{Error, Result};

pub const WINDOWS_BUILD_RS1: u32 = 14393;
pub const WINDOWS_BUILD_RS3: u32 = 16299;
pub const WINDOWS_BUILD_RS4: u32 = 17134;
pub const WINDOWS_BUILD_RS5: u32 = 17763;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

/// Every (major, minor) pair a creation request may carry
const SUPPORTED: &[SchemaVersion] = &[
    SchemaVersion::V10,
    SchemaVersion::V20,
    SchemaVersion::V21,
];

impl SchemaVersion {
    pub const V10: SchemaVersion = SchemaVersion { major: 1, minor: 0 };
    pub const V20: SchemaVersion = SchemaVersion { major: 2, minor: 0 };
    pub const V21: SchemaVersion = SchemaVersion { major: 2, minor: 1 };

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_supported(&self) -> bool {
        SUPPORTED.contains(self)
    }

    /// Fails with `UnsupportedSchemaVersion` for any pair outside the table
    pub fn check_supported(&self) -> Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(Error::UnsupportedSchemaVersion {
                major: self.major,
                minor: self.minor,
            })
        }
    }

    pub fn is_v1(&self) -> bool {
        self.major == 1
    }

    pub fn is_v2(&self) -> bool {
        self.major == 2
    }

    /// The version a request defaults to on a host of the given build:
    /// v2.1 from RS5 onwards, v1.0 before it.
    pub fn default_for_build(build: u32) -> Self {
        if build >= WINDOWS_BUILD_RS5 {
            Self::V21
        } else {
            Self::V10
        }
    }

    /// Parse the `hcs.schema.version` runtime option. Accepts the HCS JSON
    /// form (`{"Major":2,"Minor":1}`) as well as a bare `2.1`.
    pub fn parse_option(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.starts_with('{') {
            return serde_json::from_str(value).map_err(|e| Error::InvalidOption {
                key: crate::options::HCS_SCHEMA_VERSION.into(),
                reason: e.to_string(),
            });
        }
        value.parse()
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidOption {
            key: crate::options::HCS_SCHEMA_VERSION.into(),
            reason: format!("'{}' is not of the form MAJOR.MINOR", s),
        };
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_table() {
        assert!(SchemaVersion::V10.is_supported());
        assert!(SchemaVersion::V20.is_supported());
        assert!(SchemaVersion::V21.is_supported());
        assert!(!SchemaVersion::new(1, 1).is_supported());
        assert!(!SchemaVersion::new(3, 0).is_supported());
        assert!(!SchemaVersion::new(0, 0).is_supported());
    }

    #[test]
    fn test_check_supported_reports_pair() {
        match SchemaVersion::new(2, 7).check_supported() {
            Err(Error::UnsupportedSchemaVersion { major, minor }) => {
                assert_eq!((major, minor), (2, 7));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_generation() {
        assert!(SchemaVersion::V10.is_v1());
        assert!(!SchemaVersion::V21.is_v1());
        assert!(SchemaVersion::V20.is_v2());
    }

    #[test]
    fn test_default_for_build() {
        assert_eq!(SchemaVersion::default_for_build(WINDOWS_BUILD_RS4), SchemaVersion::V10);
        assert_eq!(SchemaVersion::default_for_build(WINDOWS_BUILD_RS5), SchemaVersion::V21);
        assert_eq!(SchemaVersion::default_for_build(19041), SchemaVersion::V21);
    }

    #[test]
    fn test_parse_option() {
        assert_eq!(SchemaVersion::parse_option("2.1").unwrap(), SchemaVersion::V21);
        assert_eq!(
            SchemaVersion::parse_option(r#"{"Major":1,"Minor":0}"#).unwrap(),
            SchemaVersion::V10
        );
        assert!(SchemaVersion::parse_option("two").is_err());
        assert!(SchemaVersion::parse_option("{bad json").is_err());
    }

    #[test]
    fn test_serialization_matches_hcs() {
        let json = serde_json::to_value(SchemaVersion::V21).unwrap();
        assert_eq!(json, serde_json::json!({ "Major": 2, "Minor": 1 }));
    }
}
