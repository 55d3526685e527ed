//! Typed identifiers for hosts, allocations and requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{define_id, define_index, IdError};

// =============================================================================
// Fleet
// =============================================================================

define_index!(HostIndex, u32);

/// Maximum length of a host id as written in the rack inventory.
pub const HOST_ID_MAX_LEN: usize = 64;

/// Stable identifier of a physical host.
///
/// Host ids come from the rack inventory (typically the rack position or
/// asset tag, e.g. `rack01-server12`), so unlike the allocator-minted ids
/// they are operator-chosen strings. Allowed characters are ASCII
/// alphanumerics, `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(String);

impl HostId {
    /// Validates and wraps a host id.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > HOST_ID_MAX_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: HOST_ID_MAX_LEN,
            });
        }
        if let Some(found) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdError::InvalidCharacter {
                id: s.to_string(),
                found,
            });
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HostId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for HostId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for HostId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for HostId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Allocations
// =============================================================================

define_index!(AllocationIndex, u64);

// =============================================================================
// Requests and Events
// =============================================================================

define_id!(RequestId, "req");
define_id!(EventId, "evt");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_id_roundtrip() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("req_"));
    }

    #[test]
    fn test_request_id_invalid_prefix() {
        let result: Result<RequestId, _> = "evt_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_request_id_missing_separator() {
        let result: Result<RequestId, _> = "req01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::MissingSeparator)));
    }

    #[test]
    fn test_request_id_invalid_ulid() {
        let result: Result<RequestId, _> = "req_invalid".parse();
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_host_id_accepts_rack_names() {
        let id = HostId::parse("rack01-server12.lab").unwrap();
        assert_eq!(id.as_str(), "rack01-server12.lab");
    }

    #[test]
    fn test_host_id_rejects_empty_and_spaces() {
        assert!(HostId::parse("").unwrap_err().is_empty());
        assert!(matches!(
            HostId::parse("rack 01"),
            Err(IdError::InvalidCharacter { found: ' ', .. })
        ));
    }

    #[test]
    fn test_host_id_too_long() {
        let long = "x".repeat(HOST_ID_MAX_LEN + 1);
        assert!(matches!(
            HostId::parse(&long),
            Err(IdError::TooLong { .. })
        ));
    }

    #[test]
    fn test_host_id_json_is_plain_string() {
        let id = HostId::parse("server3").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"server3\"");
        let bad: Result<HostId, _> = serde_json::from_str("\"bad/id\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_allocation_index_serializes_as_integer() {
        let index = AllocationIndex::new(7);
        assert_eq!(serde_json::to_string(&index).unwrap(), "7");
        let parsed: AllocationIndex = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_index_next_is_monotonic() {
        let first = AllocationIndex::FIRST;
        assert_eq!(first.value(), 0);
        assert!(first.next() > first);
        assert_eq!(HostIndex::new(3).next(), HostIndex::new(4));
    }

    #[test]
    fn test_index_from_str() {
        assert_eq!("12".parse::<HostIndex>().unwrap(), HostIndex::new(12));
        assert!(matches!(
            "-1".parse::<HostIndex>(),
            Err(IdError::InvalidIndex(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_host_id_accepts_allowed_alphabet(s in "[A-Za-z0-9._-]{1,64}") {
            let id = HostId::parse(&s).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }
    }
}
