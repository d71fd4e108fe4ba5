//! Core types shared by every tenantcore crate.
//!
//! String-shaped identifiers use smart constructors so an instance is always
//! valid once built, following the "parse, don't validate" principle.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Identifier of the acting user. `0` means "no user" (system activity).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// The id recorded when no user is present.
    pub const SYSTEM: Self = Self(0);

    /// Wraps a raw user id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true for the system user.
    pub const fn is_system(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Identifier of a tenant. `0` means "not tenant scoped".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TenantId(i64);

impl TenantId {
    /// Placeholder used before a tenant has been assigned.
    pub const UNASSIGNED: Self = Self(0);

    /// Wraps a raw tenant id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns true until a tenant has been assigned.
    pub const fn is_unassigned(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Correlation id of one inbound request.
///
/// `RequestId` values are guaranteed to be non-empty and at most 128 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh request id from a UUIDv7.
    pub fn generate() -> Result<Self, RequestIdError> {
        Self::try_new(uuid::Uuid::now_v7().simple().to_string())
    }
}

/// Name of a table or collection.
///
/// Names are restricted to ASCII letters, digits and underscores so backends may
/// splice them into statements as identifiers.
#[nutype(
    validate(predicate = |name: &str| {
        !name.is_empty()
            && name.len() <= 63
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit())
    }),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Deref, Display)
)]
pub struct CollectionName(String);

/// Entity identifier.
///
/// Relational tables use numeric ids; the document store uses object identifiers
/// rendered as hex strings. Composite keys are expressed as criteria instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Numeric identifier (snowflake ids and plain integers)
    Int(i64),
    /// String identifier (document object ids and natural keys)
    Text(String),
}

impl EntityId {
    /// Returns the id as an integer when it is numeric or a numeric string.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(id) => Some(*id),
            Self::Text(raw) => raw.parse().ok(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => id.fmt(f),
            Self::Text(raw) => f.write_str(raw),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self::Text(raw.to_string())
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self::Text(raw)
    }
}

/// A point in time used for soft-delete markers.
///
/// This is the single canonical representation of `deleted_at`. Backends
/// convert it at their boundary: a timestamp column in the relational store,
/// unix seconds in the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Builds a timestamp from unix seconds.
    pub fn from_unix_seconds(seconds: i64) -> Option<Self> {
        Utc.timestamp_opt(seconds, 0).single().map(Self)
    }

    /// Parses an RFC 3339 string.
    pub fn parse_rfc3339(raw: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|datetime| Self(datetime.with_timezone(&Utc)))
    }

    /// Returns whole unix seconds.
    pub const fn unix_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Renders the RFC 3339 form used in stored documents.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Current unix time in whole seconds, the unit of `created_at`/`updated_at`.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn collection_name_accepts_identifiers(s in "[a-z_][a-z0-9_]{0,40}") {
            prop_assert!(CollectionName::try_new(s).is_ok());
        }

        #[test]
        fn collection_name_rejects_punctuation(s in "[a-z]{1,10}[ ;'\"-][a-z]{0,10}") {
            prop_assert!(CollectionName::try_new(s).is_err());
        }

        #[test]
        fn timestamp_survives_unix_seconds(seconds in 0i64..4_000_000_000) {
            let ts = Timestamp::from_unix_seconds(seconds).expect("in range");
            prop_assert_eq!(ts.unix_seconds(), seconds);
        }
    }

    #[test]
    fn request_id_rejects_blank_values() {
        assert!(RequestId::try_new("   ").is_err());
        assert_eq!(
            RequestId::try_new(" abc ").expect("valid").as_ref(),
            "abc"
        );
    }

    #[test]
    fn generated_request_ids_are_distinct_hex() {
        let first = RequestId::generate().unwrap();
        let second = RequestId::generate().unwrap();

        assert_ne!(first, second);
        assert_eq!(first.as_ref().len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn entity_id_serializes_untagged() {
        assert_eq!(serde_json::to_value(EntityId::Int(42)).unwrap(), 42);
        assert_eq!(
            serde_json::to_value(EntityId::from("abc")).unwrap(),
            "abc"
        );
        let parsed: EntityId = serde_json::from_str("\"65f1c2\"").unwrap();
        assert_eq!(parsed, EntityId::Text("65f1c2".to_string()));
    }

    #[test]
    fn entity_id_reads_numeric_strings() {
        assert_eq!(EntityId::from("17").as_i64(), Some(17));
        assert_eq!(EntityId::from("abc").as_i64(), None);
    }

    #[test]
    fn timestamp_round_trips_rfc3339() {
        let ts = Timestamp::from_unix_seconds(1_700_000_000).unwrap();
        assert_eq!(Timestamp::parse_rfc3339(&ts.to_rfc3339()), Some(ts));
    }
}
