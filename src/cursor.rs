//! Sort keys and the opaque cursor codec
//!
//! A cursor is the base64 form of a [`SortKey`]: the named, typed values an
//! item is ordered by, ending with a unique tiebreaker. Field names travel
//! with the values so a cursor issued under one ordering is rejected by a
//! connection sorted another way.

use std::cmp::Ordering;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::GraphQLError;

/// Longest cursor token accepted by [`CursorCodec::decode`]
pub const MAX_CURSOR_LEN: usize = 4 * 1024;

/// A single scalar a connection can be sorted by
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum SortValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(#[serde(with = "float_bits")] f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::UInt(_) => 3,
            Self::Float(_) => 4,
            Self::String(_) => 5,
            Self::DateTime(_) => 6,
        }
    }

    /// Whether this is the `Null` value
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether two values can occupy the same sort field.
    ///
    /// `Null` is compatible with every kind since nullable columns mix both.
    pub fn same_kind(&self, other: &Self) -> bool {
        self.is_null() || other.is_null() || self.rank() == other.rank()
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::UInt(a), Self::UInt(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

impl From<bool> for SortValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for SortValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for SortValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for SortValue {
    fn from(value: u32) -> Self {
        Self::UInt(value.into())
    }
}

impl From<u64> for SortValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for SortValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SortValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for SortValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for SortValue {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<DateTime<Utc>> for SortValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl<T: Into<SortValue>> From<Option<T>> for SortValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One named component of a [`SortKey`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    #[serde(rename = "f")]
    pub name: String,
    #[serde(rename = "v")]
    pub value: SortValue,
}

impl Ord for SortField {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for SortField {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered tuple of sort values identifying a position in a connection.
///
/// The last field must be unique across the candidate set (usually the id),
/// otherwise cursors cannot resume deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey {
    fields: Vec<SortField>,
}

impl SortKey {
    /// Empty key; add fields in priority order with [`SortKey::field`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next sort field
    pub fn field(mut self, name: impl Into<String>, value: impl Into<SortValue>) -> Self {
        self.fields.push(SortField {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Fields in priority order
    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }

    /// Number of sort fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of the named field, if present
    pub fn get(&self, name: &str) -> Option<&SortValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    /// True when both keys name the same fields in the same order with compatible values
    pub fn same_shape(&self, other: &SortKey) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name == b.name && a.value.same_kind(&b.value))
    }

    /// Comma separated field names, used in error messages
    pub fn describe_shape(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Cursor encoding/decoding
pub struct CursorCodec;

impl CursorCodec {
    /// Encode a sort key into an opaque cursor
    pub fn encode(key: &SortKey) -> crate::Result<String> {
        Self::encode_structured(key)
    }

    /// Decode a cursor produced by [`CursorCodec::encode`]
    pub fn decode(cursor: &str) -> crate::Result<SortKey> {
        let key: SortKey = Self::decode_structured(cursor)?;
        if key.is_empty() {
            return Err(GraphQLError::InvalidCursor(
                "cursor carries no sort fields".to_string(),
            ));
        }
        Ok(key)
    }

    /// Encode any serializable value as base64 JSON
    pub fn encode_structured<T: Serialize>(value: &T) -> crate::Result<String> {
        let json = serde_json::to_string(value)
            .map_err(|e| GraphQLError::InvalidCursor(e.to_string()))?;
        Ok(BASE64.encode(json.as_bytes()))
    }

    /// Decode a base64 JSON cursor
    pub fn decode_structured<T: for<'de> Deserialize<'de>>(cursor: &str) -> crate::Result<T> {
        let cursor = cursor.trim();
        if cursor.is_empty() {
            return Err(GraphQLError::InvalidCursor("cursor is empty".to_string()));
        }
        if cursor.len() > MAX_CURSOR_LEN {
            return Err(GraphQLError::InvalidCursor(format!(
                "cursor exceeds max length: {} chars (max {})",
                cursor.len(),
                MAX_CURSOR_LEN
            )));
        }

        let bytes = BASE64
            .decode(cursor.as_bytes())
            .map_err(|e| GraphQLError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| GraphQLError::InvalidCursor(e.to_string()))
    }
}

/// Floats travel as their IEEE-754 bits so decoding is exact, NaN included.
mod float_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::assert_err;

    fn product_key(name: &str, id: &str) -> SortKey {
        SortKey::new().field("Products.Name", name).field("Products.Id", id)
    }

    #[test]
    fn test_cursor_round_trip() {
        let created = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let keys = vec![
            product_key("Apple", "1"),
            SortKey::new()
                .field("Orders.CreateAt", created)
                .field("Orders.Total", 12.5_f64)
                .field("Orders.Id", "ord-9"),
            SortKey::new()
                .field("Vouchers.UsageLimit", None::<i64>)
                .field("Vouchers.Active", true)
                .field("Vouchers.Rank", u64::MAX)
                .field("Vouchers.Id", -42_i64),
            SortKey::new()
                .field("Weird.Float", f64::NAN)
                .field("Weird.Name", "naïve ____ : \"quoted\"")
                .field("Weird.Id", 0.1_f64 + 0.2_f64),
        ];

        for key in keys {
            let cursor = CursorCodec::encode(&key).unwrap();
            assert_eq!(CursorCodec::decode(&cursor).unwrap(), key);
        }
    }

    #[test]
    fn test_cursor_is_opaque_base64() {
        let cursor = CursorCodec::encode(&product_key("Banana", "2")).unwrap();
        assert!(!cursor.contains("Banana"));
        assert!(BASE64.decode(cursor.as_bytes()).is_ok());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_err!(CursorCodec::decode(""));
        assert_err!(CursorCodec::decode("   "));
        assert_err!(CursorCodec::decode("not base64 !!"));
        assert_err!(CursorCodec::decode(&BASE64.encode(b"{\"not\":\"a key\"}")));
        assert_err!(CursorCodec::decode(&BASE64.encode(b"[]")));
    }

    #[test]
    fn test_decode_rejects_oversized_cursor() {
        let huge = "A".repeat(MAX_CURSOR_LEN + 4);
        let err = CursorCodec::decode(&huge).unwrap_err();
        assert!(err.to_string().contains("max length"));
    }

    #[test]
    fn test_null_sorts_first() {
        assert!(SortValue::Null < SortValue::from(0_i64));
        assert!(SortValue::Null < SortValue::from(""));
        assert!(SortValue::from(None::<String>) < SortValue::from("a"));
    }

    #[test]
    fn test_key_ordering_is_lexicographic() {
        assert!(product_key("Apple", "9") < product_key("Banana", "1"));
        assert!(product_key("Apple", "1") < product_key("Apple", "2"));
        assert_eq!(product_key("Apple", "1"), product_key("Apple", "1"));
    }

    #[test]
    fn test_same_shape() {
        let a = product_key("Apple", "1");
        assert!(a.same_shape(&product_key("Zed", "99")));
        assert!(!a.same_shape(&SortKey::new().field("Products.Slug", "x").field("Products.Id", "1")));
        assert!(!a.same_shape(&SortKey::new().field("Products.Name", "x")));
        assert!(!a.same_shape(&SortKey::new().field("Products.Name", 7_i64).field("Products.Id", "1")));

        let nullable = SortKey::new().field("Products.Name", None::<String>).field("Products.Id", "1");
        assert!(a.same_shape(&nullable));
        assert_eq!(a.describe_shape(), "Products.Name,Products.Id");
        assert_eq!(a.get("Products.Id"), Some(&SortValue::from("1")));
    }
}
