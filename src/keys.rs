//! Composite loader keys
//!
//! Relations keyed by two ids (a shipping method within a channel, a variant
//! within a warehouse, ...) use [`CompositeKey`] instead of ad hoc string
//! concatenation. The pair itself is the loader key; [`CompositeKey::encode`]
//! and `FromStr` give the one canonical string form when a string is required.

use std::fmt;
use std::str::FromStr;

use crate::GraphQLError;

/// Separator between the two parts of an encoded composite key
pub const KEY_DELIMITER: &str = "__";

/// Loader key made of two identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey<A, B> {
    pub first: A,
    pub second: B,
}

impl<A, B> CompositeKey<A, B> {
    /// Pair two identifiers
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    pub fn into_parts(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: fmt::Display, B: fmt::Display> CompositeKey<A, B> {
    /// Canonical `first__second` string form.
    ///
    /// Fails when either part contains the delimiter, since the result could
    /// not be split back unambiguously.
    pub fn encode(&self) -> crate::Result<String> {
        let first = self.first.to_string();
        let second = self.second.to_string();
        for part in [&first, &second] {
            if part.contains(KEY_DELIMITER) {
                return Err(GraphQLError::InvalidKey(format!(
                    "key part {:?} contains the reserved delimiter {:?}",
                    part, KEY_DELIMITER
                )));
            }
        }
        Ok(format!("{}{}{}", first, KEY_DELIMITER, second))
    }
}

impl<A, B> FromStr for CompositeKey<A, B>
where
    A: FromStr,
    B: FromStr,
    A::Err: fmt::Display,
    B::Err: fmt::Display,
{
    type Err = GraphQLError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(KEY_DELIMITER);
        let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(GraphQLError::InvalidKey(format!(
                "expected exactly one {:?} in composite key {:?}",
                KEY_DELIMITER, s
            )));
        };

        let first = first
            .parse()
            .map_err(|e: A::Err| GraphQLError::InvalidKey(format!("first part: {}", e)))?;
        let second = second
            .parse()
            .map_err(|e: B::Err| GraphQLError::InvalidKey(format!("second part: {}", e)))?;
        Ok(Self::new(first, second))
    }
}

impl<A, B> From<(A, B)> for CompositeKey<A, B> {
    fn from((first, second): (A, B)) -> Self {
        Self::new(first, second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    type ListingKey = CompositeKey<String, String>;

    #[test]
    fn test_encode_and_parse() {
        let key = ListingKey::new("method-1".into(), "channel-7".into());
        let encoded = key.encode().unwrap();
        assert_eq!(encoded, "method-1__channel-7");
        assert_eq!(encoded.parse::<ListingKey>().unwrap(), key);
    }

    #[test]
    fn test_encode_rejects_delimiter_in_parts() {
        let key = ListingKey::new("method__1".into(), "channel".into());
        let err = key.encode().unwrap_err();
        assert!(matches!(err, GraphQLError::InvalidKey(_)));
    }

    #[test]
    fn test_parse_rejects_ambiguous_strings() {
        assert_err!("no-delimiter".parse::<ListingKey>());
        assert_err!("a__b__c".parse::<ListingKey>());
    }

    #[test]
    fn test_typed_parts() {
        let key: CompositeKey<u64, String> = "42__eu-west".parse().unwrap();
        assert_eq!(key.into_parts(), (42, "eu-west".to_string()));
        assert_err!("x__eu-west".parse::<CompositeKey<u64, String>>());
    }

    #[test]
    fn test_pairs_are_distinct_keys() {
        use std::collections::HashSet;
        let keys: HashSet<ListingKey> = [
            ("a".to_string(), "b".to_string()).into(),
            ("b".to_string(), "a".to_string()).into(),
            ("a".to_string(), "b".to_string()).into(),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 2);
    }
}
