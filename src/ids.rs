use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ENDPOINT_ID_LENGTH;

/// Short opaque endpoint identifier, stable within a session.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct EndpointId(String);

impl EndpointId {
    /// Creates an endpoint id from its raw string form.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a random printable endpoint id.
    #[must_use]
    pub fn generate() -> Self {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut rng = rand::thread_rng();
        let id: String = (0..ENDPOINT_ID_LENGTH)
            .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
            .collect();
        Self(id)
    }

    /// Returns the raw string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identifier of the advertised service a connection belongs to.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct ServiceId(String);

impl ServiceId {
    /// Creates a service id from its raw string form.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Session-unique payload identifier.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
pub struct PayloadId(i64);

impl PayloadId {
    /// Creates a payload id from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Generates a random positive payload id.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(1..i64::MAX))
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn generated_endpoint_ids_have_fixed_length() {
        let id = EndpointId::generate();
        assert_eq!(ENDPOINT_ID_LENGTH, id.as_str().len());
        assert_eq!(
            true,
            id.as_str().chars().all(|c| c.is_ascii_alphanumeric())
        );
    }

    #[test]
    fn generated_payload_ids_are_positive() {
        for _attempt in 0..64 {
            assert_eq!(true, PayloadId::generate().value() > 0);
        }
    }

    #[test]
    fn endpoint_id_displays_raw_value() {
        assert_eq!("E1", EndpointId::from("E1").to_string());
    }
}
