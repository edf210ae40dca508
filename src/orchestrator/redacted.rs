//! Repository secrets that never show up in logs, debug output or argument vectors.
//!
//! A `RedactedString` is only ever handed to a child process through its
//! environment (see [`crate::orchestrator::command::ToolCommand::secret_env`]).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Shown wherever a secret would otherwise be printed
pub static REDACTED_SECRET: &str = "###REDACTED_SECRET###";

/// A repository password or passphrase, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RedactedString(String);

impl RedactedString {
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Self(secret.into())
    }

    /// Plain text, only for building a child's environment.
    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for RedactedString {
    fn from(secret: String) -> Self {
        Self(secret)
    }
}

impl From<&str> for RedactedString {
    fn from(secret: &str) -> Self {
        Self(secret.to_string())
    }
}

impl Debug for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RedactedString({REDACTED_SECRET})")
    }
}

impl Display for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED_SECRET)
    }
}

impl Validate for RedactedString {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        if self.0.trim().is_empty() {
            let mut errors = ValidationErrors::new();
            errors.add(
                "password",
                ValidationError::new("EmptySecret").with_message("repository password is empty".into()),
            );
            return Err(errors);
        }
        Ok(())
    }
}

impl Serialize for RedactedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED_SECRET)
    }
}

impl<'de> Deserialize<'de> for RedactedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}
