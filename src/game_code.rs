//! Join code generation and parsing
//!
//! This module provides the short alphanumeric codes participants type in to
//! find a session. Codes are six characters from `[A-Z0-9]`; user input is
//! accepted in any case and canonicalized to uppercase before any lookup.

use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::constants::code::{ALPHABET, LENGTH};

/// A join code identifying an active session
///
/// The code is always held in canonical uppercase form, so two codes compare
/// equal exactly when a participant would consider them the same code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameCode([u8; LENGTH]);

/// Errors that can occur when parsing a join code
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The input has the wrong length or contains characters outside `[A-Z0-9]`
    #[error("join code must be {LENGTH} letters or digits")]
    InvalidCode,
}

impl GameCode {
    /// Creates a new random join code
    ///
    /// Uniqueness is not checked here; see [`crate::registry::CodeRegistry`].
    pub fn random() -> Self {
        let mut code = [0; LENGTH];
        for c in &mut code {
            *c = ALPHABET[fastrand::usize(..ALPHABET.len())];
        }
        Self(code)
    }

    /// Returns the canonical string form of the code
    pub fn as_str(&self) -> &str {
        // only ASCII bytes from ALPHABET are ever stored
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl Default for GameCode {
    /// Creates a new random join code (same as `random()`)
    fn default() -> Self {
        Self::random()
    }
}

impl Display for GameCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameCode {
    type Err = Error;

    /// Parses a join code, ignoring surrounding whitespace and letter case
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidCode` if the trimmed input is not exactly six
    /// ASCII letters or digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != LENGTH {
            return Err(Error::InvalidCode);
        }

        let mut code = [0; LENGTH];
        for (slot, byte) in code.iter_mut().zip(s.bytes()) {
            let byte = byte.to_ascii_uppercase();
            if !ALPHABET.contains(&byte) {
                return Err(Error::InvalidCode);
            }
            *slot = byte;
        }

        Ok(Self(code))
    }
}

impl Serialize for GameCode {
    /// Serializes the join code as its canonical string
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GameCode {
    /// Deserializes a join code from a string, canonicalizing its case
    fn deserialize<D>(deserializer: D) -> Result<GameCode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        GameCode::from_str(&s).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}
