//! Nicknames
//!
//! A nickname is trimmed, limited in length, checked by the profanity
//! filter and unique within its session regardless of case. Sessions with
//! generated names ignore what the player typed and draw a name instead.

use std::collections::{HashMap, hash_map::Entry};

use heck::ToTitleCase;
use rustrict::CensorStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{constants::player::MAX_NICKNAME_LENGTH, presence::Id};

/// Generated candidates drawn before falling back to "Player N"
const GENERATION_ATTEMPTS: usize = 32;

/// Source of generated nicknames, with the number of words per name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, garde::Validate)]
pub enum NameStyle {
    /// "Gaius Julius" or, with three words, "Gaius Julius Caesar"
    Roman(#[garde(range(min = 2, max = 3))] usize),
    /// Adjectives followed by an animal, e.g. "Brave Otter"
    Petname(#[garde(range(min = 2, max = 3))] usize),
}

impl Default for NameStyle {
    fn default() -> Self {
        Self::Petname(2)
    }
}

impl NameStyle {
    /// Draws one title-cased candidate
    ///
    /// The candidate may still be too long or taken; see
    /// [`Names::assign_generated`].
    pub fn candidate(&self) -> String {
        match self {
            Self::Roman(words) => romanname::romanname(romanname::NameConfig {
                praenomen: *words > 2,
            }),
            Self::Petname(words) => petname::petname(*words as u8, " ").unwrap_or_default(),
        }
        .to_title_case()
    }
}

/// Reasons a nickname is refused
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Another player of the session holds it, ignoring case
    #[error("nickname is taken")]
    Used,
    /// The player already has a nickname
    #[error("player already has a nickname")]
    Assigned,
    /// Nothing is left after trimming
    #[error("nickname is empty")]
    Empty,
    /// Flagged by the profanity filter
    #[error("nickname is not allowed")]
    Sinful,
    /// Longer than the limit after trimming
    #[error("nickname is longer than {MAX_NICKNAME_LENGTH} characters")]
    TooLong,
}

/// Trims a raw nickname and checks it against the length and content rules
///
/// # Errors
///
/// * `Error::Empty` - Nothing remains after trimming
/// * `Error::TooLong` - More than 20 characters remain after trimming
/// * `Error::Sinful` - The nickname is flagged by the content filter
pub fn normalize(name: &str) -> Result<String, Error> {
    let name = rustrict::trim_whitespace(name);
    if name.is_empty() {
        return Err(Error::Empty);
    }
    if name.chars().count() > MAX_NICKNAME_LENGTH {
        return Err(Error::TooLong);
    }
    if name.is_inappropriate() {
        return Err(Error::Sinful);
    }
    Ok(name.to_owned())
}

#[derive(Deserialize)]
struct NamesSerde {
    mapping: HashMap<Id, String>,
}

/// Nicknames taken in one session
///
/// Uniqueness is checked on the lower-cased nickname, so "Ada" and "ada"
/// cannot both join the same session.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(from = "NamesSerde")]
pub struct Names {
    mapping: HashMap<Id, String>,

    /// Lower-cased nickname to holder, rebuilt on deserialize
    #[serde(skip_serializing)]
    reverse_mapping: HashMap<String, Id>,
}

impl From<NamesSerde> for Names {
    /// Rebuilds the reverse mapping, which is not serialized
    fn from(serde: NamesSerde) -> Self {
        let NamesSerde { mapping } = serde;
        let reverse_mapping = mapping
            .iter()
            .map(|(id, name)| (name.to_lowercase(), *id))
            .collect();
        Self {
            mapping,
            reverse_mapping,
        }
    }
}

impl Names {
    /// Nickname of a player
    pub fn name_of(&self, id: &Id) -> Option<&str> {
        self.mapping.get(id).map(String::as_str)
    }

    /// Holder of a nickname, ignoring case
    pub fn holder(&self, name: &str) -> Option<Id> {
        self.reverse_mapping.get(&name.trim().to_lowercase()).copied()
    }

    /// Normalizes `name` and gives it to `id`
    ///
    /// # Errors
    ///
    /// Any error from [`normalize`], plus:
    ///
    /// * `Error::Assigned` - `id` already has a nickname
    /// * `Error::Used` - Someone else holds it
    pub fn set_name(&mut self, id: Id, name: &str) -> Result<String, Error> {
        let name = normalize(name)?;
        let key = name.to_lowercase();

        if self.mapping.contains_key(&id) {
            return Err(Error::Assigned);
        }
        let Entry::Vacant(slot) = self.reverse_mapping.entry(key) else {
            return Err(Error::Used);
        };
        slot.insert(id);
        self.mapping.insert(id, name.clone());

        Ok(name)
    }

    /// Assigns a generated nickname in the given style
    ///
    /// Candidates that are too long, filtered or taken are skipped; if none
    /// fits, a numbered fallback ("Player 7") is used.
    ///
    /// # Errors
    ///
    /// Returns `Error::Assigned` if the player already has a nickname.
    pub fn assign_generated(&mut self, id: Id, style: NameStyle) -> Result<String, Error> {
        if self.mapping.contains_key(&id) {
            return Err(Error::Assigned);
        }

        for _ in 0..GENERATION_ATTEMPTS {
            if let Ok(name) = self.set_name(id, &style.candidate()) {
                return Ok(name);
            }
        }

        (self.mapping.len() + 1..)
            .find_map(|n| self.set_name(id, &format!("Player {n}")).ok())
            .ok_or(Error::Used)
    }

    /// Number of assigned nicknames
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Whether no nickname has been assigned
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_set_name_and_lookup() {
        let mut names = Names::default();
        let id = Id::new();

        assert_eq!(names.set_name(id, "  Ada Lovelace "), Ok(String::from("Ada Lovelace")));
        assert_eq!(names.name_of(&id), Some("Ada Lovelace"));
        assert_eq!(names.holder("ada lovelace"), Some(id));
        assert_eq!(names.holder("Grace"), None);
    }

    #[test]
    fn test_length_limit_in_characters_after_trimming() {
        let exact = "é".repeat(MAX_NICKNAME_LENGTH);
        assert_eq!(normalize(&exact), Ok(exact.clone()));
        assert_eq!(normalize(&format!("  {exact}\t")), Ok(exact));
        assert_eq!(
            normalize(&"x".repeat(MAX_NICKNAME_LENGTH + 1)),
            Err(Error::TooLong)
        );
    }

    #[test]
    fn test_blank_nicknames() {
        for blank in ["", "   ", "\t\n"] {
            assert_eq!(normalize(blank), Err(Error::Empty));
        }
    }

    #[test]
    fn test_profanity_is_refused() {
        assert_eq!(normalize("fuck"), Err(Error::Sinful));
    }

    #[test]
    fn test_taken_ignoring_case() {
        let mut names = Names::default();
        names.set_name(Id::new(), "Bo").unwrap();

        assert_eq!(names.set_name(Id::new(), "bo"), Err(Error::Used));
        assert_eq!(names.set_name(Id::new(), " BO "), Err(Error::Used));
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_second_name_is_refused_and_not_reserved() {
        let mut names = Names::default();
        let id = Id::new();
        names.set_name(id, "First").unwrap();

        assert_eq!(names.set_name(id, "Second"), Err(Error::Assigned));
        assert!(names.set_name(Id::new(), "Second").is_ok());
    }

    #[test]
    fn test_assign_generated_fits_limits() {
        let mut names = Names::default();
        for style in [NameStyle::Petname(2), NameStyle::Petname(3), NameStyle::Roman(3)] {
            for _ in 0..20 {
                let name = names.assign_generated(Id::new(), style).unwrap();
                assert!(!name.is_empty());
                assert!(name.chars().count() <= MAX_NICKNAME_LENGTH);
            }
        }
        assert_eq!(names.len(), 60);
    }

    #[test]
    fn test_assign_generated_rejects_named_player() {
        let mut names = Names::default();
        let id = Id::new();
        names.set_name(id, "Chosen").unwrap();
        assert_eq!(
            names.assign_generated(id, NameStyle::default()),
            Err(Error::Assigned)
        );
    }

    #[test]
    fn test_serde_rebuilds_holders() {
        let mut names = Names::default();
        let id = Id::new();
        names.set_name(id, "Persisted").unwrap();

        let json = serde_json::to_string(&names).unwrap();
        let mut restored: Names = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.holder("persisted"), Some(id));
        assert_eq!(restored.set_name(Id::new(), "PERSISTED"), Err(Error::Used));
    }
}
