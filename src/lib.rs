//! # Quizhall
//!
//! Session engine for live multi-player quizzes. A host creates a session
//! from a quiz, players join with a short code, questions run against a
//! deadline and answers are scored by correctness and speed.
//!
//! The [`game::Game`] type holds the rules and is entirely synchronous. A
//! [`session::Session`] serializes access to one game, persists every
//! transition before it becomes visible and hands updates to the
//! collaborators in [`collaborators`]. The [`engine::Engine`] creates
//! sessions and resolves join codes to them.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
use derive_where::derive_where;
use itertools::Itertools;
use serde::Serialize;

pub mod collaborators;
pub mod constants;
pub mod engine;
pub mod game;
pub mod game_code;
pub mod leaderboard;
pub mod names;
pub mod presence;
pub mod quiz;
pub mod registry;
pub mod scoring;
pub mod session;

pub use engine::Engine;
pub use game::{Envelope, Options, Phase, UpdateMessage};
pub use game_code::GameCode;
pub use presence::Id;
pub use quiz::{AnswerValue, Question, Quiz};
pub use session::{Services, Session};

/// A list cut down for display that remembers its full length
///
/// Used for leaderboards: a broadcast shows the top rows and how many
/// players there are in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[derive_where(Default)]
pub struct TruncatedVec<T> {
    /// Length before truncation
    exact_count: usize,
    /// The first items, up to the limit
    items: Vec<T>,
}

impl<T: Clone> TruncatedVec<T> {
    /// Takes up to `limit` items from `list`
    ///
    /// `exact_count` is the full length, which may exceed `limit`.
    pub fn new<I: Iterator<Item = T>>(list: I, limit: usize, exact_count: usize) -> Self {
        let items = list.take(limit).collect_vec();
        Self { exact_count, items }
    }

    /// Length before truncation
    pub fn exact_count(&self) -> usize {
        self.exact_count
    }

    /// The kept items
    pub fn items(&self) -> &[T] {
        &self.items
    }
}
