//! Quiz content and answer collection
//!
//! A [`Quiz`] is the ordered question list a host brings to a session. It is
//! validated once, when the session is created, and never changes afterwards.

pub mod answer;
pub mod question;

use std::collections::HashSet;

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::constants::session::{MAX_QUESTION_COUNT, MAX_TITLE_LENGTH};

pub use answer::{Answer, AnswerValue, Collector};
pub use question::{Choice, Question, QuestionKind, QuestionView, Solution};

/// Checks that no two questions share an ID
fn unique_ids(questions: &[Question]) -> garde::Result {
    let mut seen = HashSet::new();
    if questions.iter().all(|q| seen.insert(q.id)) {
        Ok(())
    } else {
        Err(garde::Error::new("question IDs must be unique"))
    }
}

/// A complete quiz: a title and its questions in play order
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
pub struct Quiz {
    /// Display title, not used by the engine itself
    #[garde(length(max = MAX_TITLE_LENGTH))]
    #[serde(default)]
    pub title: String,

    /// Questions in the order they are played
    #[garde(length(max = MAX_QUESTION_COUNT), dive, custom(|v, _| unique_ids(v)))]
    pub questions: Vec<Question>,
}

impl Quiz {
    /// Creates an untitled quiz
    pub fn new(questions: Vec<Question>) -> Self {
        Self {
            title: String::new(),
            questions,
        }
    }

    /// Number of questions
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// Whether the quiz has no questions
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}
