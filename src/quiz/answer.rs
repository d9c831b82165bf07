//! Answer submission and collection for the open question
//!
//! A [`Collector`] exists for exactly as long as its question is open. It
//! accepts at most one answer per player, judges and scores the answer as it
//! arrives, and turns into the final answer list (including an explicit
//! non-answer for everyone who stayed silent) when the question closes.

use std::{
    collections::{BTreeSet, HashMap, hash_map::Entry},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use web_time::SystemTime;

use crate::{game::Rejection, presence::Id, scoring};

use super::question::Question;

/// Canonical form of free text, used for both answers and accepted keys
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// What a player submitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerValue {
    /// Picked option indices, one for single-choice questions
    Choices(BTreeSet<usize>),
    /// Typed text
    Text(String),
}

impl AnswerValue {
    /// A single picked option
    pub fn single(index: usize) -> Self {
        Self::Choices(BTreeSet::from([index]))
    }

    /// A set of picked options
    pub fn choices<I: IntoIterator<Item = usize>>(indices: I) -> Self {
        Self::Choices(indices.into_iter().collect())
    }

    /// Typed text
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::Text(text.into())
    }

    fn normalized(self) -> Self {
        match self {
            Self::Text(text) => Self::Text(normalize_text(&text)),
            choices => choices,
        }
    }
}

/// A judged answer, or the record of a missing one
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Who answered
    pub player: Id,
    /// Which question was answered
    pub question: Id,
    /// The normalized submission, `None` if the player never answered
    pub value: Option<AnswerValue>,
    /// Time charged against the player, within `[0, time_limit]`
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub elapsed: Duration,
    /// Whether the answer matched the key
    pub correct: bool,
    /// Points awarded
    pub points: u64,
    /// Server time the answer was accepted
    pub submitted_at: Option<SystemTime>,
}

impl Answer {
    /// Record for a player who did not answer before the question closed
    fn missing(player: Id, question: &Question) -> Self {
        Self {
            player,
            question: question.id,
            value: None,
            elapsed: question.time_limit,
            correct: false,
            points: 0,
            submitted_at: None,
        }
    }

    /// Whether the player actually submitted something
    pub fn is_submitted(&self) -> bool {
        self.value.is_some()
    }
}

/// Collects answers for the currently open question
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collector {
    /// Position of the question in the quiz
    index: usize,
    /// ID of the question being answered
    question: Id,
    /// When the question opened
    started_at: SystemTime,
    /// Copied from the question so the deadline is self-contained
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    time_limit: Duration,
    /// Accepted answers keyed by player
    answers: HashMap<Id, Answer>,
}

impl Collector {
    /// Opens collection for `question`
    pub fn open(index: usize, question: &Question, started_at: SystemTime) -> Self {
        Self {
            index,
            question: question.id,
            started_at,
            time_limit: question.time_limit,
            answers: HashMap::new(),
        }
    }

    /// Position of the open question
    pub fn index(&self) -> usize {
        self.index
    }

    /// When the question opened
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// The instant after which no answer is accepted
    pub fn deadline(&self) -> SystemTime {
        self.started_at + self.time_limit
    }

    /// Whether the deadline has been reached at `now`
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.deadline()
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.deadline().duration_since(now).unwrap_or_default()
    }

    /// Number of accepted answers
    pub fn answered(&self) -> usize {
        self.answers.len()
    }

    /// Whether `player` already has an accepted answer
    pub fn has_answered(&self, player: Id) -> bool {
        self.answers.contains_key(&player)
    }

    /// Judges, scores and records one submission
    ///
    /// `client_elapsed` is the time the client measured between seeing the
    /// question and answering; when absent the server's own measurement is
    /// used. Either way it is clamped to the time limit.
    ///
    /// # Errors
    ///
    /// * `Rejection::WrongQuestion` - `question_id` is not the open question
    /// * `Rejection::DeadlinePassed` - `now` is at or after the deadline
    /// * `Rejection::DuplicateAnswer` - The player already answered
    /// * `Rejection::MalformedAnswer` - The value does not fit the question;
    ///   the player may still answer again
    pub fn submit(
        &mut self,
        question: &Question,
        player: Id,
        question_id: Id,
        value: AnswerValue,
        client_elapsed: Option<Duration>,
        now: SystemTime,
    ) -> Result<&Answer, Rejection> {
        if question_id != self.question || question.id != self.question {
            return Err(Rejection::WrongQuestion);
        }
        if self.is_expired(now) {
            return Err(Rejection::DeadlinePassed);
        }

        let Entry::Vacant(slot) = self.answers.entry(player) else {
            return Err(Rejection::DuplicateAnswer);
        };

        let value = value.normalized();
        let correct = question.evaluate(&value)?;
        let elapsed = client_elapsed
            .unwrap_or_else(|| now.duration_since(self.started_at).unwrap_or_default())
            .min(self.time_limit);
        let points = scoring::score(correct, question.points, elapsed, self.time_limit);

        Ok(slot.insert(Answer {
            player,
            question: self.question,
            value: Some(value),
            elapsed,
            correct,
            points,
            submitted_at: Some(now),
        }))
    }

    /// Closes collection, producing one answer per player in `players` order
    ///
    /// Players without an accepted answer get a zero-point non-answer.
    pub fn finalize(self, question: &Question, players: &[Id]) -> Vec<Answer> {
        let mut answers = self.answers;
        players
            .iter()
            .map(|id| {
                answers
                    .remove(id)
                    .unwrap_or_else(|| Answer::missing(*id, question))
            })
            .collect()
    }
}
