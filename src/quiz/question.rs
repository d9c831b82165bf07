//! Question definitions and answer evaluation

use std::{collections::BTreeSet, time::Duration};

use garde::Validate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{
    constants::question::{
        MAX_ACCEPTED_COUNT, MAX_OPTION_COUNT, MAX_OPTION_LENGTH, MAX_POINTS, MAX_PROMPT_LENGTH,
        MAX_TIME_LIMIT, MIN_OPTION_COUNT, MIN_TIME_LIMIT,
    },
    game::Rejection,
    presence::Id,
};

use super::answer::{AnswerValue, normalize_text};

type ValidationResult = garde::Result;

/// Validates that a question's time limit falls within the allowed bounds
fn validate_time_limit(val: &Duration) -> ValidationResult {
    if (MIN_TIME_LIMIT..=MAX_TIME_LIMIT).contains(&val.as_secs()) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "time_limit is outside of the bounds [{MIN_TIME_LIMIT},{MAX_TIME_LIMIT}]",
        )))
    }
}

fn exactly_one_correct(choices: &[Choice]) -> ValidationResult {
    match choices.iter().filter(|c| c.correct).count() {
        1 => Ok(()),
        n => Err(garde::Error::new(format!(
            "single choice needs exactly one correct option, found {n}"
        ))),
    }
}

fn at_least_one_correct(choices: &[Choice]) -> ValidationResult {
    if choices.iter().any(|c| c.correct) {
        Ok(())
    } else {
        Err(garde::Error::new("multi select needs a correct option"))
    }
}

fn no_blank_answers(accepted: &[String]) -> ValidationResult {
    if accepted.iter().any(|a| a.trim().is_empty()) {
        Err(garde::Error::new("accepted answers cannot be blank"))
    } else {
        Ok(())
    }
}

/// One option of a choice question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Choice {
    /// Text shown to players
    #[garde(length(min = 1, max = MAX_OPTION_LENGTH))]
    pub text: String,
    /// Whether picking this option is (part of) the right answer
    #[garde(skip)]
    pub correct: bool,
}

/// The answer format of a question, together with its key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub enum QuestionKind {
    /// Exactly one option is correct and players pick one
    SingleChoice(
        #[garde(
            length(min = MIN_OPTION_COUNT, max = MAX_OPTION_COUNT),
            dive,
            custom(|v, _| exactly_one_correct(v))
        )]
        Vec<Choice>,
    ),
    /// Players pick a set of options; only the exact correct set scores
    MultiSelect(
        #[garde(
            length(min = MIN_OPTION_COUNT, max = MAX_OPTION_COUNT),
            dive,
            custom(|v, _| at_least_one_correct(v))
        )]
        Vec<Choice>,
    ),
    /// Players type an answer, compared case-insensitively after trimming
    FreeText(
        #[garde(
            length(min = 1, max = MAX_ACCEPTED_COUNT),
            inner(length(min = 1, max = MAX_OPTION_LENGTH)),
            custom(|v, _| no_blank_answers(v))
        )]
        Vec<String>,
    ),
}

/// A question as authored by the host
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Question {
    /// Unique identifier, generated when absent from the input
    #[garde(skip)]
    #[serde(default)]
    pub id: Id,
    /// The question text
    #[garde(length(min = 1, max = MAX_PROMPT_LENGTH))]
    pub prompt: String,
    /// Answer format and key
    #[garde(dive)]
    pub kind: QuestionKind,
    /// Points for an instant correct answer
    #[garde(range(max = MAX_POINTS))]
    pub points: u64,
    /// How long players have to answer
    #[garde(custom(|v, _| validate_time_limit(v)))]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub time_limit: Duration,
}

/// The public part of a question, safe to broadcast while it is open
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionView {
    /// Question identifier players answer against
    pub id: Id,
    /// The question text
    pub prompt: String,
    /// Option texts for choice questions, `None` for free text
    pub options: Option<Vec<String>>,
    /// Whether more than one option may be picked
    pub multiple: bool,
    /// Points for an instant correct answer
    pub points: u64,
    /// How long players have to answer
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub time_limit: Duration,
}

/// The key of a question, revealed once it closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Solution {
    /// Indices of the correct options
    Choices(BTreeSet<usize>),
    /// Accepted free-text answers as authored
    Text(Vec<String>),
}

impl QuestionKind {
    fn choices(&self) -> Option<&[Choice]> {
        match self {
            Self::SingleChoice(choices) | Self::MultiSelect(choices) => Some(choices),
            Self::FreeText(_) => None,
        }
    }

    fn correct_indices(choices: &[Choice]) -> BTreeSet<usize> {
        choices
            .iter()
            .positions(|c| c.correct)
            .collect()
    }
}

impl Question {
    /// Checks an answer's shape and decides whether it is correct
    ///
    /// Text answers are compared after trimming and lower-casing both sides.
    ///
    /// # Errors
    ///
    /// Returns `Rejection::MalformedAnswer` when the value does not fit the
    /// question: the wrong kind, an option index out of range, more than one
    /// option for a single-choice question, no option at all, or blank text.
    pub fn evaluate(&self, value: &AnswerValue) -> Result<bool, Rejection> {
        match (&self.kind, value) {
            (QuestionKind::SingleChoice(choices), AnswerValue::Choices(picked)) => {
                match picked.iter().exactly_one() {
                    Ok(&index) => choices
                        .get(index)
                        .map(|c| c.correct)
                        .ok_or(Rejection::MalformedAnswer),
                    Err(_) => Err(Rejection::MalformedAnswer),
                }
            }
            (QuestionKind::MultiSelect(choices), AnswerValue::Choices(picked)) => {
                if picked.is_empty() || picked.iter().any(|&i| i >= choices.len()) {
                    return Err(Rejection::MalformedAnswer);
                }
                Ok(*picked == QuestionKind::correct_indices(choices))
            }
            (QuestionKind::FreeText(accepted), AnswerValue::Text(text)) => {
                let text = normalize_text(text);
                if text.is_empty() || text.chars().count() > MAX_OPTION_LENGTH {
                    return Err(Rejection::MalformedAnswer);
                }
                Ok(accepted.iter().any(|a| normalize_text(a) == text))
            }
            _ => Err(Rejection::MalformedAnswer),
        }
    }

    /// The question without its answer key
    pub fn view(&self) -> QuestionView {
        let choices = self.kind.choices();
        QuestionView {
            id: self.id,
            prompt: self.prompt.clone(),
            options: choices.map(|c| c.iter().map(|c| c.text.clone()).collect()),
            multiple: matches!(self.kind, QuestionKind::MultiSelect(_)),
            points: self.points,
            time_limit: self.time_limit,
        }
    }

    /// The answer key
    pub fn solution(&self) -> Solution {
        match &self.kind {
            QuestionKind::SingleChoice(choices) | QuestionKind::MultiSelect(choices) => {
                Solution::Choices(QuestionKind::correct_indices(choices))
            }
            QuestionKind::FreeText(accepted) => Solution::Text(accepted.clone()),
        }
    }
}
