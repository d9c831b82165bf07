//! Configuration constants for the quiz session engine
//!
//! This module contains the fixed limits and constraints used throughout
//! the engine to ensure data integrity and provide consistent boundaries
//! for sessions, players, questions and scoring.

/// Join code constants
pub mod code {
    /// Number of characters in a join code
    pub const LENGTH: usize = 6;
    /// Characters a join code may contain, in canonical (uppercase) form
    pub const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    /// Default number of candidates tried before issuance gives up
    pub const MAX_ISSUE_ATTEMPTS: usize = 10;
}

/// Session-wide constants
pub mod session {
    /// Maximum length of a quiz title
    pub const MAX_TITLE_LENGTH: usize = 200;
    /// Maximum number of questions allowed in a single session
    pub const MAX_QUESTION_COUNT: usize = 100;
    /// Maximum number of players allowed in a single session
    pub const MAX_PLAYER_COUNT: usize = 1000;
    /// Maximum number of leaderboard entries sent in a single update
    pub const LEADERBOARD_LIMIT: usize = 50;
    /// Maximum pause before automatically moving past a closed question, in seconds
    pub const MAX_AUTO_ADVANCE: u64 = 60;
    /// Delay before retrying an alarm whose transition could not be stored, in seconds
    pub const ALARM_RETRY: u64 = 1;
}

/// Player constants
pub mod player {
    /// Maximum length of a nickname in characters, after trimming
    pub const MAX_NICKNAME_LENGTH: usize = 20;
    /// Maximum length of an avatar reference
    pub const MAX_AVATAR_LENGTH: usize = 200;
}

/// Question constants
pub mod question {
    /// Maximum length of a question prompt
    pub const MAX_PROMPT_LENGTH: usize = 200;
    /// Minimum number of options for a choice question
    pub const MIN_OPTION_COUNT: usize = 2;
    /// Maximum number of options for a choice question
    pub const MAX_OPTION_COUNT: usize = 8;
    /// Maximum length of a single option or accepted free-text answer
    pub const MAX_OPTION_LENGTH: usize = 200;
    /// Maximum points a single question can award
    pub const MAX_POINTS: u64 = 10_000;
    /// Maximum number of accepted answers for a free-text question
    pub const MAX_ACCEPTED_COUNT: usize = 16;
    /// Minimum time limit in seconds for answering a question
    pub const MIN_TIME_LIMIT: u64 = 5;
    /// Maximum time limit in seconds for answering a question
    pub const MAX_TIME_LIMIT: u64 = 240;
}

/// Scoring constants
pub mod scoring {
    /// Share of the time limit during which a correct answer earns full points
    pub const GRACE_RATIO: f64 = 0.03;
    /// Share of the base points every correct answer earns at minimum
    pub const FLOOR_RATIO: f64 = 0.1;
}
