//! Session state machine
//!
//! [`Game`] is the synchronous core of a session: it owns the quiz, the
//! participants, the open question's answers and the leaderboard, and moves
//! through `Created → Waiting → QuestionActive ⇄ QuestionClosed → Ended`.
//!
//! Nothing here talks to the outside world. Every method records what should
//! happen as a consequence (broadcasts, achievement events, alarms, final
//! results) in an [`Outbox`], which the session dispatches only after the new
//! state has been persisted. A method that returns an error leaves the game
//! untouched.

use std::time::Duration;

use garde::Validate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use thiserror::Error;
use web_time::SystemTime;

use super::{
    TruncatedVec,
    constants::session::{LEADERBOARD_LIMIT, MAX_AUTO_ADVANCE, MAX_PLAYER_COUNT},
    game_code::GameCode,
    leaderboard::{self, Leaderboard, RankChange, Standing},
    names::{self, NameStyle},
    presence::{self, ConnectionStatus, Id, Player, Presence},
    quiz::{Answer, AnswerValue, Collector, QuestionView, Quiz, Solution},
};

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Created, lobby not open yet
    Created,
    /// Lobby open, players may join
    Waiting,
    /// A question is accepting answers
    QuestionActive,
    /// The last question is closed and scored
    QuestionClosed,
    /// Terminal
    Ended,
}

/// Current state of the game, with the data each phase needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    /// Created, lobby not open yet
    Created,
    /// Lobby open, players may join
    Waiting,
    /// Collecting answers for a question
    QuestionActive(Box<Collector>),
    /// Showing results of the question at this index
    QuestionClosed(usize),
    /// Terminal
    Ended,
}

impl State {
    /// The phase this state belongs to
    pub fn phase(&self) -> Phase {
        match self {
            Self::Created => Phase::Created,
            Self::Waiting => Phase::Waiting,
            Self::QuestionActive(_) => Phase::QuestionActive,
            Self::QuestionClosed(_) => Phase::QuestionClosed,
            Self::Ended => Phase::Ended,
        }
    }
}

fn validate_auto_advance(val: &Option<Duration>) -> garde::Result {
    match val {
        Some(pause) if pause.is_zero() || pause.as_secs() > MAX_AUTO_ADVANCE => Err(
            garde::Error::new(format!("auto_advance is outside of the bounds (0,{MAX_AUTO_ADVANCE}]")),
        ),
        _ => Ok(()),
    }
}

/// Per-session configuration chosen by the host
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Options {
    /// Maximum number of players, host excluded
    #[garde(range(min = 1, max = MAX_PLAYER_COUNT))]
    pub max_players: usize,
    /// Style for generated nicknames (None means players choose their own)
    #[garde(dive)]
    pub random_names: Option<NameStyle>,
    /// Pause after a question closes before moving on without the host
    #[garde(custom(|v, _| validate_auto_advance(v)))]
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds<u64>>")]
    pub auto_advance: Option<Duration>,
    /// Number of leaderboard rows included in broadcasts
    #[garde(range(min = 1, max = LEADERBOARD_LIMIT))]
    pub leaderboard_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYER_COUNT,
            random_names: None,
            auto_advance: None,
            leaderboard_size: LEADERBOARD_LIMIT,
        }
    }
}

/// Operations that can be refused because of the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Open the lobby
    Open,
    /// Start the first question
    Start,
    /// Close the open question
    Close,
    /// Move past a closed question
    Next,
    /// Abort the session
    End,
    /// Mark a participant connected
    Reconnect,
    /// Mark a participant disconnected
    Disconnect,
}

/// Why a join or an answer was refused
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The lobby is not open
    #[error("session is not accepting players")]
    NotJoinable,
    /// The player already answered this question
    #[error("answer already submitted")]
    DuplicateAnswer,
    /// The question's deadline has passed
    #[error("deadline has passed")]
    DeadlinePassed,
    /// The answer names a question that is not the open one
    #[error("not the current question")]
    WrongQuestion,
    /// No question is open
    #[error("no question is open")]
    NotAcceptingAnswers,
    /// The submitter is not a player of this session
    #[error("unknown player")]
    UnknownPlayer,
    /// The answer does not fit the question
    #[error("malformed answer")]
    MalformedAnswer,
    /// The nickname was refused
    #[error("invalid nickname: {0}")]
    InvalidNickname(names::Error),
    /// The avatar reference was refused
    #[error("invalid avatar")]
    InvalidAvatar,
    /// The participant is already in the session
    #[error("already joined")]
    AlreadyJoined,
    /// The session is at capacity
    #[error("session is full")]
    SessionFull,
}

impl From<presence::Error> for Rejection {
    fn from(error: presence::Error) -> Self {
        match error {
            presence::Error::SessionFull => Self::SessionFull,
            presence::Error::AlreadyJoined => Self::AlreadyJoined,
            presence::Error::InvalidNickname(e) => Self::InvalidNickname(e),
            presence::Error::InvalidAvatar => Self::InvalidAvatar,
            presence::Error::UnknownPlayer => Self::UnknownPlayer,
        }
    }
}

/// Errors returned by game operations
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The operation does not apply to the current phase
    #[error("cannot {action:?} while the session is {from:?}")]
    InvalidTransition {
        /// What was attempted
        action: Action,
        /// Phase at the time
        from: Phase,
    },
    /// A host-only operation was attempted by someone else
    #[error("only the host may {0:?}")]
    NotHost(Action),
    /// Starting requires at least one connected player
    #[error("no connected players")]
    NoActivePlayers,
    /// A join or answer was refused
    #[error(transparent)]
    Rejected(#[from] Rejection),
}

/// Who triggers a host-or-timer operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// A participant claiming to be the host
    Host(Id),
    /// The session's own scheduled alarm
    Timer,
}

/// Result of closing a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseOutcome {
    /// The question was open and is now scored
    Closed,
    /// The question had already been closed
    AlreadyClosed,
}

/// Scheduled events the session delivers back to itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// The question at `index` reaches its deadline
    Deadline {
        /// Question index the alarm was set for
        index: usize,
    },
    /// The pause after the question at `index` is over
    Advance {
        /// Question index the alarm was set for
        index: usize,
    },
}

/// Leaderboard data structure for display
#[derive(Debug, Serialize, Clone)]
pub struct LeaderboardMessage {
    /// Current standings
    pub current: TruncatedVec<Standing>,
    /// Standings before the latest question
    pub prior: TruncatedVec<Standing>,
}

/// Closing statistics sent when the session ends
#[derive(Debug, Serialize, Clone)]
pub struct SummaryMessage {
    /// Number of players who took part
    pub player_count: usize,
    /// For each played question: (players who answered correctly, everyone else)
    pub stats: Vec<(usize, usize)>,
    /// Whether the host ended the session early
    pub aborted: bool,
}

/// Events broadcast to everyone watching a session
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// The lobby is open under this code
    LobbyOpened {
        /// Join code
        code: GameCode,
    },
    /// A player joined the lobby
    PlayerJoined {
        /// Player ID
        id: Id,
        /// Normalized or generated nickname
        nickname: String,
        /// Avatar reference
        avatar: Option<String>,
        /// Number of players after the join
        players: usize,
    },
    /// A participant's connection status changed
    PresenceChanged {
        /// Participant ID
        id: Id,
        /// New status
        status: ConnectionStatus,
        /// Number of connected players afterwards
        active: usize,
    },
    /// A question opened; clients count down to `deadline`
    QuestionStarted {
        /// Question index
        index: usize,
        /// Total number of questions
        count: usize,
        /// The question without its key
        question: QuestionView,
        /// Server time after which answers are refused
        deadline: SystemTime,
    },
    /// Progress on the open question
    AnswerCount {
        /// Question index
        index: usize,
        /// Answers received so far
        answered: usize,
        /// Players in the session
        players: usize,
    },
    /// A question closed and was scored
    QuestionClosed {
        /// Question index
        index: usize,
        /// Total number of questions
        count: usize,
        /// The answer key
        solution: Solution,
        /// Players who submitted an answer
        answered: usize,
        /// Players who answered correctly
        correct: usize,
    },
    /// Standings after a question
    Leaderboard(LeaderboardMessage),
    /// The session is over
    SessionEnded {
        /// Final standings
        standings: TruncatedVec<Standing>,
        /// Closing statistics
        summary: SummaryMessage,
    },
}

/// An update stamped with its session and position in the session's stream
///
/// `seq` increases by one per update, so consumers can drop repeats and
/// detect gaps.
#[derive(Debug, Serialize, Clone)]
pub struct Envelope {
    /// Session the update belongs to
    pub session: Id,
    /// Per-session sequence number, starting at 1
    pub seq: u64,
    /// The update itself
    pub message: UpdateMessage,
}

/// An accepted answer, reported for achievement tracking
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnswerEvaluated {
    /// Who answered
    pub player: Id,
    /// Which question
    pub question: Id,
    /// Whether it was correct
    pub correct: bool,
    /// Points awarded
    pub points: u64,
    /// Time charged to the player
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub elapsed: Duration,
}

/// A player's final placing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionCompleted {
    /// Player ID
    pub player: Id,
    /// Final 1-based rank
    pub rank: usize,
    /// Final score
    pub score: u64,
}

/// Events for the achievement collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::From)]
pub enum AchievementEvent {
    /// An answer was accepted and judged
    AnswerEvaluated(AnswerEvaluated),
    /// A player's rank moved after a question
    RankChanged(RankChange),
    /// The session ended
    SessionCompleted(SessionCompleted),
}

/// Final per-player results handed to the stats collaborator
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerResult {
    /// Player ID
    pub player: Id,
    /// Player nickname
    pub nickname: String,
    /// Final score
    pub score: u64,
    /// Final 1-based rank
    pub rank: usize,
    /// Questions answered correctly
    pub correct: usize,
    /// Questions the player submitted an answer for
    pub answered: usize,
    /// Questions played
    pub total: usize,
    /// Time of the quickest correct answer
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds<u64>>")]
    pub fastest: Option<Duration>,
    /// Points earned on each played question, in question order
    pub per_question: Vec<u64>,
}

impl PlayerResult {
    fn new(player: &Player, rank: usize, per_question: Vec<u64>) -> Self {
        let correct = player.answers.iter().filter(|a| a.correct);
        Self {
            player: player.id,
            nickname: player.nickname.clone(),
            score: player.score,
            rank,
            correct: correct.clone().count(),
            answered: player.answers.iter().filter(|a| a.is_submitted()).count(),
            total: player.answers.len(),
            fastest: correct.map(|a| a.elapsed).min(),
            per_question,
        }
    }
}

/// Consequences of an operation, dispatched once the new state is stored
#[derive(Debug, Default)]
pub struct Outbox {
    /// Updates to broadcast, in order
    pub updates: Vec<Envelope>,
    /// Events for the achievement collaborator
    pub achievements: Vec<AchievementEvent>,
    /// Alarms to schedule, with their delay
    pub alarms: Vec<(AlarmMessage, Duration)>,
    /// Final results, present only when the session just ended
    pub results: Option<Vec<PlayerResult>>,
}

impl Outbox {
    /// Whether the operation changed any state
    ///
    /// Every state change announces at least one update.
    pub fn changed_state(&self) -> bool {
        !self.updates.is_empty()
    }
}

/// The main session struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    /// Session ID
    id: Id,
    /// Join code, released once the session ends
    code: GameCode,
    /// Questions in play order
    quiz: Quiz,
    /// Host configuration
    options: Options,
    /// Host and players
    presence: Presence,
    /// Per-question points and standings
    leaderboard: Leaderboard,
    /// Current phase
    state: State,
    /// Creation time
    created_at: SystemTime,
    /// Sequence number of the last broadcast update
    seq: u64,
}

impl Game {
    /// Creates a session in the `Created` phase
    ///
    /// The quiz and options are expected to have been validated.
    pub fn new(
        id: Id,
        code: GameCode,
        host: Id,
        quiz: Quiz,
        options: Options,
        now: SystemTime,
    ) -> Self {
        Self {
            id,
            code,
            quiz,
            options,
            presence: Presence::with_host(host, now),
            leaderboard: Leaderboard::default(),
            state: State::Created,
            created_at: now,
            seq: 0,
        }
    }

    /// Session ID
    pub fn id(&self) -> Id {
        self.id
    }

    /// Join code
    pub fn code(&self) -> GameCode {
        self.code
    }

    /// Host ID
    pub fn host(&self) -> Id {
        self.presence.host()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Current state
    pub fn state(&self) -> &State {
        &self.state
    }

    /// The quiz being played
    pub fn quiz(&self) -> &Quiz {
        &self.quiz
    }

    /// Host configuration
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Participants
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Per-question points and standings
    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    /// Creation time
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Sequence number of the last broadcast update
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Index of the open or just-closed question
    pub fn current_index(&self) -> Option<usize> {
        match &self.state {
            State::QuestionActive(collector) => Some(collector.index()),
            State::QuestionClosed(index) => Some(*index),
            _ => None,
        }
    }

    /// Deadline of the open question
    pub fn deadline(&self) -> Option<SystemTime> {
        match &self.state {
            State::QuestionActive(collector) => Some(collector.deadline()),
            _ => None,
        }
    }

    /// Whether an open question has reached its deadline at `now`
    pub fn is_due(&self, now: SystemTime) -> bool {
        matches!(&self.state, State::QuestionActive(c) if c.is_expired(now))
    }

    fn announce(&mut self, out: &mut Outbox, message: UpdateMessage) {
        self.seq += 1;
        out.updates.push(Envelope {
            session: self.id,
            seq: self.seq,
            message,
        });
    }

    fn invalid(&self, action: Action) -> Error {
        Error::InvalidTransition {
            action,
            from: self.phase(),
        }
    }

    fn require_host(&self, by: Id, action: Action) -> Result<(), Error> {
        if by == self.presence.host() {
            Ok(())
        } else {
            Err(Error::NotHost(action))
        }
    }

    fn require_actor(&self, by: Actor, action: Action) -> Result<(), Error> {
        match by {
            Actor::Host(id) => self.require_host(id, action),
            Actor::Timer => Ok(()),
        }
    }

    /// Opens the lobby
    ///
    /// # Errors
    ///
    /// * `Error::NotHost` - `by` is not the host
    /// * `Error::InvalidTransition` - The session is not `Created`
    pub fn open(&mut self, by: Id, out: &mut Outbox) -> Result<(), Error> {
        self.require_host(by, Action::Open)?;
        if !matches!(self.state, State::Created) {
            return Err(self.invalid(Action::Open));
        }

        self.state = State::Waiting;
        let code = self.code;
        self.announce(out, UpdateMessage::LobbyOpened { code });
        Ok(())
    }

    /// Adds a player to the lobby
    ///
    /// # Errors
    ///
    /// `Error::Rejected` with `NotJoinable` outside the lobby, or with the
    /// presence tracker's reason (nickname, avatar, capacity, duplicate ID).
    pub fn join(
        &mut self,
        player: Id,
        nickname: &str,
        avatar: Option<String>,
        out: &mut Outbox,
        now: SystemTime,
    ) -> Result<Player, Error> {
        if !matches!(self.state, State::Waiting) {
            return Err(Rejection::NotJoinable.into());
        }

        let joined = self
            .presence
            .join(
                player,
                nickname,
                avatar,
                self.options.random_names,
                self.options.max_players,
                now,
            )
            .map_err(Rejection::from)?
            .clone();

        let players = self.presence.player_count();
        self.announce(
            out,
            UpdateMessage::PlayerJoined {
                id: joined.id,
                nickname: joined.nickname.clone(),
                avatar: joined.avatar.clone(),
                players,
            },
        );
        Ok(joined)
    }

    /// Changes a participant's connection status
    ///
    /// # Returns
    ///
    /// `true` if the status changed
    ///
    /// # Errors
    ///
    /// * `Error::InvalidTransition` - The session has ended
    /// * `Error::Rejected(UnknownPlayer)` - No such participant
    pub fn set_connection(
        &mut self,
        id: Id,
        status: ConnectionStatus,
        out: &mut Outbox,
    ) -> Result<bool, Error> {
        let action = match status {
            ConnectionStatus::Connected => Action::Reconnect,
            ConnectionStatus::Disconnected => Action::Disconnect,
        };
        if matches!(self.state, State::Ended) {
            return Err(self.invalid(action));
        }

        let changed = self
            .presence
            .set_status(id, status)
            .map_err(Rejection::from)?;
        if changed {
            let active = self.presence.active_players().len();
            self.announce(out, UpdateMessage::PresenceChanged { id, status, active });
        }
        Ok(changed)
    }

    /// Starts the first question, or ends at once if the quiz is empty
    ///
    /// # Errors
    ///
    /// * `Error::NotHost` - `by` is not the host
    /// * `Error::InvalidTransition` - The session is not `Waiting`
    /// * `Error::NoActivePlayers` - No player is connected
    pub fn start(&mut self, by: Id, out: &mut Outbox, now: SystemTime) -> Result<(), Error> {
        self.require_host(by, Action::Start)?;
        if !matches!(self.state, State::Waiting) {
            return Err(self.invalid(Action::Start));
        }
        if self.presence.active_players().is_empty() {
            return Err(Error::NoActivePlayers);
        }

        self.leaderboard = Leaderboard::new(self.roster());
        tracing::info!(session = %self.id, players = self.presence.player_count(), "session started");

        if self.quiz.is_empty() {
            self.finish(out, false);
        } else {
            self.activate(0, out, now);
        }
        Ok(())
    }

    fn roster(&self) -> Vec<(Id, String)> {
        self.presence
            .players()
            .iter()
            .map(|p| (p.id, p.nickname.clone()))
            .collect()
    }

    fn activate(&mut self, index: usize, out: &mut Outbox, now: SystemTime) {
        let Some(question) = self.quiz.questions.get(index) else {
            self.finish(out, false);
            return;
        };

        let collector = Collector::open(index, question, now);
        let message = UpdateMessage::QuestionStarted {
            index,
            count: self.quiz.len(),
            question: question.view(),
            deadline: collector.deadline(),
        };
        out.alarms
            .push((AlarmMessage::Deadline { index }, question.time_limit));

        self.state = State::QuestionActive(Box::new(collector));
        self.announce(out, message);
        tracing::info!(session = %self.id, index, "question started");
    }

    /// Accepts one answer for the open question
    ///
    /// # Errors
    ///
    /// `Error::Rejected` with:
    ///
    /// * `NotAcceptingAnswers` - No question has been opened, or the session ended
    /// * `DeadlinePassed` - The named question is already closed
    /// * `UnknownPlayer` - The submitter is not a player of this session
    /// * any reason from [`Collector::submit`]
    pub fn submit(
        &mut self,
        player: Id,
        question_id: Id,
        value: AnswerValue,
        client_elapsed: Option<Duration>,
        out: &mut Outbox,
        now: SystemTime,
    ) -> Result<Answer, Error> {
        let collector = match &mut self.state {
            State::QuestionActive(collector) => collector,
            State::QuestionClosed(index) => {
                let closed = self.quiz.questions.get(*index).map(|q| q.id);
                return Err(if closed == Some(question_id) {
                    Rejection::DeadlinePassed
                } else {
                    Rejection::WrongQuestion
                }
                .into());
            }
            _ => return Err(Rejection::NotAcceptingAnswers.into()),
        };
        if !self.presence.is_player(player) {
            return Err(Rejection::UnknownPlayer.into());
        }

        let question = self
            .quiz
            .questions
            .get(collector.index())
            .ok_or(Rejection::WrongQuestion)?;
        let answer = collector
            .submit(question, player, question_id, value, client_elapsed, now)?
            .clone();
        let (index, answered) = (collector.index(), collector.answered());

        out.achievements.push(
            AnswerEvaluated {
                player,
                question: question_id,
                correct: answer.correct,
                points: answer.points,
                elapsed: answer.elapsed,
            }
            .into(),
        );
        let players = self.presence.player_count();
        self.announce(
            out,
            UpdateMessage::AnswerCount {
                index,
                answered,
                players,
            },
        );
        Ok(answer)
    }

    /// Closes the open question
    ///
    /// # Errors
    ///
    /// * `Error::NotHost` - `by` is a participant other than the host
    /// * `Error::InvalidTransition` - No question has been opened, or the session ended
    pub fn close(&mut self, by: Actor, out: &mut Outbox) -> Result<CloseOutcome, Error> {
        self.require_actor(by, Action::Close)?;
        match self.state {
            State::QuestionActive(_) => {
                self.finalize_question(out);
                Ok(CloseOutcome::Closed)
            }
            State::QuestionClosed(_) => Ok(CloseOutcome::AlreadyClosed),
            _ => Err(self.invalid(Action::Close)),
        }
    }

    /// Closes the open question if its deadline has passed
    ///
    /// # Returns
    ///
    /// `true` if the question was closed
    pub fn expire_if_due(&mut self, out: &mut Outbox, now: SystemTime) -> bool {
        if self.is_due(now) {
            self.finalize_question(out);
            true
        } else {
            false
        }
    }

    fn finalize_question(&mut self, out: &mut Outbox) {
        let collector = match std::mem::replace(&mut self.state, State::Created) {
            State::QuestionActive(collector) => collector,
            other => {
                self.state = other;
                return;
            }
        };
        let index = collector.index();
        let count = self.quiz.len();
        let Some(question) = self.quiz.questions.get(index) else {
            self.state = State::QuestionClosed(index);
            return;
        };

        let roster = self.presence.players().iter().map(|p| p.id).collect_vec();
        let answers = collector.finalize(question, &roster);
        let answered = answers.iter().filter(|a| a.is_submitted()).count();
        let correct = answers.iter().filter(|a| a.correct).count();
        let scores = answers.iter().map(|a| (a.player, a.points)).collect_vec();
        let solution = question.solution();

        for answer in answers {
            if let Err(error) = self.presence.credit(answer) {
                tracing::warn!(session = %self.id, %error, "answer for unknown player dropped");
            }
        }
        let changes = self.leaderboard.add_scores(&scores);
        out.achievements
            .extend(changes.into_iter().map(AchievementEvent::from));

        self.state = State::QuestionClosed(index);
        self.announce(
            out,
            UpdateMessage::QuestionClosed {
                index,
                count,
                solution,
                answered,
                correct,
            },
        );
        let [current, prior] = self.leaderboard.last_two(self.options.leaderboard_size);
        self.announce(
            out,
            UpdateMessage::Leaderboard(LeaderboardMessage { current, prior }),
        );

        if let Some(pause) = self.options.auto_advance {
            out.alarms.push((AlarmMessage::Advance { index }, pause));
        }
        tracing::info!(session = %self.id, index, answered, correct, "question closed");
    }

    /// Moves past a closed question: opens the next one or ends the session
    ///
    /// # Errors
    ///
    /// * `Error::NotHost` - `by` is a participant other than the host
    /// * `Error::InvalidTransition` - No question is closed
    pub fn next(&mut self, by: Actor, out: &mut Outbox, now: SystemTime) -> Result<(), Error> {
        self.require_actor(by, Action::Next)?;
        let State::QuestionClosed(index) = self.state else {
            return Err(self.invalid(Action::Next));
        };

        self.advance(index, out, now);
        Ok(())
    }

    fn advance(&mut self, closed: usize, out: &mut Outbox, now: SystemTime) {
        if closed + 1 < self.quiz.len() {
            self.activate(closed + 1, out, now);
        } else {
            self.finish(out, false);
        }
    }

    /// Aborts the session, scoring an open question first
    ///
    /// # Errors
    ///
    /// * `Error::NotHost` - `by` is not the host
    /// * `Error::InvalidTransition` - The session already ended
    pub fn end(&mut self, by: Id, out: &mut Outbox) -> Result<(), Error> {
        self.require_host(by, Action::End)?;
        match self.state {
            State::Ended => return Err(self.invalid(Action::End)),
            State::QuestionActive(_) => self.finalize_question(out),
            _ => {}
        }
        self.finish(out, true);
        Ok(())
    }

    fn finish(&mut self, out: &mut Outbox, aborted: bool) {
        self.state = State::Ended;
        if self.leaderboard.standings().len() != self.presence.player_count() {
            // never started, so the leaderboard has no roster yet
            self.leaderboard = Leaderboard::new(self.roster());
        }

        let players = self.presence.players();
        let standings =
            leaderboard::rank(players.iter().map(|p| (p.id, p.nickname.as_str(), p.score)));
        let results = standings
            .iter()
            .filter_map(|s| {
                players
                    .iter()
                    .find(|p| p.id == s.id)
                    .map(|p| PlayerResult::new(p, s.rank, self.leaderboard.player_summary(p.id)))
            })
            .collect_vec();

        out.achievements.extend(results.iter().map(|r| {
            AchievementEvent::from(SessionCompleted {
                player: r.player,
                rank: r.rank,
                score: r.score,
            })
        }));

        let player_count = players.len();
        let stats = self.question_stats(&players);
        let limit = self.options.leaderboard_size;
        let total = standings.len();
        self.announce(
            out,
            UpdateMessage::SessionEnded {
                standings: TruncatedVec::new(standings.into_iter(), limit, total),
                summary: SummaryMessage {
                    player_count,
                    stats,
                    aborted,
                },
            },
        );
        out.results = Some(results);
        tracing::info!(session = %self.id, aborted, "session ended");
    }

    /// Correct and other answer counts for each played question
    fn question_stats(&self, players: &[&Player]) -> Vec<(usize, usize)> {
        self.quiz
            .questions
            .iter()
            .take(self.leaderboard.rounds())
            .map(|question| {
                let correct = players
                    .iter()
                    .filter(|p| p.answers.iter().any(|a| a.question == question.id && a.correct))
                    .count();
                (correct, players.len() - correct)
            })
            .collect()
    }

    /// Handles an alarm scheduled by this session
    ///
    /// Alarms for a question other than the current one are stale and
    /// ignored. A deadline alarm that fires early is rescheduled for the
    /// remaining time.
    pub fn receive_alarm(&mut self, alarm: AlarmMessage, out: &mut Outbox, now: SystemTime) {
        match alarm {
            AlarmMessage::Deadline { index } => {
                let remaining = match &self.state {
                    State::QuestionActive(c) if c.index() == index => Some(c.remaining(now)),
                    _ => None,
                };
                match remaining {
                    Some(remaining) if remaining.is_zero() => self.finalize_question(out),
                    Some(remaining) => out.alarms.push((alarm, remaining)),
                    None => tracing::debug!(session = %self.id, index, "stale deadline alarm"),
                }
            }
            AlarmMessage::Advance { index } => {
                if matches!(self.state, State::QuestionClosed(i) if i == index) {
                    self.advance(index, out, now);
                } else {
                    tracing::debug!(session = %self.id, index, "stale advance alarm");
                }
            }
        }
    }
}
