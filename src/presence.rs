//! Player presence tracking
//!
//! This module manages everyone attached to a session: the host and the
//! players who joined through the session's code. Players are never removed
//! once they have joined; losing the connection only flips a status flag so
//! their score and answers stay on the leaderboard.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;
use web_time::SystemTime;

use crate::{
    constants::player::MAX_AVATAR_LENGTH,
    names::{self, NameStyle, Names},
    quiz::answer::Answer,
};

/// A unique identifier for sessions, players and questions
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    /// Creates a new random ID (same as `new()`)
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    /// Formats the ID as a UUID string
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    /// Parses an ID from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// Whether a participant currently has a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// The participant is connected
    Connected,
    /// The participant dropped and may come back
    Disconnected,
}

/// A participant in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    /// Unique identifier of the participant
    pub id: Id,
    /// Display name, already normalized
    pub nickname: String,
    /// Opaque avatar reference chosen by the client
    pub avatar: Option<String>,
    /// Current connection status
    pub status: ConnectionStatus,
    /// Total points across all closed questions
    pub score: u64,
    /// Finalized answers, one per closed question, in question order
    pub answers: Vec<Answer>,
    /// Whether this participant is the session host
    pub host: bool,
    /// Position in join order, used to break ties on the leaderboard
    pub join_seq: u64,
    /// When the participant joined
    pub joined_at: SystemTime,
}

impl Player {
    /// Whether the participant is connected
    pub fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected)
    }

    /// Whether the participant counts towards "ready to start"
    pub fn is_active(&self) -> bool {
        !self.host && self.is_connected()
    }
}

/// Errors that can occur when managing presence
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The session has reached its player capacity
    #[error("maximum number of players reached")]
    SessionFull,
    /// The participant is already part of the session
    #[error("participant already joined")]
    AlreadyJoined,
    /// The nickname was rejected
    #[error("invalid nickname: {0}")]
    InvalidNickname(#[from] names::Error),
    /// The avatar reference is too long
    #[error("avatar reference is too long")]
    InvalidAvatar,
    /// No participant with this ID exists
    #[error("unknown participant")]
    UnknownPlayer,
}

/// Serialization helper for Presence struct
#[derive(Deserialize)]
struct PresenceSerde {
    host: Id,
    players: HashMap<Id, Player>,
    names: Names,
    next_seq: u64,
}

/// Tracks every participant in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "PresenceSerde")]
pub struct Presence {
    /// ID of the session host
    host: Id,
    /// Primary mapping from participant ID to record
    players: HashMap<Id, Player>,
    /// Nickname assignments
    names: Names,
    /// Join sequence number handed to the next participant
    next_seq: u64,

    /// Reverse mapping organized by connection status
    #[serde(skip_serializing)]
    by_status: EnumMap<ConnectionStatus, HashSet<Id>>,
}

impl From<PresenceSerde> for Presence {
    /// Rebuilds the status index, which is not serialized
    fn from(serde: PresenceSerde) -> Self {
        let PresenceSerde {
            host,
            players,
            names,
            next_seq,
        } = serde;
        let mut by_status: EnumMap<ConnectionStatus, HashSet<Id>> = EnumMap::default();
        for (id, player) in &players {
            by_status[player.status].insert(*id);
        }
        Self {
            host,
            players,
            names,
            next_seq,
            by_status,
        }
    }
}

impl Presence {
    /// Creates a tracker with the host already registered
    pub fn with_host(host: Id, now: SystemTime) -> Self {
        let mut by_status: EnumMap<ConnectionStatus, HashSet<Id>> = EnumMap::default();
        by_status[ConnectionStatus::Connected].insert(host);
        Self {
            host,
            players: HashMap::from([(
                host,
                Player {
                    id: host,
                    nickname: String::from("Host"),
                    avatar: None,
                    status: ConnectionStatus::Connected,
                    score: 0,
                    answers: Vec::new(),
                    host: true,
                    join_seq: 0,
                    joined_at: now,
                },
            )]),
            names: Names::default(),
            next_seq: 1,
            by_status,
        }
    }

    /// ID of the session host
    pub fn host(&self) -> Id {
        self.host
    }

    /// Adds a player
    ///
    /// # Arguments
    ///
    /// * `id` - ID for the new player
    /// * `nickname` - Requested nickname, ignored when `generated` is set
    /// * `avatar` - Optional avatar reference
    /// * `generated` - Style for generated nicknames, if the session uses them
    /// * `capacity` - Maximum number of non-host players
    /// * `now` - Join timestamp
    ///
    /// # Errors
    ///
    /// * `Error::AlreadyJoined` - The ID is already present
    /// * `Error::SessionFull` - Capacity is reached
    /// * `Error::InvalidAvatar` - The avatar reference is too long
    /// * `Error::InvalidNickname` - The nickname failed validation
    pub fn join(
        &mut self,
        id: Id,
        nickname: &str,
        avatar: Option<String>,
        generated: Option<NameStyle>,
        capacity: usize,
        now: SystemTime,
    ) -> Result<&Player, Error> {
        if self.players.contains_key(&id) {
            return Err(Error::AlreadyJoined);
        }
        if self.player_count() >= capacity {
            return Err(Error::SessionFull);
        }
        if avatar.as_ref().is_some_and(|a| a.len() > MAX_AVATAR_LENGTH) {
            return Err(Error::InvalidAvatar);
        }

        let nickname = match generated {
            Some(style) => self.names.assign_generated(id, style)?,
            None => self.names.set_name(id, nickname)?,
        };

        let join_seq = self.next_seq;
        self.next_seq += 1;
        self.by_status[ConnectionStatus::Connected].insert(id);

        Ok(self.players.entry(id).or_insert(Player {
            id,
            nickname,
            avatar,
            status: ConnectionStatus::Connected,
            score: 0,
            answers: Vec::new(),
            host: false,
            join_seq,
            joined_at: now,
        }))
    }

    /// Sets a participant's connection status
    ///
    /// # Returns
    ///
    /// `true` if the status changed
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPlayer` if no participant has this ID.
    pub fn set_status(&mut self, id: Id, status: ConnectionStatus) -> Result<bool, Error> {
        let player = self.players.get_mut(&id).ok_or(Error::UnknownPlayer)?;
        if player.status == status {
            return Ok(false);
        }
        self.by_status[player.status].remove(&id);
        self.by_status[status].insert(id);
        player.status = status;
        Ok(true)
    }

    /// Marks a participant as disconnected, keeping score and history
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPlayer` if no participant has this ID.
    pub fn mark_disconnected(&mut self, id: Id) -> Result<bool, Error> {
        self.set_status(id, ConnectionStatus::Disconnected)
    }

    /// Marks a participant as connected again
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPlayer` if no participant has this ID.
    pub fn mark_reconnected(&mut self, id: Id) -> Result<bool, Error> {
        self.set_status(id, ConnectionStatus::Connected)
    }

    /// Looks up any participant, host included
    pub fn get(&self, id: Id) -> Option<&Player> {
        self.players.get(&id)
    }

    /// Whether `id` belongs to a non-host player
    pub fn is_player(&self, id: Id) -> bool {
        self.players.get(&id).is_some_and(|p| !p.host)
    }

    /// Non-host players in join order, connected or not
    pub fn players(&self) -> Vec<&Player> {
        self.players
            .values()
            .filter(|p| !p.host)
            .sorted_by_key(|p| p.join_seq)
            .collect_vec()
    }

    /// Connected non-host players in join order
    pub fn active_players(&self) -> Vec<&Player> {
        self.by_status[ConnectionStatus::Connected]
            .iter()
            .filter_map(|id| self.players.get(id))
            .filter(|p| !p.host)
            .sorted_by_key(|p| p.join_seq)
            .collect_vec()
    }

    /// Number of non-host players
    pub fn player_count(&self) -> usize {
        self.players.len() - 1
    }

    /// Number of participants with the given status, host included
    pub fn status_count(&self, status: ConnectionStatus) -> usize {
        self.by_status[status].len()
    }

    /// Adds a finalized answer to its player's history and total
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownPlayer` if the answer's player is not a
    /// non-host player of this session.
    pub fn credit(&mut self, answer: Answer) -> Result<(), Error> {
        let player = self
            .players
            .get_mut(&answer.player)
            .filter(|p| !p.host)
            .ok_or(Error::UnknownPlayer)?;
        player.score = player.score.saturating_add(answer.points);
        player.answers.push(answer);
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn presence() -> (Presence, Id) {
        let host = Id::new();
        (Presence::with_host(host, SystemTime::now()), host)
    }

    fn join(presence: &mut Presence, name: &str) -> Id {
        let id = Id::new();
        presence
            .join(id, name, None, None, 10, SystemTime::now())
            .unwrap();
        id
    }

    #[test]
    fn test_id_round_trips_through_string() {
        let id = Id::new();
        assert_eq!(Id::from_str(&id.to_string()).unwrap(), id);
        assert!(Id::from_str("not-a-uuid").is_err());
    }

    #[test]
    fn test_host_is_tracked_but_not_a_player() {
        let (presence, host) = presence();
        assert!(presence.get(host).is_some_and(|p| p.host));
        assert!(!presence.is_player(host));
        assert_eq!(presence.player_count(), 0);
        assert!(presence.active_players().is_empty());
    }

    #[test]
    fn test_join_normalizes_nickname_and_assigns_order() {
        let (mut presence, _) = presence();
        let a = join(&mut presence, "  Ada ");
        let b = join(&mut presence, "Brook");

        let players = presence.players();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].id, a);
        assert_eq!(players[0].nickname, "Ada");
        assert_eq!(players[1].id, b);
        assert!(players[0].join_seq < players[1].join_seq);
    }

    #[test]
    fn test_join_rejections() {
        let (mut presence, host) = presence();
        let now = SystemTime::now();

        assert_eq!(
            presence.join(Id::new(), "   ", None, None, 10, now).err(),
            Some(Error::InvalidNickname(names::Error::Empty))
        );
        assert_eq!(
            presence
                .join(Id::new(), &"x".repeat(21), None, None, 10, now)
                .err(),
            Some(Error::InvalidNickname(names::Error::TooLong))
        );
        assert_eq!(
            presence.join(host, "Sneaky", None, None, 10, now).err(),
            Some(Error::AlreadyJoined)
        );
        assert_eq!(
            presence
                .join(Id::new(), "Pic", Some("a".repeat(201)), None, 10, now)
                .err(),
            Some(Error::InvalidAvatar)
        );
        assert_eq!(presence.player_count(), 0);
    }

    #[test]
    fn test_capacity_excludes_host() {
        let (mut presence, _) = presence();
        let now = SystemTime::now();

        presence.join(Id::new(), "One", None, None, 2, now).unwrap();
        presence.join(Id::new(), "Two", None, None, 2, now).unwrap();
        assert_eq!(
            presence.join(Id::new(), "Three", None, None, 2, now).err(),
            Some(Error::SessionFull)
        );
    }

    #[test]
    fn test_generated_nickname_ignores_requested_name() {
        let (mut presence, _) = presence();
        let player = presence
            .join(
                Id::new(),
                "Ignored",
                None,
                Some(NameStyle::Petname(2)),
                10,
                SystemTime::now(),
            )
            .unwrap();
        assert_ne!(player.nickname, "Ignored");
    }

    #[test]
    fn test_disconnect_keeps_player_and_score() {
        let (mut presence, _) = presence();
        let a = join(&mut presence, "Ada");
        let b = join(&mut presence, "Brook");

        assert_eq!(presence.mark_disconnected(a), Ok(true));
        assert_eq!(presence.mark_disconnected(a), Ok(false));

        assert_eq!(presence.players().len(), 2);
        assert_eq!(
            presence.active_players().iter().map(|p| p.id).collect_vec(),
            vec![b]
        );
        assert_eq!(presence.status_count(ConnectionStatus::Disconnected), 1);

        assert_eq!(presence.mark_reconnected(a), Ok(true));
        assert_eq!(presence.active_players().len(), 2);
        assert_eq!(
            presence.mark_reconnected(Id::new()),
            Err(Error::UnknownPlayer)
        );
    }

    #[test]
    fn test_serde_rebuilds_status_index() {
        let (mut presence, _) = presence();
        let a = join(&mut presence, "Ada");
        join(&mut presence, "Brook");
        presence.mark_disconnected(a).unwrap();

        let json = serde_json::to_string(&presence).unwrap();
        let restored: Presence = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.status_count(ConnectionStatus::Disconnected), 1);
        assert_eq!(restored.active_players().len(), 1);
        assert_eq!(restored.player_count(), 2);
    }
}
