//! Leaderboard and score aggregation
//!
//! This module keeps the points every player earned on every closed question
//! and derives standings from them: total score descending, ties broken by
//! join order. Only the per-question points are persisted; the cached
//! standings are rebuilt when a leaderboard is deserialized.

use std::{cmp::Reverse, collections::HashMap};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::{TruncatedVec, presence::Id};

/// One row of the leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    /// Player ID
    pub id: Id,
    /// Player nickname
    pub nickname: String,
    /// Total points
    pub score: u64,
    /// 1-based position
    pub rank: usize,
}

/// A player's position moved between two consecutive standings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankChange {
    /// Player whose rank moved
    pub player: Id,
    /// Rank before the latest question
    pub from: usize,
    /// Rank after the latest question
    pub to: usize,
}

/// Score information for a single player
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ScoreMessage {
    /// Total points earned by the player
    pub points: u64,
    /// Current position in the leaderboard (1-indexed)
    pub position: usize,
}

/// Ranks players given in join order with their totals
///
/// The sort is stable, so players with equal scores keep their join order.
pub fn rank<'a, I>(players: I) -> Vec<Standing>
where
    I: IntoIterator<Item = (Id, &'a str, u64)>,
{
    players
        .into_iter()
        .sorted_by_key(|(_, _, score)| Reverse(*score))
        .enumerate()
        .map(|(position, (id, nickname, score))| Standing {
            id,
            nickname: nickname.to_owned(),
            score,
            rank: position + 1,
        })
        .collect()
}

/// Sums points per player over the given rounds and ranks the roster
fn standings_after(roster: &[(Id, String)], rounds: &[Vec<(Id, u64)>]) -> Vec<Standing> {
    let mut totals: HashMap<Id, u64> = HashMap::new();
    for (id, points) in rounds.iter().flatten() {
        let total = totals.entry(*id).or_default();
        *total = total.saturating_add(*points);
    }
    rank(
        roster
            .iter()
            .map(|(id, nickname)| (*id, nickname.as_str(), totals.get(id).copied().unwrap_or(0))),
    )
}

/// Serialization helper for Leaderboard struct
#[derive(Deserialize)]
struct LeaderboardSerde {
    roster: Vec<(Id, String)>,
    points_earned: Vec<Vec<(Id, u64)>>,
}

/// Tracks points per question and the resulting standings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "LeaderboardSerde")]
pub struct Leaderboard {
    /// Players in join order with their nicknames
    roster: Vec<(Id, String)>,
    /// Points earned by each player for each closed question
    points_earned: Vec<Vec<(Id, u64)>>,

    /// Standings before the latest question (cached)
    #[serde(skip)]
    previous: Vec<Standing>,
    /// Current standings (cached)
    #[serde(skip)]
    current: Vec<Standing>,
    /// Mapping from player ID to total score and 1-based position (cached)
    #[serde(skip)]
    score_and_position: HashMap<Id, (u64, usize)>,
}

impl From<LeaderboardSerde> for Leaderboard {
    /// Rebuilds the cached standings, which are not serialized
    fn from(serde: LeaderboardSerde) -> Self {
        let LeaderboardSerde {
            roster,
            points_earned,
        } = serde;

        let current = standings_after(&roster, &points_earned);
        let previous = match points_earned.split_last() {
            Some((_, earlier)) => standings_after(&roster, earlier),
            None => Vec::new(),
        };

        let mut leaderboard = Self {
            roster,
            points_earned,
            previous,
            current,
            score_and_position: HashMap::new(),
        };
        leaderboard.reindex();
        leaderboard
    }
}

impl Leaderboard {
    /// Creates a leaderboard for a fixed roster, everyone on zero points
    ///
    /// # Arguments
    ///
    /// * `roster` - Players in join order with their nicknames
    pub fn new(roster: Vec<(Id, String)>) -> Self {
        let current = standings_after(&roster, &[]);
        let mut leaderboard = Self {
            roster,
            points_earned: Vec::new(),
            previous: Vec::new(),
            current,
            score_and_position: HashMap::new(),
        };
        leaderboard.reindex();
        leaderboard
    }

    fn reindex(&mut self) {
        self.score_and_position = self
            .current
            .iter()
            .map(|s| (s.id, (s.score, s.rank)))
            .collect();
    }

    /// Adds the points of one closed question and recomputes standings
    ///
    /// # Returns
    ///
    /// Players whose rank differs from the standings after the previous
    /// question. Empty after the first question, since there is no earlier
    /// ranking to compare against.
    pub fn add_scores(&mut self, scores: &[(Id, u64)]) -> Vec<RankChange> {
        self.points_earned.push(scores.to_vec());

        let mut totals: HashMap<Id, u64> = self
            .score_and_position
            .iter()
            .map(|(id, (points, _))| (*id, *points))
            .collect();
        for (id, points) in scores {
            let total = totals.entry(*id).or_default();
            *total = total.saturating_add(*points);
        }

        let standings = rank(self.roster.iter().map(|(id, nickname)| {
            (*id, nickname.as_str(), totals.get(id).copied().unwrap_or(0))
        }));
        self.previous = std::mem::replace(&mut self.current, standings);

        let before = std::mem::take(&mut self.score_and_position);
        self.reindex();

        if self.points_earned.len() < 2 {
            return Vec::new();
        }
        self.current
            .iter()
            .filter_map(|s| {
                let &(_, from) = before.get(&s.id)?;
                (from != s.rank).then_some(RankChange {
                    player: s.id,
                    from,
                    to: s.rank,
                })
            })
            .collect()
    }

    /// Current standings, best first
    pub fn standings(&self) -> &[Standing] {
        &self.current
    }

    /// Standings before the latest question, best first
    pub fn previous_standings(&self) -> &[Standing] {
        &self.previous
    }

    /// Returns the current and previous standings, truncated for display
    ///
    /// # Returns
    ///
    /// An array containing `[current, previous]`
    pub fn last_two(&self, limit: usize) -> [TruncatedVec<Standing>; 2] {
        [
            TruncatedVec::new(self.current.iter().cloned(), limit, self.current.len()),
            TruncatedVec::new(self.previous.iter().cloned(), limit, self.previous.len()),
        ]
    }

    /// Total score and position of a player
    pub fn score(&self, id: Id) -> Option<ScoreMessage> {
        self.score_and_position
            .get(&id)
            .map(|&(points, position)| ScoreMessage { points, position })
    }

    /// Number of questions scored so far
    pub fn rounds(&self) -> usize {
        self.points_earned.len()
    }

    /// Points a player earned on each question, in question order
    pub fn player_summary(&self, id: Id) -> Vec<u64> {
        self.points_earned
            .iter()
            .map(|round| {
                round
                    .iter()
                    .find(|(player, _)| *player == id)
                    .map_or(0, |(_, points)| *points)
            })
            .collect()
    }
}
