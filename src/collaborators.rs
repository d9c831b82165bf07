//! Interfaces to the systems a session reports to
//!
//! A session persists itself through a [`Store`], fans its updates out
//! through a [`Broadcast`], hands final results to a [`StatsSink`] and
//! answer/rank events to an [`AchievementSink`]. In-memory implementations
//! are provided for single-process deployments and tests.

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    game::{AchievementEvent, Envelope, Game, Phase, PlayerResult},
    game_code::GameCode,
    presence::Id,
};

/// Errors reported by a [`Store`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached; the caller may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A snapshot could not be encoded or decoded
    #[error("snapshot encoding failed: {0}")]
    Encoding(String),
}

/// Errors reported by a [`StatsSink`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    /// The sink refused or lost the results
    #[error("stats sink failed: {0}")]
    Rejected(String),
}

/// A point-in-time copy of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Session ID
    pub session: Id,
    /// Join code at the time of the snapshot
    pub code: GameCode,
    /// Phase at the time of the snapshot
    pub phase: Phase,
    /// Sequence number of the last update included
    pub seq: u64,
    /// The serialized session
    pub body: String,
}

impl Snapshot {
    /// Serializes a session
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Encoding` if serialization fails.
    pub fn capture(game: &Game) -> Result<Self, StoreError> {
        Ok(Self {
            session: game.id(),
            code: game.code(),
            phase: game.phase(),
            seq: game.seq(),
            body: serde_json::to_string(game).map_err(|e| StoreError::Encoding(e.to_string()))?,
        })
    }

    /// Rebuilds the session the snapshot was taken from
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Encoding` if the body does not decode.
    pub fn restore(&self) -> Result<Game, StoreError> {
        serde_json::from_str(&self.body).map_err(|e| StoreError::Encoding(e.to_string()))
    }
}

/// Durable session storage
pub trait Store: Send + Sync {
    /// Atomically moves a session's phase from `expected` to `new`
    ///
    /// `expected` is `None` for a session that has never been stored.
    ///
    /// # Returns
    ///
    /// `false` if the stored phase did not match `expected`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the store cannot be reached.
    fn compare_and_set_phase(
        &self,
        session: Id,
        expected: Option<Phase>,
        new: Phase,
    ) -> Result<bool, StoreError>;

    /// Writes a full snapshot
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the store cannot be reached.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Reads the latest snapshot of a session
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the store cannot be reached.
    fn load(&self, session: Id) -> Result<Option<Snapshot>, StoreError>;
}

/// Fan-out of session updates to connected clients
///
/// Sessions call collaborators after releasing their lock, so implementations
/// may read from or act on the session. Concurrent operations can publish
/// out of order; `seq` gives the order in which they were committed.
pub trait Broadcast: Send + Sync {
    /// Publishes one update to everyone watching its session
    fn publish(&self, envelope: &Envelope);

    /// Signals that a session will publish nothing more
    fn close(&self, _session: Id) {}
}

/// Receiver of final per-player results
///
/// Called after the session lock is released.
pub trait StatsSink: Send + Sync {
    /// Records the results of an ended session
    ///
    /// # Errors
    ///
    /// Failures are logged by the session and never retried.
    fn record(&self, session: Id, results: &[PlayerResult]) -> Result<(), StatsError>;
}

/// Receiver of answer, rank and completion events
///
/// Called after the session lock is released.
pub trait AchievementSink: Send + Sync {
    /// Handles one event
    fn notify(&self, session: Id, event: &AchievementEvent);
}

/// In-memory [`Store`] keeping JSON snapshots in a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    phases: DashMap<Id, Phase>,
    snapshots: DashMap<Id, Snapshot>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Whether no session is stored
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Stored phase of a session
    pub fn phase(&self, session: Id) -> Option<Phase> {
        self.phases.get(&session).map(|p| *p)
    }
}

impl Store for MemoryStore {
    fn compare_and_set_phase(
        &self,
        session: Id,
        expected: Option<Phase>,
        new: Phase,
    ) -> Result<bool, StoreError> {
        Ok(match self.phases.entry(session) {
            Entry::Vacant(entry) => {
                let matches = expected.is_none();
                if matches {
                    entry.insert(new);
                }
                matches
            }
            Entry::Occupied(mut entry) => {
                let matches = expected == Some(*entry.get());
                if matches {
                    entry.insert(new);
                }
                matches
            }
        })
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.snapshots.insert(snapshot.session, snapshot.clone());
        Ok(())
    }

    fn load(&self, session: Id) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots.get(&session).map(|s| s.clone()))
    }
}

/// [`Broadcast`] built on one tokio broadcast channel per session
///
/// Slow receivers that fall more than `capacity` updates behind observe a
/// lag error and can resynchronize from a snapshot using `seq`.
#[derive(Debug)]
pub struct ChannelBroadcast {
    capacity: usize,
    channels: DashMap<Id, broadcast::Sender<Envelope>>,
}

impl Default for ChannelBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChannelBroadcast {
    /// Creates a fan-out buffering up to `capacity` updates per session
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: DashMap::new(),
        }
    }

    /// Subscribes to a session's updates
    pub fn subscribe(&self, session: Id) -> broadcast::Receiver<Envelope> {
        self.channels
            .entry(session)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Broadcast for ChannelBroadcast {
    fn publish(&self, envelope: &Envelope) {
        if let Some(sender) = self.channels.get(&envelope.session) {
            // no receivers left is not an error
            let _ = sender.send(envelope.clone());
        }
    }

    fn close(&self, session: Id) {
        self.channels.remove(&session);
    }
}

/// Collaborator that drops everything it is given
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Broadcast for Discard {
    fn publish(&self, _envelope: &Envelope) {}
}

impl StatsSink for Discard {
    fn record(&self, _session: Id, _results: &[PlayerResult]) -> Result<(), StatsError> {
        Ok(())
    }
}

impl AchievementSink for Discard {
    fn notify(&self, _session: Id, _event: &AchievementEvent) {}
}

/// Collaborator that keeps everything it is given, in arrival order
#[derive(Debug, Default)]
pub struct Recorder {
    envelopes: Mutex<Vec<Envelope>>,
    results: Mutex<Vec<(Id, Vec<PlayerResult>)>>,
    events: Mutex<Vec<(Id, AchievementEvent)>>,
}

impl Recorder {
    /// Creates an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates published so far
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().clone()
    }

    /// Results recorded so far, per session
    pub fn results(&self) -> Vec<(Id, Vec<PlayerResult>)> {
        self.results.lock().clone()
    }

    /// Achievement events received so far
    pub fn events(&self) -> Vec<(Id, AchievementEvent)> {
        self.events.lock().clone()
    }
}

impl Broadcast for Recorder {
    fn publish(&self, envelope: &Envelope) {
        self.envelopes.lock().push(envelope.clone());
    }
}

impl StatsSink for Recorder {
    fn record(&self, session: Id, results: &[PlayerResult]) -> Result<(), StatsError> {
        self.results.lock().push((session, results.to_vec()));
        Ok(())
    }
}

impl AchievementSink for Recorder {
    fn notify(&self, session: Id, event: &AchievementEvent) {
        self.events.lock().push((session, *event));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use web_time::SystemTime;

    use super::*;
    use crate::{
        game::{Options, UpdateMessage},
        quiz::Quiz,
    };

    fn game() -> Game {
        Game::new(
            Id::new(),
            GameCode::random(),
            Id::new(),
            Quiz::new(Vec::new()),
            Options::default(),
            SystemTime::now(),
        )
    }

    fn envelope(session: Id, seq: u64) -> Envelope {
        Envelope {
            session,
            seq,
            message: UpdateMessage::LobbyOpened {
                code: GameCode::random(),
            },
        }
    }

    #[test]
    fn test_compare_and_set_phase() {
        let store = MemoryStore::new();
        let id = Id::new();

        assert_eq!(
            store.compare_and_set_phase(id, Some(Phase::Created), Phase::Waiting),
            Ok(false)
        );
        assert_eq!(store.compare_and_set_phase(id, None, Phase::Created), Ok(true));
        assert_eq!(store.compare_and_set_phase(id, None, Phase::Created), Ok(false));
        assert_eq!(
            store.compare_and_set_phase(id, Some(Phase::Created), Phase::Waiting),
            Ok(true)
        );
        assert_eq!(store.phase(id), Some(Phase::Waiting));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_compare_and_set_has_one_winner() {
        let store = MemoryStore::new();
        let id = Id::new();
        store.compare_and_set_phase(id, None, Phase::Created).unwrap();

        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = &store;
                    scope.spawn(move || {
                        store
                            .compare_and_set_phase(id, Some(Phase::Created), Phase::Waiting)
                            .unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_snapshot_round_trip_through_store() {
        let store = MemoryStore::new();
        let game = game();
        let snapshot = Snapshot::capture(&game).unwrap();

        store.save(&snapshot).unwrap();
        let loaded = store.load(game.id()).unwrap().unwrap();
        let restored = loaded.restore().unwrap();

        assert_eq!(loaded.phase, Phase::Created);
        assert_eq!(restored.id(), game.id());
        assert_eq!(restored.code(), game.code());
        assert_eq!(store.load(Id::new()), Ok(None));
    }

    #[test]
    fn test_corrupt_snapshot_is_an_encoding_error() {
        let mut snapshot = Snapshot::capture(&game()).unwrap();
        snapshot.body = String::from("{");
        assert!(matches!(snapshot.restore(), Err(StoreError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_channel_broadcast_fans_out_per_session() {
        let broadcast = ChannelBroadcast::new(8);
        let (a, b) = (Id::new(), Id::new());
        let mut first = broadcast.subscribe(a);
        let mut second = broadcast.subscribe(a);
        let mut other = broadcast.subscribe(b);

        broadcast.publish(&envelope(a, 1));
        broadcast.publish(&envelope(a, 2));

        assert_eq!(first.recv().await.unwrap().seq, 1);
        assert_eq!(first.recv().await.unwrap().seq, 2);
        assert_eq!(second.recv().await.unwrap().seq, 1);
        assert!(other.try_recv().is_err());

        broadcast.close(a);
        assert_eq!(second.recv().await.unwrap().seq, 2);
        assert!(second.recv().await.is_err());
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let broadcast = ChannelBroadcast::default();
        broadcast.publish(&envelope(Id::new(), 1));
    }

    #[test]
    fn test_recorder_keeps_order() {
        let recorder = Recorder::new();
        let id = Id::new();
        recorder.publish(&envelope(id, 1));
        recorder.publish(&envelope(id, 2));
        recorder.record(id, &[]).unwrap();

        assert_eq!(
            recorder.envelopes().iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(recorder.results().len(), 1);
        assert!(recorder.events().is_empty());
    }
}
