//! Live session handle
//!
//! A [`Session`] wraps one [`Game`] behind a mutex and is the only way to
//! change it. Every operation runs the same sequence:
//!
//! 1. close the open question if its deadline has passed,
//! 2. apply the operation to a copy of the game,
//! 3. persist the copy (phase compare-and-set, then snapshot),
//! 4. swap the copy in,
//! 5. release the lock, then dispatch broadcasts, events and alarms.
//!
//! Steps 1 to 4 run under the lock. A failure in step 2 or 3 leaves both the
//! live state and the store as they were, and nothing is broadcast.
//!
//! Collaborators are called without the lock held and may call back into
//! the session. Operations racing on other threads can dispatch in a
//! different order than they committed; [`Envelope::seq`](game::Envelope::seq)
//! gives the commit order.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use web_time::SystemTime;

use crate::{
    collaborators::{
        AchievementSink, Broadcast, Discard, MemoryStore, Snapshot, StatsSink, Store, StoreError,
    },
    constants,
    game::{self, Actor, AlarmMessage, CloseOutcome, Game, Outbox, Phase, State},
    game_code::GameCode,
    leaderboard::{ScoreMessage, Standing},
    presence::{ConnectionStatus, Id, Player},
    quiz::{Answer, AnswerValue},
    registry::CodeRegistry,
};

/// Code index shared by the sessions of one engine
pub type SessionRegistry = CodeRegistry<Arc<Session>>;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// The current time
    fn now(&self) -> SystemTime;
}

/// [`Clock`] reading the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A deferred piece of work
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks after a delay
///
/// Tasks call back into the session, so implementations must not run them
/// synchronously inside `schedule`.
pub trait Scheduler: Send + Sync {
    /// Runs `task` once `delay` has elapsed
    fn schedule(&self, delay: Duration, task: Task);
}

/// [`Scheduler`] spawning a sleeping task on a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Schedules onto the given runtime
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Schedules onto the runtime the caller is running in
    ///
    /// # Errors
    ///
    /// Returns a `TryCurrentError` when called outside a tokio runtime.
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        tokio::runtime::Handle::try_current().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

/// [`Scheduler`] that drops every task
///
/// Sessions still close questions on time because every operation checks
/// the deadline first; only auto-advance needs a real scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unscheduled;

impl Scheduler for Unscheduled {
    fn schedule(&self, _delay: Duration, _task: Task) {}
}

/// Everything a session talks to
#[derive(Clone)]
pub struct Services {
    /// Durable storage
    pub store: Arc<dyn Store>,
    /// Update fan-out
    pub broadcast: Arc<dyn Broadcast>,
    /// Final results sink
    pub stats: Arc<dyn StatsSink>,
    /// Achievement event sink
    pub achievements: Arc<dyn AchievementSink>,
    /// Alarm delivery
    pub scheduler: Arc<dyn Scheduler>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

impl Default for Services {
    /// In-memory store, no outputs, lazy deadlines and the system clock
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            broadcast: Arc::new(Discard),
            stats: Arc::new(Discard),
            achievements: Arc::new(Discard),
            scheduler: Arc::new(Unscheduled),
            clock: Arc::new(SystemClock),
        }
    }
}

impl Services {
    /// Replaces the store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the broadcast
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: Arc<dyn Broadcast>) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Replaces the stats sink
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    /// Replaces the achievement sink
    #[must_use]
    pub fn with_achievements(mut self, achievements: Arc<dyn AchievementSink>) -> Self {
        self.achievements = achievements;
        self
    }

    /// Replaces the scheduler
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replaces the clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Errors returned by session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The game refused the operation
    #[error(transparent)]
    Game(#[from] game::Error),
    /// The store failed; nothing changed and the operation may be retried
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The stored phase no longer matches this handle's state
    #[error("session was modified elsewhere")]
    Conflict,
}

/// A live session
pub struct Session {
    id: Id,
    code: GameCode,
    host: Id,
    game: Mutex<Game>,
    services: Services,
    registry: Weak<SessionRegistry>,
    this: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("code", &self.code)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wraps a game; the code is released from `registry` when it ends
    pub(crate) fn new(game: Game, services: Services, registry: Weak<SessionRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: game.id(),
            code: game.code(),
            host: game.host(),
            game: Mutex::new(game),
            services,
            registry,
            this: this.clone(),
        })
    }

    /// Writes the first snapshot of a freshly created session
    pub(crate) fn persist_new(&self) -> Result<(), Error> {
        let game = self.game.lock();
        let snapshot = Snapshot::capture(&game)?;
        if !self
            .services
            .store
            .compare_and_set_phase(self.id, None, game.phase())?
        {
            return Err(Error::Conflict);
        }
        self.services.store.save(&snapshot)?;
        Ok(())
    }

    /// Re-arms timers after a restore from the store
    pub(crate) fn resume(&self) {
        let mut pending = Vec::new();
        let rearm = {
            let mut game = self.game.lock();
            let now = self.services.clock.now();
            if let Err(error) = self.expire_locked(&mut game, now, &mut pending) {
                tracing::warn!(session = %self.id, %error, "could not expire restored question");
            }
            match game.state() {
                State::QuestionActive(collector) => Some((
                    AlarmMessage::Deadline {
                        index: collector.index(),
                    },
                    collector.remaining(now),
                )),
                State::QuestionClosed(index) => game
                    .options()
                    .auto_advance
                    .map(|pause| (AlarmMessage::Advance { index: *index }, pause)),
                _ => None,
            }
        };
        self.flush(pending);
        if let Some((alarm, delay)) = rearm {
            self.schedule(alarm, delay);
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
        self.host
    }

    /// Committed phase
    pub fn phase(&self) -> Phase {
        self.game.lock().phase()
    }

    /// Deadline of the open question
    pub fn deadline(&self) -> Option<SystemTime> {
        self.game.lock().deadline()
    }

    /// Current standings, best first
    pub fn standings(&self) -> Vec<Standing> {
        self.game.lock().leaderboard().standings().to_vec()
    }

    /// A player's total and position, once the first question started
    pub fn score(&self, player: Id) -> Option<ScoreMessage> {
        self.game.lock().leaderboard().score(player)
    }

    /// Connected players in join order
    pub fn active_players(&self) -> Vec<Player> {
        self.game
            .lock()
            .presence()
            .active_players()
            .into_iter()
            .cloned()
            .collect()
    }

    /// A copy of the committed state
    pub fn snapshot(&self) -> Game {
        self.game.lock().clone()
    }

    /// Opens the lobby
    ///
    /// # Errors
    ///
    /// See [`Game::open`]; store failures surface as `Error::Store`.
    pub fn open(&self, by: Id) -> Result<(), Error> {
        self.transact(|game, out, _| game.open(by, out))?;
        tracing::info!(session = %self.id, code = %self.code, "lobby opened");
        Ok(())
    }

    /// Adds a player to the lobby
    ///
    /// # Errors
    ///
    /// See [`Game::join`].
    pub fn join(&self, player: Id, nickname: &str, avatar: Option<String>) -> Result<Player, Error> {
        self.transact(|game, out, now| game.join(player, nickname, avatar, out, now))
    }

    /// Marks a participant disconnected, keeping their score
    ///
    /// # Errors
    ///
    /// See [`Game::set_connection`].
    pub fn mark_disconnected(&self, id: Id) -> Result<bool, Error> {
        self.transact(|game, out, _| game.set_connection(id, ConnectionStatus::Disconnected, out))
    }

    /// Marks a participant connected again
    ///
    /// # Errors
    ///
    /// See [`Game::set_connection`].
    pub fn mark_reconnected(&self, id: Id) -> Result<bool, Error> {
        self.transact(|game, out, _| game.set_connection(id, ConnectionStatus::Connected, out))
    }

    /// Starts the first question
    ///
    /// # Errors
    ///
    /// See [`Game::start`].
    pub fn start(&self, by: Id) -> Result<(), Error> {
        self.transact(|game, out, now| game.start(by, out, now))
    }

    /// Submits an answer for the open question
    ///
    /// # Errors
    ///
    /// See [`Game::submit`].
    pub fn submit(
        &self,
        player: Id,
        question: Id,
        value: AnswerValue,
        client_elapsed: Option<Duration>,
    ) -> Result<Answer, Error> {
        self.transact(|game, out, now| game.submit(player, question, value, client_elapsed, out, now))
    }

    /// Closes the open question on the host's request
    ///
    /// # Errors
    ///
    /// See [`Game::close`].
    pub fn close(&self, by: Id) -> Result<CloseOutcome, Error> {
        self.transact(|game, out, _| game.close(Actor::Host(by), out))
    }

    /// Moves past a closed question
    ///
    /// # Errors
    ///
    /// See [`Game::next`].
    pub fn next(&self, by: Id) -> Result<(), Error> {
        self.transact(|game, out, now| game.next(Actor::Host(by), out, now))
    }

    /// Aborts the session
    ///
    /// # Errors
    ///
    /// See [`Game::end`].
    pub fn end(&self, by: Id) -> Result<(), Error> {
        self.transact(|game, out, _| game.end(by, out))
    }

    /// Closes the open question if its deadline has passed
    ///
    /// # Returns
    ///
    /// `true` if a question was closed
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the closed question could not be persisted.
    pub fn tick(&self) -> Result<bool, Error> {
        let mut pending = Vec::new();
        let result = {
            let mut game = self.game.lock();
            let before = game.phase();
            self.expire_locked(&mut game, self.services.clock.now(), &mut pending)
                .map(|()| before != game.phase())
        };
        self.flush(pending);
        result
    }

    /// Delivers an alarm scheduled by this session
    ///
    /// Alarms that cannot be stored are retried shortly after.
    pub fn receive_alarm(&self, alarm: AlarmMessage) {
        let result = self.transact(|game, out, now| {
            game.receive_alarm(alarm, out, now);
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(Error::Store(error)) => {
                tracing::warn!(session = %self.id, ?alarm, %error, "alarm not stored, retrying");
                self.schedule(alarm, Duration::from_secs(constants::session::ALARM_RETRY));
            }
            Err(error) => tracing::warn!(session = %self.id, ?alarm, %error, "alarm dropped"),
        }
    }

    fn transact<T, F>(&self, action: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Game, &mut Outbox, SystemTime) -> Result<T, game::Error>,
    {
        let mut pending = Vec::new();
        let result = self.apply(action, &mut pending);
        self.flush(pending);
        result
    }

    /// Runs `action` under the lock, queueing committed effects in `pending`
    ///
    /// An expiry committed before a refused action is still queued.
    fn apply<T, F>(&self, action: F, pending: &mut Vec<Outbox>) -> Result<T, Error>
    where
        F: FnOnce(&mut Game, &mut Outbox, SystemTime) -> Result<T, game::Error>,
    {
        let mut game = self.game.lock();
        let now = self.services.clock.now();
        self.expire_locked(&mut game, now, pending)?;

        let mut next = game.clone();
        let mut out = Outbox::default();
        let value = action(&mut next, &mut out, now).inspect_err(|error| {
            tracing::debug!(session = %self.id, %error, "operation refused");
        })?;

        self.commit(&mut game, next, out, pending)?;
        Ok(value)
    }

    fn expire_locked(
        &self,
        game: &mut Game,
        now: SystemTime,
        pending: &mut Vec<Outbox>,
    ) -> Result<(), Error> {
        if !game.is_due(now) {
            return Ok(());
        }
        let mut next = game.clone();
        let mut out = Outbox::default();
        next.expire_if_due(&mut out, now);
        self.commit(game, next, out, pending)
    }

    fn commit(
        &self,
        game: &mut Game,
        next: Game,
        out: Outbox,
        pending: &mut Vec<Outbox>,
    ) -> Result<(), Error> {
        if out.changed_state() {
            self.persist(game.phase(), &next)?;
            *game = next;
        }
        pending.push(out);
        Ok(())
    }

    fn flush(&self, pending: Vec<Outbox>) {
        for out in pending {
            self.dispatch(out);
        }
    }

    fn persist(&self, from: Phase, next: &Game) -> Result<(), Error> {
        let snapshot = Snapshot::capture(next)?;
        let store = &self.services.store;
        let to = next.phase();

        let moved = store
            .compare_and_set_phase(self.id, Some(from), to)
            .inspect_err(|error| {
                tracing::warn!(session = %self.id, %error, "store unavailable, transition aborted");
            })?;
        if !moved {
            return Err(Error::Conflict);
        }

        if let Err(error) = store.save(&snapshot) {
            tracing::warn!(session = %self.id, %error, "snapshot not saved, transition aborted");
            if from != to
                && let Err(revert) = store.compare_and_set_phase(self.id, Some(to), from)
            {
                tracing::warn!(session = %self.id, error = %revert, "stored phase could not be reverted");
            }
            return Err(error.into());
        }
        Ok(())
    }

    fn dispatch(&self, out: Outbox) {
        let Outbox {
            updates,
            achievements,
            alarms,
            results,
        } = out;

        for envelope in &updates {
            self.services.broadcast.publish(envelope);
        }
        for event in &achievements {
            self.services.achievements.notify(self.id, event);
        }
        for (alarm, delay) in alarms {
            self.schedule(alarm, delay);
        }

        if let Some(results) = results {
            if let Err(error) = self.services.stats.record(self.id, &results) {
                tracing::warn!(session = %self.id, %error, "final results not recorded");
            }
            if let Some(registry) = self.registry.upgrade() {
                registry.release(&self.code);
            }
            self.services.broadcast.close(self.id);
        }
    }

    fn schedule(&self, alarm: AlarmMessage, delay: Duration) {
        let session = self.this.clone();
        self.services.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(session) = session.upgrade() {
                    session.receive_alarm(alarm);
                }
            }),
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{
        collaborators::Recorder,
        game::{Options, Rejection, UpdateMessage},
        quiz::{Quiz, fixtures::single_choice},
    };

    #[derive(Default)]
    struct ManualClock(Mutex<Option<SystemTime>>);

    impl ManualClock {
        fn at(start: SystemTime) -> Self {
            Self(Mutex::new(Some(start)))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock();
            *now = now.map(|t| t + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            self.0.lock().unwrap_or_else(SystemTime::now)
        }
    }

    #[derive(Default)]
    struct ManualScheduler(Mutex<Vec<(Duration, Task)>>);

    impl ManualScheduler {
        fn run_all(&self) -> usize {
            let tasks = std::mem::take(&mut *self.0.lock());
            let count = tasks.len();
            for (_, task) in tasks {
                task();
            }
            count
        }

        fn delays(&self) -> Vec<Duration> {
            self.0.lock().iter().map(|(d, _)| *d).collect()
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: Task) {
            self.0.lock().push((delay, task));
        }
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable(String::from("down")))
            } else {
                Ok(())
            }
        }
    }

    impl Store for FlakyStore {
        fn compare_and_set_phase(
            &self,
            session: Id,
            expected: Option<Phase>,
            new: Phase,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.compare_and_set_phase(session, expected, new)
        }

        fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save(snapshot)
        }

        fn load(&self, session: Id) -> Result<Option<Snapshot>, StoreError> {
            self.check()?;
            self.inner.load(session)
        }
    }

    struct Harness {
        session: Arc<Session>,
        host: Id,
        clock: Arc<ManualClock>,
        scheduler: Arc<ManualScheduler>,
        recorder: Arc<Recorder>,
        store: Arc<FlakyStore>,
        registry: Arc<SessionRegistry>,
    }

    fn harness(quiz: Quiz, options: Options) -> Harness {
        let clock = Arc::new(ManualClock::at(SystemTime::now()));
        let scheduler = Arc::new(ManualScheduler::default());
        let recorder = Arc::new(Recorder::new());
        let store = Arc::new(FlakyStore::default());
        let services = Services::default()
            .with_clock(clock.clone())
            .with_scheduler(scheduler.clone())
            .with_broadcast(recorder.clone())
            .with_stats(recorder.clone())
            .with_achievements(recorder.clone())
            .with_store(store.clone());

        let registry = Arc::new(SessionRegistry::default());
        let host = Id::new();
        let (_, session) = registry
            .issue_with(|code| {
                Session::new(
                    Game::new(Id::new(), code, host, quiz, options, clock.now()),
                    services,
                    Arc::downgrade(&registry),
                )
            })
            .unwrap();
        session.persist_new().unwrap();

        Harness {
            session,
            host,
            clock,
            scheduler,
            recorder,
            store,
            registry,
        }
    }

    fn started(h: &Harness, names: &[&str]) -> Vec<Id> {
        h.session.open(h.host).unwrap();
        let ids = names
            .iter()
            .map(|n| {
                let id = Id::new();
                h.session.join(id, n, None).unwrap();
                id
            })
            .collect();
        h.session.start(h.host).unwrap();
        ids
    }

    #[test]
    fn test_lazy_expiry_before_any_operation() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        let players = started(&h, &["Ada"]);
        let question = h.session.snapshot().quiz().questions[0].id;

        h.clock.advance(Duration::from_secs(21));
        assert_eq!(
            h.session
                .submit(players[0], question, AnswerValue::single(0), None)
                .err(),
            Some(Error::Game(game::Error::Rejected(Rejection::DeadlinePassed)))
        );
        assert_eq!(h.session.phase(), Phase::QuestionClosed);
        assert_eq!(h.store.inner.phase(h.session.id()), Some(Phase::QuestionClosed));
    }

    #[test]
    fn test_deadline_alarm_closes_question() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        started(&h, &["Ada"]);
        assert_eq!(h.scheduler.delays(), vec![Duration::from_secs(20)]);

        h.clock.advance(Duration::from_secs(20));
        assert_eq!(h.scheduler.run_all(), 1);

        assert_eq!(h.session.phase(), Phase::QuestionClosed);
        assert!(h.recorder.envelopes().iter().any(|e| matches!(
            e.message,
            UpdateMessage::QuestionClosed { index: 0, .. }
        )));
    }

    #[test]
    fn test_store_failure_aborts_transition() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        h.session.open(h.host).unwrap();
        h.session.join(Id::new(), "Ada", None).unwrap();
        let published = h.recorder.envelopes().len();

        h.store.down.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.session.start(h.host),
            Err(Error::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(h.session.phase(), Phase::Waiting);
        assert_eq!(h.recorder.envelopes().len(), published);
        assert!(h.scheduler.delays().is_empty());

        h.store.down.store(false, Ordering::SeqCst);
        assert!(h.session.start(h.host).is_ok());
        assert_eq!(h.session.phase(), Phase::QuestionActive);
    }

    #[test]
    fn test_alarm_retried_when_store_is_down() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        started(&h, &["Ada"]);

        h.clock.advance(Duration::from_secs(20));
        h.store.down.store(true, Ordering::SeqCst);
        h.scheduler.run_all();
        assert_eq!(h.session.phase(), Phase::QuestionActive);
        assert_eq!(
            h.scheduler.delays(),
            vec![Duration::from_secs(constants::session::ALARM_RETRY)]
        );

        h.store.down.store(false, Ordering::SeqCst);
        h.scheduler.run_all();
        assert_eq!(h.session.phase(), Phase::QuestionClosed);
    }

    #[test]
    fn test_conflicting_store_phase_is_refused() {
        let h = harness(Quiz::new(Vec::new()), Options::default());
        h.store
            .inner
            .compare_and_set_phase(h.session.id(), Some(Phase::Created), Phase::Ended)
            .unwrap();

        assert_eq!(h.session.open(h.host), Err(Error::Conflict));
        assert_eq!(h.session.phase(), Phase::Created);
    }

    #[test]
    fn test_end_releases_code_and_reports_results() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        started(&h, &["Ada", "Bo"]);
        assert_eq!(h.registry.len(), 1);

        h.session.end(h.host).unwrap();

        assert!(h.registry.resolve_code(&h.session.code()).is_err());
        let results = h.recorder.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, h.session.id());
        assert_eq!(results[0].1.len(), 2);
    }

    #[test]
    fn test_refused_operation_changes_nothing() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        let seq = h.session.snapshot().seq();

        assert!(h.session.start(h.host).is_err());
        assert!(h.session.join(Id::new(), "Ada", None).is_err());

        assert_eq!(h.session.snapshot().seq(), seq);
        assert!(h.recorder.envelopes().is_empty());
    }

    #[test]
    fn test_stale_alarm_after_host_close_is_ignored() {
        let h = harness(
            Quiz::new(vec![single_choice(500, 20, 4, 0), single_choice(500, 20, 4, 0)]),
            Options::default(),
        );
        started(&h, &["Ada"]);
        h.session.close(h.host).unwrap();
        h.session.next(h.host).unwrap();

        // deadline alarms for both questions are pending; only the second is live
        h.clock.advance(Duration::from_secs(5));
        h.scheduler.run_all();
        assert_eq!(h.session.phase(), Phase::QuestionActive);
        assert_eq!(h.session.close(h.host), Ok(CloseOutcome::Closed));
        assert_eq!(h.session.close(h.host), Ok(CloseOutcome::AlreadyClosed));
    }

    #[test]
    fn test_tick_expires_question() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        started(&h, &["Ada"]);

        assert_eq!(h.session.tick(), Ok(false));
        h.clock.advance(Duration::from_secs(30));
        assert_eq!(h.session.tick(), Ok(true));
        assert_eq!(h.session.tick(), Ok(false));
    }

    #[derive(Default)]
    struct Observer {
        session: Mutex<Weak<Session>>,
        seen: Mutex<Vec<(u64, Phase, usize)>>,
    }

    impl Broadcast for Observer {
        fn publish(&self, envelope: &game::Envelope) {
            let session = self.session.lock().upgrade();
            if let Some(session) = session {
                let players = session.active_players().len();
                self.seen.lock().push((envelope.seq, session.phase(), players));
            }
        }
    }

    #[test]
    fn test_broadcast_can_read_the_session() {
        let observer = Arc::new(Observer::default());
        let host = Id::new();
        let game = Game::new(
            Id::new(),
            GameCode::random(),
            host,
            Quiz::new(vec![single_choice(500, 20, 4, 0)]),
            Options::default(),
            SystemTime::now(),
        );
        let session = Session::new(
            game,
            Services::default().with_broadcast(observer.clone()),
            Weak::new(),
        );
        *observer.session.lock() = Arc::downgrade(&session);
        session.persist_new().unwrap();

        session.open(host).unwrap();
        session.join(Id::new(), "Ada", None).unwrap();
        session.start(host).unwrap();

        assert_eq!(
            *observer.seen.lock(),
            vec![
                (1, Phase::Waiting, 0),
                (2, Phase::Waiting, 1),
                (3, Phase::QuestionActive, 1),
            ]
        );
    }

    #[test]
    fn test_score_follows_the_leaderboard() {
        let h = harness(Quiz::new(vec![single_choice(500, 20, 4, 0)]), Options::default());
        let players = started(&h, &["Ada", "Bo"]);
        let question = h.session.snapshot().quiz().questions[0].id;

        h.session
            .submit(players[1], question, AnswerValue::single(0), None)
            .unwrap();
        h.session.close(h.host).unwrap();

        assert_eq!(
            h.session.score(players[1]),
            Some(ScoreMessage {
                points: 500,
                position: 1
            })
        );
        assert_eq!(
            h.session.score(players[0]),
            Some(ScoreMessage {
                points: 0,
                position: 2
            })
        );
        assert_eq!(h.session.score(Id::new()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_runs_after_delay() {
        let scheduler = TokioScheduler::current().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        scheduler.schedule(
            Duration::from_secs(10),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
