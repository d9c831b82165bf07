//! Session creation, lookup and restore
//!
//! The [`Engine`] owns the join code index and the collaborators shared by
//! every session it creates. Sessions are independent of each other; the
//! engine only hands out codes and routes a code to its session.

use std::sync::Arc;

use garde::Validate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    collaborators::StoreError,
    constants,
    game::{Game, Options, Phase},
    presence::{Id, Player},
    quiz::Quiz,
    registry,
    session::{self, Services, Session, SessionRegistry},
};

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Candidate codes tried before session creation gives up
    pub max_issue_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_issue_attempts: constants::code::MAX_ISSUE_ATTEMPTS,
        }
    }
}

/// Errors returned by the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Code issuance or resolution failed
    #[error(transparent)]
    Registry(#[from] registry::Error),
    /// The session refused the operation
    #[error(transparent)]
    Session(#[from] session::Error),
    /// The quiz or options are invalid
    #[error("invalid session setup: {0}")]
    Invalid(#[from] garde::Report),
    /// The store could not be read
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The store holds no session with this ID
    #[error("no stored session with this ID")]
    UnknownSession,
}

/// Entry point for hosting sessions
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<SessionRegistry>,
    services: Services,
}

impl Engine {
    /// Creates an engine issuing random codes
    pub fn new(config: Config, services: Services) -> Self {
        Self::with_registry(SessionRegistry::new(config.max_issue_attempts), services)
    }

    /// Creates an engine around a prepared code index
    pub fn with_registry(registry: SessionRegistry, services: Services) -> Self {
        Self {
            registry: Arc::new(registry),
            services,
        }
    }

    /// The code index
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Number of sessions holding a code
    pub fn active_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Creates a session in the `Created` phase and gives it a join code
    ///
    /// # Errors
    ///
    /// * `Error::Invalid` - The quiz or options failed validation
    /// * `Error::Registry` - No free code was found
    /// * `Error::Session` - The first snapshot could not be stored; the code
    ///   is released again
    pub fn create_session(
        &self,
        host: Id,
        quiz: Quiz,
        options: Options,
    ) -> Result<Arc<Session>, Error> {
        quiz.validate()?;
        options.validate()?;

        let now = self.services.clock.now();
        let (code, session) = self.registry.issue_with(|code| {
            Session::new(
                Game::new(Id::new(), code, host, quiz, options, now),
                self.services.clone(),
                Arc::downgrade(&self.registry),
            )
        })?;

        if let Err(error) = session.persist_new() {
            self.registry.release(&code);
            return Err(error.into());
        }

        tracing::info!(session = %session.id(), %code, "session created");
        Ok(session)
    }

    /// Finds the session a player-entered code belongs to
    ///
    /// # Errors
    ///
    /// `Error::Registry` if the code is malformed or not active.
    pub fn resolve(&self, code: &str) -> Result<Arc<Session>, Error> {
        Ok(self.registry.resolve(code)?)
    }

    /// Resolves a code and joins its session
    ///
    /// # Errors
    ///
    /// See [`Engine::resolve`] and [`Session::join`].
    pub fn join(
        &self,
        code: &str,
        player: Id,
        nickname: &str,
        avatar: Option<String>,
    ) -> Result<(Arc<Session>, Player), Error> {
        let session = self.resolve(code)?;
        let joined = session.join(player, nickname, avatar)?;
        Ok((session, joined))
    }

    /// Rebuilds a session from its latest snapshot
    ///
    /// Unfinished sessions get their code back and their timers re-armed;
    /// a question whose deadline passed while nobody held the session is
    /// closed right away.
    ///
    /// # Errors
    ///
    /// * `Error::UnknownSession` - Nothing is stored under `session`
    /// * `Error::Store` - The store failed or the snapshot is corrupt
    /// * `Error::Registry` - The session's code is held by another session
    pub fn restore(&self, session: Id) -> Result<Arc<Session>, Error> {
        let snapshot = self
            .services
            .store
            .load(session)?
            .ok_or(Error::UnknownSession)?;
        let game = snapshot.restore()?;
        let ended = game.phase() == Phase::Ended;

        let restored = Session::new(game, self.services.clone(), Arc::downgrade(&self.registry));
        if !ended {
            self.registry.reserve(restored.code(), restored.clone())?;
            restored.resume();
        }

        tracing::info!(session = %session, phase = ?restored.phase(), "session restored");
        Ok(restored)
    }
}
