//! Active join code index
//!
//! The registry maps each live [`GameCode`] to a reference to the session
//! that owns it. It is shared by every session of an engine, so issuance uses
//! an atomic check-and-insert on a sharded map: two sessions created at the
//! same time can never end up holding the same code.

use std::str::FromStr;

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use thiserror::Error;

use crate::{
    constants,
    game_code::{self, GameCode},
};

/// Errors that can occur when issuing or resolving join codes
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The supplied code is malformed
    #[error(transparent)]
    Code(#[from] game_code::Error),
    /// The code does not belong to any active session
    #[error("no active session uses this code")]
    NotFound,
    /// Every generated candidate collided with an active code
    #[error("no free join code found after {0} attempts")]
    CodeExhausted(usize),
    /// A specific code could not be reserved because it is in use
    #[error("join code is already in use")]
    CodeTaken,
}

/// Index of active join codes
///
/// `V` is whatever handle callers resolve a code to; the engine uses
/// `Arc<Session>`.
pub struct CodeRegistry<V> {
    active: DashMap<GameCode, V>,
    max_attempts: usize,
    generate: Box<dyn Fn() -> GameCode + Send + Sync>,
}

impl<V> std::fmt::Debug for CodeRegistry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegistry")
            .field("active", &self.active.len())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<V: Clone> Default for CodeRegistry<V> {
    fn default() -> Self {
        Self::new(constants::code::MAX_ISSUE_ATTEMPTS)
    }
}

impl<V: Clone> CodeRegistry<V> {
    /// Creates an empty registry issuing random codes
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Number of candidates tried before giving up
    pub fn new(max_attempts: usize) -> Self {
        Self::with_generator(max_attempts, GameCode::random)
    }

    /// Creates an empty registry drawing candidates from `generate`
    pub fn with_generator<G>(max_attempts: usize, generate: G) -> Self
    where
        G: Fn() -> GameCode + Send + Sync + 'static,
    {
        Self {
            active: DashMap::new(),
            max_attempts: max_attempts.max(1),
            generate: Box::new(generate),
        }
    }

    /// Issues a fresh code and binds it to the value built by `make`
    ///
    /// `make` runs at most once, while the candidate slot is held, so the
    /// value can embed its own code.
    ///
    /// # Errors
    ///
    /// Returns `Error::CodeExhausted` if every candidate was already taken.
    pub fn issue_with<F>(&self, make: F) -> Result<(GameCode, V), Error>
    where
        F: FnOnce(GameCode) -> V,
    {
        for _ in 0..self.max_attempts {
            let code = (self.generate)();
            if let Entry::Vacant(entry) = self.active.entry(code) {
                let value = make(code);
                entry.insert(value.clone());
                return Ok((code, value));
            }
            tracing::debug!(%code, "join code collision, retrying");
        }

        Err(Error::CodeExhausted(self.max_attempts))
    }

    /// Binds a specific code, used when restoring a persisted session
    ///
    /// # Errors
    ///
    /// Returns `Error::CodeTaken` if the code is already active.
    pub fn reserve(&self, code: GameCode, value: V) -> Result<(), Error> {
        match self.active.entry(code) {
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
            Entry::Occupied(_) => Err(Error::CodeTaken),
        }
    }

    /// Resolves raw user input to the session it names
    ///
    /// # Errors
    ///
    /// * `Error::Code` - The input is not a well-formed code (no lookup happens)
    /// * `Error::NotFound` - No active session holds the code
    pub fn resolve(&self, input: &str) -> Result<V, Error> {
        self.resolve_code(&GameCode::from_str(input)?)
    }

    /// Resolves an already parsed code
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no active session holds the code.
    pub fn resolve_code(&self, code: &GameCode) -> Result<V, Error> {
        self.active
            .get(code)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotFound)
    }

    /// Frees a code, returning the value it was bound to
    pub fn release(&self, code: &GameCode) -> Option<V> {
        self.active.remove(code).map(|(_, value)| value)
    }

    /// Number of active codes
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no code is active
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_issue_and_resolve() {
        let registry = CodeRegistry::<u32>::default();
        let (code, value) = registry.issue_with(|_| 7).unwrap();

        assert_eq!(value, 7);
        assert_eq!(registry.resolve(code.as_str()), Ok(7));
        assert_eq!(registry.resolve(&code.as_str().to_lowercase()), Ok(7));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_make_receives_issued_code() {
        let registry = CodeRegistry::<GameCode>::default();
        let (code, value) = registry.issue_with(|code| code).unwrap();
        assert_eq!(code, value);
    }

    #[test]
    fn test_resolve_malformed_is_rejected_before_lookup() {
        let registry = CodeRegistry::<u32>::default();
        assert_eq!(
            registry.resolve("abc"),
            Err(Error::Code(game_code::Error::InvalidCode))
        );
        assert_eq!(registry.resolve("ZZZZZZ"), Err(Error::NotFound));
    }

    #[test]
    fn test_released_code_is_not_found() {
        let registry = CodeRegistry::<u32>::default();
        let (code, _) = registry.issue_with(|_| 1).unwrap();

        assert_eq!(registry.release(&code), Some(1));
        assert_eq!(registry.resolve_code(&code), Err(Error::NotFound));
        assert!(registry.is_empty());
        assert_eq!(registry.release(&code), None);
    }

    #[test]
    fn test_collision_retries_then_succeeds() {
        let taken = GameCode::from_str("AAAAAA").unwrap();
        let free = GameCode::from_str("BBBBBB").unwrap();
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let registry = CodeRegistry::with_generator(10, move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                taken
            } else {
                free
            }
        });
        registry.reserve(taken, 0).unwrap();

        let (code, _) = registry.issue_with(|_| 1).unwrap();
        assert_eq!(code, free);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_exhaustion_after_bounded_attempts() {
        let taken = GameCode::from_str("AAAAAA").unwrap();
        let registry = CodeRegistry::with_generator(10, move || taken);
        registry.reserve(taken, 0).unwrap();

        let mut built = false;
        let result = registry.issue_with(|_| {
            built = true;
            1
        });

        assert_eq!(result.map(|(c, _)| c), Err(Error::CodeExhausted(10)));
        assert!(!built);
        assert_eq!(registry.resolve_code(&taken), Ok(0));
    }

    #[test]
    fn test_reserve_taken_code() {
        let registry = CodeRegistry::<u32>::default();
        let code = GameCode::from_str("QQ11QQ").unwrap();

        assert_eq!(registry.reserve(code, 1), Ok(()));
        assert_eq!(registry.reserve(code, 2), Err(Error::CodeTaken));
        assert_eq!(registry.resolve_code(&code), Ok(1));
    }

    #[test]
    fn test_concurrent_issuance_yields_distinct_codes() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 250;

        let registry = CodeRegistry::<usize>::default();

        let codes: Vec<GameCode> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let registry = &registry;
                    scope.spawn(move || {
                        (0..PER_THREAD)
                            .map(|i| registry.issue_with(|_| t * PER_THREAD + i).unwrap().0)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        let distinct: HashSet<_> = codes.iter().collect();
        assert_eq!(distinct.len(), THREADS * PER_THREAD);
        assert_eq!(registry.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_concurrent_issuance_from_tiny_space_never_duplicates() {
        // two possible codes, many racing issuers: at most two can win
        let a = GameCode::from_str("AAAAAA").unwrap();
        let b = GameCode::from_str("BBBBBB").unwrap();
        let registry =
            CodeRegistry::<usize>::with_generator(10, move || if fastrand::bool() { a } else { b });

        let wins: Vec<GameCode> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let registry = &registry;
                    scope.spawn(move || registry.issue_with(|_| i).ok().map(|(c, _)| c))
                })
                .collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });

        let distinct: HashSet<_> = wins.iter().collect();
        assert_eq!(distinct.len(), wins.len());
        assert!(wins.len() <= 2);
    }
}
