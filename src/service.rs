//! External services consumed by the game-room core
//!
//! The core never talks to storage directly: token resolution and question
//! retrieval live behind the traits in this module, alongside the data
//! types they traffic in. Implementations belong to the surrounding
//! server; tests plug in scripted stand-ins.

use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A user attached to a room
///
/// Guests and registered users share one identity keyspace: a registered
/// user's identity is positive, a guest's is negative (derived from the
/// guest id). Keying the roster and reconnect table by this identity makes
/// guest reconnects work exactly like registered reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Identity of the user; negative for guests, positive otherwise
    pub id: i64,
    /// Display name of the user
    pub username: String,
    /// Whether this user is an unregistered guest
    pub guest: bool,
}

impl User {
    /// Creates a registered user.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not positive.
    pub fn registered(id: i64, username: impl Into<String>) -> Self {
        assert!(id > 0, "registered users must have a positive identity");
        Self {
            id,
            username: username.into(),
            guest: false,
        }
    }

    /// Creates a guest user from a guest id.
    ///
    /// # Panics
    ///
    /// Panics if `guest_id` is not positive.
    pub fn guest(guest_id: i64) -> Self {
        assert!(guest_id > 0, "guest ids must be positive");
        Self {
            id: -guest_id,
            username: format!("#Guest{guest_id}"),
            guest: true,
        }
    }
}

/// An authentication token record as resolved by the auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// The token string presented by the client
    pub token: String,
    /// Identity of the registered user the token belongs to, if any
    pub user_id: Option<i64>,
    /// Guest id the token belongs to, if any
    pub guest_id: Option<i64>,
    /// When the token stops being valid
    pub expires_at: SystemTime,
}

/// A single trivia question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Unique id of the question
    pub id: i64,
    /// Category of the question
    pub category: String,
    /// Difficulty of the question
    pub difficulty: String,
    /// The question text
    pub prompt: String,
    /// The answer choices, in presentation order; at least two
    pub choices: Vec<String>,
    /// Index of the correct choice
    pub correct_choice: usize,
    /// Where the question was sourced from
    pub source: String,
}

/// Failure while resolving an auth token
///
/// Resolution failures are transient: the socket stays pending and a
/// retried `client-auth` may succeed.
#[derive(Debug, Error)]
#[error("token resolution failed: {0}")]
pub struct TokenError(
    /// Human-readable cause of the failure
    pub String,
);

/// Resolves auth tokens to users
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// Resolves a token string to its record and user.
    ///
    /// `Ok(None)` means the token is unknown or expired. A guest token
    /// resolves to a guest user with a negative identity.
    ///
    /// # Errors
    ///
    /// Returns a [`TokenError`] on transient failure; the caller may retry
    /// with the client's next `client-auth`.
    async fn resolve(&self, token: &str) -> Result<Option<(AuthToken, User)>, TokenError>;
}

/// Failure while fetching questions
#[derive(Debug, Error)]
#[error("question lookup failed: {0}")]
pub struct QuestionError(
    /// Human-readable cause of the failure
    pub String,
);

/// Supplies the questions a game poses
#[async_trait]
pub trait QuestionProvider: Send + Sync {
    /// Returns exactly `count` questions with distinct ids.
    ///
    /// # Errors
    ///
    /// Returns a [`QuestionError`] if that many questions cannot be
    /// produced; this is fatal for the requesting room.
    async fn take(&self, count: usize) -> Result<Vec<Question>, QuestionError>;
}
