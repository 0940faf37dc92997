//! Configuration constants for the trivia game-room core
//!
//! This module contains the timing values, queue capacities, and option
//! bounds used throughout the room state machine and the connection
//! layer, so that every tunable lives in one place.

/// Game timeline constants
pub mod game {
    use std::time::Duration;

    /// Delay between sending a question prompt to users and starting the
    /// answer countdown. This time should be used for animating between
    /// trivia prompts; the reading budget is added on top of it.
    pub const QUESTION_ANIMATION_TIME: Duration = Duration::from_secs(2);

    /// Delay between revealing an answer and moving on to the next
    /// question. This time should be used for animating the answer reveal
    /// and the participants' point totals.
    pub const ANSWER_REVEAL_TIME: Duration = Duration::from_secs(5);

    /// Padding applied to countdown boundaries to account for the amount
    /// of time it takes messages to reach some users.
    pub const PING_DELAY: Duration = Duration::from_millis(500);

    /// Assumed reading speed when budgeting extra time for long prompts
    pub const WORDS_PER_SECOND: u64 = 2;

    /// Upper bound on the reading budget added after posing a question
    pub const MAX_READ_TIME: Duration = Duration::from_secs(6);

    /// Points awarded for a correct answer
    pub const POINTS_PER_CORRECT_ANSWER: u64 = 100;

    /// Maximum number of messages drained from a single client in one
    /// loop iteration, so one client cannot starve the others.
    pub const MAX_MESSAGES_PER_CLIENT: usize = 16;

    /// Longest interval between two broadcasts of the same countdown
    pub const COUNTDOWN_TICK_INTERVAL: Duration = Duration::from_secs(1);
}

/// Connection and admission constants
pub mod conn {
    use std::time::Duration;

    /// Capacity of the per-connection inbound message queue. The reader
    /// task blocks on a full queue, which backpressures the peer.
    pub const INBOUND_QUEUE_CAPACITY: usize = 8;

    /// Capacity of a room's arrival queue for freshly admitted sockets
    pub const ARRIVAL_QUEUE_CAPACITY: usize = 16;

    /// Maximum number of sockets a room keeps waiting for authentication
    pub const MAX_PENDING_SOCKETS: usize = 64;

    /// How long an admitted socket may stay unauthenticated before it is
    /// closed and dropped.
    pub const PENDING_AUTH_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Bounds on room options
pub mod options {
    /// Maximum number of participants a room may be configured for
    pub const MAX_PARTICIPANT_LIMIT: usize = 1000;
    /// Minimum start delay in seconds
    pub const MIN_START_DELAY: u64 = 0;
    /// Maximum start delay in seconds
    pub const MAX_START_DELAY: u64 = 300;
    /// Minimum answer duration in seconds
    pub const MIN_ANSWER_DURATION: u64 = 1;
    /// Maximum answer duration in seconds
    pub const MAX_ANSWER_DURATION: u64 = 240;
    /// Maximum number of questions in a single game
    pub const MAX_QUESTION_COUNT: usize = 100;
}
