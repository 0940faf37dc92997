//! Wire codec for the trivia game protocol
//!
//! Every frame on the wire is a JSON envelope `{"tag": ..., "payload": ...}`
//! with a kebab-case tag naming the message kind and an optional payload
//! object. This module maps that envelope onto typed values for the closed
//! sets of inbound and outbound messages, and provides encoding that
//! produces identical bytes for identical input so a broadcast can encode
//! once and write the same frame to every client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conn::SocketId;

/// Error produced when an inbound frame cannot be decoded
///
/// Decode errors are logged and the offending frame is dropped; they never
/// tear down the connection that produced them.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was not a valid envelope, used an unknown tag, or was
    /// missing a required payload.
    #[error("malformed inbound frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Messages received from clients
///
/// The inbound set is closed: anything that does not decode to one of
/// these kinds is a [`DecodeError`]. The `@socket-closed` kind is internal,
/// synthesized by the connection reader when its socket terminates; a peer
/// writing that tag on the wire is treated like any other unknown tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tag", content = "payload")]
pub enum IncomingMessage {
    /// The client identifies itself with its auth token, completing the
    /// admission handshake.
    #[serde(rename = "client-auth", rename_all = "camelCase")]
    ClientAuth {
        /// The token previously issued to the user by the auth layer
        auth_token: String,
    },
    /// The client selected an answer for a question
    #[serde(rename = "select-answer", rename_all = "camelCase")]
    SelectAnswer {
        /// Index of the question this answer is for
        question_index: i64,
        /// Index of the selected choice
        index: i64,
    },
    /// Internal: the socket identified by the carried handle has closed.
    ///
    /// The handle makes late closures comparable, so a close produced by a
    /// connection the user has already replaced can be ignored.
    #[serde(skip)]
    SocketClosed {
        /// The socket that produced the close
        socket: SocketId,
    },
}

/// One row of the participants list as shown on every scoreboard frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantEntry {
    /// Display name of the participant
    pub username: String,
    /// Current score of the participant
    pub score: u64,
    /// Whether the participant's socket is currently closed
    pub disconnected: bool,
}

/// Messages sent to clients
///
/// Encoding an outgoing message is deterministic: the same value always
/// produces the same bytes, which the broadcaster relies on to encode once
/// and send to many clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "kebab-case")]
pub enum OutgoingMessage {
    /// Asks a freshly admitted socket for its `client-auth`
    #[serde(rename_all = "camelCase")]
    ClientInfoRequest {
        /// Id of the room the socket was admitted to
        #[serde(rename = "gameID")]
        game_id: String,
    },
    /// The requested room does not exist or is not accepting quick-joins
    GameNotFound,
    /// The presented auth token does not belong to any user
    UserNotFound,
    /// Countdown tick for the delay between game fill-up and game start
    #[serde(rename_all = "camelCase")]
    GStartCountdownTick {
        /// `true` on the tick that starts a countdown; `false` on
        /// resynchronization ticks, so clients adjust instead of
        /// restarting their animations.
        begin: bool,
        /// Time left until the countdown expires
        millis_remaining: u64,
    },
    /// The game has started
    #[serde(rename_all = "camelCase")]
    GStart {
        /// Number of questions the game will pose
        question_count: usize,
    },
    /// Presents a question and its choices
    #[serde(rename_all = "camelCase")]
    QSetPrompt {
        /// Index of the question being posed
        index: i64,
        /// The question text
        prompt: String,
        /// The answer choices, in presentation order
        choices: Vec<String>,
        /// Category of the question
        category: String,
        /// Difficulty of the question
        difficulty: String,
    },
    /// Countdown tick for the answer window of the current question
    #[serde(rename_all = "camelCase")]
    QCountdownTick {
        /// `true` on the tick that starts the countdown
        begin: bool,
        /// Time left until the answer window closes
        millis_remaining: u64,
    },
    /// Reveals the correct answer for a question
    #[serde(rename_all = "camelCase")]
    QRevealAnswer {
        /// Index of the question being revealed
        question_index: i64,
        /// Index of the correct choice
        answer_index: i64,
    },
    /// Replaces the client's participants list wholesale
    PListSet {
        /// The full participants list, in join order
        participants: Vec<ParticipantEntry>,
    },
    /// A participant joined; append them to the list
    PListAdd {
        /// The newly joined participant
        participant: ParticipantEntry,
    },
    /// A participant left before the game started; drop them from the list
    PListRemove {
        /// Name of the removed participant
        username: String,
    },
    /// A single participant's row changed in place
    PListSetOne {
        /// The updated row
        participant: ParticipantEntry,
    },
    /// Several messages delivered as one frame, applied in order. Used for
    /// the snapshot sent to late joiners and reconnecting clients.
    Multi {
        /// The wrapped messages
        messages: Vec<OutgoingMessage>,
    },
}

/// Encodes an outgoing message into its wire frame.
///
/// The returned [`Bytes`] are cheap to clone, so a broadcast encodes the
/// payload once and hands the same frame to every connection.
///
/// # Panics
///
/// This function panics if serialization fails, which should never happen
/// with the default JSON serializer for well-formed data.
pub fn encode(message: &OutgoingMessage) -> Bytes {
    Bytes::from(serde_json::to_vec(message).expect("default serializer cannot fail"))
}

/// Decodes one inbound wire frame into a typed message.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the frame is not a valid envelope, uses a
/// tag outside the inbound set, or is missing a required payload.
pub fn decode(frame: &str) -> Result<IncomingMessage, DecodeError> {
    Ok(serde_json::from_str(frame)?)
}
