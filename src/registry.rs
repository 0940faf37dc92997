//! Registry of running rooms
//!
//! The registry owns the ordered mapping from room id to running room and
//! the per-room admission flags that the layer above inspects. It routes
//! freshly upgraded sockets to rooms: by verbatim id, or via quick-join to
//! the first room still accepting participants. A socket that cannot be
//! routed receives a single `game-not-found` frame and is closed without
//! ever starting a reader.
//!
//! One lock covers room lookup and the admission-flag snapshots. Rooms
//! take it briefly from their own loops to refresh their flags and to
//! remove themselves once they terminate; that is the only cross-room
//! coordination point.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use crate::conn::{FrameSink, FrameSource, FramedConnection};
use crate::constants::conn::ARRIVAL_QUEUE_CAPACITY;
use crate::game::{GameRoom, RoomOptions};
use crate::message::{self, OutgoingMessage};
use crate::service::{QuestionProvider, TokenResolver};

/// Reserved room id that routes to quick-join instead of a lookup
pub const QUICK_JOIN_ID: &str = "quickjoin";

/// Admission flags of one room, as published for external inspection
#[derive(Debug, Clone, Copy)]
pub struct RoomView {
    /// Whether the room still admits new participants
    pub accepting_joins: bool,
    /// Number of participants counted toward the scoreboard
    pub participant_count: usize,
    /// Maximum number of participants the room allows
    pub max_participants: usize,
}

/// Channel ends used to hand work to a room's loop
struct RoomHandle {
    arrivals: mpsc::Sender<FramedConnection>,
    stop: mpsc::Sender<()>,
    wakeup: Arc<Notify>,
}

struct RoomEntry {
    handle: RoomHandle,
    view: RoomView,
}

type Rooms = Arc<Mutex<BTreeMap<String, RoomEntry>>>;

fn lock_rooms(rooms: &Mutex<BTreeMap<String, RoomEntry>>) -> MutexGuard<'_, BTreeMap<String, RoomEntry>> {
    rooms.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A room's side of the registry: lets the room loop refresh its published
/// admission flags and unregister itself when it terminates.
pub(crate) struct RegistryLink {
    rooms: Rooms,
    room_id: String,
}

impl RegistryLink {
    /// Publishes a fresh admission-flag snapshot for this room
    pub(crate) fn refresh(&self, view: RoomView) {
        if let Some(entry) = lock_rooms(&self.rooms).get_mut(&self.room_id) {
            entry.view = view;
        }
    }

    /// Removes this room from the registry
    pub(crate) fn remove(&self) {
        lock_rooms(&self.rooms).remove(&self.room_id);
    }
}

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A room with the requested id is already running
    #[error("a room with the id {0:?} already exists")]
    DuplicateId(String),
    /// The requested id is reserved for quick-join routing
    #[error("the room id {0:?} is reserved")]
    ReservedId(String),
    /// The room options failed validation
    #[error("invalid room options: {0}")]
    InvalidOptions(String),
    /// No room matched the requested id, or no room is accepting
    /// quick-joins.
    #[error("no room with the given id was found")]
    GameNotFound,
}

/// The set of rooms that are currently running
pub struct RoomRegistry {
    rooms: Rooms,
    token_resolver: Arc<dyn TokenResolver>,
    question_provider: Arc<dyn QuestionProvider>,
}

impl RoomRegistry {
    /// Creates an empty registry backed by the given services
    pub fn new(
        token_resolver: Arc<dyn TokenResolver>,
        question_provider: Arc<dyn QuestionProvider>,
    ) -> Self {
        Self {
            rooms: Arc::default(),
            token_resolver,
            question_provider,
        }
    }

    /// Creates a room and starts its loop.
    ///
    /// Must be called from within a Tokio runtime; the room's loop runs as
    /// its own task until the game finishes or the room is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ReservedId`] for the quick-join id,
    /// [`RegistryError::InvalidOptions`] if the options fail validation,
    /// or [`RegistryError::DuplicateId`] if the id is already in use.
    pub fn create_room(&self, id: &str, options: RoomOptions) -> Result<(), RegistryError> {
        if id == QUICK_JOIN_ID {
            return Err(RegistryError::ReservedId(id.to_owned()));
        }
        garde::Validate::validate(&options)
            .map_err(|report| RegistryError::InvalidOptions(report.to_string()))?;
        if options.max_participants < options.min_participants {
            return Err(RegistryError::InvalidOptions(
                "maxParticipants must be at least minParticipants".to_owned(),
            ));
        }

        let (arrival_tx, arrival_rx) = mpsc::channel(ARRIVAL_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let wakeup = Arc::new(Notify::new());

        {
            let mut rooms = lock_rooms(&self.rooms);
            if rooms.contains_key(id) {
                return Err(RegistryError::DuplicateId(id.to_owned()));
            }
            rooms.insert(
                id.to_owned(),
                RoomEntry {
                    handle: RoomHandle {
                        arrivals: arrival_tx,
                        stop: stop_tx,
                        wakeup: wakeup.clone(),
                    },
                    view: RoomView {
                        accepting_joins: true,
                        participant_count: 0,
                        max_participants: options.max_participants,
                    },
                },
            );
        }

        let room = GameRoom::new(
            id.to_owned(),
            options,
            arrival_rx,
            stop_rx,
            wakeup,
            RegistryLink {
                rooms: self.rooms.clone(),
                room_id: id.to_owned(),
            },
            self.token_resolver.clone(),
            self.question_provider.clone(),
        );
        tokio::spawn(room.run());

        info!(room = id, "created room");
        Ok(())
    }

    /// Routes an upgraded socket to a room.
    ///
    /// `room_id` is looked up verbatim, except for the reserved
    /// [`QUICK_JOIN_ID`] which selects the first room still accepting
    /// participants. On success the socket's reader is started and the
    /// socket lands on the chosen room's arrival queue.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::GameNotFound`] if no room matched; the
    /// socket has then been sent a `game-not-found` frame and closed.
    pub async fn admit(
        &self,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        room_id: &str,
    ) -> Result<(), RegistryError> {
        let target = {
            let rooms = lock_rooms(&self.rooms);
            let entry = if room_id == QUICK_JOIN_ID {
                rooms.values().find(|entry| entry.view.accepting_joins)
            } else {
                rooms.get(room_id)
            };
            entry.map(|entry| (entry.handle.arrivals.clone(), entry.handle.wakeup.clone()))
        };

        let Some((arrivals, wakeup)) = target else {
            debug!(room = room_id, "refusing socket, no matching room");
            refuse(sink).await;
            return Err(RegistryError::GameNotFound);
        };

        let conn = FramedConnection::spawn(source, sink, wakeup.clone());
        match arrivals.send(conn).await {
            Ok(()) => {
                wakeup.notify_one();
                Ok(())
            }
            // The room terminated between lookup and delivery.
            Err(mpsc::error::SendError(mut conn)) => {
                let _ = conn
                    .write_frame(message::encode(&OutgoingMessage::GameNotFound))
                    .await;
                conn.close().await;
                Err(RegistryError::GameNotFound)
            }
        }
    }

    /// Runs `f` with the admission-flag snapshot of the given room, if it
    /// exists, under the registry's ordering guarantees.
    pub fn with_room_view<R>(&self, room_id: &str, f: impl FnOnce(&RoomView) -> R) -> Option<R> {
        lock_rooms(&self.rooms).get(room_id).map(|entry| f(&entry.view))
    }

    /// Asks a room to stop at its next iteration boundary.
    ///
    /// Returns `false` if no room with the given id is running.
    pub fn stop_room(&self, room_id: &str) -> bool {
        let rooms = lock_rooms(&self.rooms);
        let Some(entry) = rooms.get(room_id) else {
            return false;
        };
        let _ = entry.handle.stop.try_send(());
        entry.handle.wakeup.notify_one();
        true
    }
}

/// Writes a single `game-not-found` frame and closes the socket, without
/// ever starting a reader for it.
async fn refuse(mut sink: Box<dyn FrameSink>) {
    let _ = sink
        .send_frame(message::encode(&OutgoingMessage::GameNotFound))
        .await;
    sink.close().await;
}
