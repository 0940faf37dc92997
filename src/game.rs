//! Core game-room logic and state management
//!
//! This module contains the room struct and the logic for running one
//! trivia game: admitting and authenticating sockets, driving the question
//! timeline, reading client answers, scoring, and broadcasting state to
//! every connected client.
//!
//! A room owns a single execution context, its loop. All mutation of room
//! state happens inside that loop; the outside world reaches it only
//! through three thread-safe sinks (the arrival queue, the stop signal,
//! and the tick timer) plus the wake-up condition that reader tasks signal
//! when a client message lands in its queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_with::DurationMilliSeconds;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::constants::conn::{MAX_PENDING_SOCKETS, PENDING_AUTH_TIMEOUT};
use crate::constants::game::*;
use crate::constants::options::*;
use crate::conn::FramedConnection;
use crate::message::{self, IncomingMessage, OutgoingMessage, ParticipantEntry};
use crate::registry::{RegistryLink, RoomView};
use crate::service::{Question, QuestionProvider, TokenResolver, User};

/// Custom `garde` validator bounding a duration field to an inclusive
/// range of whole seconds.
fn duration_within<const MIN_SECONDS: u64, const MAX_SECONDS: u64>(
    value: &Duration,
    _ctx: &(),
) -> garde::Result {
    let secs = value.as_secs();
    if secs < MIN_SECONDS || secs > MAX_SECONDS {
        return Err(garde::Error::new(format!(
            "must be between {MIN_SECONDS}s and {MAX_SECONDS}s"
        )));
    }
    Ok(())
}

/// Options for a single trivia room
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RoomOptions {
    /// Minimum number of participants required before the game starts
    #[garde(range(min = 1, max = MAX_PARTICIPANT_LIMIT))]
    pub min_participants: usize,
    /// Maximum number of participants allowed in the game
    #[garde(range(min = 1, max = MAX_PARTICIPANT_LIMIT))]
    pub max_participants: usize,
    /// Delay before the game starts once the minimum number of
    /// participants has been reached.
    #[garde(custom(duration_within::<MIN_START_DELAY, MAX_START_DELAY>))]
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub start_delay: Duration,
    /// Number of questions presented during the game
    #[garde(range(min = 1, max = MAX_QUESTION_COUNT))]
    pub question_count: usize,
    /// Time players get to answer each question
    #[garde(custom(duration_within::<MIN_ANSWER_DURATION, MAX_ANSWER_DURATION>))]
    #[serde(with = "serde_with::As::<DurationMilliSeconds<u64>>")]
    pub answer_duration: Duration,
}

/// Phase of a room's question timeline
///
/// The room progresses through these phases in declaration order, except
/// that `Reveal` loops back to `PoseQuestion` until the questions run out,
/// and a pre-start reset returns the room to `WaitingForPlayers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Waiting for enough participants to join
    WaitingForPlayers,
    /// Retrieving this game's questions from the provider
    FetchingQuestions,
    /// Counting down the start delay
    StartCountdown,
    /// Presenting the next question
    PoseQuestion,
    /// Arming the answer countdown for the posed question
    StartAnswerCountdown,
    /// Counting down the answer window
    AnswerCountdown,
    /// Revealing the correct answer and scoring
    Reveal,
    /// The timeline has ended; the room is draining
    Finished,
}

impl Phase {
    /// `true` once the first question has been posed (or the game ended)
    fn in_progress(self) -> bool {
        self >= Phase::PoseQuestion
    }
}

/// Role assigned to a client on admission; immutable afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Counts toward scoring and appears on the scoreboard
    Participant,
    /// Receives all broadcasts but is never scored
    Spectator,
}

/// A user attached to the room, participant or spectator
struct Client {
    user: User,
    /// The client's connection; `None` while the client is disconnected
    conn: Option<FramedConnection>,
    role: Role,
    /// Index of the question this client has been presented; -1 before any
    question_index_seen: i64,
    /// Index of the answer the client selected; -1 until they pick one
    selected_choice: i64,
    score: u64,
    /// Set once the client's socket has produced its close event
    closed: bool,
}

/// An accepted socket that has not yet completed authentication
struct PendingSocket {
    conn: FramedConnection,
    admitted_at: Instant,
}

/// A single running trivia game
///
/// Constructed by the registry, which then spawns [`GameRoom::run`] as the
/// room's own task.
pub(crate) struct GameRoom {
    id: String,
    options: RoomOptions,
    phase: Phase,
    /// This game's questions; assigned once fetched, never mutated
    questions: Vec<Question>,
    /// Index of the current question; -1 before the first one
    current_index: i64,
    /// Deadline of the running countdown; meaningful only in
    /// `StartCountdown` and `AnswerCountdown`.
    countdown_deadline: Option<Instant>,
    /// Clients currently attached, keyed by user identity
    roster: HashMap<i64, Client>,
    /// Clients whose sockets closed mid-game, awaiting reconnection
    disconnected: HashMap<i64, Client>,
    /// Sockets the room is waiting for authentication from
    pending: Vec<PendingSocket>,
    /// The scoreboard, in join order. Doubles as the literal payload of
    /// the outbound participants-list frame.
    participants_view: Vec<ParticipantEntry>,
    /// Whether the loop must wait for the tick timer before the next
    /// state-machine step.
    tick_waiting: bool,
    /// When the tick timer expires; meaningful while `tick_waiting`
    tick_deadline: Instant,
    /// Skips the end-of-iteration pause once, for immediate transitions
    skip_pause: bool,
    /// Set when the room should terminate after the current iteration
    done: bool,
    arrivals: mpsc::Receiver<FramedConnection>,
    stop: mpsc::Receiver<()>,
    wakeup: Arc<Notify>,
    registry: RegistryLink,
    token_resolver: Arc<dyn TokenResolver>,
    question_provider: Arc<dyn QuestionProvider>,
}

impl GameRoom {
    /// Creates a room in its waiting state, wired to the given sinks
    pub(crate) fn new(
        id: String,
        options: RoomOptions,
        arrivals: mpsc::Receiver<FramedConnection>,
        stop: mpsc::Receiver<()>,
        wakeup: Arc<Notify>,
        registry: RegistryLink,
        token_resolver: Arc<dyn TokenResolver>,
        question_provider: Arc<dyn QuestionProvider>,
    ) -> Self {
        Self {
            id,
            options,
            phase: Phase::WaitingForPlayers,
            questions: Vec::new(),
            current_index: -1,
            countdown_deadline: None,
            roster: HashMap::new(),
            disconnected: HashMap::new(),
            pending: Vec::new(),
            participants_view: Vec::new(),
            tick_waiting: false,
            tick_deadline: Instant::now(),
            skip_pause: false,
            done: false,
            arrivals,
            stop,
            wakeup,
            registry,
            token_resolver,
            question_provider,
        }
    }

    /// Runs the room's loop until the game finishes or a stop arrives.
    ///
    /// Each iteration drains the input sinks, processes pending sockets,
    /// executes at most one state-machine step, reads client messages, and
    /// then either continues immediately or parks on the wake-up condition
    /// until one of the sinks is written to or the tick timer expires.
    pub(crate) async fn run(mut self) {
        info!(room = %self.id, "room loop started");

        loop {
            let mut execute_tick = !self.tick_waiting;
            if self.tick_waiting && Instant::now() >= self.tick_deadline {
                self.tick_waiting = false;
                execute_tick = true;
            }

            while let Ok(conn) = self.arrivals.try_recv() {
                self.admit_socket(conn).await;
            }

            if self.stop.try_recv().is_ok() {
                info!(room = %self.id, "stop requested");
                break;
            }

            self.handle_pending_sockets().await;
            if execute_tick {
                self.game_tick().await;
            }
            self.read_client_messages().await;

            if self.done {
                break;
            }

            if self.skip_pause {
                self.skip_pause = false;
                continue;
            }

            let tick_at = self.tick_waiting.then_some(self.tick_deadline);
            let pending_at = self
                .pending
                .iter()
                .map(|pending| pending.admitted_at + PENDING_AUTH_TIMEOUT)
                .min();
            let wake_at = match (tick_at, pending_at) {
                (Some(tick), Some(pending)) => Some(tick.min(pending)),
                (tick_at, pending_at) => tick_at.or(pending_at),
            };
            match wake_at {
                Some(wake_at) => {
                    tokio::select! {
                        () = self.wakeup.notified() => {}
                        () = tokio::time::sleep_until(wake_at) => {}
                    }
                }
                None => self.wakeup.notified().await,
            }
        }

        self.shutdown().await;
        info!(room = %self.id, "room loop stopped");
    }

    /// Greets a freshly admitted socket and adds it to the pending list
    async fn admit_socket(&mut self, mut conn: FramedConnection) {
        if self.pending.len() >= MAX_PENDING_SOCKETS {
            warn!(room = %self.id, socket = %conn.id(), "pending list full, dropping socket");
            conn.close().await;
            return;
        }

        debug!(room = %self.id, socket = %conn.id(), "socket added to pending list");
        let _ = conn
            .write_frame(message::encode(&OutgoingMessage::ClientInfoRequest {
                game_id: self.id.clone(),
            }))
            .await;
        self.pending.push(PendingSocket {
            conn,
            admitted_at: Instant::now(),
        });
    }

    /// Handles `client-auth` messages from pending sockets and drops the
    /// ones that closed or overstayed the authentication window.
    ///
    /// At most one queued message per socket is examined per pass; a
    /// message that is not `client-auth` is put back so admission never
    /// consumes game traffic.
    async fn handle_pending_sockets(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].conn.is_closed()
                || self.pending[i].admitted_at.elapsed() >= PENDING_AUTH_TIMEOUT
            {
                let mut dropped = self.pending.swap_remove(i);
                debug!(room = %self.id, socket = %dropped.conn.id(), "dropping pending socket");
                dropped.conn.close().await;
                continue;
            }

            let Some(msg) = self.pending[i].conn.read_next() else {
                i += 1;
                continue;
            };

            match msg {
                IncomingMessage::ClientAuth { auth_token } => {
                    match self.token_resolver.resolve(&auth_token).await {
                        Err(err) => {
                            warn!(room = %self.id, %err, "token resolution failed, keeping socket pending");
                            i += 1;
                        }
                        Ok(None) => {
                            let mut refused = self.pending.swap_remove(i);
                            let _ = refused
                                .conn
                                .write_frame(message::encode(&OutgoingMessage::UserNotFound))
                                .await;
                            refused.conn.close().await;
                        }
                        Ok(Some((_token, user))) => {
                            let accepted = self.pending.swap_remove(i);
                            self.attach_user(accepted.conn, user).await;
                        }
                    }
                }
                IncomingMessage::SocketClosed { .. } => {
                    self.pending.swap_remove(i);
                }
                other => {
                    self.pending[i].conn.unread(other);
                    i += 1;
                }
            }
        }
    }

    /// Attaches an authenticated socket: as a reconnect when the user is
    /// already known, otherwise as a new client.
    async fn attach_user(&mut self, conn: FramedConnection, user: User) {
        if let Some((conn, user)) = self.try_reconnect(conn, user).await {
            self.add_client(conn, user).await;
        }
    }

    /// Reassociates a socket with an existing client of the same user.
    ///
    /// Returns the socket and user back if no client matched, meaning this
    /// is a new admission. Reconnects never change the client's role,
    /// score, or seen-question index.
    async fn try_reconnect(
        &mut self,
        conn: FramedConnection,
        user: User,
    ) -> Option<(FramedConnection, User)> {
        if let Some(client) = self.roster.get_mut(&user.id) {
            // Duplicate join: the newest socket wins.
            if let Some(mut previous) = client.conn.take() {
                previous.close().await;
            }
            client.conn = Some(conn);
            client.closed = false;
            info!(room = %self.id, user = %client.user.username, "reconnected user over its live session");
            self.send_snapshot(user.id).await;
            return None;
        }

        if let Some(mut client) = self.disconnected.remove(&user.id) {
            client.conn = Some(conn);
            client.closed = false;
            let role = client.role;
            let username = client.user.username.clone();
            self.roster.insert(user.id, client);
            info!(room = %self.id, user = %username, "reconnected user");
            if role == Role::Participant {
                self.mark_view_disconnected(&username, false).await;
            }
            self.send_snapshot(user.id).await;
            return None;
        }

        Some((conn, user))
    }

    /// Admits a new client, as a participant while the room still accepts
    /// them and as a spectator otherwise.
    async fn add_client(&mut self, conn: FramedConnection, user: User) {
        debug!(room = %self.id, user = %user.username, "adding user to game");
        let accepting = self.accepting_joins();
        let id = user.id;
        let client = Client {
            user,
            conn: Some(conn),
            role: if accepting {
                Role::Participant
            } else {
                Role::Spectator
            },
            question_index_seen: -1,
            selected_choice: -1,
            score: 0,
            closed: false,
        };

        if accepting {
            let entry = ParticipantEntry {
                username: client.user.username.clone(),
                score: 0,
                disconnected: false,
            };
            // Everyone already attached sees the delta; the newcomer then
            // receives the full list once it is in the roster and view.
            self.broadcast(&OutgoingMessage::PListAdd {
                participant: entry.clone(),
            })
            .await;
            self.participants_view.push(entry);
            self.roster.insert(id, client);
            let full_list = OutgoingMessage::PListSet {
                participants: self.participants_view.clone(),
            };
            self.send_to_client(id, &full_list).await;
            self.refresh_registry_view();
        } else {
            self.roster.insert(id, client);
            self.send_snapshot(id).await;
        }
    }

    /// Reads queued messages from every attached client, bounded per
    /// client so one sender cannot starve the others.
    async fn read_client_messages(&mut self) {
        let ids: Vec<i64> = self.roster.keys().copied().collect();
        for id in ids {
            if self.roster.get(&id).is_some_and(|client| client.closed) {
                // A failed write marked this client; route it through the
                // normal disconnect path.
                self.client_disconnected(id).await;
                continue;
            }

            for _ in 0..MAX_MESSAGES_PER_CLIENT {
                let message = match self.roster.get_mut(&id) {
                    Some(client) => {
                        match client.conn.as_mut().and_then(FramedConnection::read_next) {
                            Some(message) => message,
                            None => break,
                        }
                    }
                    None => break,
                };
                if !self.handle_client_message(id, message).await {
                    break;
                }
            }
        }
    }

    /// Applies one message from an attached client.
    ///
    /// Returns `false` once this client should not be read further in the
    /// current iteration.
    async fn handle_client_message(&mut self, id: i64, message: IncomingMessage) -> bool {
        match message {
            IncomingMessage::SocketClosed { socket } => {
                let current = self
                    .roster
                    .get(&id)
                    .and_then(|client| client.conn.as_ref())
                    .map(FramedConnection::id);
                if current != Some(socket) {
                    // Late close from a connection this user has already
                    // replaced.
                    return true;
                }
                self.client_disconnected(id).await;
                false
            }
            IncomingMessage::SelectAnswer {
                question_index,
                index,
            } => {
                self.apply_answer(id, question_index, index);
                true
            }
            IncomingMessage::ClientAuth { .. } => {
                debug!(room = %self.id, "ignoring client-auth from an attached client");
                true
            }
        }
    }

    /// Records a client's answer if it is the first one for the question
    /// currently being answered.
    fn apply_answer(&mut self, id: i64, question_index: i64, index: i64) {
        if question_index != self.current_index {
            return;
        }
        let choice_count = match self.current_question() {
            Some(question) => question.choices.len() as i64,
            None => return,
        };
        let Some(client) = self.roster.get_mut(&id) else {
            return;
        };
        if client.question_index_seen != question_index {
            return;
        }
        if index >= 0 && index < choice_count && client.selected_choice < 0 {
            client.selected_choice = index;
        }
    }

    /// Detaches a client whose socket closed.
    ///
    /// Mid-game the client moves to the reconnect table and keeps its
    /// scoreboard row; before the game starts a participant is removed
    /// outright, resetting the room if that drops it below the minimum.
    async fn client_disconnected(&mut self, id: i64) {
        let Some(mut client) = self.roster.remove(&id) else {
            return;
        };
        client.closed = true;
        if let Some(mut conn) = client.conn.take() {
            conn.close().await;
        }
        debug!(room = %self.id, user = %client.user.username, "connection to user closed");

        if self.phase.in_progress() {
            let username = client.user.username.clone();
            let is_participant = client.role == Role::Participant;
            self.disconnected.insert(id, client);
            if is_participant {
                self.mark_view_disconnected(&username, true).await;
            }
        } else if client.role == Role::Participant {
            let username = client.user.username.clone();
            self.participants_view
                .retain(|entry| entry.username != username);
            self.broadcast(&OutgoingMessage::PListRemove { username }).await;
            self.refresh_registry_view();
            if self.participants_view.len() < self.options.min_participants {
                self.reset();
            }
        }
    }

    /// Flips a participant's scoreboard row between connected and
    /// disconnected and broadcasts the updated row.
    async fn mark_view_disconnected(&mut self, username: &str, disconnected: bool) {
        let Some(entry) = self
            .participants_view
            .iter_mut()
            .find(|entry| entry.username == username)
        else {
            return;
        };
        entry.disconnected = disconnected;
        let participant = entry.clone();
        self.broadcast(&OutgoingMessage::PListSetOne { participant })
            .await;
    }

    /// Executes exactly one state-machine transition
    async fn game_tick(&mut self) {
        match self.phase {
            Phase::WaitingForPlayers => {
                if self.participants_view.len() >= self.options.min_participants {
                    self.countdown_deadline = Some(Instant::now() + self.options.start_delay);
                    self.phase = Phase::FetchingQuestions;
                    self.tick_imm();
                }
            }
            Phase::FetchingQuestions => {
                match self.question_provider.take(self.options.question_count).await {
                    Ok(questions) => {
                        self.questions = questions;
                        self.broadcast(&OutgoingMessage::GStartCountdownTick {
                            begin: true,
                            millis_remaining: millis(self.options.start_delay),
                        })
                        .await;
                        self.phase = Phase::StartCountdown;
                        self.tick_imm();
                    }
                    Err(err) => {
                        error!(room = %self.id, %err, "failed to fetch questions, terminating room");
                        self.done = true;
                    }
                }
            }
            Phase::StartCountdown => {
                let now = Instant::now();
                let deadline = self.countdown_deadline.unwrap_or(now);
                if now >= deadline {
                    self.phase = Phase::PoseQuestion;
                    self.refresh_registry_view();
                    self.broadcast(&OutgoingMessage::GStart {
                        question_count: self.questions.len(),
                    })
                    .await;
                    self.tick_wait(PING_DELAY);
                } else {
                    let remaining = deadline - now;
                    self.broadcast(&OutgoingMessage::GStartCountdownTick {
                        begin: true,
                        millis_remaining: millis(remaining),
                    })
                    .await;
                    self.tick_wait(remaining.min(COUNTDOWN_TICK_INTERVAL));
                }
            }
            Phase::PoseQuestion => {
                let next = self.current_index + 1;
                if next >= self.questions.len() as i64 {
                    self.phase = Phase::Finished;
                    self.tick_imm();
                    return;
                }

                self.current_index = next;
                // Only clients that are attached right now are eligible to
                // answer, so reconnecting clients are not penalized for
                // questions posed while they were away.
                for client in self.roster.values_mut() {
                    if !client.closed {
                        client.question_index_seen = next;
                        client.selected_choice = -1;
                    }
                }

                let question = &self.questions[next as usize];
                let budget = reading_budget(&question.prompt, &question.choices);
                let prompt = set_prompt(next, question);
                debug!(room = %self.id, index = next, "posing question");
                self.broadcast(&prompt).await;
                self.phase = Phase::StartAnswerCountdown;
                self.tick_wait(QUESTION_ANIMATION_TIME + budget);
            }
            Phase::StartAnswerCountdown => {
                self.countdown_deadline = Some(Instant::now() + self.options.answer_duration);
                self.broadcast(&OutgoingMessage::QCountdownTick {
                    begin: true,
                    millis_remaining: millis(self.options.answer_duration),
                })
                .await;
                self.phase = Phase::AnswerCountdown;
                self.tick_imm();
            }
            Phase::AnswerCountdown => {
                let now = Instant::now();
                let deadline = self.countdown_deadline.unwrap_or(now);
                if now >= deadline {
                    self.phase = Phase::Reveal;
                    self.tick_wait(PING_DELAY);
                } else {
                    // No per-tick broadcast: clients count down locally
                    // from the initial tick.
                    self.tick_wait((deadline - now).min(COUNTDOWN_TICK_INTERVAL));
                }
            }
            Phase::Reveal => {
                let current = self.current_question().map(|question| {
                    (
                        question.correct_choice,
                        OutgoingMessage::QRevealAnswer {
                            question_index: self.current_index,
                            answer_index: question.correct_choice as i64,
                        },
                    )
                });
                if let Some((correct_choice, reveal)) = current {
                    self.broadcast(&reveal).await;
                    self.award_points(correct_choice);
                    let scoreboard = OutgoingMessage::PListSet {
                        participants: self.participants_view.clone(),
                    };
                    self.broadcast(&scoreboard).await;
                }
                self.phase = Phase::PoseQuestion;
                self.tick_wait(ANSWER_REVEAL_TIME);
            }
            Phase::Finished => {
                info!(room = %self.id, "game finished");
                self.done = true;
            }
        }
    }

    /// Awards points for correct answers and updates scoreboard rows
    fn award_points(&mut self, correct_choice: usize) {
        let correct_choice = correct_choice as i64;
        for client in self.roster.values_mut() {
            if client.role != Role::Participant {
                continue;
            }
            if client.question_index_seen != self.current_index
                || client.selected_choice != correct_choice
            {
                continue;
            }
            client.score += POINTS_PER_CORRECT_ANSWER;
            if let Some(entry) = self
                .participants_view
                .iter_mut()
                .find(|entry| entry.username == client.user.username)
            {
                entry.score = client.score;
            }
        }
    }

    /// Assembles the snapshot sent to reconnecting clients and new
    /// spectators so they land in the current phase: always the
    /// participants list, then whichever of game-start, countdown, and
    /// prompt frames apply. Resynchronization ticks carry `begin: false`.
    fn snapshot(&self) -> OutgoingMessage {
        let now = Instant::now();
        let mut messages = vec![OutgoingMessage::PListSet {
            participants: self.participants_view.clone(),
        }];

        if self.phase.in_progress() {
            messages.push(OutgoingMessage::GStart {
                question_count: self.questions.len(),
            });
        }

        match self.phase {
            Phase::StartCountdown => {
                let remaining = self
                    .countdown_deadline
                    .map_or(Duration::ZERO, |deadline| {
                        deadline.saturating_duration_since(now)
                    });
                messages.push(OutgoingMessage::GStartCountdownTick {
                    begin: false,
                    millis_remaining: millis(remaining),
                });
            }
            Phase::PoseQuestion | Phase::StartAnswerCountdown | Phase::AnswerCountdown => {
                if let Some(question) = self.current_question() {
                    messages.push(set_prompt(self.current_index, question));
                }
                if matches!(
                    self.phase,
                    Phase::StartAnswerCountdown | Phase::AnswerCountdown
                ) {
                    let remaining = self
                        .countdown_deadline
                        .map_or(self.options.answer_duration, |deadline| {
                            deadline.saturating_duration_since(now)
                        });
                    messages.push(OutgoingMessage::QCountdownTick {
                        begin: false,
                        millis_remaining: millis(remaining),
                    });
                }
            }
            _ => {}
        }

        OutgoingMessage::Multi { messages }
    }

    /// Sends the current-phase snapshot to one client
    async fn send_snapshot(&mut self, id: i64) {
        let snapshot = self.snapshot();
        self.send_to_client(id, &snapshot).await;
    }

    /// Writes one message to a single attached client
    async fn send_to_client(&mut self, id: i64, message: &OutgoingMessage) {
        let frame = message::encode(message);
        let Some(client) = self.roster.get_mut(&id) else {
            return;
        };
        let Some(conn) = client.conn.as_mut() else {
            return;
        };
        if conn.write_frame(frame).await.is_err() {
            client.closed = true;
        }
    }

    /// Encodes a message once and writes the frame to every attached,
    /// not-closed client. A failed write marks that client closed and the
    /// broadcast continues.
    async fn broadcast(&mut self, message: &OutgoingMessage) {
        let frame = message::encode(message);
        for client in self.roster.values_mut() {
            if client.closed {
                continue;
            }
            let Some(conn) = client.conn.as_mut() else {
                continue;
            };
            if conn.write_frame(frame.clone()).await.is_err() {
                client.closed = true;
            }
        }
    }

    /// `true` while new participants may still be admitted
    fn accepting_joins(&self) -> bool {
        matches!(
            self.phase,
            Phase::WaitingForPlayers | Phase::FetchingQuestions | Phase::StartCountdown
        ) && self.participants_view.len() < self.options.max_participants
    }

    /// Publishes this room's admission flags to the registry
    fn refresh_registry_view(&self) {
        self.registry.refresh(RoomView {
            accepting_joins: self.accepting_joins(),
            participant_count: self.participants_view.len(),
            max_participants: self.options.max_participants,
        });
    }

    /// The question at `current_index`, once one has been posed
    fn current_question(&self) -> Option<&Question> {
        usize::try_from(self.current_index)
            .ok()
            .and_then(|index| self.questions.get(index))
    }

    /// Returns the room to its starting state while keeping every
    /// connected client attached.
    fn reset(&mut self) {
        info!(room = %self.id, "too few participants, resetting game");
        self.questions.clear();
        self.current_index = -1;
        self.countdown_deadline = None;
        self.phase = Phase::WaitingForPlayers;
        self.refresh_registry_view();
        self.tick_imm();
    }

    /// Causes the next state-machine step to run without pausing the loop
    fn tick_imm(&mut self) {
        self.tick_waiting = false;
        self.skip_pause = true;
    }

    /// Arms the tick timer so the next state-machine step runs after `dur`
    fn tick_wait(&mut self, dur: Duration) {
        if dur.is_zero() {
            self.tick_imm();
            return;
        }
        self.tick_waiting = true;
        self.tick_deadline = Instant::now() + dur;
    }

    /// Closes every socket and unregisters the room
    async fn shutdown(&mut self) {
        for pending in &mut self.pending {
            pending.conn.close().await;
        }
        self.pending.clear();
        for client in self.roster.values_mut() {
            if let Some(conn) = client.conn.as_mut() {
                conn.close().await;
            }
        }
        self.registry.remove();
    }
}

/// Builds the prompt frame for one question
fn set_prompt(index: i64, question: &Question) -> OutgoingMessage {
    OutgoingMessage::QSetPrompt {
        index,
        prompt: question.prompt.clone(),
        choices: question.choices.clone(),
        category: question.category.clone(),
        difficulty: question.difficulty.clone(),
    }
}

/// Extra time granted for reading a question, proportional to the number
/// of Unicode-whitespace-separated words in its prompt and choices.
fn reading_budget(prompt: &str, choices: &[String]) -> Duration {
    let words = prompt.split_whitespace().count()
        + choices
            .iter()
            .map(|choice| choice.split_whitespace().count())
            .sum::<usize>();
    Duration::from_secs_f64(words as f64 / WORDS_PER_SECOND as f64).min(MAX_READ_TIME)
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
