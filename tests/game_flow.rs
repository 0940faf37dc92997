//! End-to-end scenarios for the game-room core: rooms are driven through
//! the registry over in-memory transports, with scripted token and
//! question services standing in for the real storage layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

use trivia::conn::{FrameSink, FrameSource, TransportError};
use trivia::game::RoomOptions;
use trivia::registry::{QUICK_JOIN_ID, RegistryError, RoomRegistry};
use trivia::service::{
    AuthToken, Question, QuestionError, QuestionProvider, TokenError, TokenResolver, User,
};

/// Generous bound for awaiting a frame; tests run on a paused clock, so
/// this only elapses when the room genuinely produces nothing further.
const RECV_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------

struct ServerSource {
    frames: mpsc::Receiver<String>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

#[async_trait]
impl FrameSource for ServerSource {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        tokio::select! {
            frame = self.frames.recv() => frame.map(Ok),
            () = self.close_signal.notified() => None,
        }
    }
}

struct ServerSink {
    frames: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
}

#[async_trait]
impl FrameSink for ServerSink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError("transport closed".to_owned()));
        }
        self.frames
            .send(frame)
            .await
            .map_err(|_| TransportError("peer went away".to_owned()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.notify_waiters();
    }
}

/// The client's end of an in-memory socket
struct ClientSocket {
    to_server: mpsc::Sender<String>,
    from_server: mpsc::Receiver<Bytes>,
}

fn socket_pair() -> (Box<dyn FrameSource>, Box<dyn FrameSink>, ClientSocket) {
    let (to_server_tx, to_server_rx) = mpsc::channel(16);
    let (from_server_tx, from_server_rx) = mpsc::channel(64);
    let closed = Arc::new(AtomicBool::new(false));
    let close_signal = Arc::new(Notify::new());

    (
        Box::new(ServerSource {
            frames: to_server_rx,
            closed: closed.clone(),
            close_signal: close_signal.clone(),
        }),
        Box::new(ServerSink {
            frames: from_server_tx,
            closed,
            close_signal,
        }),
        ClientSocket {
            to_server: to_server_tx,
            from_server: from_server_rx,
        },
    )
}

impl ClientSocket {
    async fn send(&self, frame: &Value) -> Result<()> {
        self.to_server
            .send(frame.to_string())
            .await
            .context("server dropped the connection")
    }

    async fn auth(&self, token: &str) -> Result<()> {
        self.send(&json!({"tag": "client-auth", "payload": {"authToken": token}}))
            .await
    }

    async fn select_answer(&self, question_index: i64, index: i64) -> Result<()> {
        self.send(&json!({
            "tag": "select-answer",
            "payload": {"questionIndex": question_index, "index": index},
        }))
        .await
    }

    async fn recv(&mut self) -> Result<Value> {
        let frame = timeout(RECV_TIMEOUT, self.from_server.recv())
            .await
            .context("timed out waiting for a frame")?
            .context("connection closed by the server")?;
        serde_json::from_slice(&frame).context("server sent an invalid frame")
    }

    /// Receives the next frame and asserts its tag, returning the payload
    async fn expect(&mut self, tag: &str) -> Result<Value> {
        let frame = self.recv().await?;
        ensure!(frame["tag"] == tag, "expected a {tag} frame, got {frame}");
        Ok(frame["payload"].clone())
    }

    /// Discards frames until one with the given tag arrives
    async fn next_with_tag(&mut self, tag: &str) -> Result<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["tag"] == tag {
                return Ok(frame["payload"].clone());
            }
        }
    }

    /// Asserts that the server closes this connection
    async fn expect_closed(&mut self) -> Result<()> {
        loop {
            match timeout(RECV_TIMEOUT, self.from_server.recv())
                .await
                .context("timed out waiting for the server to close")?
            {
                None => return Ok(()),
                Some(_) => {} // drain whatever was in flight
            }
        }
    }

    /// Asserts that nothing further arrives on this connection
    async fn expect_no_frame(&mut self) -> Result<()> {
        match timeout(Duration::from_secs(5), self.from_server.recv()).await {
            Err(_) => Ok(()),
            Ok(None) => bail!("connection was closed instead of staying quiet"),
            Ok(Some(frame)) => bail!("unexpected frame {:?}", String::from_utf8_lossy(&frame)),
        }
    }
}

// ---------------------------------------------------------------------
// Scripted services
// ---------------------------------------------------------------------

struct StaticTokens(HashMap<String, User>);

impl StaticTokens {
    fn new(users: &[(&str, User)]) -> Self {
        Self(
            users
                .iter()
                .map(|(token, user)| ((*token).to_owned(), user.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl TokenResolver for StaticTokens {
    async fn resolve(&self, token: &str) -> Result<Option<(AuthToken, User)>, TokenError> {
        Ok(self.0.get(token).map(|user| {
            (
                AuthToken {
                    token: token.to_owned(),
                    user_id: (!user.guest).then_some(user.id),
                    guest_id: user.guest.then_some(-user.id),
                    expires_at: SystemTime::now() + Duration::from_secs(3600),
                },
                user.clone(),
            )
        }))
    }
}

struct FixedQuestions(Vec<Question>);

#[async_trait]
impl QuestionProvider for FixedQuestions {
    async fn take(&self, count: usize) -> Result<Vec<Question>, QuestionError> {
        if count > self.0.len() {
            return Err(QuestionError(format!(
                "only {} questions available",
                self.0.len()
            )));
        }
        Ok(self.0[..count].to_vec())
    }
}

fn math_question() -> Question {
    Question {
        id: 7,
        category: "Math".to_owned(),
        difficulty: "easy".to_owned(),
        prompt: "2 + 2?".to_owned(),
        choices: vec!["3", "4", "5", "22"].into_iter().map(str::to_owned).collect(),
        correct_choice: 1,
        source: "arithmetic".to_owned(),
    }
}

/// Routes room logs through the test harness; enable with `RUST_LOG`.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn registry_with(users: &[(&str, User)], questions: Vec<Question>) -> RoomRegistry {
    init_tracing();
    RoomRegistry::new(
        Arc::new(StaticTokens::new(users)),
        Arc::new(FixedQuestions(questions)),
    )
}

fn two_users() -> Vec<(&'static str, User)> {
    vec![
        ("tok-ada", User::registered(1, "ada")),
        ("tok-bea", User::registered(2, "bea")),
    ]
}

/// Admits a socket, answers the info request with the given token, and
/// returns the client side.
async fn join(registry: &RoomRegistry, room: &str, token: &str) -> Result<ClientSocket> {
    let (source, sink, mut client) = socket_pair();
    registry
        .admit(source, sink, room)
        .await
        .map_err(|err| anyhow::anyhow!("admission failed: {err}"))?;
    client.expect("client-info-request").await?;
    client.auth(token).await?;
    Ok(client)
}

/// Drains a client's frames up to and including the answer-countdown tick
/// of the current question, so the game is known to be mid-countdown.
async fn drain_until_answer_countdown(client: &mut ClientSocket) -> Result<()> {
    let tick = client.next_with_tag("q-countdown-tick").await?;
    ensure!(tick["begin"] == true, "countdown must start with begin=true");
    Ok(())
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn quick_join_round_scores_first_answer() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 2,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(1),
        },
    )?;

    let mut ada = join(&registry, QUICK_JOIN_ID, "tok-ada").await?;
    let roster = ada.expect("p-list-set").await?;
    assert_eq!(roster["participants"].as_array().unwrap().len(), 1);

    let mut bea = join(&registry, QUICK_JOIN_ID, "tok-bea").await?;
    let addition = ada.expect("p-list-add").await?;
    assert_eq!(addition["participant"]["username"], "bea");
    let roster = bea.expect("p-list-set").await?;
    assert_eq!(roster["participants"].as_array().unwrap().len(), 2);

    for client in [&mut ada, &mut bea] {
        let tick = client.expect("g-start-countdown-tick").await?;
        assert_eq!(tick["begin"], true);
        assert!(tick["millisRemaining"].as_u64().unwrap() <= 100);

        let start = client.next_with_tag("g-start").await?;
        assert_eq!(start["questionCount"], 1);

        let prompt = client.expect("q-set-prompt").await?;
        assert_eq!(prompt["index"], 0);
        assert_eq!(prompt["prompt"], "2 + 2?");
        assert_eq!(prompt["choices"].as_array().unwrap().len(), 4);

        let countdown = client.expect("q-countdown-tick").await?;
        assert_eq!(countdown["begin"], true);
        assert_eq!(countdown["millisRemaining"], 1000);
    }

    // Only ada answers, correctly.
    ada.select_answer(0, 1).await?;

    for client in [&mut ada, &mut bea] {
        let reveal = client.next_with_tag("q-reveal-answer").await?;
        assert_eq!(reveal["questionIndex"], 0);
        assert_eq!(reveal["answerIndex"], 1);

        let board = client.expect("p-list-set").await?;
        let participants = board["participants"].as_array().unwrap().clone();
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0]["username"], "ada");
        assert_eq!(participants[0]["score"], 100);
        assert_eq!(participants[1]["username"], "bea");
        assert_eq!(participants[1]["score"], 0);
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn quick_join_is_refused_once_the_game_is_running() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 1,
            max_participants: 1,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(240),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    ada.next_with_tag("q-set-prompt").await?;

    let (source, sink, mut late) = socket_pair();
    let result = registry.admit(source, sink, QUICK_JOIN_ID).await;
    assert!(matches!(result, Err(RegistryError::GameNotFound)));

    late.expect("game-not-found").await?;
    late.expect_closed().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_joiner_becomes_spectator_and_is_never_scored() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 1,
            max_participants: 1,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(240),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    drain_until_answer_countdown(&mut ada).await?;

    // bea arrives mid-game; participation is closed, so she attaches as a
    // spectator and immediately receives the current-phase snapshot.
    let mut bea = join(&registry, "r", "tok-bea").await?;
    let snapshot = bea.expect("multi").await?;
    let messages = snapshot["messages"].as_array().unwrap().clone();
    let tags: Vec<&str> = messages.iter().map(|m| m["tag"].as_str().unwrap()).collect();
    assert_eq!(
        tags,
        ["p-list-set", "g-start", "q-set-prompt", "q-countdown-tick"]
    );

    let participants = messages[0]["payload"]["participants"].as_array().unwrap().clone();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["username"], "ada");

    let tick = &messages[3]["payload"];
    assert_eq!(tick["begin"], false);
    assert!(tick["millisRemaining"].as_u64().unwrap() <= 240_000);

    // A spectator's answers never change any score.
    bea.select_answer(0, 1).await?;

    let board = ada.next_with_tag("p-list-set").await?;
    let participants = board["participants"].as_array().unwrap().clone();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["username"], "ada");
    assert_eq!(participants[0]["score"], 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnecting_participant_keeps_playing_the_current_question() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 2,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(240),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    let mut bea = join(&registry, "r", "tok-bea").await?;
    drain_until_answer_countdown(&mut ada).await?;
    drain_until_answer_countdown(&mut bea).await?;

    // ada's socket closes mid-countdown.
    drop(ada);
    let row = bea.next_with_tag("p-list-set-one").await?;
    assert_eq!(row["participant"]["username"], "ada");
    assert_eq!(row["participant"]["disconnected"], true);

    // She reattaches with the same token before the countdown expires.
    let mut ada = join(&registry, "r", "tok-ada").await?;
    let row = bea.next_with_tag("p-list-set-one").await?;
    assert_eq!(row["participant"]["disconnected"], false);

    let snapshot = ada.next_with_tag("multi").await?;
    let messages = snapshot["messages"].as_array().unwrap().clone();
    let tags: Vec<&str> = messages.iter().map(|m| m["tag"].as_str().unwrap()).collect();
    assert_eq!(
        tags,
        ["p-list-set", "g-start", "q-set-prompt", "q-countdown-tick"]
    );
    assert_eq!(messages[3]["payload"]["begin"], false);

    // Her first answer for the current question is still honored.
    ada.select_answer(0, 1).await?;

    let board = ada.next_with_tag("p-list-set").await?;
    let participants = board["participants"].as_array().unwrap().clone();
    assert_eq!(participants[0]["username"], "ada");
    assert_eq!(participants[0]["score"], 100);
    assert_eq!(participants[1]["score"], 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pre_start_disconnect_resets_the_room() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 2,
            max_participants: 4,
            start_delay: Duration::from_secs(300),
            question_count: 1,
            answer_duration: Duration::from_secs(10),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    let bea = join(&registry, "r", "tok-bea").await?;

    // The start countdown is running.
    let tick = ada.next_with_tag("g-start-countdown-tick").await?;
    assert_eq!(tick["begin"], true);

    // bea leaves before the game starts: the room drops back to waiting.
    drop(bea);
    let removal = ada.next_with_tag("p-list-remove").await?;
    assert_eq!(removal["username"], "bea");

    let view = registry
        .with_room_view("r", |view| (view.accepting_joins, view.participant_count))
        .unwrap();
    assert_eq!(view, (true, 1));

    // No game frames follow the reset.
    ada.expect_no_frame().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_join_replaces_the_previous_socket() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 1,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(240),
        },
    )?;

    let mut first = join(&registry, "r", "tok-ada").await?;
    drain_until_answer_countdown(&mut first).await?;

    // A second socket authenticates as the same user; the server closes
    // the previous one and the roster stays unchanged.
    let mut second = join(&registry, "r", "tok-ada").await?;
    first.expect_closed().await?;

    let snapshot = second.expect("multi").await?;
    let messages = snapshot["messages"].as_array().unwrap().clone();
    let participants = messages[0]["payload"]["participants"].as_array().unwrap().clone();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["username"], "ada");
    assert_eq!(participants[0]["score"], 0);
    assert_eq!(participants[0]["disconnected"], false);

    let count = registry
        .with_room_view("r", |view| view.participant_count)
        .unwrap();
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn question_provider_failure_terminates_the_room() -> Result<()> {
    let registry = registry_with(&two_users(), Vec::new());
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 1,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(10),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    ada.expect("p-list-set").await?;

    // Fetching questions fails, which is fatal for the room: every socket
    // is closed and the room unregisters itself.
    ada.expect_closed().await?;
    assert!(registry.with_room_view("r", |_| ()).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_a_room_closes_its_sockets() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 2,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(10),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    ada.expect("p-list-set").await?;

    assert!(registry.stop_room("r"));
    ada.expect_closed().await?;
    assert!(registry.with_room_view("r", |_| ()).is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_tokens_are_turned_away() -> Result<()> {
    let registry = registry_with(&two_users(), vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 2,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(10),
        },
    )?;

    let (source, sink, mut stranger) = socket_pair();
    registry.admit(source, sink, "r").await?;
    stranger.expect("client-info-request").await?;
    stranger.auth("no-such-token").await?;

    stranger.expect("user-not-found").await?;
    stranger.expect_closed().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn guests_reconnect_by_their_guest_identity() -> Result<()> {
    let users = vec![
        ("tok-ada", User::registered(1, "ada")),
        ("tok-guest", User::guest(9)),
    ];
    let registry = registry_with(&users, vec![math_question()]);
    registry.create_room(
        "r",
        RoomOptions {
            min_participants: 2,
            max_participants: 2,
            start_delay: Duration::from_millis(100),
            question_count: 1,
            answer_duration: Duration::from_secs(240),
        },
    )?;

    let mut ada = join(&registry, "r", "tok-ada").await?;
    let mut guest = join(&registry, "r", "tok-guest").await?;
    drain_until_answer_countdown(&mut ada).await?;
    drain_until_answer_countdown(&mut guest).await?;

    drop(guest);
    let row = ada.next_with_tag("p-list-set-one").await?;
    assert_eq!(row["participant"]["username"], "#Guest9");
    assert_eq!(row["participant"]["disconnected"], true);

    let mut guest = join(&registry, "r", "tok-guest").await?;
    let snapshot = guest.next_with_tag("multi").await?;
    let participants = snapshot["messages"][0]["payload"]["participants"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(participants.len(), 2);

    let row = ada.next_with_tag("p-list-set-one").await?;
    assert_eq!(row["participant"]["disconnected"], false);
    Ok(())
}
