//! WebSocket Handler
//!
//! Per connection: this receive loop, one sender task that owns the write
//! half of the socket, and one command worker running relays in order.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::relay::{EventSink, RelayState, RunCommand, SessionRelay};

use super::protocol::{ClientMessage, Outbound, ServerMessage, parse_client_message};

/// Commands accepted while another is still running
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Time the sender task gets to flush queued frames after the session ends
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle one agent WebSocket connection until it closes.
pub async fn handle_agent_ws(socket: WebSocket, state: AppState, chat_id: Option<String>) {
    let session = state.sessions.open(chat_id).await;
    let session_id = session.id.clone();
    state.metrics.connection_opened();
    info!(session_id = %session_id, chat_id = ?session.chat_id, "WebSocket connection opened");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to the WebSocket
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.relay_config.send_channel_capacity);
    let sink = EventSink::new(tx);

    // Cancelled on disconnect, and by the server on shutdown
    let cancel = state.shutdown.child_token();

    let sender_session = session_id.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!(session_id = %sender_session, "Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                debug!(session_id = %sender_session, "Socket write failed, stopping sender");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });
    let sender_abort = sender_task.abort_handle();

    let _ = sink
        .send(ServerMessage::Connected {
            ws_id: session_id.clone(),
            chat_id: session.chat_id.clone(),
        })
        .await;

    let (cmd_tx, cmd_rx) = mpsc::channel::<RunCommand>(COMMAND_QUEUE_CAPACITY);
    let relay = SessionRelay::new(&session_id, &state, sink.clone());
    let worker = tokio::spawn(run_command_worker(relay, cmd_rx, cancel.clone()));

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                info!(session_id = %session_id, "Server shutting down, closing session");
                break;
            }
            msg = ws_receiver.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => match parse_client_message(text.as_str()) {
                ClientMessage::Send(cmd) => {
                    info!(
                        session_id = %session_id,
                        chat_id = %cmd.chat_id,
                        prompt_len = cmd.prompt.len(),
                        "Queueing command"
                    );
                    match cmd_tx.try_send(cmd) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(session_id = %session_id, "Command queue full, rejecting command");
                            let _ = sink
                                .send(ServerMessage::error("Too many queued commands"))
                                .await;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                ClientMessage::Ignored(reason) => {
                    info!(
                        session_id = %session_id,
                        reason,
                        preview = %text.as_str().chars().take(200).collect::<String>(),
                        "Ignoring client message"
                    );
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!(
                    session_id = %session_id,
                    code = ?frame.as_ref().map(|f| f.code),
                    "Client closed connection"
                );
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
            None => {
                debug!(session_id = %session_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Stops the running relay (terminating its process) and the worker
    cancel.cancel();
    drop(cmd_tx);
    if let Err(e) = worker.await {
        error!(session_id = %session_id, "Command worker panicked: {}", e);
    }

    // Last sink clone: the sender flushes what is queued, then closes the socket
    drop(sink);
    if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, sender_task)
        .await
        .is_err()
    {
        warn!(session_id = %session_id, "Sender did not drain in time");
        sender_abort.abort();
    }

    state.sessions.close(&session_id).await;
    state.metrics.connection_closed();
    info!(session_id = %session_id, "WebSocket connection closed");
}

/// Run queued commands one at a time, in arrival order, until cancelled.
async fn run_command_worker(
    mut relay: SessionRelay,
    mut commands: mpsc::Receiver<RunCommand>,
    cancel: CancellationToken,
) {
    loop {
        // A command queued just before disconnect must not start an agent
        let cmd = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        let outcome = relay.run(cmd, &cancel).await;
        debug!(?outcome, state = ?relay.state(), "Command finished");
        if relay.state() == RelayState::Killed {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::test_helpers::{spawn_test_server, test_app_state_with_agent, write_script};
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite;

    type WsClient =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    const TWO_EVENTS: &str = r#"echo '{"type":"system","n":1}'
echo '{"type":"user","n":2}'"#;

    async fn connect(addr: SocketAddr, query: &str) -> WsClient {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws{query}"))
            .await
            .unwrap();
        ws
    }

    async fn send_json(ws: &mut WsClient, value: Value) {
        ws.send(tungstenite::Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn send_command(ws: &mut WsClient) {
        send_json(ws, json!({"type": "send", "chatId": "abc", "prompt": "hi"})).await;
    }

    /// Next text frame as JSON; `None` once the server closes the socket.
    async fn next_json(ws: &mut WsClient) -> Option<Value> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("timed out waiting for a frame");
            match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).unwrap());
                }
                Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn expect_json(ws: &mut WsClient) -> Value {
        next_json(ws).await.expect("socket closed early")
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    async fn server_with_agent(body: &str) -> (AppState, SocketAddr, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let agent = write_script(tmp.path(), "agent", body);
        let state = test_app_state_with_agent(&agent);
        let addr = spawn_test_server(state.clone()).await;
        (state, addr, tmp)
    }

    #[tokio::test]
    async fn test_worker_skips_commands_queued_before_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("started");
        let agent = write_script(
            tmp.path(),
            "agent",
            &format!("touch '{}'\nexit 0", marker.display()),
        );
        let state = test_app_state_with_agent(&agent);
        let (tx, mut rx) = mpsc::channel(16);
        let relay = SessionRelay::new("s", &state, EventSink::new(tx));

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        for prompt in ["one", "two"] {
            cmd_tx
                .send(RunCommand {
                    chat_id: "abc".to_string(),
                    prompt: prompt.to_string(),
                })
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(5),
            run_command_worker(relay, cmd_rx, cancel),
        )
        .await
        .unwrap();

        assert!(!marker.exists());
        assert!(rx.try_recv().is_err());
        assert_eq!(state.metrics.snapshot().commands.started, 0);
        assert_eq!(state.metrics.snapshot().errors.spawn, 0);
    }

    #[tokio::test]
    async fn test_connected_greeting() {
        let (state, addr, _tmp) = server_with_agent("exit 0").await;

        let mut ws = connect(addr, "?chatId=chat-42").await;
        let greeting = expect_json(&mut ws).await;
        assert_eq!(greeting["type"], "connected");
        assert_eq!(greeting["chatId"], "chat-42");
        let ws_id = greeting["wsId"].as_str().unwrap().to_string();
        assert!(state.sessions.get(&ws_id).await.is_some());

        let mut anonymous = connect(addr, "").await;
        let greeting = expect_json(&mut anonymous).await;
        assert_eq!(greeting["chatId"], Value::Null);
        assert_ne!(greeting["wsId"].as_str().unwrap(), ws_id);
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_then_success() {
        let (state, addr, _tmp) = server_with_agent(TWO_EVENTS).await;
        let mut ws = connect(addr, "?chatId=abc").await;
        assert_eq!(expect_json(&mut ws).await["type"], "connected");

        send_command(&mut ws).await;
        let reset = expect_json(&mut ws).await;
        assert_eq!(reset["type"], "reset");
        assert_eq!(reset["chatId"], "abc");
        assert_eq!(expect_json(&mut ws).await, json!({"type": "system", "n": 1}));
        assert_eq!(expect_json(&mut ws).await, json!({"type": "user", "n": 2}));
        assert_eq!(
            expect_json(&mut ws).await,
            json!({"type": "result", "subtype": "success", "exitCode": 0})
        );

        assert!(state.sessions.processes().is_empty().await);
        assert_eq!(state.metrics.snapshot().commands.completed, 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_result() {
        let (_state, addr, _tmp) = server_with_agent("exit 2").await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;

        send_command(&mut ws).await;
        assert_eq!(expect_json(&mut ws).await["type"], "reset");
        assert_eq!(
            expect_json(&mut ws).await,
            json!({"type": "result", "subtype": "error", "exitCode": 2})
        );
    }

    #[tokio::test]
    async fn test_raw_and_stderr_lines() {
        let (_state, addr, _tmp) =
            server_with_agent("echo 'Loading model...'\necho 'disk almost full' >&2").await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;

        send_command(&mut ws).await;
        let mut events = Vec::new();
        loop {
            let event = expect_json(&mut ws).await;
            let done = event["type"] == "result";
            events.push(event);
            if done {
                break;
            }
        }
        assert_eq!(events[0]["type"], "reset");
        assert!(events.contains(&json!({"type": "raw", "data": "Loading model..."})));
        assert!(events.contains(&json!({"type": "error", "message": "disk almost full"})));
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_commands_run_in_arrival_order() {
        let (_state, addr, _tmp) =
            server_with_agent("sleep 0.2\necho \"{\\\"type\\\":\\\"echo\\\",\\\"prompt\\\":\\\"$9\\\"}\"")
                .await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;

        send_json(&mut ws, json!({"type": "send", "chatId": "abc", "prompt": "first"})).await;
        send_json(&mut ws, json!({"type": "send", "chatId": "abc", "prompt": "second"})).await;

        for prompt in ["first", "second"] {
            assert_eq!(expect_json(&mut ws).await["type"], "reset");
            assert_eq!(
                expect_json(&mut ws).await,
                json!({"type": "echo", "prompt": prompt})
            );
            assert_eq!(expect_json(&mut ws).await["type"], "result");
        }
    }

    #[tokio::test]
    async fn test_invalid_messages_are_ignored() {
        let (_state, addr, _tmp) = server_with_agent(TWO_EVENTS).await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;

        ws.send(tungstenite::Message::Text("not json".into()))
            .await
            .unwrap();
        send_json(&mut ws, json!({"type": "ping"})).await;
        send_json(&mut ws, json!({"type": "send", "chatId": "abc"})).await;
        send_command(&mut ws).await;

        assert_eq!(expect_json(&mut ws).await["type"], "reset");
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_session_usable() {
        let state = test_app_state_with_agent(std::path::Path::new("/definitely/not/an/agent"));
        let addr = spawn_test_server(state.clone()).await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;

        for _ in 0..2 {
            send_command(&mut ws).await;
            let event = expect_json(&mut ws).await;
            assert_eq!(event["type"], "error");
            assert!(
                event["message"]
                    .as_str()
                    .unwrap()
                    .contains("/definitely/not/an/agent")
            );
        }
        assert_eq!(state.metrics.snapshot().errors.spawn, 2);
        assert!(state.sessions.processes().is_empty().await);
    }

    #[tokio::test]
    async fn test_disconnect_terminates_agent() {
        let (state, addr, _tmp) =
            server_with_agent("echo '{\"type\":\"system\"}'\nexec sleep 30").await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;

        send_command(&mut ws).await;
        assert_eq!(expect_json(&mut ws).await["type"], "reset");
        assert_eq!(expect_json(&mut ws).await["type"], "system");
        assert_eq!(state.sessions.processes().len().await, 1);

        ws.close(None).await.unwrap();
        drop(ws);

        let sessions = state.sessions.clone();
        wait_until(|| {
            let sessions = sessions.clone();
            async move { sessions.processes().is_empty().await && sessions.count().await == 0 }
        })
        .await;
        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.commands.killed, 1);
        assert_eq!(snapshot.commands.completed, 0);
        assert_eq!(snapshot.connections.active, 0);
    }

    #[tokio::test]
    async fn test_disconnect_kills_agent_ignoring_terminate() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = write_script(
            tmp.path(),
            "agent",
            "trap '' TERM\necho '{\"type\":\"system\"}'\nexec sleep 30",
        );
        let mut state = test_app_state_with_agent(&agent);
        state.relay_config = Arc::new(RelayConfig {
            grace_period: Duration::from_millis(300),
            ..RelayConfig::default()
        });
        let addr = spawn_test_server(state.clone()).await;

        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;
        send_command(&mut ws).await;
        expect_json(&mut ws).await;
        expect_json(&mut ws).await;
        drop(ws);

        let started = std::time::Instant::now();
        let sessions = state.sessions.clone();
        wait_until(|| {
            let sessions = sessions.clone();
            async move { sessions.processes().is_empty().await }
        })
        .await;
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(state.metrics.snapshot().commands.killed, 1);
    }

    #[tokio::test]
    async fn test_server_shutdown_closes_sessions() {
        let (state, addr, _tmp) =
            server_with_agent("echo '{\"type\":\"system\"}'\nexec sleep 30").await;
        let mut ws = connect(addr, "").await;
        expect_json(&mut ws).await;
        send_command(&mut ws).await;
        expect_json(&mut ws).await;
        expect_json(&mut ws).await;

        state.shutdown.cancel();
        // The socket closes without a result event
        assert_eq!(next_json(&mut ws).await, None);

        let report = state.sessions.shutdown(Duration::from_millis(300)).await;
        assert_eq!(report.killed, 0);
        assert!(state.sessions.processes().is_empty().await);
    }
}
