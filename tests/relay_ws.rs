//! End-to-end relay scenarios over real websockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boardwalk::auth::TokenVerifier;
use boardwalk::config::Config;
use boardwalk::registry::SessionRegistry;
use boardwalk::server::{build_router, AppState};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration secret!";

/// Start a relay (without the room layer) on an ephemeral port.
async fn start_relay(cfg: Config) -> SocketAddr {
    let cfg = Arc::new(cfg);
    let registry = SessionRegistry::new(cfg.clone());
    registry.spawn_sweeper();
    let state = AppState {
        verifier: TokenVerifier::new(SECRET),
        cfg,
        registry,
        storage: None,
        broker: None,
    };
    let app = build_router(state, None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_config() -> Config {
    Config {
        control_token_secret: SECRET.to_string(),
        viewer_setup_timeout: Duration::from_secs(1),
        spawn_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

fn mint_token(subject: &str, username: &str) -> String {
    let claims = json!({
        "sub": subject,
        "username": username,
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect_control(addr: SocketAddr, session: &str, token: &str) -> Socket {
    let url = format!("ws://{}/ws/control/{}", addr, session);
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token).parse().unwrap(),
    );
    let (socket, _) = connect_async(request).await.expect("control connect");
    socket
}

async fn connect_plain(addr: SocketAddr, path: &str) -> Socket {
    let url = format!("ws://{}{}", addr, path);
    let (socket, _) = connect_async(&url).await.expect("websocket connect");
    socket
}

/// Read frames until a Text frame arrives, with a timeout.
async fn next_json(socket: &mut Socket) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

async fn next_binary(socket: &mut Socket) -> Vec<u8> {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = timeout(deadline, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Binary(bytes) => return bytes,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected binary frame, got {:?}", other),
        }
    }
}

/// Read until the server closes the socket; returns the close code.
async fn wait_for_close(socket: &mut Socket) -> Option<u16> {
    let deadline = Duration::from_secs(5);
    loop {
        match timeout(deadline, socket.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}


/// The control handler runs after the websocket upgrade completes; give the
/// server a beat to register the session before viewers look it up.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn fresh_spawn_end_to_end() {
    let addr = start_relay(test_config()).await;
    let token = mint_token("u1", "sam");

    // Producer dials in and handshakes.
    let mut control = connect_control(addr, "sess-1", &token).await;
    control
        .send(Message::Text(
            json!({"type": "control_handshake", "version": "1", "hostname": "devbox"}).to_string(),
        ))
        .await
        .unwrap();
    settle().await;

    // Viewer asks for a new terminal.
    let mut viewer = connect_plain(addr, "/ws/terminal/sess-1").await;
    viewer
        .send(Message::Text(
            json!({"type": "setup", "action": "new", "name": "x", "cols": 80, "rows": 24})
                .to_string(),
        ))
        .await
        .unwrap();

    // The relay turns that into start_terminal on the control channel.
    let start = next_json(&mut control).await;
    assert_eq!(start["type"], "start_terminal");
    assert_eq!(start["name"], "x");
    assert_eq!(start["cols"], 80);
    let request_id = start["requestId"].as_str().unwrap();

    // Producer picks its own name (the PID) and confirms.
    control
        .send(Message::Text(
            json!({
                "type": "terminal_started",
                "name": "7421",
                "requestId": request_id,
                "success": true,
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let response = next_json(&mut viewer).await;
    assert_eq!(response["type"], "setup_response");
    assert_eq!(response["success"], true);
    assert_eq!(response["name"], "7421");
    assert_eq!(response["cols"], 80);
    assert_eq!(response["rows"], 24);

    // Producer opens the terminal's data channel and handshakes; the relay
    // answers with the current geometry.
    let mut data = connect_plain(addr, "/ws/terminal-data/sess-1/7421").await;
    data.send(Message::Binary(
        [b"1".as_slice(), br#"{"version":"1","shell":"/bin/bash"}"#].concat(),
    ))
    .await
    .unwrap();
    let resize = next_binary(&mut data).await;
    assert_eq!(resize[0], b'1');
    let geometry: serde_json::Value = serde_json::from_slice(&resize[1..]).unwrap();
    assert_eq!(geometry["cols"], 80);
    assert_eq!(geometry["rows"], 24);

    // Output fans out to the viewer; viewer input reaches the producer.
    data.send(Message::Binary(b"0hello from the pty".to_vec()))
        .await
        .unwrap();
    assert_eq!(next_binary(&mut viewer).await, b"hello from the pty");

    viewer.send(Message::Binary(b"ls\n".to_vec())).await.unwrap();
    let input = next_binary(&mut data).await;
    assert_eq!(input[0], b'0');
    assert_eq!(&input[1..], b"ls\n");
}

#[tokio::test]
async fn viewer_setup_timeout_closes_4408() {
    let addr = start_relay(test_config()).await;
    let token = mint_token("u1", "sam");
    let _control = connect_control(addr, "sess-t", &token).await;
    settle().await;

    let mut viewer = connect_plain(addr, "/ws/terminal/sess-t").await;
    // Send nothing; the setup window is 1 s in the test config.
    assert_eq!(wait_for_close(&mut viewer).await, Some(4408));
}

#[tokio::test]
async fn second_producer_is_rejected_4409() {
    let addr = start_relay(test_config()).await;
    let token = mint_token("u1", "sam");
    let _first = connect_control(addr, "sess-d", &token).await;
    settle().await;

    let mut second = connect_control(addr, "sess-d", &token).await;
    assert_eq!(wait_for_close(&mut second).await, Some(4409));
}

#[tokio::test]
async fn missing_token_is_rejected_4401() {
    let addr = start_relay(test_config()).await;
    let mut control = connect_plain(addr, "/ws/control/sess-a").await;
    assert_eq!(wait_for_close(&mut control).await, Some(4401));
}

#[tokio::test]
async fn viewer_for_unknown_session_is_rejected_4404() {
    let addr = start_relay(test_config()).await;
    let mut viewer = connect_plain(addr, "/ws/terminal/no-such-session").await;
    assert_eq!(wait_for_close(&mut viewer).await, Some(4404));
}

#[tokio::test]
async fn graceful_producer_close_disconnects_viewers() {
    let addr = start_relay(test_config()).await;
    let token = mint_token("u1", "sam");

    let mut control = connect_control(addr, "sess-g", &token).await;
    control
        .send(Message::Text(
            json!({"type": "control_handshake", "version": "1"}).to_string(),
        ))
        .await
        .unwrap();
    settle().await;

    // Attach a viewer to a spawned terminal.
    let mut viewer = connect_plain(addr, "/ws/terminal/sess-g").await;
    viewer
        .send(Message::Text(
            json!({"type": "setup", "action": "new", "name": "x"}).to_string(),
        ))
        .await
        .unwrap();
    let start = next_json(&mut control).await;
    let request_id = start["requestId"].as_str().unwrap();
    control
        .send(Message::Text(
            json!({
                "type": "terminal_started",
                "name": "101",
                "requestId": request_id,
                "success": true,
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let response = next_json(&mut viewer).await;
    assert_eq!(response["success"], true);

    // Producer shuts down cleanly.
    control
        .send(Message::Close(Some(
            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                reason: "client shutdown".into(),
            },
        )))
        .await
        .unwrap();

    let disconnect = next_json(&mut viewer).await;
    assert_eq!(disconnect["type"], "disconnect");
    assert_eq!(disconnect["reason"], "session_ended");
    assert_eq!(wait_for_close(&mut viewer).await, Some(1000));

    // The session is gone: a new viewer finds nothing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late = connect_plain(addr, "/ws/terminal/sess-g").await;
    assert_eq!(wait_for_close(&mut late).await, Some(4404));
}

#[tokio::test]
async fn mirror_of_missing_terminal_gets_error_then_4404() {
    let addr = start_relay(test_config()).await;
    let token = mint_token("u1", "sam");
    let mut control = connect_control(addr, "sess-m", &token).await;
    control
        .send(Message::Text(
            json!({"type": "control_handshake", "version": "1"}).to_string(),
        ))
        .await
        .unwrap();
    settle().await;

    let mut viewer = connect_plain(addr, "/ws/terminal/sess-m").await;
    viewer
        .send(Message::Text(
            json!({"type": "setup", "action": "mirror", "name": "nope"}).to_string(),
        ))
        .await
        .unwrap();
    let response = next_json(&mut viewer).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "Terminal not found");
    assert_eq!(wait_for_close(&mut viewer).await, Some(4404));
}

#[tokio::test]
async fn garbage_setup_is_rejected_4400() {
    let addr = start_relay(test_config()).await;
    let token = mint_token("u1", "sam");
    let _control = connect_control(addr, "sess-b", &token).await;
    settle().await;

    let mut viewer = connect_plain(addr, "/ws/terminal/sess-b").await;
    viewer
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    assert_eq!(wait_for_close(&mut viewer).await, Some(4400));
}
