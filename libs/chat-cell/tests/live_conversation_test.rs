use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use chat_cell::chat_routes;
use chat_cell::services::chat::ChatServices;
use chat_cell::{ConversationId, SenderRole};
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

const SECRET: &str = "test-secret-key-for-jwt-validation-must-be-long-enough";
const WAIT: Duration = Duration::from_secs(2);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (SocketAddr, Arc<ChatServices>) {
    let chat = Arc::new(ChatServices::in_memory());
    let app = chat_routes(TestConfig::default().to_arc(), chat.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, chat)
}

async fn open_live(addr: SocketAddr, user: &TestUser, other_id: &str) -> Socket {
    let token = JwtTestUtils::create_test_token(user, SECRET, Some(24));
    let url = format!(
        "ws://{}/conversations/{}/live?access_token={}",
        addr, other_id, token
    );
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for live event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn wait_for_no_subscriptions(chat: &ChatServices) {
    let deadline = Instant::now() + WAIT;
    while chat.subscriptions.active_subscriptions() != 0 {
        assert!(Instant::now() < deadline, "live subscription still running");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_live_socket_streams_snapshots() {
    let (addr, chat) = serve().await;
    let patient = TestUser::patient("patient@example.com").with_id("p1");
    let mut socket = open_live(addr, &patient, "d1").await;

    let first = next_event(&mut socket).await;
    assert_eq!(first["type"], "snapshot");
    assert!(first["messages"].as_array().unwrap().is_empty());

    let conversation_id = ConversationId::for_pair("chat-p1", "chat-d1");
    chat.adapter
        .send_message(&conversation_id, "chat-d1", "chat-p1", "Your results are in", "Doc", SenderRole::Doctor)
        .await
        .unwrap();

    let event = loop {
        let event = next_event(&mut socket).await;
        if !event["messages"].as_array().unwrap().is_empty() {
            break event;
        }
    };
    assert_eq!(event["type"], "snapshot");
    assert_eq!(event["messages"][0]["content"], "Your results are in");
    assert_eq!(event["messages"][0]["sender_role"], "doctor");
}

#[tokio::test]
async fn test_closing_socket_cancels_subscription() {
    let (addr, chat) = serve().await;
    let patient = TestUser::patient("patient@example.com").with_id("p1");
    let mut socket = open_live(addr, &patient, "d1").await;

    next_event(&mut socket).await;
    assert_eq!(chat.subscriptions.active_subscriptions(), 1);

    socket.close(None).await.unwrap();
    wait_for_no_subscriptions(&chat).await;
}

#[tokio::test]
async fn test_disconnect_sends_error_event() {
    let (addr, chat) = serve().await;
    let doctor = TestUser::doctor("doctor@example.com").with_id("d1");
    let mut socket = open_live(addr, &doctor, "p1").await;
    next_event(&mut socket).await;

    chat.shutdown();

    let event = next_event(&mut socket).await;
    assert_eq!(event["type"], "error");
    assert!(event["error"].is_string());
    wait_for_no_subscriptions(&chat).await;
}
