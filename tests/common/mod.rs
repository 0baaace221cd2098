//! Shared helpers for integration tests

use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use coread::backend::server::{create_app, ServerConfig};
use coread::shared::message::{ActionType, SyncMessage};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start a sync server on an ephemeral port and return its address
pub async fn start_server(config: ServerConfig) -> SocketAddr {
    let app = create_app(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    addr
}

/// Connect a raw WebSocket client for one participant
pub async fn connect_participant(addr: SocketAddr, session: i64, user: &str) -> WsClient {
    let url = format!(
        "ws://{}/sync?session={}&user={}&name={}",
        addr, session, user, user
    );
    let (stream, _) = connect_async(url).await.expect("ws connect");
    stream
}

/// Receive frames until one parses as a `SyncMessage`, skipping pings
pub async fn recv_message(stream: &mut WsClient) -> SyncMessage {
    loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("stream error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("well-formed frame");
        }
    }
}

/// Receive messages until one has the wanted action type
pub async fn recv_action(stream: &mut WsClient, action: ActionType) -> SyncMessage {
    loop {
        let msg = recv_message(stream).await;
        if msg.action_type == action {
            return msg;
        }
    }
}

/// Serialize and send one `SyncMessage`
pub async fn send_message(stream: &mut WsClient, msg: &SyncMessage) {
    use futures_util::SinkExt;
    let json = serde_json::to_string(msg).expect("serialize");
    stream
        .send(Message::Text(json.into()))
        .await
        .expect("send frame");
}
