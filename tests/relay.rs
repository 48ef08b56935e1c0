//! End-to-end exercises of the relay over real WebSocket connections:
//! authentication, room presence, and directed forwarding.

use futures_util::{SinkExt, StreamExt};
use peerdrop::core::signal::{ClientMessage, ServerMessage};
use peerdrop::relay::{RelayServer, TokenAuthenticator};
use peerdrop::utils::sos::SignalOfStop;
use peerdrop::workers::endpoint::{Endpoint, EndpointConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (String, SignalOfStop) {
    let listener = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::new(Arc::new(TokenAuthenticator)));
    let sos = SignalOfStop::new();
    tokio::spawn(server.run(listener, sos.clone()));
    (format!("ws://{addr}"), sos)
}

async fn connect(base: &str, token: &str) -> Ws {
    let (ws, _) = connect_async(format!("{base}/ws/{token}")).await.unwrap();
    ws
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a relay message")
            .expect("relay connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap()))
        .await
        .unwrap();
}

async fn join(ws: &mut Ws, room: &str) {
    send(
        ws,
        &ClientMessage::JoinRoom {
            room_id: room.into(),
        },
    )
    .await;
    let ack = recv(ws).await;
    assert!(matches!(ack, ServerMessage::RoomJoined { room_id } if room_id == room));
}

/// Next `transfer_response`, skipping the roster refreshes that room
/// churn interleaves with it.
async fn recv_transfer_response(ws: &mut Ws) -> bool {
    loop {
        match recv(ws).await {
            ServerMessage::TransferResponse { accepted, .. } => return accepted,
            ServerMessage::RoomUsers { .. } => continue,
            other => panic!("expected transfer_response, got {other:?}"),
        }
    }
}

fn roster_ids(msg: &ServerMessage) -> Vec<String> {
    let ServerMessage::RoomUsers { users, .. } = msg else {
        panic!("expected room_users, got {msg:?}");
    };
    let mut ids: Vec<String> = users.iter().map(|u| u.id.clone()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn bad_token_gets_policy_close() {
    let (base, _sos) = start_relay().await;
    let (mut ws, _) = connect_async(format!("{base}/ws/garbage")).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Close(Some(close)) = frame else {
        panic!("expected close frame, got {frame:?}");
    };
    assert_eq!(u16::from(close.code), 4001);
}

#[tokio::test]
async fn roster_excludes_the_recipient() {
    let (base, _sos) = start_relay().await;
    let mut alice = connect(&base, "1:alice").await;
    let mut bob = connect(&base, "2:bob").await;

    join(&mut alice, "den").await;
    let msg = recv(&mut alice).await;
    assert!(roster_ids(&msg).is_empty());

    join(&mut bob, "den").await;
    let msg = recv(&mut bob).await;
    assert_eq!(roster_ids(&msg), vec!["1"]);
    let msg = recv(&mut alice).await;
    assert_eq!(roster_ids(&msg), vec!["2"]);
}

#[tokio::test]
async fn handshake_is_forwarded_with_sender_annotation() {
    let (base, _sos) = start_relay().await;
    let mut alice = connect(&base, "1:alice").await;
    let mut bob = connect(&base, "2:bob").await;
    join(&mut alice, "den").await;
    recv(&mut alice).await; // roster
    join(&mut bob, "den").await;
    recv(&mut bob).await; // roster
    recv(&mut alice).await; // roster refresh

    send(
        &mut alice,
        &ClientMessage::TransferRequest {
            target: "2".into(),
            file_name: "report.pdf".into(),
            file_size: 32768,
            file_type: "application/pdf".into(),
        },
    )
    .await;

    let msg = recv(&mut bob).await;
    let ServerMessage::TransferRequest {
        from,
        from_username,
        file_name,
        file_size,
        ..
    } = msg
    else {
        panic!("expected transfer_request, got {msg:?}");
    };
    assert_eq!(from, "1");
    assert_eq!(from_username, "alice");
    assert_eq!(file_name, "report.pdf");
    assert_eq!(file_size, 32768);

    // Reject flows back the same way, annotated.
    send(
        &mut bob,
        &ClientMessage::TransferResponse {
            target: "1".into(),
            accepted: false,
        },
    )
    .await;
    let msg = recv(&mut alice).await;
    assert!(
        matches!(msg, ServerMessage::TransferResponse { ref from, accepted: false } if from == "2")
    );
}

#[tokio::test]
async fn offer_and_candidates_reach_only_the_target() {
    let (base, _sos) = start_relay().await;
    let mut alice = connect(&base, "1:alice").await;
    let mut bob = connect(&base, "2:bob").await;
    let mut carol = connect(&base, "3:carol").await;
    join(&mut alice, "den").await;
    recv(&mut alice).await;
    join(&mut bob, "den").await;
    recv(&mut bob).await;
    recv(&mut alice).await;
    join(&mut carol, "den").await;
    recv(&mut carol).await;
    recv(&mut alice).await;
    recv(&mut bob).await;

    send(
        &mut alice,
        &ClientMessage::Offer {
            target: "2".into(),
            sdp: "{\"type\":\"offer\"}".into(),
        },
    )
    .await;
    send(
        &mut alice,
        &ClientMessage::IceCandidate {
            target: "2".into(),
            candidate: "{\"candidate\":\"host\"}".into(),
        },
    )
    .await;

    let msg = recv(&mut bob).await;
    assert!(matches!(msg, ServerMessage::Offer { ref from, .. } if from == "1"));
    let msg = recv(&mut bob).await;
    assert!(matches!(msg, ServerMessage::IceCandidate { ref from, .. } if from == "1"));

    // Carol saw nothing but roster traffic; a leave proves the queue held
    // no stray forwards.
    send(&mut carol, &ClientMessage::LeaveRoom).await;
    let msg = recv(&mut carol).await;
    assert!(matches!(msg, ServerMessage::RoomLeft));
}

#[tokio::test]
async fn disconnect_implies_leave() {
    let (base, _sos) = start_relay().await;
    let mut alice = connect(&base, "1:alice").await;
    let mut bob = connect(&base, "2:bob").await;
    join(&mut alice, "den").await;
    recv(&mut alice).await;
    join(&mut bob, "den").await;
    recv(&mut bob).await;
    recv(&mut alice).await;

    drop(bob);

    let msg = recv(&mut alice).await;
    assert!(roster_ids(&msg).is_empty());
}

#[tokio::test]
async fn rejoin_moves_between_rooms() {
    let (base, _sos) = start_relay().await;
    let mut alice = connect(&base, "1:alice").await;
    let mut bob = connect(&base, "2:bob").await;
    join(&mut alice, "den").await;
    recv(&mut alice).await;
    join(&mut bob, "den").await;
    recv(&mut bob).await;
    recv(&mut alice).await;

    join(&mut bob, "attic").await;
    let msg = recv(&mut bob).await;
    assert!(roster_ids(&msg).is_empty());
    let msg = recv(&mut alice).await;
    assert!(roster_ids(&msg).is_empty());
}

#[tokio::test]
async fn endpoint_survives_malformed_offer() {
    let (base, sos) = start_relay().await;

    let config = EndpointConfig {
        relay_url: base.clone(),
        token: "9:echo".into(),
        room: "den".into(),
        downloads: std::env::temp_dir().join("peerdrop-endpoint-test"),
        auto_accept: true,
        outbound: None,
        history: None,
    };
    tokio::spawn(Endpoint::run(config, sos.clone()));

    let mut alice = connect(&base, "1:alice").await;
    join(&mut alice, "den").await;
    loop {
        let msg = recv(&mut alice).await;
        if roster_ids(&msg).iter().any(|id| id == "9") {
            break;
        }
    }

    let request = ClientMessage::TransferRequest {
        target: "9".into(),
        file_name: "report.pdf".into(),
        file_size: 32768,
        file_type: "application/pdf".into(),
    };
    send(&mut alice, &request).await;
    assert!(recv_transfer_response(&mut alice).await);

    // An offer whose SDP does not decode fails that one negotiation.
    send(
        &mut alice,
        &ClientMessage::Offer {
            target: "9".into(),
            sdp: "not json".into(),
        },
    )
    .await;

    // The endpoint must still be serving: once the failed transfer is
    // torn down, a fresh request is accepted again.
    let mut accepted = false;
    for _ in 0..20 {
        send(&mut alice, &request).await;
        if recv_transfer_response(&mut alice).await {
            accepted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(accepted, "endpoint stopped answering after a bad offer");

    sos.cancel();
}
