//! The websocket front end, spoken to the way a client would.

mod support;

use common::network::{Connection, Packet, Request, Response};
use common::{ErrorKind, MatchStatus};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;

use server::connection_manager;
use support::harness;

#[tokio::test]
async fn login_then_bet_over_the_wire() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let fixture = h.open_match().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(connection_manager::serve(listener, h.engine.clone()));

    let mut client = Connection::connect(&format!("ws://{addr}")).await.unwrap();

    let packet = client
        .request(Request::Login {
            user_id: alice.user_id.clone(),
        })
        .await
        .unwrap();
    let (principal, wallet) = match packet {
        Packet::ResponsePacket(Response::SuccessfulLogin { principal, wallet }) => (principal, wallet),
        other => panic!("login refused: {other:?}"),
    };
    assert_eq!(principal, alice);
    assert_eq!(wallet.balance, dec!(100));

    let packet = client
        .request(Request::Matches {
            status: Some(MatchStatus::Upcoming),
        })
        .await
        .unwrap();
    assert!(matches!(packet, Packet::ResponsePacket(Response::Matches(ref list)) if list.len() == 1));

    let packet = client
        .request(Request::PlaceBet {
            match_id: fixture.id.clone(),
            side: "ind".into(),
            stake: "40".into(),
        })
        .await
        .unwrap();
    let (bet, wallet) = match packet {
        Packet::ResponsePacket(Response::BetPlaced { bet, wallet }) => (bet, wallet),
        other => panic!("bet refused: {other:?}"),
    };
    assert_eq!(bet.potential_win, dec!(79.20));
    assert_eq!((wallet.balance, wallet.exposure), (dec!(60), dec!(40)));

    // errors come back typed, the session stays open
    let packet = client
        .request(Request::PlaceBet {
            match_id: fixture.id.clone(),
            side: "ind".into(),
            stake: "1000".into(),
        })
        .await
        .unwrap();
    assert!(matches!(packet, Packet::Error(ref reply) if reply.kind == ErrorKind::Funds));

    let packet = client
        .request(Request::DeclareResult {
            match_id: fixture.id.clone(),
            result: "IND".into(),
        })
        .await
        .unwrap();
    assert!(matches!(packet, Packet::Error(ref reply) if reply.kind == ErrorKind::Forbidden));

    let packet = client.request(Request::Wallet).await.unwrap();
    assert!(matches!(
        packet,
        Packet::ResponsePacket(Response::Wallet(wallet)) if wallet.balance == dec!(60)
    ));

    client.close().await.unwrap();
}

#[tokio::test]
async fn first_packet_must_be_a_login() {
    let h = harness().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(connection_manager::serve(listener, h.engine.clone()));

    let mut client = Connection::connect(&format!("ws://{addr}")).await.unwrap();
    let packet = client.request(Request::Wallet).await.unwrap();
    assert!(matches!(packet, Packet::Error(ref reply) if reply.kind == ErrorKind::Forbidden));

    let mut client = Connection::connect(&format!("ws://{addr}")).await.unwrap();
    let packet = client
        .request(Request::Login {
            user_id: "nobody".into(),
        })
        .await
        .unwrap();
    assert!(matches!(packet, Packet::Error(ref reply) if reply.kind == ErrorKind::NotFound));
}
