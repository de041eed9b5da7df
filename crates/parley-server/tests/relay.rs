//! End-to-end scenarios: a real relay on a loopback port, driven by
//! `ParleyClient` connections.

use parley_client::ParleyClient;
use parley_core::envelope::fields::{
    ACCOUNT_NAME, DESTINATION, MESSAGE_TEXT, PUBLIC_KEY, SENDER, TIME, USER,
};
use parley_core::{Action, Envelope, ParleyError, ParleyResult, ResponseCode};
use parley_server::{MemoryDirectory, RelayHandle, RelayServer, ServerConfig};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

struct TestRelay {
    handle: RelayHandle,
    directory: Arc<MemoryDirectory>,
    task: JoinHandle<ParleyResult<()>>,
}

fn test_config() -> ServerConfig {
    ServerConfig {
        address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        port: 0,
        io_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
        login_max_attempts: 0,
        ..ServerConfig::default()
    }
}

async fn start_with(config: ServerConfig) -> TestRelay {
    let directory = Arc::new(MemoryDirectory::new());
    for (name, password) in [("alice", "wonderland"), ("bob", "builder"), ("carol", "singer")] {
        directory.add_user(name, password);
    }
    let (server, handle) = RelayServer::bind(config, directory.clone()).await.unwrap();
    let task = tokio::spawn(server.run());
    TestRelay {
        handle,
        directory,
        task,
    }
}

async fn start() -> TestRelay {
    start_with(test_config()).await
}

async fn connect(relay: &TestRelay) -> ParleyClient {
    ParleyClient::connect(relay.handle.local_addr(), CLIENT_TIMEOUT)
        .await
        .unwrap()
}

async fn login(relay: &TestRelay, name: &str, password: &str) -> ParleyClient {
    let mut client = connect(relay).await;
    client
        .login(name, password, &format!("{name}-key"))
        .await
        .unwrap();
    client
}

fn presence(name: &str) -> Envelope {
    Envelope::request(Action::Presence).with(USER, json!({ ACCOUNT_NAME: name, PUBLIC_KEY: "pk" }))
}

/// The server dropped us: a closed or reset socket, not a silent one.
async fn assert_closed(client: &mut ParleyClient) {
    match client.next_envelope().await {
        Err(ParleyError::PeerUnreachable(_)) => {}
        other => panic!("expected closed connection, got {other:?}"),
    }
}

async fn wait_for_sessions(handle: &RelayHandle, expected: &[&str]) {
    for _ in 0..100 {
        if handle.sessions().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "sessions never became {expected:?}, last {:?}",
        handle.sessions().await
    );
}

#[tokio::test]
async fn message_is_relayed_verbatim() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;
    let mut bob = login(&relay, "bob", "builder").await;

    let envelope = Envelope::new()
        .with("action", "msg")
        .with(TIME, 1_700_000_000)
        .with(SENDER, "alice")
        .with(DESTINATION, "bob")
        .with(MESSAGE_TEXT, "hi")
        .with("encrypted", true);
    let reply = alice.request(&envelope).await.unwrap();
    assert!(reply.is_response(ResponseCode::Ok));

    let received = bob.next_incoming().await.unwrap();
    assert_eq!(received, envelope);

    let stats = relay.directory.message_stats();
    let alice_stats = stats.iter().find(|s| s.name == "alice").unwrap();
    let bob_stats = stats.iter().find(|s| s.name == "bob").unwrap();
    assert_eq!(alice_stats.sent, 1);
    assert_eq!(bob_stats.accepted, 1);
}

#[tokio::test]
async fn message_to_offline_user_is_rejected() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;

    let err = alice.send_message("bob", "anyone there?").await.unwrap_err();
    assert!(matches!(err, ParleyError::UnknownDestination(_)));

    // Connection stays usable.
    assert_eq!(alice.contacts().await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn unregistered_user_is_rejected_and_closed() {
    let relay = start().await;
    let mut client = connect(&relay).await;

    let err = client.login("mallory", "secret", "pk").await.unwrap_err();
    assert!(matches!(err, ParleyError::UnknownUser(_)));
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn wrong_password_is_rejected_without_binding() {
    let relay = start().await;
    let mut client = connect(&relay).await;

    let err = client.login("alice", "looking-glass", "pk").await.unwrap_err();
    assert!(matches!(err, ParleyError::AuthFailed(_)));
    assert_closed(&mut client).await;
    assert!(relay.handle.sessions().await.unwrap().is_empty());
    assert!(relay.directory.active_users().is_empty());
}

#[tokio::test]
async fn second_login_for_bound_name_is_refused() {
    let relay = start().await;
    let mut first = login(&relay, "alice", "wonderland").await;

    let mut second = connect(&relay).await;
    let err = second.login("alice", "wonderland", "pk").await.unwrap_err();
    assert!(matches!(err, ParleyError::DuplicateSession(_)));
    assert_closed(&mut second).await;

    assert_eq!(first.contacts().await.unwrap(), Vec::<String>::new());
    assert_eq!(relay.handle.sessions().await.unwrap(), vec!["alice"]);
}

#[tokio::test]
async fn action_before_login_closes_connection() {
    let relay = start().await;
    let mut client = connect(&relay).await;

    let request = Envelope::request(Action::GetContacts).with(USER, "alice");
    client.send_envelope(&request).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn principal_mismatch_closes_connection() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;
    let _bob = login(&relay, "bob", "builder").await;

    let forged = Envelope::request(Action::Msg)
        .with(SENDER, "bob")
        .with(DESTINATION, "bob")
        .with(MESSAGE_TEXT, "spoofed");
    alice.send_envelope(&forged).await.unwrap();
    assert_closed(&mut alice).await;
    wait_for_sessions(&relay.handle, &["bob"]).await;
}

#[tokio::test]
async fn unknown_action_gets_bad_request() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;

    let reply = alice
        .request(&Envelope::new().with("action", "teleport"))
        .await
        .unwrap();
    assert!(reply.is_response(ResponseCode::BadRequest));
    assert_eq!(reply.error_text(), Some("malformed request"));

    // Incomplete known action, same treatment.
    let reply = alice
        .request(&Envelope::request(Action::AddContact))
        .await
        .unwrap();
    assert!(reply.is_response(ResponseCode::BadRequest));

    assert!(alice.known_users().await.is_ok());
}

#[tokio::test]
async fn contact_list_round_trip() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;

    alice.add_contact("bob").await.unwrap();
    alice.add_contact("bob").await.unwrap();
    alice.add_contact("ghost").await.unwrap();
    assert_eq!(alice.contacts().await.unwrap(), vec!["bob"]);

    alice.remove_contact("bob").await.unwrap();
    alice.remove_contact("bob").await.unwrap();
    assert!(alice.contacts().await.unwrap().is_empty());
}

#[tokio::test]
async fn user_listing_and_public_keys() {
    let relay = start().await;
    let _alice = login(&relay, "alice", "wonderland").await;
    let mut bob = login(&relay, "bob", "builder").await;

    assert_eq!(bob.known_users().await.unwrap(), vec!["alice", "bob", "carol"]);
    assert_eq!(
        bob.public_key_of("alice").await.unwrap().as_deref(),
        Some("alice-key")
    );
    assert_eq!(bob.public_key_of("carol").await.unwrap(), None);
}

#[tokio::test]
async fn dropped_peer_releases_its_name() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;
    let bob = login(&relay, "bob", "builder").await;
    drop(bob);

    wait_for_sessions(&relay.handle, &["alice"]).await;
    let err = alice.send_message("bob", "still there?").await.unwrap_err();
    assert!(matches!(err, ParleyError::UnknownDestination(_)));
    assert!(relay.directory.active_users().iter().all(|u| u.name != "bob"));

    let _bob = login(&relay, "bob", "builder").await;
    alice.send_message("bob", "welcome back").await.unwrap();
}

#[tokio::test]
async fn stalled_recipient_is_torn_down_by_the_router() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;
    // Bob stays connected but never reads.
    let _bob = login(&relay, "bob", "builder").await;
    let text = "x".repeat(60_000);

    let mut sent = 0;
    while relay.handle.sessions().await.unwrap().iter().any(|s| s == "bob") {
        alice.send_message("bob", &text).await.unwrap();
        sent += 1;
        assert!(sent < 1_000, "bob was never torn down");
    }

    assert!(sent > 0);
    assert_eq!(relay.handle.sessions().await.unwrap(), vec!["alice"]);
    assert!(relay.directory.active_users().iter().all(|u| u.name != "bob"));
    let err = alice.send_message("bob", "gone?").await.unwrap_err();
    assert!(matches!(err, ParleyError::UnknownDestination(_)));
}

#[tokio::test]
async fn contacts_changed_reaches_every_session() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;
    let mut bob = login(&relay, "bob", "builder").await;

    relay.handle.notify_contacts_changed().await.unwrap();

    for client in [&mut alice, &mut bob] {
        let pushed = client.next_incoming().await.unwrap();
        assert!(pushed.is_response(ResponseCode::ContactsChanged));
    }
}

#[tokio::test]
async fn push_during_request_is_queued() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;
    let mut bob = login(&relay, "bob", "builder").await;

    alice.send_message("bob", "first").await.unwrap();
    // Bob's reply to this request arrives after alice's message.
    assert!(bob.contacts().await.unwrap().is_empty());

    let queued = bob.take_incoming();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].str_field(MESSAGE_TEXT), Some("first"));
}

#[tokio::test]
async fn exit_ends_session_and_allows_relogin() {
    let relay = start().await;
    let alice = login(&relay, "alice", "wonderland").await;
    alice.exit().await.unwrap();

    wait_for_sessions(&relay.handle, &[]).await;
    assert!(relay.directory.active_users().is_empty());

    let again = login(&relay, "alice", "wonderland").await;
    assert_eq!(again.username(), Some("alice"));
    assert_eq!(relay.directory.login_history(Some("alice")).len(), 2);
}

#[tokio::test]
async fn undecodable_frame_closes_connection() {
    let relay = start().await;
    let mut client = connect(&relay).await;

    let payload = b"not json";
    let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(payload);
    client.send_raw(&frame).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let relay = start().await;
    let mut client = connect(&relay).await;

    client.send_raw(&u32::MAX.to_be_bytes()).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn unanswered_challenge_times_out() {
    let relay = start_with(ServerConfig {
        io_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await;
    let mut client = connect(&relay).await;

    let reply = client.request(&presence("alice")).await.unwrap();
    assert!(reply.is_response(ResponseCode::AuthRequired));
    assert_eq!(reply.data().map(str::len), Some(128));

    assert_closed(&mut client).await;
    assert!(relay.handle.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_logins_are_throttled() {
    let relay = start_with(ServerConfig {
        login_max_attempts: 2,
        ..test_config()
    })
    .await;

    for _ in 0..2 {
        let mut client = connect(&relay).await;
        let err = client.login("alice", "nope", "pk").await.unwrap_err();
        assert!(matches!(err, ParleyError::AuthFailed(_)));
    }

    let mut client = connect(&relay).await;
    let reply = client.request(&presence("alice")).await.unwrap();
    assert_eq!(reply.error_text(), Some("too many login attempts"));
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn connections_over_the_cap_are_refused() {
    let relay = start_with(ServerConfig {
        max_connections: 1,
        ..test_config()
    })
    .await;
    let mut alice = login(&relay, "alice", "wonderland").await;

    let mut extra = connect(&relay).await;
    assert!(extra.login("bob", "builder", "pk").await.is_err());

    assert!(alice.contacts().await.is_ok());
}

#[tokio::test]
async fn shutdown_stops_the_loop_and_logs_everyone_out() {
    let relay = start().await;
    let mut alice = login(&relay, "alice", "wonderland").await;

    relay.handle.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(2), relay.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    assert_closed(&mut alice).await;
    assert!(relay.directory.active_users().is_empty());
    assert!(relay.handle.sessions().await.is_err());
}
