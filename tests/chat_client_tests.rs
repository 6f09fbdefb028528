// End-to-end chat flows against the in-process mock backend
// These tests drive ChatClient through connect, roster load, delivery and reconnect

mod common;
use common::{drain, identity, roster, setup_logging, test_config, wait_for, MockRoster, MockServer};

use std::time::Duration;

use tutorchat::chat::client::ChatClient;
use tutorchat::chat::connection::ConnectionState;
use tutorchat::chat::transport::{InboundFrame, OutboundFrame};
use tutorchat::chat::ChatUpdate;
use tutorchat::error::{ChatError, RosterFetchError, TransportError};
use tutorchat::models::{ContactStatus, DeliveryStatus, MessageKey};

fn students() -> Vec<tutorchat::chat::roster::RosterEntry> {
    roster(&[("C1", "Alice"), ("C2", "Bob")])
}

fn is_connected(update: &ChatUpdate) -> bool {
    matches!(update, ChatUpdate::ConnectionChanged(ConnectionState::Connected))
}

fn is_status(key: &MessageKey, status: DeliveryStatus) -> impl Fn(&ChatUpdate) -> bool + '_ {
    move |update| matches!(update, ChatUpdate::DeliveryChanged { key: k, status: s } if k == key && *s == status)
}

fn sent_keys(server: &MockServer) -> Vec<MessageKey> {
    server.sent().iter().map(OutboundFrame::key).collect()
}

#[tokio::test]
async fn test_pending_messages_flush_in_submission_order() {
    setup_logging();
    let server = MockServer::new();
    server.set_connect_delay(Duration::from_millis(150));
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();

    assert_eq!(client.load_contacts().await, Ok(2));
    assert_eq!(client.submit("C1", "first"), Ok(1));
    assert_eq!(client.submit("C2", "second"), Ok(1));
    assert_eq!(client.submit("C1", "third"), Ok(2));
    assert_eq!(client.core().stats().queued, 3);

    wait_for(&mut client, is_connected).await;
    let last = MessageKey::new("C1", 2);
    wait_for(&mut client, is_status(&last, DeliveryStatus::Sent)).await;

    assert_eq!(
        sent_keys(&server),
        vec![MessageKey::new("C1", 1), MessageKey::new("C2", 1), MessageKey::new("C1", 2)]
    );
    assert_eq!(client.core().stats().queued, 0);
    assert_eq!(client.core().stats().awaiting_ack, 3);
}

#[tokio::test]
async fn test_submit_while_disconnected_then_ack() {
    setup_logging();
    let server = MockServer::new();
    server.set_connect_delay(Duration::from_millis(100));
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();

    let seq = client.submit("C1", "hi").unwrap();
    assert_eq!(seq, 1);
    let message = client.core().session("C1").unwrap().message(1).unwrap();
    assert_eq!(message.delivery_status(), DeliveryStatus::Pending);

    let key = MessageKey::new("C1", 1);
    wait_for(&mut client, is_status(&key, DeliveryStatus::Sent)).await;

    server.push(InboundFrame::Ack { local_seq: 1, peer_id: None });
    wait_for(&mut client, is_status(&key, DeliveryStatus::Acknowledged)).await;
    let message = client.core().session("C1").unwrap().message(1).unwrap();
    assert_eq!(message.delivery_status(), DeliveryStatus::Acknowledged);
}

#[tokio::test]
async fn test_ack_reaches_inactive_session() {
    setup_logging();
    let server = MockServer::new();
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    wait_for(&mut client, is_connected).await;

    let session = client.select("C1").unwrap();
    assert!(session.messages().is_empty());
    assert_eq!(client.submit("C1", "hello"), Ok(1));
    let key = MessageKey::new("C1", 1);
    wait_for(&mut client, is_status(&key, DeliveryStatus::Sent)).await;

    client.select("C2").unwrap();
    server.push(InboundFrame::Ack { local_seq: 1, peer_id: Some("C1".into()) });
    wait_for(&mut client, is_status(&key, DeliveryStatus::Acknowledged)).await;

    let alice = client.core().session("C1").unwrap();
    assert!(!alice.is_active());
    assert_eq!(alice.message(1).unwrap().delivery_status(), DeliveryStatus::Acknowledged);
}

#[tokio::test]
async fn test_reconnect_sends_queued_message_once() {
    setup_logging();
    let server = MockServer::new();
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    wait_for(&mut client, is_connected).await;

    let first = MessageKey::new("C1", 1);
    client.submit("C1", "before").unwrap();
    wait_for(&mut client, is_status(&first, DeliveryStatus::Sent)).await;

    server.drop_link();
    wait_for(&mut client, |u| {
        matches!(u, ChatUpdate::ConnectionChanged(ConnectionState::Reconnecting { .. }))
    })
    .await;
    client.submit("C1", "during").unwrap();

    let second = MessageKey::new("C1", 2);
    wait_for(&mut client, is_status(&second, DeliveryStatus::Sent)).await;

    // The already sent message is not written again
    assert_eq!(sent_keys(&server), vec![first.clone(), second]);
    assert_eq!(server.connects(), 2);
    let message = client.core().session("C1").unwrap().message(1).unwrap();
    assert_eq!(message.delivery_status(), DeliveryStatus::Sent);
}

#[tokio::test]
async fn test_ack_timeout_fails_message() {
    setup_logging();
    let server = MockServer::new();
    let mut config = test_config();
    config.ack_timeout_ms = 100;
    let mut client = ChatClient::start(identity(), &config, server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    wait_for(&mut client, is_connected).await;

    client.submit("C2", "anyone there?").unwrap();
    let update = wait_for(&mut client, |u| matches!(u, ChatUpdate::DeliveryFailed { .. })).await;
    assert!(matches!(
        update,
        ChatUpdate::DeliveryFailed { reason: ChatError::DeliveryTimeout { local_seq: 1, .. }, .. }
    ));

    // A late ack leaves the failure in place
    server.push(InboundFrame::Ack { local_seq: 1, peer_id: Some("C2".into()) });
    server.push(InboundFrame::Presence { contact_id: "C2".into(), status: "online".into() });
    wait_for(&mut client, |u| matches!(u, ChatUpdate::PresenceChanged { .. })).await;
    let message = client.core().session("C2").unwrap().message(1).unwrap();
    assert_eq!(message.delivery_status(), DeliveryStatus::Failed);
}

#[tokio::test]
async fn test_reconnect_exhaustion_fails_messages_once() {
    setup_logging();
    let server = MockServer::new();
    server.refuse_connects(true);
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    client.submit("C1", "one").unwrap();
    client.submit("C2", "two").unwrap();

    let updates = drain(&mut client).await;
    let failures: Vec<&MessageKey> = updates
        .iter()
        .filter_map(|u| match u {
            ChatUpdate::DeliveryFailed { key, reason: ChatError::ConnectivityExhausted { .. } } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![&MessageKey::new("C1", 1), &MessageKey::new("C2", 1)]);

    let ConnectionState::Disconnected(Some(reason)) = client.core().connection_state().clone() else {
        panic!("expected terminal failure, got {:?}", client.core().connection_state());
    };
    assert!(matches!(reason, ChatError::ConnectivityExhausted { attempts: 3, .. }));
    assert_eq!(server.connects(), 3);
    assert_eq!(client.submit("C1", "three"), Err(reason));
}

#[tokio::test]
async fn test_lost_link_exhaustion_counts_failed_connects() {
    setup_logging();
    let server = MockServer::new();
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    wait_for(&mut client, is_connected).await;

    server.refuse_connects(true);
    server.drop_link();
    let updates = drain(&mut client).await;

    let attempts: Vec<u32> = updates
        .iter()
        .filter_map(|u| match u {
            ChatUpdate::ConnectionChanged(ConnectionState::Reconnecting { attempt }) => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(matches!(
        client.core().connection_state(),
        ConnectionState::Disconnected(Some(ChatError::ConnectivityExhausted { attempts: 3, .. }))
    ));
    // One successful connect followed by three refused ones
    assert_eq!(server.connects(), 4);
}

#[tokio::test]
async fn test_slow_handshake_times_out_and_retries() {
    setup_logging();
    let server = MockServer::new();
    server.set_connect_delay(Duration::from_millis(300));
    let mut config = test_config();
    config.connect_timeout_ms = 100;
    let mut client = ChatClient::start(identity(), &config, server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();

    let update = wait_for(&mut client, |u| {
        matches!(u, ChatUpdate::ConnectionChanged(ConnectionState::Reconnecting { .. }))
    })
    .await;
    assert_eq!(update, ChatUpdate::ConnectionChanged(ConnectionState::Reconnecting { attempt: 2 }));
    assert!(!server.is_linked());

    drain(&mut client).await;
    assert_eq!(
        client.core().connection_state(),
        &ConnectionState::Disconnected(Some(ChatError::ConnectivityExhausted {
            attempts: 3,
            last_error: TransportError::HandshakeTimeout(Duration::from_millis(100)),
        }))
    );
    assert_eq!(server.connects(), 3);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_without_spawning() {
    setup_logging();
    let server = MockServer::new();
    let mut config = test_config();
    config.event_buffer = 0;

    let result = ChatClient::start(identity(), &config, server.connector(), MockRoster::new(vec![Ok(students())]));
    assert!(matches!(result, Err(ChatError::InvalidConfig(_))));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connects(), 0);
}

#[tokio::test]
async fn test_presence_before_roster_is_dropped() {
    setup_logging();
    let server = MockServer::new();
    let roster_source = MockRoster::with_delay(vec![Ok(students())], Duration::from_millis(200));
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), roster_source).unwrap();

    server.wait_linked().await;
    server.push(InboundFrame::Presence { contact_id: "C1".into(), status: "online".into() });
    client.load_contacts().await.unwrap();

    assert_eq!(client.core().directory().get("C1").unwrap().status, ContactStatus::Offline);
    assert_eq!(client.core().stats().presence_dropped, 1);

    server.push(InboundFrame::Presence { contact_id: "C1".into(), status: "online".into() });
    let update = wait_for(&mut client, |u| matches!(u, ChatUpdate::PresenceChanged { .. })).await;
    assert_eq!(
        update,
        ChatUpdate::PresenceChanged { contact_id: "C1".into(), status: ContactStatus::Online }
    );
    assert_eq!(client.core().directory().get("C1").unwrap().status, ContactStatus::Online);
    assert_eq!(client.core().stats().presence_applied, 1);
    assert_eq!(client.core().stats().presence_dropped, 1);
}

#[tokio::test]
async fn test_incoming_messages_are_kept_for_unselected_peers() {
    setup_logging();
    let server = MockServer::new();
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    wait_for(&mut client, is_connected).await;
    client.select("C1").unwrap();

    for (seq, text) in [(10, "one"), (11, "two"), (10, "one again"), (12, "three")] {
        server.push(InboundFrame::Message {
            peer_id: "C2".into(),
            payload: text.into(),
            server_seq: seq,
            timestamp: None,
        });
    }
    let update = wait_for(&mut client, |u| {
        matches!(u, ChatUpdate::MessageReceived { local_seq: 3, .. })
    })
    .await;
    assert_eq!(
        update,
        ChatUpdate::MessageReceived { peer_id: "C2".into(), local_seq: 3, active: false }
    );

    let session = client.select("C2").unwrap();
    let payloads: Vec<&str> = session.messages().iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_message_from_unlisted_peer_is_adopted_on_reload() {
    setup_logging();
    let server = MockServer::new();
    let roster_source = MockRoster::new(vec![
        Ok(roster(&[("C1", "Alice")])),
        Ok(roster(&[("C1", "Alice"), ("C3", "Carol")])),
    ]);
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), roster_source).unwrap();
    client.load_contacts().await.unwrap();
    wait_for(&mut client, is_connected).await;

    server.push(InboundFrame::Message {
        peer_id: "C3".into(),
        payload: "hello?".into(),
        server_seq: 1,
        timestamp: Some(1_700_000_000),
    });
    server.push(InboundFrame::Presence { contact_id: "C1".into(), status: "away".into() });
    wait_for(&mut client, |u| matches!(u, ChatUpdate::PresenceChanged { .. })).await;
    assert_eq!(client.core().stats().parked, 1);
    assert!(client.core().session("C3").is_none());

    assert_eq!(client.load_contacts().await, Ok(2));
    let update = wait_for(&mut client, |u| matches!(u, ChatUpdate::MessageReceived { .. })).await;
    assert_eq!(
        update,
        ChatUpdate::MessageReceived { peer_id: "C3".into(), local_seq: 1, active: false }
    );
    assert_eq!(client.core().stats().parked, 0);
    let message = client.core().session("C3").unwrap().message(1).unwrap();
    assert_eq!(message.server_timestamp, Some(1_700_000_000));
}

#[tokio::test]
async fn test_roster_failure_keeps_previous_contacts() {
    setup_logging();
    let server = MockServer::new();
    let roster_source = MockRoster::new(vec![Ok(students()), Err(RosterFetchError::Status(503))]);
    let mut client = ChatClient::start(identity(), &test_config(), server.connector(), roster_source).unwrap();

    client.load_contacts().await.unwrap();
    let err = client.load_contacts().await.unwrap_err();
    assert_eq!(err, ChatError::RosterFetch(RosterFetchError::Status(503)));
    assert_eq!(client.core().directory().len(), 2);
    assert_eq!(
        client.core().directory().last_error(),
        Some(&RosterFetchError::Status(503))
    );
}

#[tokio::test]
async fn test_logout_fails_undelivered_messages() {
    setup_logging();
    let server = MockServer::new();
    server.refuse_connects(true);
    let mut config = test_config();
    config.reconnect.initial_delay_ms = 1_000;
    config.reconnect.max_delay_ms = 1_000;
    let mut client = ChatClient::start(identity(), &config, server.connector(), MockRoster::new(vec![Ok(students())])).unwrap();
    client.load_contacts().await.unwrap();
    client.submit("C1", "unsent").unwrap();

    client.logout().await;
    let updates = drain(&mut client).await;
    assert!(updates.contains(&ChatUpdate::DeliveryFailed {
        key: MessageKey::new("C1", 1),
        reason: ChatError::LoggedOut,
    }));
    assert!(updates.contains(&ChatUpdate::ConnectionChanged(ConnectionState::Disconnected(None))));
    assert_eq!(client.submit("C1", "too late"), Err(ChatError::LoggedOut));
    assert_eq!(client.load_contacts().await, Err(ChatError::LoggedOut));
}
