//! Session lifecycle: acceptance, termination, content changes and errors.

mod common;

use common::{
    exchange, jid, test_config, wait_ended, DuplexFactory, Peer, PeerOptions, DUPLEX_NS,
};
use jingle_session::security::psk::{PreSharedKeyMethod, NS_PSK};
use jingle_session::{
    Cipher, ContentOutcome, EncryptionMethods, JetSecurityFactory, JingleError, JingleEvent,
    LoopbackNetwork, SessionConfig, SessionState, Signaling, SignalingError,
};
use jingle_wire::{
    Action, JingleCondition, JingleRequest, Reason, Response, SessionId, NS_JINGLE_JET,
};
use std::sync::Arc;
use std::time::Duration;

const ALICE: &str = "alice@example.org/laptop";
const BOB: &str = "bob@example.org/phone";

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let network = LoopbackNetwork::new();
    let mut alice = Peer::spawn(&network, ALICE, PeerOptions::default()).await;
    let mut bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await
        .unwrap();
    let incoming = bob.incoming().await;

    session.terminate(Reason::Cancel).await;
    session.terminate(Reason::Success).await;
    assert_eq!(session.state(), SessionState::Ended);
    assert_eq!(session.end_reason(), Some(Reason::Cancel));
    assert_eq!(wait_ended(&incoming).await, Some(Reason::Cancel));

    let mut ended = 0;
    while let Ok(event) = alice.events.try_recv() {
        if matches!(event, JingleEvent::SessionEnded { .. }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);
    assert!(alice.manager.sessions().is_empty());
    assert!(bob.manager.sessions().is_empty());
    assert!(matches!(incoming.accept().await, Err(JingleError::SessionEnded)));
}

#[tokio::test]
async fn test_unsupported_application_declines_session() {
    let network = LoopbackNetwork::new();
    let mut alice = Peer::spawn(&network, ALICE, PeerOptions::default()).await;
    let bob = Peer::spawn(
        &network,
        BOB,
        PeerOptions {
            application: false,
            ..Default::default()
        },
    )
    .await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await
        .unwrap();
    assert_eq!(
        wait_ended(&session).await,
        Some(Reason::UnsupportedApplications)
    );
    match alice.next_outcome().await {
        ContentOutcome::Failed { reason, .. } => assert_eq!(reason, Reason::UnsupportedApplications),
        ContentOutcome::Ready { .. } => panic!("declined content must not connect"),
    }
    assert!(bob.manager.sessions().is_empty());
}

#[tokio::test]
async fn test_unsupported_transport_declines_session() {
    let network = LoopbackNetwork::new();
    let (duplex, _) = DuplexFactory::pair();
    let mut alice = Peer::spawn(
        &network,
        ALICE,
        PeerOptions {
            fallback: Some(duplex),
            ..Default::default()
        },
    )
    .await;
    let bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file").with_transport(DUPLEX_NS)])
        .await
        .unwrap();
    assert_eq!(
        wait_ended(&session).await,
        Some(Reason::UnsupportedTransports)
    );
    match alice.next_outcome().await {
        ContentOutcome::Failed { reason, .. } => assert_eq!(reason, Reason::UnsupportedTransports),
        ContentOutcome::Ready { .. } => panic!("declined content must not connect"),
    }
    assert!(bob.manager.sessions().is_empty());
}

#[tokio::test]
async fn test_unusable_security_offer_declines_session() {
    let network = LoopbackNetwork::new();
    let psk = PreSharedKeyMethod::new(jid(ALICE), [7u8; 32]);
    let alice_jet = JetSecurityFactory::new(
        EncryptionMethods::new().with(Arc::new(psk)),
        NS_PSK,
        Cipher::Aes256Gcm,
        Duration::from_secs(2),
    );
    // Bob speaks the overlay but knows no way to unwrap the key
    let bob_jet = JetSecurityFactory::new(
        EncryptionMethods::new(),
        NS_PSK,
        Cipher::Aes256Gcm,
        Duration::from_secs(2),
    );
    let mut alice = Peer::spawn(
        &network,
        ALICE,
        PeerOptions {
            security: Some(Arc::new(alice_jet)),
            ..Default::default()
        },
    )
    .await;
    let bob = Peer::spawn(
        &network,
        BOB,
        PeerOptions {
            security: Some(Arc::new(bob_jet)),
            ..Default::default()
        },
    )
    .await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file").with_security(NS_JINGLE_JET)])
        .await
        .unwrap();
    assert_eq!(wait_ended(&session).await, Some(Reason::SecurityError));
    match alice.next_outcome().await {
        ContentOutcome::Failed { reason, .. } => assert_eq!(reason, Reason::SecurityError),
        ContentOutcome::Ready { .. } => panic!("declined content must not connect"),
    }
    assert!(bob.manager.sessions().is_empty());
}

#[tokio::test]
async fn test_unknown_session_is_reported() {
    let network = LoopbackNetwork::new();
    let bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;
    let mallory = network.endpoint(jid("mallory@example.org/x"));

    let request = JingleRequest::new(Action::SessionTerminate, SessionId::new("no-such-session"))
        .with_reason(Reason::Success.into());
    match mallory.send_request(&bob.jid, request).await.unwrap() {
        Response::Error(error) => assert_eq!(error.jingle, Some(JingleCondition::UnknownSession)),
        Response::Ack => panic!("terminate for an unknown session must fail"),
    }
}

#[tokio::test]
async fn test_crossed_initiate_is_a_tie_break() {
    let network = LoopbackNetwork::new();
    let alice = Peer::spawn(&network, ALICE, PeerOptions::default()).await;
    let mut bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await
        .unwrap();
    let incoming = bob.incoming().await;

    // Bob re-initiates the same session id towards Alice
    let raw_bob = network.endpoint(bob.jid.clone());
    let mut request = JingleRequest::new(Action::SessionInitiate, session.sid().clone());
    request.initiator = Some(bob.jid.clone());
    request.contents = vec![{
        let mut content = jingle_wire::ContentElement::new(jingle_wire::Role::Initiator, "file")
            .with_transport(jingle_wire::TransportElement::opaque(
                jingle_wire::NS_JINGLE_S5B,
                ciborium::Value::Null,
            ));
        content.description = Some(jingle_wire::DescriptionElement {
            namespace: common::APP_NS.into(),
            payload: ciborium::Value::Null,
        });
        content
    }];
    match raw_bob.send_request(&alice.jid, request).await.unwrap() {
        Response::Error(error) => assert_eq!(error.jingle, Some(JingleCondition::TieBreak)),
        Response::Ack => panic!("crossed initiate must be rejected"),
    }
    assert_eq!(session.state(), SessionState::Pending);
    assert_eq!(incoming.state(), SessionState::Unacknowledged);
}

#[tokio::test]
async fn test_initiate_times_out_when_peer_is_silent() {
    let network = LoopbackNetwork::new();
    let config = SessionConfig {
        response_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let alice = Peer::spawn(
        &network,
        ALICE,
        PeerOptions {
            config,
            ..Default::default()
        },
    )
    .await;
    let bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;
    network.disconnect(&bob.jid);

    let result = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await;
    assert!(matches!(
        result,
        Err(JingleError::Signaling(SignalingError::Timeout))
    ));
    assert!(alice.manager.sessions().is_empty());
}

#[tokio::test]
async fn test_added_content_negotiates_and_last_removal_ends_session() {
    let network = LoopbackNetwork::new();
    let mut alice = Peer::spawn(&network, ALICE, PeerOptions::default()).await;
    let mut bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await
        .unwrap();
    let incoming = bob.incoming().await;
    incoming.accept().await.unwrap();
    let first = alice.ready().await;
    let second = bob.ready().await;
    exchange(first, second).await;

    session.add_content(alice.spec("notes")).await.unwrap();
    let added = loop {
        if let JingleEvent::ContentAdded { content, .. } = bob.next_event().await {
            break content;
        }
    };
    assert_eq!(added, "notes");
    incoming.accept_content("notes").await.unwrap();
    let first = alice.ready().await;
    let second = bob.ready().await;
    exchange(first, second).await;

    session.remove_content("file", Reason::Cancel).await.unwrap();
    match bob.next_outcome().await {
        ContentOutcome::Failed { content, reason, .. } => {
            assert_eq!(content, "file");
            assert_eq!(reason, Reason::Cancel);
        }
        ContentOutcome::Ready { .. } => panic!("removed content reported ready"),
    }
    assert_eq!(session.state(), SessionState::Active);

    session.remove_content("notes", Reason::Success).await.unwrap();
    assert_eq!(wait_ended(&session).await, Some(Reason::Success));
    assert_eq!(wait_ended(&incoming).await, Some(Reason::Success));
}

#[tokio::test]
async fn test_rejected_content_is_dropped() {
    let network = LoopbackNetwork::new();
    let mut alice = Peer::spawn(&network, ALICE, PeerOptions::default()).await;
    let mut bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await
        .unwrap();
    let incoming = bob.incoming().await;
    incoming.accept().await.unwrap();
    alice.ready().await;
    bob.ready().await;

    session.add_content(alice.spec("extra")).await.unwrap();
    loop {
        if let JingleEvent::ContentAdded { .. } = bob.next_event().await {
            break;
        }
    }
    incoming.reject_content("extra").await.unwrap();

    match alice.next_outcome().await {
        ContentOutcome::Failed { content, reason, .. } => {
            assert_eq!(content, "extra");
            assert_eq!(reason, Reason::Decline);
        }
        ContentOutcome::Ready { .. } => panic!("rejected content reported ready"),
    }
    assert_eq!(session.content_state("extra").await, None);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_unanswered_pings_end_session() {
    let network = LoopbackNetwork::new();
    let config = SessionConfig {
        response_timeout: Duration::from_millis(200),
        ping_interval: Some(Duration::from_millis(100)),
        max_missed_pings: 2,
        ..test_config()
    };
    let mut alice = Peer::spawn(
        &network,
        ALICE,
        PeerOptions {
            config,
            ..Default::default()
        },
    )
    .await;
    let mut bob = Peer::spawn(&network, BOB, PeerOptions::default()).await;

    let session = alice
        .manager
        .initiate(bob.jid.clone(), vec![alice.spec("file")])
        .await
        .unwrap();
    bob.incoming().await.accept().await.unwrap();
    alice.ready().await;
    bob.ready().await;
    assert!(session.ping().await.is_ok());

    network.disconnect(&bob.jid);
    assert_eq!(wait_ended(&session).await, Some(Reason::ConnectivityError));
}
