use std::{sync::Arc, time::Duration};

use pc_client::{ChatClient, ClientConfig, EncryptionCodec, Fault, KeyStore, MemoryHub, PushRelay, UiEvent};
use pc_crypto::IdentityKeyPair;
use pc_proto::{AckKind, HandshakeStage, MessageStatus, Notification, NotificationType, Receipt};
use pc_store::{MemoryRecordStore, PrivacyFlags};

fn test_config() -> ClientConfig {
    ClientConfig { send_timeout_secs: 2, resend_after_secs: 0, ..ClientConfig::default() }
}

fn client(hub: &MemoryHub, config: ClientConfig) -> Arc<ChatClient> {
    let identity = IdentityKeyPair::generate();
    let sid = identity.session_id().unwrap().to_string();
    Arc::new(
        ChatClient::new(
            config,
            identity,
            Arc::new(MemoryRecordStore::new()),
            Arc::new(hub.push_relay(&sid)),
            Arc::new(hub.connector(&sid)),
        )
        .unwrap(),
    )
}

/// Two clients that know each other's keys.
fn pair(hub: &MemoryHub) -> (Arc<ChatClient>, Arc<ChatClient>) {
    let alice = client(hub, test_config());
    let bob = client(hub, test_config());
    alice.add_contact(bob.session_id()).unwrap();
    bob.add_contact(alice.session_id()).unwrap();
    (alice, bob)
}

async fn status_of(client: &ChatClient, id: &str) -> MessageStatus {
    client.message(id).await.unwrap().unwrap().status
}

fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn full_handshake_reaches_read_on_sender() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);

    let sent = alice.send_message(bob.session_id(), "hello bob").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    assert_eq!(alice.stage(&sent.id).await.unwrap(), Some(HandshakeStage::AwaitingDelivery));

    assert_eq!(bob.pump().await.unwrap(), 1);
    let received = bob.message(&sent.id).await.unwrap().unwrap();
    assert_eq!(received.status, MessageStatus::Delivered);
    assert_eq!(received.content, "hello bob");
    assert!(!received.is_outgoing);
    assert!(received.delivery_ack_sent);

    assert_eq!(alice.pump().await.unwrap(), 1);
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Delivered);

    let consumed = bob.mark_conversation_read(alice.session_id()).await.unwrap();
    assert_eq!(consumed, vec![sent.id.clone()]);

    alice.pump().await.unwrap();
    let final_copy = alice.message(&sent.id).await.unwrap().unwrap();
    assert_eq!(final_copy.status, MessageStatus::Read);
    assert!(final_copy.delivered_at.is_some());
    assert!(final_copy.read_at.is_some());

    let receiver_copy = bob.message(&sent.id).await.unwrap().unwrap();
    assert_eq!(receiver_copy.status, MessageStatus::Delivered);
    assert!(receiver_copy.read_at.is_some());
    assert!(receiver_copy.read_ack_sent);
    assert_eq!(alice.stage(&sent.id).await.unwrap(), Some(HandshakeStage::Read));
}

#[tokio::test]
async fn large_inbox_backlog_is_stored_before_it_is_acked() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    for i in 0..300 {
        alice.send_message(bob.session_id(), &format!("m{i}")).await.unwrap();
    }
    assert_eq!(hub.queued_for(bob.session_id()), 300);

    assert_eq!(bob.pump().await.unwrap(), 300);
    assert_eq!(bob.messages_with(alice.session_id()).await.unwrap().len(), 300);
    assert_eq!(hub.queued_for(bob.session_id()), 0);

    assert_eq!(alice.pump().await.unwrap(), 300);
    let outgoing = alice.messages_with(bob.session_id()).await.unwrap();
    assert!(outgoing.iter().all(|m| m.status == MessageStatus::Delivered));
}

#[tokio::test]
async fn http_relay_from_config_carries_outbound_messages() {
    let hub = MemoryHub::new();
    let bob = client(&hub, test_config());
    let identity = IdentityKeyPair::generate();
    let sid = identity.session_id().unwrap().to_string();
    let config = ClientConfig { push_relay_url: "http://127.0.0.1:9".into(), ..test_config() };
    let alice = ChatClient::with_http_relay(
        config,
        identity,
        Arc::new(MemoryRecordStore::new()),
        Arc::new(hub.connector(&sid)),
    )
    .unwrap();
    alice.add_contact(bob.session_id()).unwrap();

    // Nothing listens there, so the send fails instead of reaching the loopback hub.
    let sent = alice.send_message(bob.session_id(), "over http").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Error);
    assert_eq!(hub.queued_for(bob.session_id()), 0);
}

#[tokio::test]
async fn mixed_case_peer_id_addresses_the_same_conversation() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    let shouted = bob.session_id().to_ascii_uppercase();

    let sent = alice.send_message(&shouted, "case blind").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    assert_eq!(sent.recipient_id, bob.session_id());
    assert_eq!(
        alice.handshake().conversation_with(&shouted),
        alice.handshake().conversation_with(bob.session_id())
    );

    assert_eq!(bob.pump().await.unwrap(), 1);
    assert_eq!(bob.message(&sent.id).await.unwrap().unwrap().conversation_id, sent.conversation_id);
    assert_eq!(alice.messages_with(&shouted).await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_delivery_is_stored_once_and_reacked() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    hub.fault_next(NotificationType::Message, Fault::Duplicate, 1);

    let sent = alice.send_message(bob.session_id(), "twice").await.unwrap();
    assert_eq!(bob.pump().await.unwrap(), 2);

    let stored = bob.messages_with(alice.session_id()).await.unwrap();
    assert_eq!(stored.len(), 1);
    let conversation = bob.conversations().await.unwrap().remove(0);
    assert_eq!(conversation.unread_count, 1);
    assert_eq!(hub.accepted(NotificationType::DeliveryReceipt), 2);

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Delivered);
}

#[tokio::test]
async fn missing_peer_key_is_never_transmitted() {
    let hub = MemoryHub::new();
    let alice = client(&hub, test_config());
    let stranger = IdentityKeyPair::generate().session_id().unwrap().to_string();
    let mut ui = alice.subscribe_ui();

    let message = alice.send_message(&stranger, "secret").await.unwrap();
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(hub.queued_for(&stranger), 0);
    assert_eq!(hub.accepted(NotificationType::Message), 0);

    let events = drain(&mut ui);
    assert!(events.contains(&UiEvent::KeyExchangeRequested { peer_id: stranger.clone() }));
    assert_eq!(alice.messages_with(&stranger).await.unwrap().len(), 1, "kept locally");
}

#[tokio::test]
async fn relay_rejection_marks_error_and_manual_resend_recovers() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    hub.fault_next(NotificationType::Message, Fault::Reject, 1);

    let failed = alice.send_message(bob.session_id(), "retry me").await.unwrap();
    assert_eq!(failed.status, MessageStatus::Error);
    assert_eq!(bob.pump().await.unwrap(), 0);

    let retried = alice.resend(&failed.id).await.unwrap();
    assert_eq!(retried.status, MessageStatus::Sent);
    assert_eq!(bob.pump().await.unwrap(), 1);
    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &failed.id).await, MessageStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn stalled_relay_times_out_into_error() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    hub.fault_next(NotificationType::Message, Fault::Stall, 1);

    let message = alice.send_message(bob.session_id(), "slow").await.unwrap();
    assert_eq!(message.status, MessageStatus::Error);
}

#[tokio::test]
async fn corrupted_payload_is_dropped_without_touching_storage() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);

    let garbage = Notification {
        kind: NotificationType::Message,
        sender_id: alice.session_id().to_owned(),
        payload: "bm90IGEgcmVhbCBwYXlsb2Fk".into(),
        checksum: "00".repeat(32),
    };
    assert!(hub.push_relay("attacker").deliver(bob.session_id(), &garbage).await.is_accepted());
    assert_eq!(bob.pump().await.unwrap(), 1);
    assert!(bob.messages_with(alice.session_id()).await.unwrap().is_empty());
    assert_eq!(hub.accepted(NotificationType::DeliveryReceipt), 0);

    alice.send_message(bob.session_id(), "real one").await.unwrap();
    bob.pump().await.unwrap();
    assert_eq!(bob.messages_with(alice.session_id()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn decrypt_warning_only_for_active_conversation() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    let mut ui = bob.subscribe_ui();
    let garbage = Notification {
        kind: NotificationType::Message,
        sender_id: alice.session_id().to_owned(),
        payload: "AAAA".into(),
        checksum: "00".repeat(32),
    };

    hub.push_relay("attacker").deliver(bob.session_id(), &garbage).await;
    bob.pump().await.unwrap();
    assert!(!drain(&mut ui).iter().any(|e| matches!(e, UiEvent::Warning { .. })));

    bob.open_conversation(alice.session_id()).await.unwrap();
    hub.push_relay("attacker").deliver(bob.session_id(), &garbage).await;
    bob.pump().await.unwrap();
    assert!(drain(&mut ui).iter().any(|e| matches!(e, UiEvent::Warning { .. })));
}

#[tokio::test]
async fn dropped_receipt_is_recovered_on_foreground_resume() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    hub.fault_next(NotificationType::DeliveryReceipt, Fault::Drop, 1);

    let sent = alice.send_message(bob.session_id(), "are you there").await.unwrap();
    bob.pump().await.unwrap();
    assert_eq!(alice.pump().await.unwrap(), 0);
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Sent);

    alice.enter_background().await;
    alice.enter_foreground().await;

    bob.pump().await.unwrap();
    assert_eq!(bob.messages_with(alice.session_id()).await.unwrap().len(), 1);
    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Delivered);
    alice.shutdown().await;
}

#[tokio::test]
async fn late_delivery_receipt_never_downgrades_read() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    hub.fault_next(NotificationType::DeliveryReceipt, Fault::Drop, 1);

    let sent = alice.send_message(bob.session_id(), "order").await.unwrap();
    bob.pump().await.unwrap();
    bob.mark_conversation_read(alice.session_id()).await.unwrap();
    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Read);

    let codec = EncryptionCodec::new(bob.keys().clone(), &test_config());
    let receipt = Receipt::signed(
        AckKind::Delivered,
        vec![sent.id.clone()],
        bob.keys().current_session_id(),
        bob.keys().identity(),
    );
    let late = codec.encode(alice.session_id(), NotificationType::DeliveryReceipt, &receipt).await.unwrap();
    hub.push_relay(bob.session_id()).deliver(alice.session_id(), &late).await;

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Read);
}

#[tokio::test]
async fn receipt_from_a_third_party_is_ignored() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    let carol = client(&hub, test_config());
    alice.add_contact(carol.session_id()).unwrap();
    carol.add_contact(alice.session_id()).unwrap();

    let sent = alice.send_message(bob.session_id(), "for bob only").await.unwrap();

    let codec = EncryptionCodec::new(carol.keys().clone(), &test_config());
    let receipt = Receipt::signed(
        AckKind::Read,
        vec![sent.id.clone()],
        carol.keys().current_session_id(),
        carol.keys().identity(),
    );
    let forged = codec.encode(alice.session_id(), NotificationType::ReadReceipt, &receipt).await.unwrap();
    hub.push_relay(carol.session_id()).deliver(alice.session_id(), &forged).await;

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Sent);
}

#[tokio::test]
async fn disabled_read_receipts_keep_sender_at_delivered() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    bob.set_privacy(alice.session_id(), PrivacyFlags { read_receipts: false, ..PrivacyFlags::default() })
        .await
        .unwrap();

    let sent = alice.send_message(bob.session_id(), "seen?").await.unwrap();
    bob.pump().await.unwrap();
    assert_eq!(bob.mark_conversation_read(alice.session_id()).await.unwrap().len(), 1);
    assert_eq!(hub.accepted(NotificationType::ReadReceipt), 0);
    assert!(bob.message(&sent.id).await.unwrap().unwrap().read_ack_sent);

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Delivered);

    let report = bob.reconcile().await.unwrap();
    assert_eq!(report.read_acks, 0);
}

#[tokio::test]
async fn read_receipts_are_batched_per_peer() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    let first = alice.send_message(bob.session_id(), "one").await.unwrap();
    let second = alice.send_message(bob.session_id(), "two").await.unwrap();
    bob.pump().await.unwrap();

    let mut consumed = bob.mark_conversation_read(alice.session_id()).await.unwrap();
    consumed.sort();
    let mut expected = vec![first.id.clone(), second.id.clone()];
    expected.sort();
    assert_eq!(consumed, expected);
    assert_eq!(hub.accepted(NotificationType::ReadReceipt), 1);
    assert!(bob.mark_conversation_read(alice.session_id()).await.unwrap().is_empty());

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &first.id).await, MessageStatus::Read);
    assert_eq!(status_of(&alice, &second.id).await, MessageStatus::Read);
}

#[tokio::test]
async fn open_conversation_consumes_new_messages_immediately() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    bob.open_conversation(alice.session_id()).await.unwrap();

    let sent = alice.send_message(bob.session_id(), "live").await.unwrap();
    bob.pump().await.unwrap();
    assert!(bob.message(&sent.id).await.unwrap().unwrap().read_at.is_some());

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &sent.id).await, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn failed_ack_is_flushed_when_peer_writes_again() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    hub.fault_next(NotificationType::DeliveryReceipt, Fault::Reject, 1);

    let first = alice.send_message(bob.session_id(), "first").await.unwrap();
    bob.pump().await.unwrap();
    assert!(!bob.message(&first.id).await.unwrap().unwrap().delivery_ack_sent);
    assert_eq!(bob.handshake().pending().len(), 1);

    // Backed off: an immediate reconcile leaves it parked.
    let report = bob.reconcile().await.unwrap();
    assert_eq!(report.delivery_acks, 0);
    assert_eq!(report.deferred, 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    let second = alice.send_message(bob.session_id(), "second").await.unwrap();
    bob.pump().await.unwrap();
    assert!(bob.message(&first.id).await.unwrap().unwrap().delivery_ack_sent);
    assert!(bob.handshake().pending().is_empty());

    alice.pump().await.unwrap();
    assert_eq!(status_of(&alice, &first.id).await, MessageStatus::Delivered);
    assert_eq!(status_of(&alice, &second.id).await, MessageStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_reaches_peer_and_expires() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    alice.start().await;

    alice.input_changed(bob.session_id()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    bob.pump().await.unwrap();
    assert!(bob.handshake().is_peer_typing(alice.session_id()));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!bob.handshake().is_peer_typing(alice.session_id()));
    alice.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn typing_disabled_sends_nothing() {
    let hub = MemoryHub::new();
    let (alice, bob) = pair(&hub);
    alice
        .set_privacy(bob.session_id(), PrivacyFlags { typing_indicators: false, ..PrivacyFlags::default() })
        .await
        .unwrap();
    alice.start().await;

    alice.input_changed(bob.session_id()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(hub.accepted(NotificationType::TypingIndicator), 0);
    alice.shutdown().await;
}
