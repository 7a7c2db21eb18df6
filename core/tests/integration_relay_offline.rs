//! Relaying through a middle peer and store-and-forward for absent peers
//!
//! Run with: cargo test --test integration_relay_offline

mod common;

use ananta_core::offline::OfflineRecord;
use ananta_core::relay::unpack;
use ananta_core::trust::MemoryTrustDirectory;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::{pair, wait_until, Mesh};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type Inbox<T> = Arc<Mutex<Vec<T>>>;

fn collect_bundles(node: &ananta_core::Node) -> Inbox<(String, OfflineRecord)> {
    let inbox: Inbox<(String, OfflineRecord)> = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    node.offline()
        .add_bundle_listener(Arc::new(move |from: &str, records: &[OfflineRecord]| {
            let mut sink = sink.lock();
            for record in records {
                sink.push((from.to_string(), record.clone()));
            }
        }));
    inbox
}

async fn open_session(
    requester: &ananta_core::Node,
    relay: &ananta_core::Node,
    target: &str,
) -> Uuid {
    let ready = Arc::new(Mutex::new(None));
    let slot = ready.clone();
    let requested = requester
        .relay()
        .request_relay(
            relay.local_id(),
            target,
            Box::new(move |id| *slot.lock() = Some(id)),
        )
        .unwrap();
    assert!(wait_until(|| ready.lock().is_some()).await, "relay never confirmed");
    assert_eq!(*ready.lock(), Some(requested));
    requested
}

#[tokio::test]
async fn test_relay_forwards_both_directions() {
    let mut mesh = Mesh::new();
    let (alice, _) = mesh.node().await;
    let (bob, _) = mesh.node().await;
    let (carol, _) = mesh.node().await;
    pair(&alice, &bob).await;
    pair(&bob, &carol).await;

    let session = open_session(&alice, &bob, carol.local_id()).await;
    let recorded = bob.relay().session(session).unwrap();
    assert_eq!(recorded.peer_a, alice.local_id());
    assert_eq!(recorded.peer_c, carol.local_id());

    let carol_control: Inbox<(String, String)> = Arc::new(Mutex::new(Vec::new()));
    let carol_data: Inbox<Vec<u8>> = Arc::new(Mutex::new(Vec::new()));
    let alice_control: Inbox<String> = Arc::new(Mutex::new(Vec::new()));
    let sink = carol_control.clone();
    carol.relay().register_control_listener(
        session,
        Arc::new(move |from: &str, message: &str| {
            sink.lock().push((from.to_string(), message.to_string()))
        }),
    );
    let sink = carol_data.clone();
    carol.relay().register_data_listener(
        session,
        Arc::new(move |_from: &str, payload: &[u8]| sink.lock().push(payload.to_vec())),
    );
    let sink = alice_control.clone();
    alice.relay().register_control_listener(
        session,
        Arc::new(move |_from: &str, message: &str| sink.lock().push(message.to_string())),
    );

    alice
        .relay()
        .send_control(bob.local_id(), session, "offer:with:colons")
        .unwrap();
    alice
        .relay()
        .send_data(bob.local_id(), session, &[7u8; 1000])
        .unwrap();
    assert!(wait_until(|| !carol_control.lock().is_empty() && !carol_data.lock().is_empty()).await);

    let (from, message) = carol_control.lock()[0].clone();
    assert_eq!(from, bob.local_id());
    assert_eq!(message, "offer:with:colons");
    assert_eq!(carol_data.lock()[0], vec![7u8; 1000]);

    carol
        .relay()
        .send_control(bob.local_id(), session, "answer")
        .unwrap();
    assert!(wait_until(|| *alice_control.lock() == vec!["answer".to_string()]).await);

    assert!(bob.relay().session(session).is_some());
    bob.relay().close_session(session);
    assert!(bob.relay().session(session).is_none());
}

#[tokio::test]
async fn test_relay_holds_traffic_for_absent_trusted_target() {
    let mut mesh = Mesh::new();
    let trust = Arc::new(MemoryTrustDirectory::new());
    let (alice, _) = mesh.node().await;
    let (bob, _) = mesh.node_with_trust(trust.clone()).await;
    let (carol, _) = mesh.node().await;
    trust.set_level(carol.local_id(), 4);
    pair(&alice, &bob).await;

    // Carol is known to bob but not connected yet
    let session = open_session(&alice, &bob, carol.local_id()).await;
    alice
        .relay()
        .send_data(bob.local_id(), session, b"while you were away")
        .unwrap();
    assert!(
        wait_until(|| bob
            .offline()
            .store_handle()
            .count(carol.local_id())
            .unwrap()
            == 1)
        .await
    );

    let bundles = collect_bundles(&carol);
    pair(&carol, &bob).await;
    assert!(wait_until(|| bundles.lock().len() == 1).await);

    let (from, record) = bundles.lock()[0].clone();
    assert_eq!(from, bob.local_id());
    assert_eq!(record.recipient, carol.local_id());
    assert_eq!(record.sender, alice.local_id());
    let packet = BASE64.decode(&record.payload).unwrap();
    let (id, payload) = unpack(&packet).unwrap();
    assert_eq!(id, session);
    assert_eq!(payload, b"while you were away");
}

#[tokio::test]
async fn test_relay_drops_traffic_for_untrusted_absent_target() {
    let mut mesh = Mesh::new();
    let trust = Arc::new(MemoryTrustDirectory::new());
    let (alice, _) = mesh.node().await;
    let (bob, _) = mesh.node_with_trust(trust.clone()).await;
    let carol_id = ananta_core::IdentityKeys::generate().peer_id();
    // At the threshold is not enough
    trust.set_level(&carol_id, 3);
    pair(&alice, &bob).await;

    let session = open_session(&alice, &bob, &carol_id).await;
    alice
        .relay()
        .send_data(bob.local_id(), session, b"dropped")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.offline().store_handle().count(&carol_id).unwrap(), 0);
}

#[tokio::test]
async fn test_deposit_is_delivered_when_recipient_connects() {
    let mut mesh = Mesh::new();
    let (alice, _) = mesh.node().await;
    let (bob, _) = mesh.node().await;
    let (carol, _) = mesh.node().await;
    pair(&alice, &bob).await;

    alice
        .offline()
        .store_message(bob.local_id(), carol.local_id(), b"see you later")
        .unwrap();
    assert!(
        wait_until(|| bob
            .offline()
            .store_handle()
            .count(carol.local_id())
            .unwrap()
            == 1)
        .await
    );

    let bundles = collect_bundles(&carol);
    pair(&carol, &bob).await;
    assert!(wait_until(|| bundles.lock().len() == 1).await);

    let (_, record) = bundles.lock()[0].clone();
    assert_eq!(record.sender, alice.local_id());
    assert_eq!(BASE64.decode(&record.payload).unwrap(), b"see you later");
    assert!(record.verify_with(&alice.keys().public_key_bytes()));
    assert!(!record.verify_with(&carol.keys().public_key_bytes()));

    // Delivery does not purge by default
    assert_eq!(
        bob.offline().store_handle().count(carol.local_id()).unwrap(),
        1
    );
}
