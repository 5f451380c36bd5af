use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use tether_core::FileManifest;
use tether_services::group::GroupTransferConfig;
use tether_services::peer::PeerManagerConfig;
use tether_services::progress::{GroupStatus, Recipient};

use crate::infra::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Group transfer — fan-out to several recipients
// ══════════════════════════════════════════════════════════════════════════════

fn recipients(n: usize) -> Vec<Recipient> {
    (1..=n)
        .map(|i| Recipient::new(format!("r{i}"), format!("Recipient {i}")))
        .collect()
}

async fn prepared(net: &Net, config: GroupTransferConfig, file_size: usize, n: usize) -> tether_services::GroupTransferCoordinator {
    let coordinator = net.coordinator(config);
    coordinator
        .initialize_group_transfer("xfer-1", "video.mp4", file_size as u64, recipients(n))
        .unwrap();
    assert_eq!(coordinator.connect_recipients(&direct_policy()).await.unwrap(), n);
    assert_eq!(coordinator.start_key_exchange().await.unwrap(), n);
    coordinator
}

/// Recipient 2's link drops partway through a 10 MB file. The other two
/// finish, the result is partial, and completion fires once.
#[tokio::test(start_paused = true)]
async fn dropped_recipient_is_isolated() {
    let net = Net::new(PeerManagerConfig::default());
    net.factory
        .close_after
        .lock()
        .unwrap()
        .insert("r2".into(), 4 * MB as u64);

    let payload = Bytes::from(vec![0x42u8; 10 * MB]);
    let coordinator = prepared(&net, GroupTransferConfig::default(), payload.len(), 3).await;
    let result = coordinator.send_to_all(payload.clone()).await.unwrap();

    assert_eq!(result.successful_recipients.len(), 2);
    assert_eq!(result.failed_recipients.len(), 1);
    assert_eq!(result.failed_recipients[0].id, "r2");
    assert_eq!(result.status, GroupStatus::Partial);
    assert_eq!(net.observer.completions.load(Ordering::SeqCst), 1);

    for id in ["r1", "r3"] {
        let t = net.factory.transport(id);
        // Manifest plus 160 chunks of 64 KiB.
        assert_eq!(t.frames.load(Ordering::SeqCst), 161, "{id}");
        assert!(t.sent() > 10 * MB as u64, "{id}");
    }
    assert!(net.factory.transport("r2").sent() <= 4 * MB as u64);
    assert_eq!(
        net.observer.recipient_errors.lock().unwrap().as_slice(),
        ["r2".to_string()]
    );
    assert_eq!(net.signaling.left.lock().unwrap().len(), 1);
}

/// Each recipient is capped at 5 MB/s. Parallel streams finish in roughly
/// one recipient's time, not three.
#[tokio::test(start_paused = true)]
async fn throttled_recipients_run_in_parallel() {
    let net = Net::new(PeerManagerConfig::default());
    let config = GroupTransferConfig {
        bandwidth_limit: Some(15 * MB as u64),
        ..GroupTransferConfig::default()
    };
    let payload = Bytes::from(vec![7u8; 10 * MB]);
    let coordinator = prepared(&net, config, payload.len(), 3).await;

    let started = Instant::now();
    let result = coordinator.send_to_all(payload).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, GroupStatus::Completed);
    // One second of burst, one second of refill per recipient.
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn manifest_precedes_sealed_chunks() {
    let net = Net::new(PeerManagerConfig::default());
    let config = GroupTransferConfig {
        chunk_size: 1000,
        ..GroupTransferConfig::default()
    };
    let payload = Bytes::from((0..4500u32).map(|i| i as u8).collect::<Vec<u8>>());
    let coordinator = prepared(&net, config, payload.len(), 1).await;
    coordinator.send_to_all(payload.clone()).await.unwrap();

    let t = net.factory.transport("r1");
    let first = t.first_frame.lock().unwrap().clone().unwrap();
    assert_eq!(first[0], 0xE1);
    let manifest: FileManifest = serde_json::from_slice(&first[1..]).unwrap();
    assert_eq!(manifest.chunk_count, 5);
    assert_eq!(manifest.file_size, 4500);
    assert!(manifest.verify(&payload));
    assert_eq!(t.frames.load(Ordering::SeqCst), 6);
    assert_eq!(net.observer.last_overall.load(Ordering::SeqCst), 100);
}

/// A second transfer to the same peers reuses their sessions but performs a
/// fresh handshake.
#[tokio::test(start_paused = true)]
async fn second_transfer_reuses_connections() {
    let net = Net::new(PeerManagerConfig::default());
    let coordinator = net.coordinator(GroupTransferConfig::default());

    for round in 0..2 {
        coordinator
            .initialize_group_transfer(&format!("xfer-{round}"), "notes.txt", 1024, recipients(2))
            .unwrap();
        coordinator.connect_recipients(&direct_policy()).await.unwrap();
        coordinator.start_key_exchange().await.unwrap();
        let result = coordinator.send_to_all(Bytes::from(vec![0u8; 1024])).await.unwrap();
        assert_eq!(result.status, GroupStatus::Completed);
    }

    assert_eq!(net.signaling.offers.load(Ordering::SeqCst), 2);
    assert_eq!(net.negotiator.handshakes.load(Ordering::SeqCst), 4);
    assert_eq!(net.observer.completions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn group_larger_than_capacity_is_rejected_up_front() {
    let net = Net::new(PeerManagerConfig {
        max_connections: 2,
        ..PeerManagerConfig::default()
    });
    let coordinator = net.coordinator(GroupTransferConfig::default());
    let err = coordinator
        .initialize_group_transfer("x", "f", 1, recipients(3))
        .unwrap_err();
    assert!(matches!(err, tether_services::Error::CapacityReached(2)));
    assert_eq!(net.signaling.offers.load(Ordering::SeqCst), 0);
}
