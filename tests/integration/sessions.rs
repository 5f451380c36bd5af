use std::sync::atomic::Ordering;
use std::time::Duration;

use tether_core::{policy, NatClass, ServerDescriptor};
use tether_services::peer::{PeerEvent, PeerManagerConfig, QualityClass};
use tether_services::transport::{PeerTransport, SessionDescription, TransportState};
use tether_services::{Error, ErrorClass};

use crate::infra::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Peer sessions — admission, negotiation, teardown
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn capacity_is_enforced_and_released() {
    let net = Net::new(PeerManagerConfig {
        max_connections: 2,
        ..PeerManagerConfig::default()
    });
    let policy = direct_policy();

    net.manager.connect("a", &policy).await.unwrap();
    net.manager.connect("b", &policy).await.unwrap();
    let err = net.manager.connect("c", &policy).await.err().unwrap();
    assert!(matches!(err, Error::CapacityReached(2)));
    assert_eq!(err.class(), ErrorClass::Configuration);

    net.manager.disconnect("a").await.unwrap();
    assert_eq!(net.factory.transport("a").state(), TransportState::Closed);
    net.manager.connect("c", &policy).await.unwrap();
    assert_eq!(net.manager.records().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_signaling_times_out_and_frees_the_slot() {
    let net = Net::new(PeerManagerConfig {
        max_connections: 1,
        connect_timeout: Duration::from_secs(2),
        ..PeerManagerConfig::default()
    });
    *net.signaling.round_trip.lock().unwrap() = Duration::from_secs(10);

    let err = net.manager.connect("slow", &direct_policy()).await.err().unwrap();
    assert!(matches!(err, Error::Timeout(d, _) if d == Duration::from_secs(2)));
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(net.factory.transport("slow").state(), TransportState::Closed);
    assert!(!net.manager.is_connected("slow"));
    assert_eq!(net.manager.available_slots(), 1);
}

#[tokio::test(start_paused = true)]
async fn answering_side_registers_the_peer() {
    let net = Net::new(PeerManagerConfig::default());
    let mut events = net.manager.subscribe();

    let answer = net
        .manager
        .accept("erin", SessionDescription::offer("v=0 o=erin"), &direct_policy())
        .await
        .unwrap();
    assert_eq!(answer, SessionDescription::answer("v=0 a=erin"));
    assert!(net.manager.is_connected("erin"));
    assert_eq!(
        events.recv().await.unwrap(),
        PeerEvent::Connected {
            peer_id: "erin".into()
        }
    );

    let err = net
        .manager
        .accept("erin", SessionDescription::offer("v=0"), &direct_policy())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyConnected(_)));
}

#[tokio::test(start_paused = true)]
async fn stats_refresh_classifies_quality() {
    let net = Net::new(PeerManagerConfig::default());
    net.manager.connect("frank", &direct_policy()).await.unwrap();
    net.manager
        .transport("frank")
        .unwrap()
        .send(bytes::Bytes::from_static(b"hello"))
        .await
        .unwrap();

    let record = net.manager.refresh_stats("frank").await.unwrap();
    assert_eq!(record.quality, QualityClass::Excellent);
    assert_eq!(record.stats.bytes_sent, 5);
    assert_eq!(record.stats.round_trip_time, Some(Duration::from_millis(40)));

    net.factory.transport("frank").set_state(TransportState::Closed);
    let record = net.manager.refresh_stats("frank").await.unwrap();
    assert_eq!(record.quality, QualityClass::Disconnected);
}

/// Behind a symmetric NAT only relay candidates from the remote side are
/// applied; host and reflexive ones are dropped.
#[tokio::test(start_paused = true)]
async fn relay_only_policy_filters_remote_candidates() {
    let net = Net::new(PeerManagerConfig::default());
    let relay = ServerDescriptor::with_credentials(
        vec!["turn:relay.example.net:3478".into()],
        "u",
        "p",
    );
    let policy = policy::build(NatClass::Symmetric, &[], &[relay]);
    net.manager.connect("gina", &policy).await.unwrap();

    let host = "candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host";
    let srflx = "candidate:2 1 udp 1694498815 203.0.113.9 41000 typ srflx raddr 192.168.1.20 rport 50000";
    let relayed = "candidate:3 1 udp 16777215 198.51.100.4 62000 typ relay raddr 203.0.113.9 rport 41000";

    assert!(!net.manager.add_remote_candidate("gina", host).await.unwrap());
    assert!(!net.manager.add_remote_candidate("gina", srflx).await.unwrap());
    assert!(net.manager.add_remote_candidate("gina", relayed).await.unwrap());
    assert_eq!(net.signaling.offers.load(Ordering::SeqCst), 1);

    let err = net.manager.add_remote_candidate("nobody", relayed).await.unwrap_err();
    assert!(matches!(err, Error::UnknownPeer(_)));
}
