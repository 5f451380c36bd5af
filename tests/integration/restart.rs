use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;

use tether_services::peer::{PeerEvent, PeerManagerConfig};
use tether_services::restart::{RestartOutcome, RestartPhase};
use tether_services::transport::{PeerTransport, TransportState};
use tether_services::Error;

use crate::infra::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Restart — recovery of a dropped session
// ══════════════════════════════════════════════════════════════════════════════

async fn connected(net: &Net, peer: &str) {
    net.manager.connect(peer, &direct_policy()).await.unwrap();
}

/// Wait for the next recovery verdict for `peer`.
async fn verdict(events: &mut broadcast::Receiver<PeerEvent>, peer: &str) -> PeerEvent {
    loop {
        let event = events.recv().await.unwrap();
        match &event {
            PeerEvent::Recovered { peer_id, .. } | PeerEvent::Dead { peer_id } if peer_id == peer => {
                return event
            }
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_restarts_run_one_cycle() {
    let net = Net::new(PeerManagerConfig::default());
    connected(&net, "alice").await;
    let controller = net.manager.restart_controller("alice").unwrap();
    let transport = net.factory.transport("alice");

    let (a, b) = tokio::join!(
        controller.initiate_restart(transport.as_ref() as &dyn PeerTransport),
        controller.initiate_restart(transport.as_ref() as &dyn PeerTransport),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert!(outcomes.contains(&RestartOutcome::Restarted { attempt: 1 }));
    assert!(outcomes.contains(&RestartOutcome::AlreadyInProgress));
    assert_eq!(net.signaling.restart_offers.load(Ordering::SeqCst), 1);
    assert_eq!(transport.restart_offers.load(Ordering::SeqCst), 1);
}

/// A transport failure triggers recovery without any caller involvement.
#[tokio::test(start_paused = true)]
async fn failed_transport_recovers_on_second_attempt() {
    let net = Net::new(PeerManagerConfig::default());
    connected(&net, "bob").await;
    let mut events = net.manager.subscribe();
    net.signaling.drop_restarts.store(1, Ordering::SeqCst);

    let started = tokio::time::Instant::now();
    net.factory.transport("bob").set_state(TransportState::Failed);

    assert_eq!(
        verdict(&mut events, "bob").await,
        PeerEvent::Recovered {
            peer_id: "bob".into(),
            attempt: 2
        }
    );
    // 1 s then 2 s of backoff.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(net.factory.transport("bob").state(), TransportState::Connected);
    let controller = net.manager.restart_controller("bob").unwrap();
    assert_eq!(controller.state().attempt, 0);
    assert_eq!(controller.phase(), RestartPhase::Idle);
}

/// A dead peer leaves the table and can be recreated from scratch.
#[tokio::test(start_paused = true)]
async fn exhausted_peer_is_torn_down_and_reconnectable() {
    let net = Net::new(PeerManagerConfig {
        max_connections: 1,
        ..PeerManagerConfig::default()
    });
    connected(&net, "carol").await;
    let controller = net.manager.restart_controller("carol").unwrap();
    let mut events = net.manager.subscribe();
    net.signaling.drop_restarts.store(usize::MAX, Ordering::SeqCst);

    let transport = net.factory.transport("carol");
    transport.set_state(TransportState::Disconnected);
    assert_eq!(
        verdict(&mut events, "carol").await,
        PeerEvent::Dead {
            peer_id: "carol".into()
        }
    );
    assert_eq!(net.signaling.restart_offers.load(Ordering::SeqCst), 3);

    assert_eq!(controller.phase(), RestartPhase::Exhausted);
    let err = controller
        .initiate_restart(transport.as_ref() as &dyn PeerTransport)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RestartExhausted { attempts: 3, .. }));
    assert_eq!(net.signaling.restart_offers.load(Ordering::SeqCst), 3);

    assert!(!net.manager.is_connected("carol"));
    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(net.manager.available_slots(), 1);

    connected(&net, "carol").await;
    let fresh = net.manager.restart_controller("carol").unwrap();
    assert!(!std::sync::Arc::ptr_eq(&controller, &fresh));
    assert_eq!(fresh.phase(), RestartPhase::Idle);
    assert_eq!(net.factory.transport("carol").state(), TransportState::Connected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_backoff() {
    let net = Net::new(PeerManagerConfig::default());
    connected(&net, "dave").await;
    let controller = net.manager.restart_controller("dave").unwrap();
    let transport = net.factory.transport("dave");

    let restart = {
        let controller = controller.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            controller
                .initiate_restart(transport.as_ref() as &dyn PeerTransport)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    net.manager.disconnect("dave").await.unwrap();

    let err = restart.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::RestartCancelled(_)));
    assert_eq!(net.signaling.restart_offers.load(Ordering::SeqCst), 0);
    assert!(matches!(
        controller
            .initiate_restart(transport.as_ref() as &dyn PeerTransport)
            .await,
        Err(Error::RestartCancelled(_))
    ));
    assert_eq!(net.manager.available_slots(), PeerManagerConfig::default().max_connections);
}
