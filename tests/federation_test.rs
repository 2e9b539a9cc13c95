//! Federation integration tests
//!
//! End-to-end scenarios over the public API: a standalone root core for
//! the single-process cases, and a loopback tree (root broker, mid broker,
//! cores) for routing and disconnect propagation.

use fedhub::config::BrokerConfig;
use fedhub::core::{Core, CoreHandle, FederateInfo};
use fedhub::federate::FederateManager;
use fedhub::broker::Broker;
use fedhub::error::FederationError;
use fedhub::time::Time;
use fedhub::transport::LoopbackNetwork;

fn ns(value: i64) -> Time {
    Time::from_ns(value)
}

fn info(delta: i64, look_ahead: i64) -> FederateInfo {
    FederateInfo {
        time_delta: ns(delta),
        look_ahead: ns(look_ahead),
        ..FederateInfo::default()
    }
}

/// Standalone root core expecting `min_federates` registrants.
fn start_core(min_federates: u32) -> CoreHandle {
    let core = Core::new(BrokerConfig {
        root: true,
        min_federates,
        ..Default::default()
    });
    let handle = core.handle();
    tokio::spawn(core.run());
    handle
}

async fn bring_up_pair(handle: &CoreHandle, a: fedhub::FederateId, b: fedhub::FederateId) {
    let (ia, ib) = tokio::join!(
        handle.enter_initializing_state(a),
        handle.enter_initializing_state(b)
    );
    ia.unwrap();
    ib.unwrap();
    let (ea, eb) = tokio::join!(
        handle.enter_executing_state(a, true),
        handle.enter_executing_state(b, true)
    );
    assert!(ea.unwrap());
    assert!(eb.unwrap());
}

// =============================================================================
// Scenario 1: two-federate ping
// =============================================================================

#[tokio::test]
async fn test_two_federate_ping() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 1)).await.unwrap();
    let b = handle.register_federate("B", info(1, 1)).await.unwrap();
    let ep_a = handle.register_endpoint(a, "a", "raw").await.unwrap();
    let ep_b = handle.register_endpoint(b, "b", "raw").await.unwrap();

    bring_up_pair(&handle, a, b).await;

    // A sends at granted 0; the default stamp is granted + look-ahead.
    let stamp = handle.send(a, ep_a, "b", b"hello".to_vec()).await.unwrap();
    assert_eq!(stamp, ns(1));

    let (ta, tb) = tokio::join!(handle.time_request(a, ns(5)), handle.time_request(b, ns(5)));
    assert_eq!(ta.unwrap(), ns(5));
    assert_eq!(tb.unwrap(), ns(5));

    assert_eq!(handle.receive_count_any(b), 1);
    let (dest, msg) = handle.receive_any(b).unwrap();
    assert_eq!(dest, ep_b);
    assert_eq!(msg.data, b"hello");
    assert_eq!(msg.time, ns(1));
    assert_eq!(msg.source, "a");
    assert!(handle.receive_any(b).is_none());
    assert_eq!(handle.receive_count_any(a), 0);
}

// =============================================================================
// Scenario 2: look-ahead violation
// =============================================================================

#[tokio::test]
async fn test_look_ahead_violation() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 2)).await.unwrap();
    let b = handle.register_federate("B", info(1, 2)).await.unwrap();
    let ep_a = handle.register_endpoint(a, "a", "raw").await.unwrap();
    let _ep_b = handle.register_endpoint(b, "b", "raw").await.unwrap();

    bring_up_pair(&handle, a, b).await;

    // Advance A to granted time 3.
    let (ta, tb) = tokio::join!(handle.time_request(a, ns(3)), handle.time_request(b, ns(3)));
    assert_eq!(ta.unwrap(), ns(3));
    assert_eq!(tb.unwrap(), ns(3));

    // An explicit stamp of 4 is inside the look-ahead window (3 + 2 = 5).
    let err = handle
        .send_event(a, ep_a, "b", ns(4), b"late".to_vec())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FederationError::LookAheadViolation {
            requested: ns(4),
            earliest: ns(5),
        }
    );

    // Nothing was transmitted.
    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.messages_routed, 0);

    // The boundary stamp is accepted.
    handle.send_event(a, ep_a, "b", ns(5), b"ok".to_vec()).await.unwrap();
}

// =============================================================================
// Scenario 3: pub/sub propagation
// =============================================================================

#[tokio::test]
async fn test_pub_sub_propagation() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 0)).await.unwrap();
    let b = handle.register_federate("B", info(1, 0)).await.unwrap();

    let p1 = handle.register_publication(a, "p1", "double", "m").await.unwrap();
    let sub = handle.register_subscription(b, "p1", "double", "m", false).await.unwrap();
    assert_eq!(handle.get_publication("p1"), Some(p1));
    assert_eq!(handle.get_subscription(b, "p1"), Some(sub));
    assert_eq!(handle.get_units(p1).as_deref(), Some("m"));
    assert_eq!(handle.get_type(p1).as_deref(), Some("double"));

    bring_up_pair(&handle, a, b).await;

    let value = 3.14f64.to_le_bytes().to_vec();
    handle.set_value(a, p1, value.clone()).await.unwrap();

    let (ta, tb) = tokio::join!(handle.time_request(a, ns(1)), handle.time_request(b, ns(1)));
    ta.unwrap();
    tb.unwrap();

    let updates = handle.get_value_updates(b);
    assert_eq!(updates, vec![sub]);
    assert_eq!(handle.get_value(sub), Some(value.clone()));
    assert_eq!(handle.get_value(p1), Some(value));

    // The updates list is drained by the read.
    assert!(handle.get_value_updates(b).is_empty());

    // No synthesized message without an endpoint link.
    assert_eq!(handle.receive_count_any(b), 0);
}

/// A subscription linked to an endpoint synthesizes a message on the
/// endpoint queue, with the publication name as its (original) source.
#[tokio::test]
async fn test_subscription_linked_to_endpoint() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 0)).await.unwrap();
    let b = handle.register_federate("B", info(1, 0)).await.unwrap();

    let p1 = handle.register_publication(a, "p1", "double", "m").await.unwrap();

    let manager = FederateManager::new(handle.clone(), b);
    let ep = manager.register_endpoint("b-in", "double").await.unwrap();
    manager.subscribe(ep, "p1", "double").await.unwrap();

    let (ia, ib) = tokio::join!(handle.enter_initializing_state(a), manager.enter_initializing());
    ia.unwrap();
    ib.unwrap();
    let (ea, eb) = tokio::join!(handle.enter_executing_state(a, true), manager.enter_executing(true));
    assert!(ea.unwrap());
    assert!(eb.unwrap());

    handle.set_value(a, p1, b"3.14".to_vec()).await.unwrap();

    let (ta, tb) = tokio::join!(handle.time_request(a, ns(1)), manager.request_time(ns(1)));
    ta.unwrap();
    assert_eq!(tb.unwrap(), ns(1));

    assert!(manager.has_message_at(ep));
    let msg = manager.get_message(ep).unwrap();
    assert_eq!(msg.source, "p1");
    assert_eq!(msg.original_source, "p1");
    assert_eq!(msg.dest, "b-in");
    assert_eq!(msg.data, b"3.14");
    assert_eq!(msg.time, ns(1));
}

// =============================================================================
// Scenario 4: name collision
// =============================================================================

#[tokio::test]
async fn test_publication_name_collision() {
    let handle = start_core(2);
    let a = handle.register_federate("A", FederateInfo::default()).await.unwrap();
    let b = handle.register_federate("B", FederateInfo::default()).await.unwrap();

    handle.register_publication(a, "x", "double", "").await.unwrap();
    let err = handle.register_publication(b, "x", "double", "").await.unwrap_err();
    assert_eq!(err, FederationError::NameInUse("x".to_string()));

    // Federate names collide too.
    let err = handle.register_federate("A", FederateInfo::default()).await.unwrap_err();
    assert_eq!(err, FederationError::NameInUse("A".to_string()));
}

// =============================================================================
// Scenario 5: iterative convergence
// =============================================================================

#[tokio::test]
async fn test_iterative_convergence() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 0)).await.unwrap();
    let b = handle.register_federate("B", info(1, 0)).await.unwrap();

    bring_up_pair(&handle, a, b).await;

    let (ra, rb) = tokio::join!(
        handle.request_time_iterative(a, ns(2), false),
        handle.request_time_iterative(b, ns(2), false)
    );
    assert_eq!(ra.unwrap(), (ns(2), false));
    assert_eq!(rb.unwrap(), (ns(2), false));
    assert_eq!(handle.get_current_iteration(a).await.unwrap(), 1);

    let (ra, rb) = tokio::join!(
        handle.request_time_iterative(a, ns(2), true),
        handle.request_time_iterative(b, ns(2), true)
    );
    assert_eq!(ra.unwrap(), (ns(2), true));
    assert_eq!(rb.unwrap(), (ns(2), true));
    assert_eq!(handle.get_current_iteration(a).await.unwrap(), 1);
    assert_eq!(handle.get_current_iteration(b).await.unwrap(), 1);
}

// =============================================================================
// Scenario 6: disconnect propagation through a three-level tree
// =============================================================================

#[tokio::test]
async fn test_disconnect_propagation() {
    let network = LoopbackNetwork::new();

    let mut root = Broker::new(BrokerConfig {
        name: Some("root".into()),
        root: true,
        ..Default::default()
    });
    root.set_transport(Box::new(network.attach("root", root.action_sender())));
    let root_handle = root.handle();

    let mut mid = Broker::new(BrokerConfig {
        name: Some("mid".into()),
        broker_address: Some("root".into()),
        ..Default::default()
    });
    mid.set_transport(Box::new(network.attach("mid", mid.action_sender())));
    let mid_handle = mid.handle();

    let mut core = Core::new(BrokerConfig {
        name: Some("core1".into()),
        broker_address: Some("mid".into()),
        ..Default::default()
    });
    core.set_transport(Box::new(network.attach("core1", core.action_sender())));
    let handle = core.handle();

    tokio::spawn(root.run());
    tokio::spawn(mid.run());
    tokio::spawn(core.run());

    let fed = handle.register_federate("F", FederateInfo::default()).await.unwrap();
    handle.enter_initializing_state(fed).await.unwrap();
    assert!(handle.enter_executing_state(fed, true).await.unwrap());

    handle.finalize(fed).await.unwrap();
    // A second finalize is a no-op.
    handle.finalize(fed).await.unwrap();

    // The disconnect climbs the tree: each level's finalized count reaches
    // its child count exactly once.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let root_metrics = root_handle.metrics().await.unwrap();
        let mid_metrics = mid_handle.metrics().await.unwrap();
        if root_metrics.children_finalized == 1 && mid_metrics.children_finalized == 1 {
            assert_eq!(root_metrics.brokers, 1);
            assert_eq!(mid_metrics.brokers, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "disconnect did not propagate");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let core_metrics = handle.metrics().await.unwrap();
    assert_eq!(core_metrics.federates, 1);
    assert_eq!(core_metrics.finalized, 1);
}

// =============================================================================
// Two cores exchanging messages through a root broker
// =============================================================================

#[tokio::test]
async fn test_cross_core_message() {
    let network = LoopbackNetwork::new();

    let mut root = Broker::new(BrokerConfig {
        name: Some("root".into()),
        root: true,
        min_brokers: 2,
        ..Default::default()
    });
    root.set_transport(Box::new(network.attach("root", root.action_sender())));

    let mut core_a = Core::new(BrokerConfig {
        name: Some("core-a".into()),
        broker_address: Some("root".into()),
        ..Default::default()
    });
    core_a.set_transport(Box::new(network.attach("core-a", core_a.action_sender())));
    let ha = core_a.handle();

    let mut core_b = Core::new(BrokerConfig {
        name: Some("core-b".into()),
        broker_address: Some("root".into()),
        ..Default::default()
    });
    core_b.set_transport(Box::new(network.attach("core-b", core_b.action_sender())));
    let hb = core_b.handle();

    tokio::spawn(root.run());
    tokio::spawn(core_a.run());
    tokio::spawn(core_b.run());

    let a = ha.register_federate("A", info(1, 1)).await.unwrap();
    let b = hb.register_federate("B", info(1, 1)).await.unwrap();
    let ep_a = ha.register_endpoint(a, "a", "raw").await.unwrap();
    let ep_b = hb.register_endpoint(b, "b", "raw").await.unwrap();

    let (ia, ib) = tokio::join!(ha.enter_initializing_state(a), hb.enter_initializing_state(b));
    ia.unwrap();
    ib.unwrap();
    let (ea, eb) = tokio::join!(ha.enter_executing_state(a, true), hb.enter_executing_state(b, true));
    assert!(ea.unwrap());
    assert!(eb.unwrap());

    let stamp = ha.send(a, ep_a, "b", b"ping".to_vec()).await.unwrap();
    assert_eq!(stamp, ns(1));

    let (ta, tb) = tokio::join!(ha.time_request(a, ns(5)), hb.time_request(b, ns(5)));
    assert_eq!(ta.unwrap(), ns(5));
    assert_eq!(tb.unwrap(), ns(5));

    let (dest, msg) = hb.receive_any(b).unwrap();
    assert_eq!(dest, ep_b);
    assert_eq!(msg.data, b"ping");
    assert_eq!(msg.time, ns(1));
}

// =============================================================================
// Universal invariants
// =============================================================================

#[tokio::test]
async fn test_granted_time_monotone() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 0)).await.unwrap();
    let b = handle.register_federate("B", info(1, 0)).await.unwrap();

    bring_up_pair(&handle, a, b).await;

    let mut last = Time::ZERO;
    for target in [1i64, 3, 3, 7, 20] {
        let (ta, tb) = tokio::join!(
            handle.time_request(a, ns(target)),
            handle.time_request(b, ns(target))
        );
        let granted = ta.unwrap();
        tb.unwrap();
        assert!(granted >= last, "granted time regressed: {granted} < {last}");
        last = granted;
    }
}

#[tokio::test]
async fn test_per_pair_fifo_order() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 1)).await.unwrap();
    let b = handle.register_federate("B", info(1, 1)).await.unwrap();
    let ep_a = handle.register_endpoint(a, "a", "raw").await.unwrap();
    let _ep_b = handle.register_endpoint(b, "b", "raw").await.unwrap();

    bring_up_pair(&handle, a, b).await;

    for i in 0..5u8 {
        handle.send(a, ep_a, "b", vec![i]).await.unwrap();
    }
    let (ta, tb) = tokio::join!(handle.time_request(a, ns(5)), handle.time_request(b, ns(5)));
    ta.unwrap();
    tb.unwrap();

    let mut received = Vec::new();
    while let Some((_, msg)) = handle.receive_any(b) {
        assert!(msg.time <= ns(5));
        received.push(msg.data[0]);
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_endpoint_round_trip() {
    let handle = start_core(1);
    let a = handle.register_federate("A", FederateInfo::default()).await.unwrap();
    let ep = handle.register_endpoint(a, "telemetry", "raw").await.unwrap();

    assert_eq!(handle.get_endpoint_id("telemetry"), Some(ep));
    assert_eq!(handle.get_endpoint_name(ep).as_deref(), Some("telemetry"));
    assert_eq!(handle.get_federate_name(a).as_deref(), Some("A"));
    assert_eq!(handle.get_federate_id("A"), Some(a));
}

#[tokio::test]
async fn test_registry_freeze_after_executing() {
    let handle = start_core(1);
    let a = handle.register_federate("A", FederateInfo::default()).await.unwrap();
    handle.register_endpoint(a, "early", "raw").await.unwrap();

    handle.enter_initializing_state(a).await.unwrap();
    assert!(handle.enter_executing_state(a, true).await.unwrap());

    let err = handle.register_endpoint(a, "late", "raw").await.unwrap_err();
    assert_eq!(err, FederationError::Frozen);
    let err = handle
        .register_federate("B", FederateInfo::default())
        .await
        .unwrap_err();
    assert_eq!(err, FederationError::Frozen);
}

#[tokio::test]
async fn test_finalize_idempotent_and_releases_requests() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 0)).await.unwrap();
    let b = handle.register_federate("B", info(1, 0)).await.unwrap();

    bring_up_pair(&handle, a, b).await;

    // B requests far ahead and stays blocked because A never requests;
    // finalizing B releases the request at its current granted time.
    let blocked = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.time_request(b, ns(100)).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.finalize(b).await.unwrap();
    let granted = blocked.await.unwrap().unwrap();
    assert_eq!(granted, Time::ZERO);

    handle.finalize(b).await.unwrap();
    handle.finalize(a).await.unwrap();
    let metrics = handle.metrics().await.unwrap();
    assert_eq!(metrics.finalized, 2);
}

#[tokio::test]
async fn test_impact_window_defers_inbound() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 1)).await.unwrap();
    let b = handle
        .register_federate(
            "B",
            FederateInfo {
                time_delta: ns(1),
                look_ahead: ns(1),
                impact_window: ns(10),
                ..FederateInfo::default()
            },
        )
        .await
        .unwrap();
    let ep_a = handle.register_endpoint(a, "a", "raw").await.unwrap();
    let _ep_b = handle.register_endpoint(b, "b", "raw").await.unwrap();

    bring_up_pair(&handle, a, b).await;

    handle.send(a, ep_a, "b", b"slow".to_vec()).await.unwrap();

    // Message stamped 1; with an impact window of 10 it becomes eligible
    // only once B's granted time reaches 11.
    let (ta, tb) = tokio::join!(handle.time_request(a, ns(5)), handle.time_request(b, ns(5)));
    ta.unwrap();
    tb.unwrap();
    assert_eq!(handle.receive_count_any(b), 0);

    let (ta, tb) = tokio::join!(handle.time_request(a, ns(11)), handle.time_request(b, ns(11)));
    ta.unwrap();
    tb.unwrap();
    assert_eq!(handle.receive_count_any(b), 1);
}

#[tokio::test]
async fn test_dependency_restricted_grant() {
    let handle = start_core(3);
    let a = handle.register_federate("A", info(1, 2)).await.unwrap();
    let b = handle.register_federate("B", info(1, 2)).await.unwrap();
    let c = handle.register_federate("C", info(1, 2)).await.unwrap();

    // C only waits on A; B's clock does not gate it.
    handle.add_dependency(c, "A").await.unwrap();

    let (ia, ib, ic) = tokio::join!(
        handle.enter_initializing_state(a),
        handle.enter_initializing_state(b),
        handle.enter_initializing_state(c)
    );
    ia.unwrap();
    ib.unwrap();
    ic.unwrap();
    let (ea, eb, ec) = tokio::join!(
        handle.enter_executing_state(a, true),
        handle.enter_executing_state(b, true),
        handle.enter_executing_state(c, true)
    );
    assert!(ea.unwrap());
    assert!(eb.unwrap());
    assert!(ec.unwrap());

    // A blocks at 10; with look-ahead 2 its output bound is 12, so C's
    // request for 5 resolves even though B never requests.
    let a_task = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.time_request(a, ns(10)).await })
    };
    let granted = handle.time_request(c, ns(5)).await.unwrap();
    assert_eq!(granted, ns(5));

    // Release A by finalizing everyone.
    handle.finalize(b).await.unwrap();
    handle.finalize(c).await.unwrap();
    handle.finalize(a).await.unwrap();
    a_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_filter_capture_and_rewrite() {
    let handle = start_core(2);
    let a = handle.register_federate("A", info(1, 1)).await.unwrap();
    let b = handle.register_federate("B", info(1, 1)).await.unwrap();
    let ep_a = handle.register_endpoint(a, "a", "raw").await.unwrap();
    let _ep_b = handle.register_endpoint(b, "b", "raw").await.unwrap();

    // A destination filter owned by B, targeting endpoint b, with a delay
    // operator: messages arrive re-stamped but keep their original source.
    let filter = handle
        .register_destination_filter(b, "delay-b", "b", "raw")
        .await
        .unwrap();
    handle
        .set_filter_operator(filter, fedhub::federate::delay_operator(ns(3)))
        .await
        .unwrap();

    bring_up_pair(&handle, a, b).await;

    handle.send(a, ep_a, "b", b"slow".to_vec()).await.unwrap();
    let (ta, tb) = tokio::join!(handle.time_request(a, ns(10)), handle.time_request(b, ns(10)));
    ta.unwrap();
    tb.unwrap();

    let (_, msg) = handle.receive_any(b).unwrap();
    assert_eq!(msg.time, ns(4)); // stamped 1, delayed by 3
    assert_eq!(msg.original_source, "a");
}
