use chordkv_integration_tests::integration::{NetworkInvariants, TestHarness, TestScenarios};
use chordkv_node::{ChordNode, Config, NodeError};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_two_node_ring() {
    TestScenarios::basic_ring_formation(&[10, 200])
        .await
        .expect("Two nodes should form a ring");
}

#[tokio::test]
async fn test_five_node_ring() {
    TestScenarios::basic_ring_formation(&[3, 77, 130, 131, 250])
        .await
        .expect("Five nodes should form a ring");
}

#[tokio::test]
async fn test_joins_through_different_bootstraps() {
    let harness = TestHarness::new();
    let first = harness.add_node(100).await.unwrap();
    harness.create_ring(&first).await.unwrap();

    let mut previous = first;
    for id in [20, 180, 60, 240] {
        let address = harness.add_node(id).await.unwrap();
        harness.join_node(&address, &previous).await.unwrap();
        harness.run_stabilization_rounds(1).await;
        previous = address;
    }
    harness.stabilize_until_consistent(30).await.unwrap();

    let violations = NetworkInvariants::check_all(&harness).await;
    assert!(violations.is_empty(), "All invariants should hold: {:?}", violations);
}

#[tokio::test]
async fn test_lookup_agrees_from_every_node() {
    let harness = TestScenarios::basic_ring_formation(&[0, 40, 80, 160])
        .await
        .unwrap();

    let id = harness.space().id(100);
    let expected = harness.expected_owner(&id).await.unwrap();
    assert_eq!(expected.info.address, TestHarness::address_of(160));

    for node in harness.live_nodes().await {
        let lookup = node.lookup(id).await;
        assert_eq!(lookup.node.address, expected.info.address);
        assert!(lookup.hops <= 4, "too many hops: {}", lookup.hops);
    }
}

#[tokio::test]
async fn test_join_with_taken_identifier_is_rejected() {
    let harness = TestHarness::new();
    harness.build_ring(&[10, 90]).await.unwrap();

    // Same ring position as node 90 under a different address
    let config = Config {
        p2p_address: "sim-duplicate".to_string(),
        node_id: Some(harness.space().id(90)),
        bits: harness.space().bits(),
        rpc_timeout: Duration::from_millis(500),
        ..Config::default()
    };
    let client = Arc::new(harness.network().create_client("sim-duplicate".to_string()));
    let node = ChordNode::new(&config, client).unwrap();

    let result = node.join(Some(&TestHarness::address_of(10))).await;
    assert!(matches!(result, Err(NodeError::JoinFailure { .. })));
}

#[tokio::test]
async fn test_join_through_unreachable_bootstrap_fails() {
    let harness = TestHarness::new();
    let address = harness.add_node(5).await.unwrap();

    let node = harness.get_node(&address).await.unwrap();
    let result = node.join(Some("sim-nowhere")).await;
    assert!(matches!(result, Err(NodeError::JoinFailure { .. })));
}
