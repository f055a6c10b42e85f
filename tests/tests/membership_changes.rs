use chordkv_integration_tests::integration::{NetworkInvariants, TestHarness, TestScenarios};
use chordkv_node::NodeError;

#[tokio::test]
async fn test_join_preserves_data() {
    TestScenarios::join_preserves_data(40)
        .await
        .expect("Keys should survive joins");
}

#[tokio::test]
async fn test_leave_preserves_data() {
    TestScenarios::leave_preserves_data(40)
        .await
        .expect("Keys should survive graceful leaves");
}

#[tokio::test]
async fn test_churn() {
    TestScenarios::churn()
        .await
        .expect("Ring should survive mixed joins and leaves");
}

#[tokio::test]
async fn test_new_node_pulls_its_keys_on_join() {
    let harness = TestHarness::new();
    let first = harness.add_node(0).await.unwrap();
    harness.create_ring(&first).await.unwrap();
    for i in 0..30 {
        harness
            .store_data(&first, &format!("key-{}", i), b"v")
            .await
            .unwrap();
    }

    let joining = harness.add_node(128).await.unwrap();
    harness.join_node(&joining, &first).await.unwrap();

    // Before any stabilization the joiner already holds exactly (0, 128]
    let space = harness.space();
    let node = harness.get_node(&joining).await.unwrap();
    let bootstrap = harness.get_node(&first).await.unwrap();
    for key in harness.stored_data().await.keys() {
        let owned_by_joiner = space.in_half_open(&space.hash(key), &space.id(0), &space.id(128));
        assert_eq!(node.retrieve_local(key).is_some(), owned_by_joiner, "key {}", key);
        assert_eq!(bootstrap.retrieve_local(key).is_some(), !owned_by_joiner, "key {}", key);
    }
}

#[tokio::test]
async fn test_leave_twice_fails() {
    let harness = TestScenarios::basic_ring_formation(&[10, 100]).await.unwrap();
    let leaving = TestHarness::address_of(100);

    harness.leave_node(&leaving).await.unwrap();
    let node = harness.get_node(&leaving).await.unwrap();
    assert!(matches!(node.leave().await, Err(NodeError::AlreadyLeft)));
}

#[tokio::test]
async fn test_leave_down_to_single_node() {
    let harness = TestScenarios::basic_ring_formation(&[10, 100, 200]).await.unwrap();
    let survivor = TestHarness::address_of(10);
    harness.store_data(&survivor, "kept", b"yes").await.unwrap();

    harness.leave_node(&TestHarness::address_of(100)).await.unwrap();
    harness.leave_node(&TestHarness::address_of(200)).await.unwrap();
    harness.stabilize_until_consistent(10).await.unwrap();

    let node = harness.get_node(&survivor).await.unwrap();
    assert_eq!(node.successor().address, survivor);
    assert_eq!(
        harness.retrieve_data(&survivor, "kept").await.unwrap().as_deref(),
        Some(b"yes".as_slice())
    );
}

#[tokio::test]
async fn test_leave_aborts_when_successor_is_unreachable() {
    let harness = TestScenarios::basic_ring_formation(&[10, 100, 200]).await.unwrap();
    let leaving = TestHarness::address_of(100);
    harness.store_data(&leaving, "pinned", b"v").await.unwrap();

    harness.fail_node(&TestHarness::address_of(200)).await.unwrap();
    let node = harness.get_node(&leaving).await.unwrap();
    let result = node.leave().await;

    assert!(matches!(result, Err(NodeError::HandoffFailed { .. })));
    assert!(node.is_alive());
}

#[tokio::test]
async fn test_write_between_join_and_first_round_reaches_joiner() {
    let harness = TestScenarios::basic_ring_formation(&[0, 128]).await.unwrap();
    let first = TestHarness::address_of(0);

    let joining = harness.add_node(64).await.unwrap();
    harness.join_node(&joining, &first).await.unwrap();
    harness.get_node(&joining).await.unwrap().stabilize().await.unwrap();

    // Node 0 still routes (0, 64] to 128, which now turns it away
    let key = harness.key_between(0, 64, 0);
    harness.store_data(&first, &key, b"late").await.unwrap();
    let joiner = harness.get_node(&joining).await.unwrap();
    assert_eq!(joiner.retrieve_local(&key), Some(b"late".to_vec()));

    harness.stabilize_until_consistent(20).await.unwrap();
    assert_eq!(
        harness.retrieve_data(&first, &key).await.unwrap(),
        Some(b"late".to_vec())
    );
    let violations = NetworkInvariants::check_all(&harness).await;
    assert!(violations.is_empty(), "All invariants should hold: {:?}", violations);
}
