use chordkv_integration_tests::integration::{NetworkInvariants, TestHarness, TestScenarios};

#[tokio::test]
async fn test_liveness_repair() {
    TestScenarios::liveness_repair()
        .await
        .expect("Ring should route around a crashed node");
}

#[tokio::test]
async fn test_predecessor_cleared_after_crash() {
    let harness = TestScenarios::basic_ring_formation(&[10, 100, 200]).await.unwrap();
    harness.fail_node(&TestHarness::address_of(10)).await.unwrap();

    let node = harness.get_node(&TestHarness::address_of(100)).await.unwrap();
    node.check_predecessor().await;
    assert!(node.predecessor().is_none());

    harness.stabilize_until_consistent(20).await.unwrap();
    assert_eq!(
        node.predecessor().map(|p| p.address),
        Some(TestHarness::address_of(200))
    );
}

#[tokio::test]
async fn test_two_adjacent_crashes() {
    let harness = TestScenarios::basic_ring_formation(&[0, 40, 80, 120, 160, 200])
        .await
        .unwrap();
    harness.fail_node(&TestHarness::address_of(40)).await.unwrap();
    harness.fail_node(&TestHarness::address_of(80)).await.unwrap();

    harness.stabilize_until_consistent(30).await.unwrap();
    let violations = NetworkInvariants::check_all(&harness).await;
    assert!(violations.is_empty(), "All invariants should hold: {:?}", violations);
}

#[tokio::test]
async fn test_lookups_still_answer_with_latency() {
    let harness = TestScenarios::basic_ring_formation(&[0, 85, 170]).await.unwrap();
    harness.network().set_latency(5).await;

    let node = harness.get_node(&TestHarness::address_of(0)).await.unwrap();
    let found = node.find_successor(harness.space().id(100)).await;
    assert_eq!(found.address, TestHarness::address_of(170));
}

#[tokio::test]
async fn test_keys_held_back_for_unreachable_predecessor_are_recovered() {
    let harness = TestScenarios::basic_ring_formation(&[0, 128]).await.unwrap();
    let first = TestHarness::address_of(0);
    for skip in 0..5 {
        let key = harness.key_between(0, 64, skip);
        harness.store_data(&first, &key, b"v").await.unwrap();
    }

    // 128 adopts 64 as predecessor while 64 cannot take the keys
    let joining = harness.add_node(64).await.unwrap();
    harness.fail_node(&joining).await.unwrap();
    let holder = harness.get_node(&TestHarness::address_of(128)).await.unwrap();
    let candidate = harness.get_node(&joining).await.unwrap().info.clone();
    holder.notify(candidate).await;
    assert_eq!(holder.predecessor().map(|p| p.address), Some(joining.clone()));
    assert_eq!(holder.metrics().local_key_count, 5);

    harness.recover_node(&joining).await.unwrap();
    harness.join_node(&joining, &first).await.unwrap();
    harness.stabilize_until_consistent(20).await.unwrap();

    for key in harness.stored_data().await.keys() {
        assert_eq!(
            harness.retrieve_data(&first, key).await.unwrap(),
            Some(b"v".to_vec()),
            "key {}",
            key
        );
    }
    assert_eq!(holder.metrics().local_key_count, 0);
    let violations = NetworkInvariants::check_all(&harness).await;
    assert!(violations.is_empty(), "All invariants should hold: {:?}", violations);
}

#[tokio::test]
async fn test_stray_keys_are_handed_back_by_stabilization() {
    let harness = TestScenarios::basic_ring_formation(&[0, 128]).await.unwrap();
    let key = harness.key_between(0, 64, 0);

    let joining = harness.add_node(64).await.unwrap();
    harness.fail_node(&joining).await.unwrap();
    let holder = harness.get_node(&TestHarness::address_of(128)).await.unwrap();
    holder.store_local(key.clone(), b"stray".to_vec());
    holder
        .notify(harness.get_node(&joining).await.unwrap().info.clone())
        .await;
    assert_eq!(holder.retrieve_local(&key), Some(b"stray".to_vec()));

    // The next round retries the handback once 64 answers again
    harness.recover_node(&joining).await.unwrap();
    let node = harness.get_node(&joining).await.unwrap();
    let _ = holder.run_stabilization_round().await;

    assert_eq!(holder.retrieve_local(&key), None);
    assert_eq!(node.retrieve_local(&key), Some(b"stray".to_vec()));
}
