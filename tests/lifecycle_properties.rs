mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u8),
    Delete(u8),
    Touch(u8),
    Expire,
    Pause(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..4, 0u8..3).prop_map(|(id, version)| Op::Put(id, version)),
        2 => (0u8..4).prop_map(Op::Delete),
        1 => (0u8..4).prop_map(Op::Touch),
        1 => Just(Op::Expire),
        2 => (0u8..4).prop_map(Op::Pause),
    ]
}

async fn run_ops(ops: Vec<Op>) {
    let mut harness = HostHarness::new();
    harness.monitor.start().unwrap();

    for op in ops {
        match op {
            Op::Put(id, version) => harness.put_host(host_id(id as u128), &format!("v{version}")),
            Op::Delete(id) => {
                let _ = harness.store.delete(&harness.path(host_id(id as u128)));
            }
            Op::Touch(id) => {
                let _ = harness.store.touch(&harness.path(host_id(id as u128)));
            }
            Op::Expire => {
                harness.store.expire_session();
                harness.store.reconnect();
            }
            Op::Pause(ms) => tokio::time::sleep(Duration::from_millis(ms as u64)).await,
        }
    }

    let events = harness.drain().await;
    let mut checker = LifecycleChecker::default();
    checker.apply_all(&events);

    let mut expected = BTreeMap::new();
    for n in 0..4u128 {
        if let Some(raw) = harness.store.get(&harness.path(host_id(n))) {
            let host: topology_monitor::Host = serde_json::from_slice(&raw).unwrap();
            expected.insert(host_id(n), host.name);
        }
    }
    assert_eq!(checker.live_names(), expected, "events: {events:?}");
    harness.monitor.stop().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn per_id_sequences_follow_lifecycle(ops in prop::collection::vec(op(), 1..40)) {
        enable_logger();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops));
    }
}
