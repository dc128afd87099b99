//! At most one place holds a resource, whatever the exporter does.

mod common;

use std::collections::BTreeMap;

use common::{coordinator, eventually, FakeExporter};
use labhub_coordinator::Coordinator;
use proptest::prelude::*;

const PLACES: [(&str, &str); 3] = [
    ("board", "lab/bench/*"),
    ("console-only", "lab/bench/RawSerialPort/console"),
    ("power-only", "lab/bench/PowerPort/power"),
];

const RESOURCES: [(&str, &str); 2] = [("console", "RawSerialPort"), ("power", "PowerPort")];

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
    /// The exporter forgets it holds a resource.
    RepublishFree(usize),
    /// The exporter drops its stream and comes back with everything free.
    Restart,
    Sync,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PLACES.len()).prop_map(Op::Acquire),
        2 => (0..PLACES.len()).prop_map(Op::Release),
        2 => (0..RESOURCES.len()).prop_map(Op::RepublishFree),
        1 => Just(Op::Restart),
        2 => Just(Op::Sync),
    ]
}

async fn connect_exporter(coordinator: &std::sync::Arc<Coordinator>) -> FakeExporter {
    let exporter = FakeExporter::connect(coordinator, "lab");
    for (name, cls) in RESOURCES {
        exporter.add_resource("bench", name, cls);
    }
    exporter.wait_for_resources(coordinator, RESOURCES.len()).await;
    exporter
}

async fn assert_single_owner(coordinator: &Coordinator, after: &Op) {
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for place in coordinator.get_places().await {
        if place.acquired.is_none() {
            assert!(
                place.acquired_resources.is_empty(),
                "released place {} still lists resources after {after:?}",
                place.name
            );
        }
        for path in place.acquired_resources {
            if let Some(other) = owners.insert(path.clone(), place.name.clone()) {
                panic!("{path} held by {other} and {} after {after:?}", place.name);
            }
        }
    }
}

async fn run(ops: Vec<Op>) {
    let coordinator = coordinator();
    let mut exporter = connect_exporter(&coordinator).await;
    for (name, pattern) in PLACES {
        coordinator.add_place(name).await.unwrap();
        coordinator.add_place_match(name, pattern, None).await.unwrap();
    }

    for op in ops {
        match &op {
            Op::Acquire(i) => {
                let _ = coordinator.acquire_place(PLACES[*i].0, "host/alice").await;
            }
            Op::Release(i) => {
                let _ = coordinator.release_place(PLACES[*i].0, None).await;
            }
            Op::RepublishFree(i) => {
                let (name, cls) = RESOURCES[*i];
                exporter.add_resource("bench", name, cls);
                eventually("resource to be reported free", || async {
                    coordinator
                        .exporters()
                        .by_name("lab")
                        .and_then(|e| e.lookup("bench", name))
                        .is_some_and(|h| h.acquired().is_none())
                })
                .await;
            }
            Op::Restart => {
                exporter.disconnect(&coordinator).await;
                exporter = connect_exporter(&coordinator).await;
            }
            Op::Sync => {
                let stats = coordinator.synchronize_resources().await;
                assert_eq!(stats.conflicts, 0);
            }
        }
        assert_single_owner(&coordinator, &op).await;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn no_resource_has_two_owners(ops in proptest::collection::vec(op(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run(ops));
    }
}
