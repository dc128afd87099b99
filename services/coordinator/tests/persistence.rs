mod common;

use std::collections::BTreeMap;

use common::{place, test_config, FakeExporter};
use labhub_coordinator::config::CoordinatorConfig;
use labhub_coordinator::persistence::{PLACES_FILE, RESOURCES_FILE};
use labhub_coordinator::Coordinator;
use tempfile::tempdir;

#[tokio::test]
async fn places_survive_a_restart() {
    let dir = tempdir().unwrap();
    let config = CoordinatorConfig {
        state_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };

    {
        let coordinator = Coordinator::new(config.clone()).unwrap();
        let exporter = FakeExporter::connect(&coordinator, "lab");
        exporter.add_resource("1", "console", "RawSerialPort");
        exporter.wait_for_resources(&coordinator, 1).await;

        coordinator.add_place("board").await.unwrap();
        coordinator.add_place_alias("board", "b").await.unwrap();
        coordinator
            .add_place_match("board", "lab/1/*", Some("main".into()))
            .await
            .unwrap();
        let tags = BTreeMap::from([("board".to_string(), "rpi".to_string())]);
        coordinator.set_place_tags("board", &tags).await.unwrap();
        coordinator.acquire_place("board", "host/alice").await.unwrap();

        coordinator.save().await.unwrap();
        let resources = std::fs::read_to_string(dir.path().join(RESOURCES_FILE)).unwrap();
        assert!(resources.contains("console"));
    }

    assert!(dir.path().join(PLACES_FILE).exists());
    let restarted = Coordinator::new(config).unwrap();
    let board = place(&restarted, "board").await;
    assert_eq!(board.aliases, vec!["b"]);
    assert_eq!(board.tags.get("board").map(String::as_str), Some("rpi"));
    assert_eq!(board.matches[0].rename.as_deref(), Some("main"));
    assert_eq!(board.acquired, None);
    assert!(board.acquired_resources.is_empty());
}
