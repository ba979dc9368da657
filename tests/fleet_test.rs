// tests/fleet_test.rs

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use netdeploy::config::rewrite::read_field;
use netdeploy::config::{ConfigManager, VERSION_KEYS};
use netdeploy::execution::HostExecutor;
use netdeploy::scaling::{FleetError, FleetSettings, NodeFleetManager};
use netdeploy::service::{CleanOptions, ServiceCatalog};
use walkdir::WalkDir;

const NODE_CONF: &str = r#"myLegalName="O=TestNode, L=London, C=GB"
p2pAddress="localhost:10200"
rpcSettings {
    address="localhost:10201"
    adminAddress="localhost:10202"
}
sshd {
    port=2222
}
devMode=false
"#;

fn fleet(root: &Path) -> NodeFleetManager {
    let template = root.join("cenm-node");
    fs::create_dir_all(template.join("certificates")).unwrap();
    fs::create_dir_all(template.join("logs")).unwrap();
    fs::write(template.join("node.conf"), NODE_CONF).unwrap();
    fs::write(template.join("corda.jar"), "jar").unwrap();
    fs::write(template.join("certificates/network-root-truststore.jks"), "root").unwrap();
    fs::write(template.join("certificates/nodekeystore.jks"), "identity").unwrap();
    fs::write(template.join("logs/node.log"), "old run").unwrap();

    let mut config = ConfigManager::default_config();
    config.root_dir = root.to_path_buf();
    for key in VERSION_KEYS {
        config.versions.insert(key.to_string(), "4.10".to_string());
    }
    let catalog = ServiceCatalog::from_config(&config).unwrap();

    NodeFleetManager::new(
        catalog.node_template().clone(),
        FleetSettings::from_config(&config.nodes, false),
        HostExecutor::new().as_executor(),
    )
}

/// Every file under `root` with its contents
fn snapshot(root: &Path) -> BTreeMap<PathBuf, String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().to_path_buf(), fs::read_to_string(e.path()).unwrap_or_default()))
        .collect()
}

fn node_conf(root: &Path, ordinal: u32) -> String {
    fs::read_to_string(root.join(format!("cenm-node-{}/node.conf", ordinal))).unwrap()
}

#[test_log::test(tokio::test)]
async fn three_replicas_get_their_own_identity_and_ports() {
    let root = tempfile::tempdir().unwrap();
    let fleet = fleet(root.path());

    let instances = fleet.reconcile_or_create(3).await.unwrap();
    assert_eq!(instances.len(), 3);

    let mut suffixes = HashSet::new();
    for instance in &instances {
        let i = instance.ordinal;
        let conf = node_conf(root.path(), i);
        let suffix = instance.suffix.clone().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffixes.insert(suffix.clone()));

        assert_eq!(
            read_field(&conf, "myLegalName").unwrap(),
            format!("O=TestNode{}-{}, L=London, C=GB", i, suffix)
        );
        assert_eq!(read_field(&conf, "p2pAddress").unwrap(), format!("localhost:60{}11", i));
        assert_eq!(read_field(&conf, "rpcSettings.address").unwrap(), format!("localhost:60{}12", i));
        assert_eq!(read_field(&conf, "rpcSettings.adminAddress").unwrap(), format!("localhost:60{}13", i));
        assert_eq!(read_field(&conf, "sshd.port").unwrap(), format!("223{}", i));
        assert_eq!(read_field(&conf, "devMode").unwrap(), "false");

        let dir = root.path().join(format!("cenm-node-{}", i));
        assert!(instance.created);
        assert_eq!(instance.descriptor.dir, dir);
        assert_eq!(instance.descriptor.abbreviation, format!("node{}", i));
        assert!(dir.join("corda.jar").is_file());
        assert!(dir.join("certificates/network-root-truststore.jks").is_file());
        assert!(!dir.join("certificates/nodekeystore.jks").exists());
        assert!(!dir.join("logs").exists());
    }

    let descriptors = fleet.deployment_list(&instances).unwrap();
    let names: Vec<&str> = descriptors.iter().map(|d| d.abbreviation.as_str()).collect();
    assert_eq!(names, vec!["node1", "node2", "node3"]);

    // the template keeps its own settings
    assert_eq!(
        fs::read_to_string(root.path().join("cenm-node/node.conf")).unwrap(),
        NODE_CONF
    );
}

#[tokio::test]
async fn zero_adopts_existing_replicas_untouched() {
    let root = tempfile::tempdir().unwrap();
    let fleet = fleet(root.path());
    let created = fleet.reconcile_or_create(3).await.unwrap();
    let before = snapshot(root.path());

    let adopted = fleet.reconcile_or_create(0).await.unwrap();
    assert_eq!(adopted.len(), 3);
    assert!(adopted.iter().all(|i| !i.created));
    for (old, new) in created.iter().zip(&adopted) {
        assert_eq!(old.ordinal, new.ordinal);
        assert_eq!(old.suffix, new.suffix);
        assert_eq!(old.ports, new.ports);
    }
    assert_eq!(snapshot(root.path()), before);

    let matching = fleet.reconcile_or_create(3).await.unwrap();
    assert_eq!(matching.len(), 3);
    assert_eq!(snapshot(root.path()), before);
}

#[tokio::test]
async fn count_mismatch_is_fatal_and_touches_nothing() {
    let root = tempfile::tempdir().unwrap();
    let fleet = fleet(root.path());
    fleet.reconcile_or_create(3).await.unwrap();
    let before = snapshot(root.path());

    match fleet.reconcile_or_create(2).await {
        Err(FleetError::CountMismatch { existing, requested }) => {
            assert_eq!(existing, 3);
            assert_eq!(requested, 2);
        }
        other => panic!("unexpected result: {:?}", other.map(|i| i.len())),
    }
    assert!(matches!(
        fleet.reconcile_or_create(5).await,
        Err(FleetError::CountMismatch { existing: 3, requested: 5 })
    ));
    assert_eq!(snapshot(root.path()), before);
}

#[tokio::test]
async fn deep_clean_removes_replicas_only() {
    let root = tempfile::tempdir().unwrap();
    let fleet = fleet(root.path());
    fleet.reconcile_or_create(2).await.unwrap();

    let cleaned = fleet
        .clean_fleet(&CleanOptions {
            deep: true,
            ..CleanOptions::default()
        })
        .unwrap();
    assert_eq!(cleaned, 2);
    assert!(fleet.discover().unwrap().is_empty());
    assert!(root.path().join("cenm-node/node.conf").is_file());

    // a fresh fleet can be created again
    assert_eq!(fleet.reconcile_or_create(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn no_replicas_and_no_request_is_an_empty_fleet() {
    let root = tempfile::tempdir().unwrap();
    let fleet = fleet(root.path());
    assert!(fleet.reconcile_or_create(0).await.unwrap().is_empty());
    assert!(fleet.discover().unwrap().is_empty());
}
