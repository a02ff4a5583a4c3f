use crate::transport::{MountTransport, SshTransport, Transport, TransportError};
use assert_matches::assert_matches;
use std::{collections::BTreeMap, fs, path::Path};

#[test]
fn mount_transport_resolves_below_worker() {
    let transport = MountTransport::new("/mnt/workers");

    assert_eq!(
        transport.resolve("node1", Path::new("/home/fleet/watched/run_Sweep.sh")),
        Path::new("/mnt/workers/node1/home/fleet/watched/run_Sweep.sh")
    );
    assert_eq!(
        transport.resolve("node1", Path::new("../watched")),
        Path::new("/mnt/workers/node1/watched")
    );
}

#[test]
fn mount_transport_copies_files_and_trees() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("sweep");
    fs::create_dir_all(source.join("lib")).unwrap();
    fs::write(source.join("lib").join("train.sh"), "echo train").unwrap();
    let entry_point = dir.path().join("entry.sh");
    fs::write(&entry_point, "fleet worker").unwrap();

    let transport = MountTransport::new(dir.path().join("workers"));
    transport
        .make_dirs("node1", Path::new("watched/sweep"))
        .unwrap();
    transport
        .put_tree("node1", &source, Path::new("watched/sweep"))
        .unwrap();
    transport
        .put("node1", &entry_point, Path::new("watched/run_Sweep.sh"))
        .unwrap();

    let watched = dir.path().join("workers").join("node1").join("watched");
    assert_eq!(
        fs::read_to_string(watched.join("sweep").join("lib").join("train.sh")).unwrap(),
        "echo train"
    );
    assert_eq!(
        fs::read_to_string(watched.join("run_Sweep.sh")).unwrap(),
        "fleet worker"
    );
}

#[test]
fn ssh_transport_requires_known_host() {
    let transport = SshTransport {
        hosts: BTreeMap::from([("Node1".to_string(), "10.0.0.1".to_string())]),
        user: "fleet".to_string(),
        private_key: "/keys/id_rsa".into(),
        timeout: None,
        skip_hostkey: false,
    };

    assert_matches!(
        transport.make_dirs("node2", Path::new("watched")),
        Err(TransportError::UnknownHost(host)) if host == "node2"
    );
}
