use crate::discovery::Discovery;
use std::{fs, path::PathBuf};

fn touch(dir: &std::path::Path, name: &str) {
    fs::write(dir.join(name), "param_name: p\n").unwrap();
}

fn names(paths: Vec<PathBuf>) -> Vec<String> {
    paths
        .into_iter()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn only_descriptors_for_worker_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "node1_lr_sweep_run_1.yaml");
    touch(dir.path(), "node1_lr_sweep_run_0.yaml");
    touch(dir.path(), "node10_lr_sweep_run_0.yaml");
    touch(dir.path(), "node2_lr_sweep_run_0.yaml");
    touch(dir.path(), "[processing]_node1_lr_sweep_run_2.yaml");
    touch(dir.path(), "[done]_node1_lr_sweep_run_3.yaml");
    touch(dir.path(), "node1_notes.txt");
    fs::create_dir(dir.path().join("node1_directory.yaml")).unwrap();
    fs::create_dir_all(dir.path().join("runs")).unwrap();
    touch(&dir.path().join("runs"), "node1_nested_run.yaml");

    let discovery = Discovery::new(dir.path(), "node1").unwrap();
    let found = names(discovery.find_pending().collect());

    assert_eq!(
        found,
        vec!["node1_lr_sweep_run_0.yaml", "node1_lr_sweep_run_1.yaml"]
    );
}

#[test]
fn worker_id_is_matched_case_insensitively() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "Node1_family_a.yaml");
    touch(dir.path(), "NODE2_family_a.yaml");

    let discovery = Discovery::new(dir.path(), "NODE1").unwrap();
    let found = names(discovery.find_pending().collect());

    assert_eq!(found, vec!["Node1_family_a.yaml"]);
}

#[test]
fn empty_or_missing_inbox_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();

    let discovery = Discovery::new(dir.path(), "node1").unwrap();
    assert_eq!(discovery.find_pending().count(), 0);

    let missing = Discovery::new(dir.path().join("missing"), "node1").unwrap();
    assert_eq!(missing.find_pending().count(), 0);
}

#[test]
fn listing_again_sees_new_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let discovery = Discovery::new(dir.path(), "node1").unwrap();

    assert_eq!(discovery.find_pending().count(), 0);
    touch(dir.path(), "node1_family_job.yaml");
    assert_eq!(discovery.find_pending().count(), 1);
}
