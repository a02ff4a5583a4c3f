use crate::{
    descriptor::{decode, ParameterSet},
    dispatch::{check_usage, DispatchError, DispatchSettings, Dispatcher},
    transport::MountTransport,
};
use assert_matches::assert_matches;
use serde_yaml::Value;
use std::{fs, path::Path};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    dispatcher: Dispatcher<MountTransport>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared");
        let source = dir.path().join("sweep");
        fs::create_dir_all(source.join("lib")).unwrap();
        fs::write(source.join("lib").join("train.sh"), "echo train").unwrap();
        let entry_point = dir.path().join("entry.sh");
        fs::write(&entry_point, "exec fleet worker").unwrap();
        let key = dir.path().join("id_rsa");
        fs::write(&key, "key").unwrap();

        let settings = DispatchSettings {
            project_name: "Sweep".to_string(),
            inbox_root: shared.join("Sweep"),
            results_root: shared.join("Sweep").join("runs"),
            source,
            disk_max_percent: 100.0,
            private_key: key,
            watched_dir: "watched".into(),
            entry_point: Some(entry_point),
        };
        let transport = MountTransport::new(dir.path().join("workers"));

        Self {
            dispatcher: Dispatcher::new(settings, transport),
            dir,
        }
    }

    fn inbox(&self) -> std::path::PathBuf {
        self.dir.path().join("shared").join("Sweep")
    }

    fn watched(&self, worker: &str) -> std::path::PathBuf {
        self.dir.path().join("workers").join(worker).join("watched")
    }
}

fn job(job_name: &str) -> ParameterSet {
    ParameterSet::from_iter([
        ("param_name", Value::from("lr_sweep")),
        ("job_name", Value::from(job_name)),
        ("save_path", Value::from("/scratch/a")),
    ])
}

fn entries(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn stage_writes_addressed_descriptor() {
    let fixture = Fixture::new();

    let path = fixture.dispatcher.stage(&job("run_0"), "node1").unwrap();

    assert_eq!(path, fixture.inbox().join("node1_lr_sweep_run_0.yaml"));
    assert_eq!(decode(&fs::read(&path).unwrap()).unwrap(), job("run_0"));
    assert_eq!(entries(&fixture.inbox()), vec!["node1_lr_sweep_run_0.yaml"]);
}

#[test]
fn stage_refuses_incomplete_job_without_writing() {
    let fixture = Fixture::new();
    let mut incomplete = job("run_0");
    incomplete.remove("save_path");

    assert_matches!(
        fixture.dispatcher.stage(&incomplete, "node1"),
        Err(DispatchError::JobNotReady(missing)) if missing == vec!["save_path"]
    );
    assert!(!fixture.inbox().exists());
}

#[test]
fn submit_checks_every_job_before_staging() {
    let fixture = Fixture::new();
    let mut incomplete = job("run_1");
    incomplete.insert("job_name", Value::Null);

    assert_matches!(
        fixture
            .dispatcher
            .submit("node1", &[job("run_0"), incomplete], false),
        Err(DispatchError::JobNotReady(_))
    );
    assert!(!fixture.inbox().exists());
}

#[test]
fn submit_stages_and_pushes() {
    let fixture = Fixture::new();

    let staged = fixture
        .dispatcher
        .submit("node1", &[job("run_0"), job("run_1")], true)
        .unwrap();

    assert_eq!(staged.len(), 2);
    assert_eq!(
        entries(&fixture.watched("node1")),
        vec!["run_Sweep.sh", "sweep"]
    );
    assert_eq!(
        fs::read_to_string(fixture.watched("node1").join("sweep").join("lib").join("train.sh"))
            .unwrap(),
        "echo train"
    );
    assert!(fixture.inbox().join("runs").is_dir());
}

#[test]
fn missing_private_key_blocks_push() {
    let fixture = Fixture::new();
    fs::remove_file(fixture.dir.path().join("id_rsa")).unwrap();

    assert_matches!(
        fixture.dispatcher.push_code_and_entry_point("node1"),
        Err(DispatchError::MissingCredential(_))
    );
    assert!(!fixture.dir.path().join("workers").exists());
}

#[test]
fn submit_with_missing_key_stages_nothing() {
    let fixture = Fixture::new();
    fs::remove_file(fixture.dir.path().join("id_rsa")).unwrap();

    assert_matches!(
        fixture.dispatcher.submit("node1", &[job("run_0")], true),
        Err(DispatchError::MissingCredential(_))
    );
    assert!(!fixture.inbox().join("node1_lr_sweep_run_0.yaml").exists());
}

#[test]
fn failed_push_removes_staged_descriptors() {
    let fixture = Fixture::new();
    fs::remove_file(fixture.dir.path().join("entry.sh")).unwrap();

    assert_matches!(
        fixture
            .dispatcher
            .submit("node1", &[job("run_0"), job("run_1")], true),
        Err(DispatchError::Transport(_))
    );
    assert_eq!(entries(&fixture.inbox()), vec!["runs"]);
}

#[test]
fn kill_retires_pending_and_pushes_only_entry_point() {
    let fixture = Fixture::new();
    fixture.dispatcher.stage(&job("run_0"), "node1").unwrap();
    fixture.dispatcher.stage(&job("run_0"), "node2").unwrap();

    assert_eq!(fixture.dispatcher.kill("node1").unwrap(), 1);

    assert_eq!(
        entries(&fixture.inbox()),
        vec![
            "[killed]_node1_lr_sweep_run_0.yaml",
            "node2_lr_sweep_run_0.yaml",
            "runs"
        ]
    );
    assert_eq!(entries(&fixture.watched("node1")), vec!["run_Sweep.sh"]);
}

#[test]
fn entry_point_name_uses_extension() {
    let fixture = Fixture::new();
    let mut settings = fixture.dispatcher.settings().clone();

    assert_eq!(settings.entry_point_name(), "run_Sweep.sh");
    assert_eq!(settings.remote_source_dir(), Path::new("watched/sweep"));

    settings.entry_point = None;
    assert_eq!(settings.entry_point_name(), "run_Sweep");
}

#[test]
fn usage_over_threshold_is_rejected() {
    assert!(check_usage(Path::new("/"), 42.0, 90.0).is_ok());
    assert_matches!(
        check_usage(Path::new("/"), 95.5, 90.0),
        Err(DispatchError::DiskSpaceExceeded { max, .. }) if max == 90.0
    );
}
