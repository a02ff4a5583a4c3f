use crate::status::{read_status, FamilyStatus, InboxStatus};
use std::fs;

#[test]
fn status_of_missing_tree_is_empty() {
    let dir = tempfile::tempdir().unwrap();

    let report = read_status(&dir.path().join("runs"), &dir.path().join("inbox")).unwrap();

    assert!(report.families.is_empty());
    assert!(report.inbox.is_empty());
    assert!(report.to_string().contains("no runs yet"));
}

#[test]
fn status_counts_families_and_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let runs = dir.path().join("runs");
    fs::create_dir_all(runs.join("lr_sweep").join("run_0")).unwrap();
    fs::create_dir_all(runs.join("lr_sweep").join("run_1")).unwrap();
    fs::write(runs.join("lr_sweep").join("param2val.yaml"), "job_name: null\n").unwrap();
    fs::create_dir_all(runs.join("dropout").join("run_0")).unwrap();

    for name in [
        "node1_lr_sweep_run_2.yaml",
        "Node1_lr_sweep_run_3.yaml",
        "[processing]_node1_lr_sweep_run_1.yaml",
        "[done]_node1_lr_sweep_run_0.yaml",
        "[failed]_node1_lr_sweep_run_4.yaml",
        "[killed]_node2_dropout_run_1.yaml",
        "notes.txt",
    ] {
        fs::write(dir.path().join(name), "").unwrap();
    }

    let report = read_status(&runs, dir.path()).unwrap();

    assert_eq!(
        report.families,
        vec![
            FamilyStatus {
                param_name: "dropout".to_string(),
                jobs: vec!["run_0".to_string()],
                has_metadata: false,
            },
            FamilyStatus {
                param_name: "lr_sweep".to_string(),
                jobs: vec!["run_0".to_string(), "run_1".to_string()],
                has_metadata: true,
            },
        ]
    );
    assert_eq!(
        report.inbox["node1"],
        InboxStatus {
            pending: 2,
            processing: 1,
            done: 1,
            failed: 1,
            killed: 0,
        }
    );
    assert_eq!(report.inbox["node2"].killed, 1);
    assert_eq!(report.inbox.len(), 2);
    assert!(report
        .to_string()
        .contains("done   1 | failed   1 | killed   0"));
}
