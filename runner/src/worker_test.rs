use crate::{
    artifact::{JobOutput, Series},
    descriptor::{encode, ParameterSet},
    discovery::Discovery,
    job::JobError,
    publisher::Publisher,
    worker::{Worker, WorkerError},
};
use assert_matches::assert_matches;
use serde_yaml::Value;
use std::{
    cell::{Cell, RefCell},
    fs,
    path::Path,
};

fn stage(inbox: &Path, worker: &str, job_name: &str, save_path: &Path) {
    let params = ParameterSet::from_iter([
        ("param_name", Value::from("lr_sweep")),
        ("job_name", Value::from(job_name)),
        ("save_path", Value::from(save_path.to_string_lossy().into_owned())),
    ]);
    fs::create_dir_all(inbox).unwrap();
    fs::write(
        inbox.join(format!("{worker}_lr_sweep_{job_name}.yaml")),
        encode(&params).unwrap(),
    )
    .unwrap();
}

fn loss(params: &ParameterSet) -> Result<Vec<JobOutput>, JobError> {
    let scratch = params.save_path().unwrap();
    fs::write(scratch.join("log.txt"), params.job_name().unwrap()).unwrap();

    Ok(vec![Series::new("loss").with_row(0, 1.0).into()])
}

#[test]
fn idle_run_reports_zero_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let runs = dir.path().join("runs");
    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(&runs),
        loss,
    );

    let summary = worker.run().unwrap();

    assert!(summary.is_idle());
    assert!(summary.completed.is_empty());
    assert!(!runs.exists());
}

#[test]
fn jobs_run_in_file_name_order_and_are_retired() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    stage(dir.path(), "node1", "run_1", &scratch.join("1"));
    stage(dir.path(), "node1", "run_0", &scratch.join("0"));
    stage(dir.path(), "node2", "run_2", &scratch.join("2"));

    let order = RefCell::new(Vec::new());
    let job = |params: &ParameterSet| -> Result<Vec<JobOutput>, JobError> {
        order
            .borrow_mut()
            .push(params.job_name().unwrap_or_default().to_string());
        loss(params)
    };
    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        job,
    );

    let summary = worker.run().unwrap();

    assert_eq!(summary.found, 2);
    assert_eq!(summary.completed.len(), 2);
    assert_eq!(*order.borrow(), vec!["run_0", "run_1"]);
    assert_eq!(
        fs::read_to_string(dir.path().join("runs/lr_sweep/run_1/log.txt")).unwrap(),
        "run_1"
    );
    assert!(dir.path().join("[done]_node1_lr_sweep_run_0.yaml").exists());
    assert!(dir.path().join("node2_lr_sweep_run_2.yaml").exists());

    // a second trigger finds nothing left to do
    assert!(worker.run().unwrap().is_idle());
}

#[test]
fn failure_aborts_remaining_jobs_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    stage(dir.path(), "node1", "run_0", &scratch.join("0"));
    stage(dir.path(), "node1", "run_1", &scratch.join("1"));

    let failing = |_: &ParameterSet| -> Result<Vec<JobOutput>, JobError> {
        Err(JobError::Custom("diverged".to_string()))
    };
    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        failing,
    );

    assert_matches!(worker.run(), Err(WorkerError::Job(JobError::Custom(_))));
    assert!(dir.path().join("[failed]_node1_lr_sweep_run_0.yaml").exists());
    assert!(dir.path().join("node1_lr_sweep_run_1.yaml").exists());
}

#[test]
fn keep_going_collects_failures() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    stage(dir.path(), "node1", "run_0", &scratch.join("0"));
    stage(dir.path(), "node1", "run_1", &scratch.join("1"));

    let flaky = |params: &ParameterSet| -> Result<Vec<JobOutput>, JobError> {
        if params.job_name() == Some("run_0") {
            Err(JobError::Custom("diverged".to_string()))
        } else {
            loss(params)
        }
    };
    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        flaky,
    )
    .keep_going(true);

    let summary = worker.run().unwrap();

    assert_eq!(summary.found, 2);
    assert_eq!(summary.completed.len(), 1);
    assert_eq!(
        summary.failed,
        vec![dir.path().join("node1_lr_sweep_run_0.yaml")]
    );
    assert!(dir.path().join("[failed]_node1_lr_sweep_run_0.yaml").exists());
    assert!(dir.path().join("[done]_node1_lr_sweep_run_1.yaml").exists());
}

#[test]
fn corrupt_descriptor_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("node1_bad_job.yaml"), "- not\n- a mapping\n").unwrap();

    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        loss,
    );

    assert_matches!(worker.run(), Err(WorkerError::CorruptDescriptor(..)));
}

#[test]
fn save_path_is_created_before_the_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = dir.path().join("deep").join("scratch");
    stage(dir.path(), "node1", "run_0", &scratch);

    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        loss,
    );

    let summary = worker.run().unwrap();
    assert!(summary.completed[0].moved_scratch);
    assert!(!scratch.exists());
}

#[test]
fn incomplete_descriptor_fails_before_the_job_runs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("node1_fam_x.yaml"), "param_name: fam\nlr: 0.1\n").unwrap();

    let executions = Cell::new(0);
    let job = |params: &ParameterSet| -> Result<Vec<JobOutput>, JobError> {
        executions.set(executions.get() + 1);
        loss(params)
    };
    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        job,
    );

    assert_matches!(
        worker.run(),
        Err(WorkerError::JobNotReady(_, missing)) if missing == vec!["job_name", "save_path"]
    );
    assert_eq!(executions.get(), 0);
    assert!(!dir.path().join("runs").exists());
    assert!(dir.path().join("[failed]_node1_fam_x.yaml").exists());
}

#[test]
fn unclaimable_descriptor_is_a_claim_error() {
    let dir = tempfile::tempdir().unwrap();
    stage(dir.path(), "node1", "run_0", &dir.path().join("scratch"));
    // renaming a file onto a directory fails
    fs::create_dir(dir.path().join("[processing]_node1_lr_sweep_run_0.yaml")).unwrap();

    let worker = Worker::new(
        Discovery::new(dir.path(), "node1").unwrap(),
        Publisher::new(dir.path().join("runs")),
        loss,
    );

    assert_matches!(
        worker.run(),
        Err(WorkerError::Claim(path, _)) if path == dir.path().join("node1_lr_sweep_run_0.yaml")
    );
}
