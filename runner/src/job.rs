use crate::{artifact::JobOutput, config::JobConfig, descriptor::ParameterSet};
use std::{
    ffi::OsString,
    io::{Read, Write},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to spawn job {0:?}")]
    Spawn(PathBuf, #[source] std::io::Error),
    #[error("Failed to wait for a child proccess")]
    ChildError(#[from] std::io::Error),
    #[error("Job ran into timeout after {0:?}")]
    Timeout(Duration),
    #[error("Job exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("Failed to serialize parameters for the job")]
    SerializeParameters(#[source] serde_yaml::Error),
    #[error("Job output is not a sequence of results")]
    MalformedOutput(#[source] serde_yaml::Error),
    #[error("{0}")]
    Custom(String),
}

/// The user's computation: parameters in, named results out.
pub trait JobFunction {
    fn run(&self, params: &ParameterSet) -> Result<Vec<JobOutput>, JobError>;
}

impl<F> JobFunction for F
where
    F: Fn(&ParameterSet) -> Result<Vec<JobOutput>, JobError>,
{
    fn run(&self, params: &ParameterSet) -> Result<Vec<JobOutput>, JobError> {
        self(params)
    }
}

/// Runs an executable as the job.
///
/// The parameter set is written as YAML to stdin and the executable prints a
/// YAML sequence of outputs on stdout.
#[derive(Debug, Clone)]
pub struct ExecJob {
    pub exec: PathBuf,
    pub params: Vec<OsString>,
    pub timeout: Option<Duration>,
}

impl ExecJob {
    pub fn load(config: &JobConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            params: config.params.iter().map(OsString::from).collect(),
            timeout: config.timeout.map(Duration::from_secs),
        }
    }
}

impl JobFunction for ExecJob {
    #[tracing::instrument(level = "debug", skip_all, fields(exec = ?self.exec))]
    fn run(&self, params: &ParameterSet) -> Result<Vec<JobOutput>, JobError> {
        let input = serde_yaml::to_string(params).map_err(JobError::SerializeParameters)?;
        let start = Instant::now();

        let mut child = Command::new(&self.exec)
            .args(self.params.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| JobError::Spawn(self.exec.clone(), error))?;

        // drain both pipes on their own threads so a chatty job can't fill them and stall
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(input.as_bytes()) {
                Ok(()) => {}
                // the job is free to ignore its parameters
                Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Job closed stdin before reading the parameters")
                }
                Err(error) => return Err(error.into()),
            }
            // dropping stdin closes it, giving the job a clear end of input
        }

        debug!("Job waiting on {}", child.id());
        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => status,
                None => {
                    // child hasn't exited yet
                    child.kill()?;
                    child.wait()?;
                    error!("Job ran into timeout after {timeout:?}");

                    return Err(JobError::Timeout(timeout));
                }
            },
            None => child.wait()?,
        };

        let stdout = join(stdout);
        let stderr = join(stderr);

        info!(
            "Job finished in {} ms | status: {}",
            start.elapsed().as_millis(),
            status.success()
        );

        if !status.success() {
            return Err(JobError::Failed {
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        parse_outputs(&stdout)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        let _ = pipe.read_to_string(&mut buffer);
        buffer
    })
}

fn join(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Empty output means the job returned no results.
pub fn parse_outputs(stdout: &str) -> Result<Vec<JobOutput>, JobError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_yaml::from_str(stdout).map_err(JobError::MalformedOutput)
}
