use crate::{
    descriptor::{decode, DescriptorError, ParameterSet},
    discovery::Discovery,
    distributed::fs::ClaimedPath,
    job::{JobError, JobFunction},
    publisher::{PublishError, PublishReport, Publisher},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to claim descriptor {0:?}")]
    Claim(PathBuf, #[source] io::Error),
    #[error("Failed to read descriptor {0:?}")]
    ReadDescriptor(PathBuf, #[source] io::Error),
    #[error("Descriptor {0:?} is corrupt")]
    CorruptDescriptor(PathBuf, #[source] DescriptorError),
    #[error("Descriptor {0:?} is missing {1:?}")]
    JobNotReady(PathBuf, Vec<&'static str>),
    #[error("Failed to prepare save_path {0:?}")]
    PrepareSavePath(PathBuf, #[source] io::Error),
    #[error("Job failed")]
    Job(#[from] JobError),
    #[error("Failed to publish results")]
    Publish(#[from] PublishError),
    #[error("Invalid worker id")]
    Glob(#[from] globset::Error),
}

/// Outcome of one run loop invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub found: usize,
    pub completed: Vec<PublishReport>,
    pub failed: Vec<PathBuf>,
}

impl RunSummary {
    pub fn is_idle(&self) -> bool {
        self.found == 0
    }
}

/// Executes the descriptors addressed to one worker, one after another.
pub struct Worker<J> {
    discovery: Discovery,
    publisher: Publisher,
    job: J,
    keep_going: bool,
}

impl<J: JobFunction> Worker<J> {
    pub fn new(discovery: Discovery, publisher: Publisher, job: J) -> Self {
        Self {
            discovery,
            publisher,
            job,
            keep_going: false,
        }
    }

    /// Continue with the remaining descriptors when one fails, instead of aborting.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// One invocation of the run loop, as triggered by the watcher.
    ///
    /// Finding no descriptors is the normal outcome of a kill and not an error.
    #[instrument(skip(self), fields(worker = %self.discovery.worker_id()))]
    pub fn run(&self) -> Result<RunSummary, WorkerError> {
        let pending: Vec<PathBuf> = self.discovery.find_pending().collect();
        let mut summary = RunSummary {
            found: pending.len(),
            ..RunSummary::default()
        };

        if pending.is_empty() {
            // the trigger still stopped whatever ran before
            info!("No jobs found.");
            return Ok(summary);
        }

        info!("Found {} jobs:", pending.len());
        for path in pending.iter() {
            info!("{}", path.display());
        }

        for path in pending {
            // lost the claim to another invocation, it owns the descriptor now
            let Some(mut claimed) = ClaimedPath::claim(&path)
                .map_err(|e| WorkerError::Claim(path.clone(), e))?
            else {
                continue;
            };

            match self.run_descriptor(&claimed) {
                Ok(report) => summary.completed.push(report),
                Err(error) => {
                    claimed.mark_failed();
                    if !self.keep_going {
                        return Err(error);
                    }
                    error!(path = ?path, "Job failed, continuing with the next one: {error}");
                    summary.failed.push(path);
                }
            }
        }

        info!(
            "Done with {}/{} jobs",
            summary.completed.len(),
            summary.found
        );

        Ok(summary)
    }

    fn run_descriptor(&self, path: &Path) -> Result<PublishReport, WorkerError> {
        let bytes =
            fs::read(path).map_err(|e| WorkerError::ReadDescriptor(path.to_path_buf(), e))?;
        let params =
            decode(&bytes).map_err(|e| WorkerError::CorruptDescriptor(path.to_path_buf(), e))?;

        // nothing could be published for it, so don't run it
        let missing = params.missing_fields();
        if !missing.is_empty() {
            return Err(WorkerError::JobNotReady(path.to_path_buf(), missing));
        }

        self.run_job(&params)
    }

    /// Prepare the scratch directory, execute the job and publish its results.
    #[instrument(skip_all, fields(param_name = params.param_name(), job_name = params.job_name()))]
    pub fn run_job(&self, params: &ParameterSet) -> Result<PublishReport, WorkerError> {
        // save_path has to be created on the worker itself
        if let Some(save_path) = params.save_path() {
            if !save_path.exists() {
                fs::create_dir_all(&save_path)
                    .map_err(|e| WorkerError::PrepareSavePath(save_path.clone(), e))?;
            }
        }

        let outputs = self.job.run(params)?;

        Ok(self.publisher.publish(params, &outputs)?)
    }
}
