use crate::{
    artifact::{validate, ContractError, JobOutput, TABLE_EXTENSION},
    descriptor::{ParameterSet, DESCRIPTOR_EXTENSION},
    distributed::util::move_contents,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const METADATA_STEM: &str = "param2val";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Parameter set is missing {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("Failed to serialize family metadata")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to write results to {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PublishError + '_ {
    move |source| PublishError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What a single `publish` call changed.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    pub job_path: PathBuf,
    pub artifacts: usize,
    pub wrote_metadata: bool,
    pub moved_scratch: bool,
}

/// Writes job outputs into `{results_root}/{param_name}/{job_name}`.
#[derive(Debug, Clone)]
pub struct Publisher {
    results_root: PathBuf,
}

impl Publisher {
    pub fn new(results_root: impl Into<PathBuf>) -> Self {
        Self {
            results_root: results_root.into(),
        }
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn metadata_path(&self, param_name: &str) -> PathBuf {
        self.results_root
            .join(param_name)
            .join(format!("{METADATA_STEM}.{DESCRIPTOR_EXTENSION}"))
    }

    /// Publish the outputs of one job.
    ///
    /// Artifacts are validated up front, so a contract violation writes nothing.
    /// Writes are sequential and not transactional: an I/O failure after the
    /// artifacts were written leaves the job directory partially populated.
    #[instrument(skip_all, fields(param_name = params.param_name(), job_name = params.job_name()))]
    pub fn publish(
        &self,
        params: &ParameterSet,
        outputs: &[JobOutput],
    ) -> Result<PublishReport, PublishError> {
        let param_name = params
            .param_name()
            .ok_or(PublishError::MissingField("param_name"))?;
        let job_name = params
            .job_name()
            .ok_or(PublishError::MissingField("job_name"))?;

        let series_list = validate(outputs)?;
        if series_list.is_empty() {
            warn!("WARNING: Job did not return any results");
        }

        let job_path = self.results_root.join(param_name).join(job_name);
        fs::create_dir_all(&job_path).map_err(io_error(&job_path))?;

        for series in series_list.iter() {
            let name = series.name.as_deref().unwrap_or_default();
            let path = job_path.join(format!("{name}.{TABLE_EXTENSION}"));

            fs::write(&path, series.to_csv()).map_err(io_error(&path))?;
            debug!(path = ?path, rows = series.len(), "Saved series");
        }
        info!("Saved results   to {}", job_path.display());

        let metadata_path = self.metadata_path(param_name);
        let wrote_metadata = write_once(
            &metadata_path,
            serde_yaml::to_string(&params.family_metadata())?.as_bytes(),
        )
        .map_err(io_error(&metadata_path))?;
        if wrote_metadata {
            info!("Saved param2val to {}", metadata_path.display());
        } else {
            debug!(path = ?metadata_path, "param2val already exists, leaving it untouched");
        }

        // the user may never have created anything at save_path
        let moved_scratch = match params.save_path() {
            Some(save_path) if save_path.is_dir() => {
                let moved = move_contents(&save_path, &job_path).map_err(io_error(&save_path))?;
                info!("Moved {moved} entries of save_path to {}", job_path.display());
                true
            }
            _ => false,
        };

        Ok(PublishReport {
            job_path,
            artifacts: series_list.len(),
            wrote_metadata,
            moved_scratch,
        })
    }
}

/// Write `path` only if it does not exist yet, returns whether this call wrote it.
///
/// Content goes to a private sibling first and is published with link(2), which
/// fails if the target exists. Concurrent first writers therefore cannot
/// interleave and readers never see a partial file.
pub fn write_once(path: &Path, contents: &[u8]) -> Result<bool, io::Error> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("metadata");
    let tmp = path.with_file_name(format!(".{file_name}.tmp.{}.{nanos}", std::process::id()));

    fs::write(&tmp, contents)?;
    let linked = fs::hard_link(&tmp, path);
    fs::remove_file(&tmp)?;

    match linked {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(error) => Err(error),
    }
}
