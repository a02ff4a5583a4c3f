use crate::{
    config::FleetConfig,
    descriptor::{DescriptorError, JobDescriptor, ParameterSet},
    discovery::Discovery,
    distributed::fs::retire_killed,
    transport::{Transport, TransportError},
};
use std::{
    ffi::OsStr,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Cannot stage job, missing {0:?}")]
    JobNotReady(Vec<&'static str>),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("Did not find private key in {0:?}")]
    MissingCredential(PathBuf),
    #[error("Disk space usage at {path:?} is {percent:.1}% > {max}%")]
    DiskSpaceExceeded { path: PathBuf, percent: f64, max: f64 },
    #[error("Failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid worker id")]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DispatchError + '_ {
    move |source| DispatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Paths and thresholds the dispatcher works with, taken from the config.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub project_name: String,
    pub inbox_root: PathBuf,
    pub results_root: PathBuf,
    pub source: PathBuf,
    pub disk_max_percent: f64,
    pub private_key: PathBuf,
    pub watched_dir: PathBuf,
    pub entry_point: Option<PathBuf>,
}

impl DispatchSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            project_name: config.project.name.clone(),
            inbox_root: config.inbox_root(),
            results_root: config.results_root(),
            source: config.project.source.clone(),
            disk_max_percent: config.dispatch.disk_max_percent,
            private_key: config.private_key(),
            watched_dir: config.dispatch.watched_dir.clone(),
            entry_point: config.dispatch.entry_point.clone(),
        }
    }

    /// `run_{project}.{ext}`, the name the watcher reacts to
    pub fn entry_point_name(&self) -> String {
        let extension = self
            .entry_point
            .as_deref()
            .and_then(Path::extension)
            .and_then(OsStr::to_str);

        match extension {
            Some(extension) => format!("run_{}.{extension}", self.project_name),
            None => format!("run_{}", self.project_name),
        }
    }

    /// sources land in `{watched}/{lowercased project name}`
    pub fn remote_source_dir(&self) -> PathBuf {
        self.watched_dir.join(self.project_name.to_lowercase())
    }
}

/// Coordinator side: stages descriptors and pushes code to workers.
///
/// Every call blocks until the transport returns, bound it with
/// `dispatch.timeout` in the config.
pub struct Dispatcher<T> {
    settings: DispatchSettings,
    transport: T,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(settings: DispatchSettings, transport: T) -> Self {
        Self {
            settings,
            transport,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Write the descriptor for `params` into the inbox, addressed to `worker`.
    ///
    /// Nothing is written unless the job is ready, and the descriptor only
    /// appears under its final name once it is complete.
    #[instrument(skip(self, params), fields(param_name = params.param_name(), job_name = params.job_name()))]
    pub fn stage(&self, params: &ParameterSet, worker: &str) -> Result<PathBuf, DispatchError> {
        let missing = params.missing_fields();
        if !missing.is_empty() {
            return Err(DispatchError::JobNotReady(missing));
        }

        let descriptor = JobDescriptor::new(worker, params.clone())?;
        let (bytes, file_name) = descriptor.encode()?;

        let inbox = &self.settings.inbox_root;
        fs::create_dir_all(inbox).map_err(io_error(inbox))?;

        let path = inbox.join(&file_name);
        atomic_write(&path, &bytes).map_err(io_error(&path))?;

        info!("Parameter configuration for {worker} saved to {}", path.display());

        Ok(path)
    }

    /// Stage all jobs for `worker`, then push code and the entry point.
    ///
    /// Readiness and, when pushing, the preflight checks pass for every job
    /// before the first one is written. If staging or the push fails, the
    /// descriptors written so far are removed again.
    pub fn submit(
        &self,
        worker: &str,
        jobs: &[ParameterSet],
        push: bool,
    ) -> Result<Vec<PathBuf>, DispatchError> {
        if let Some(missing) = jobs
            .iter()
            .map(ParameterSet::missing_fields)
            .find(|missing| !missing.is_empty())
        {
            return Err(DispatchError::JobNotReady(missing));
        }
        if push {
            self.preflight()?;
        }

        let mut staged = Vec::with_capacity(jobs.len());
        for params in jobs {
            match self.stage(params, worker) {
                Ok(path) => staged.push(path),
                Err(error) => {
                    unstage(&staged);
                    return Err(error);
                }
            }
        }

        if push {
            if let Err(error) = self.push_code_and_entry_point(worker) {
                unstage(&staged);
                return Err(error);
            }
        }

        Ok(staged)
    }

    /// Checks that must pass before touching the network.
    pub fn preflight(&self) -> Result<(), DispatchError> {
        self.check_disk_space()?;
        self.check_credential()
    }

    pub fn check_credential(&self) -> Result<(), DispatchError> {
        let private_key = &self.settings.private_key;
        debug!("Looking for private key in {}", private_key.display());

        if private_key.is_file() {
            Ok(())
        } else {
            Err(DispatchError::MissingCredential(private_key.clone()))
        }
    }

    #[cfg(target_os = "linux")]
    pub fn check_disk_space(&self) -> Result<(), DispatchError> {
        let path = nearest_existing(&self.settings.inbox_root);
        let percent = disk_usage_percent(&path).map_err(|errno| DispatchError::Io {
            path: path.clone(),
            source: io::Error::from(errno),
        })?;

        debug!("Percent disk space used at {}: {percent:.1}", path.display());
        check_usage(&path, percent, self.settings.disk_max_percent)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn check_disk_space(&self) -> Result<(), DispatchError> {
        debug!("Disk space check is only supported on linux");
        Ok(())
    }

    /// Upload the source tree and the entry point to `worker`.
    ///
    /// The arriving entry point makes the watcher restart the worker's run loop,
    /// which stops whatever was running there before.
    #[instrument(skip(self))]
    pub fn push_code_and_entry_point(&self, worker: &str) -> Result<(), DispatchError> {
        self.preflight()?;
        self.prepare_project()?;

        let remote_source = self.settings.remote_source_dir();
        info!(
            "Will upload {} to {} on {worker}",
            self.settings.source.display(),
            remote_source.display()
        );
        self.transport.make_dirs(worker, &remote_source)?;
        self.transport
            .put_tree(worker, &self.settings.source, &remote_source)?;

        self.push_entry_point(worker)?;
        info!("Upload to {worker} complete");

        Ok(())
    }

    /// Retire the worker's pending descriptors and push the entry point alone.
    ///
    /// The restarted run loop finds nothing to do. There is no acknowledgement
    /// that the previous job actually stopped.
    #[instrument(skip(self))]
    pub fn kill(&self, worker: &str) -> Result<usize, DispatchError> {
        self.preflight()?;
        self.prepare_project()?;

        let discovery = Discovery::new(&self.settings.inbox_root, worker)?;
        let mut retired = 0;
        for path in discovery.find_pending().collect::<Vec<_>>() {
            match retire_killed(&path) {
                Ok(killed) => {
                    debug!(path = ?killed, "Retired descriptor");
                    retired += 1;
                }
                // claimed by the worker in the meantime
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = ?path, "Descriptor vanished before it could be retired")
                }
                Err(e) => return Err(io_error(&path)(e)),
            }
        }

        self.push_entry_point(worker)?;
        info!(
            "Killed any active jobs of {} on {worker}, retired {retired} staged descriptors",
            self.settings.project_name
        );

        Ok(retired)
    }

    fn push_entry_point(&self, worker: &str) -> Result<(), DispatchError> {
        let remote = self.settings.watched_dir.join(self.settings.entry_point_name());

        match self.settings.entry_point {
            Some(ref entry_point) => self.transport.put(worker, entry_point, &remote)?,
            None => {
                // any file arrival triggers the watcher, write a marker
                let marker = self
                    .settings
                    .inbox_root
                    .join(format!(".{}", self.settings.entry_point_name()));
                fs::write(&marker, self.settings.project_name.as_bytes())
                    .map_err(io_error(&marker))?;
                self.transport.put(worker, &marker, &remote)?;
            }
        }

        debug!("Pushed entry point to {}", remote.display());
        Ok(())
    }

    fn prepare_project(&self) -> Result<(), DispatchError> {
        for path in [&self.settings.inbox_root, &self.settings.results_root] {
            fs::create_dir_all(path).map_err(io_error(path))?;
        }

        Ok(())
    }
}

fn unstage(staged: &[PathBuf]) {
    for path in staged {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = ?path, "Removed staged descriptor"),
            // claimed by a worker already
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?path, "Could not remove staged descriptor: {e}"),
        }
    }
}

pub(crate) fn check_usage(path: &Path, percent: f64, max: f64) -> Result<(), DispatchError> {
    if percent > max {
        Err(DispatchError::DiskSpaceExceeded {
            path: path.to_path_buf(),
            percent,
            max,
        })
    } else {
        Ok(())
    }
}

/// used / (used + available), as `df` reports it
#[cfg(target_os = "linux")]
pub fn disk_usage_percent(path: &Path) -> Result<f64, nix::Error> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let used = stat.blocks().saturating_sub(stat.blocks_free()) as f64;
    let available = stat.blocks_available() as f64;

    if used + available == 0.0 {
        Ok(0.0)
    } else {
        Ok(used / (used + available) * 100.0)
    }
}

fn nearest_existing(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|ancestor| ancestor.exists())
        .unwrap_or(Path::new("/"))
        .to_path_buf()
}

/// temporary sibling + rename, a crash never leaves a partial descriptor
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let file_name = path
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("descriptor");
    let tmp = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));

    let result = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    match result.and_then(|()| fs::rename(&tmp, path)) {
        Ok(()) => Ok(()),
        Err(error) => {
            let _ = fs::remove_file(&tmp);
            Err(error)
        }
    }
}
