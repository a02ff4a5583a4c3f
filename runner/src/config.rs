use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

pub const DEFAULT_CONFIG_PATH: &str = "fleet.yaml";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {0:?}")]
    ReadConfig(PathBuf, #[source] Error),
    #[error("Config file is not valid")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Config contains errors, see the log above")]
    Preflight,
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("worker.job is required to run jobs on this machine")]
    MissingJob,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    // Name of the project, the entry point is pushed as run_{name}.{ext}
    pub name: String,
    // Project root on the shared drive, descriptors are staged here
    pub root: PathBuf,
    // Result hierarchy, defaults to {root}/runs
    pub results: Option<PathBuf>,
    // Local source tree that is pushed to the workers
    #[serde(default = "default_source")]
    pub source: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(default = "default_disk_max_percent")]
    pub disk_max_percent: f64,
    // defaults to {root}/../.fleet/id_rsa
    pub private_key: Option<PathBuf>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_watched_dir")]
    pub watched_dir: PathBuf,
    pub entry_point: Option<PathBuf>,
    // seconds, bounds every transport call
    pub timeout: Option<u64>,
    // worker id -> network address
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    // file with `Host`/`HostName` aliases merged into `hosts`
    pub ssh_config: Option<PathBuf>,
    // (unsafe) skip the host key check
    #[serde(default)]
    pub skip_hostkey: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    // overrides the hostname as worker identity
    pub id: Option<String>,
    pub job: Option<JobConfig>,
    // run the remaining descriptors when one of them fails
    #[serde(default)]
    pub keep_going: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // seconds
    pub timeout: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            disk_max_percent: default_disk_max_percent(),
            private_key: None,
            user: default_user(),
            watched_dir: default_watched_dir(),
            entry_point: None,
            timeout: None,
            hosts: BTreeMap::new(),
            ssh_config: None,
            skip_hostkey: false,
        }
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigErrors::ReadConfig(path.to_path_buf(), e))?;

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// shared directory holding the staged descriptors
    pub fn inbox_root(&self) -> PathBuf {
        self.project.root.clone()
    }

    pub fn results_root(&self) -> PathBuf {
        self.project
            .results
            .clone()
            .unwrap_or_else(|| self.project.root.join("runs"))
    }

    pub fn private_key(&self) -> PathBuf {
        self.dispatch.private_key.clone().unwrap_or_else(|| {
            self.project
                .root
                .parent()
                .unwrap_or(&self.project.root)
                .join(".fleet")
                .join("id_rsa")
        })
    }

    /// Check the loaded config and merge the ssh aliases into `hosts`.
    ///
    /// Every problem is logged before returning, returns `true` if any was found.
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.project.name.is_empty() {
            error!("project.name must not be empty");
            contains_error = true;
        }

        if !(0.0..=100.0).contains(&self.dispatch.disk_max_percent) {
            error!(
                "dispatch.disk_max_percent ({}) must be between 0 and 100",
                self.dispatch.disk_max_percent
            );
            contains_error = true;
        }

        if let Some(ref ssh_config) = self.dispatch.ssh_config {
            match fs::read_to_string(ssh_config) {
                Ok(contents) => {
                    for (host, address) in parse_ssh_config(&contents) {
                        if self.dispatch.hosts.contains_key(&host) {
                            warn!("Host {host} is defined in both dispatch.hosts and {ssh_config:?}, keeping dispatch.hosts");
                        } else {
                            self.dispatch.hosts.insert(host, address);
                        }
                    }
                }
                Err(e) => {
                    error!("Please specify hostname-to-IP mappings in {ssh_config:?}: {e}");
                    contains_error = true;
                }
            }
        }

        for (host, address) in self.dispatch.hosts.iter() {
            if host.contains('_') {
                error!("Worker {host} contains '_', which separates the parts of a descriptor name");
                contains_error = true;
            }
            if address.is_empty() {
                error!("dispatch.hosts.{host} has no address");
                contains_error = true;
            }
        }

        if let Some(ref entry_point) = self.dispatch.entry_point {
            if !entry_point.is_file() {
                error!(
                    "Failed to find dispatch.entry_point. Either not a file or not found at {}",
                    entry_point.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if let Some(ref job) = self.worker.job {
            match check_executable(&job.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "worker.job.exec {} is not executable",
                        job.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                // the job may only exist on the workers
                Err(e) => warn!(
                    "Failed to determine if worker.job.exec ({}) is an executable: {e}",
                    job.exec.to_string_lossy()
                ),
            }

            if job.timeout == Some(0) {
                error!("worker.job.timeout cannot be 0");
                contains_error = true;
            }
        }

        if self.dispatch.timeout == Some(0) {
            error!("dispatch.timeout cannot be 0");
            contains_error = true;
        }

        contains_error
    }
}

/// Extract `Host` -> `HostName` aliases from an ssh config.
pub fn parse_ssh_config(contents: &str) -> BTreeMap<String, String> {
    let mut hosts = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in contents.lines() {
        let mut words = line.split_whitespace();

        match (words.next(), words.next()) {
            (Some(key), Some(value)) if key.eq_ignore_ascii_case("host") => {
                current = Some(value.to_string());
            }
            (Some(key), Some(value)) if key.eq_ignore_ascii_case("hostname") => {
                if let Some(host) = current.take() {
                    hosts.insert(host, value.to_string());
                }
            }
            _ => {}
        }
    }

    hosts
}

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

fn default_disk_max_percent() -> f64 {
    90.0
}

fn default_user() -> String {
    "fleet".to_string()
}

fn default_watched_dir() -> PathBuf {
    PathBuf::from("watched")
}
