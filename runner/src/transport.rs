use crate::distributed::util::copy_tree;
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs, io,
    io::Read,
    path::{Component, Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No address known for worker {0}")]
    UnknownHost(String),
    #[error("Failed to spawn {0}")]
    Spawn(String, #[source] io::Error),
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} exited with {status}: {stderr}")]
    Remote {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Failed to copy {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Authenticated file transfer to a worker, addressed by worker id.
pub trait Transport {
    fn put(&self, worker: &str, local: &Path, remote: &Path) -> Result<(), TransportError>;

    /// copy the contents of `local` into `remote`
    fn put_tree(&self, worker: &str, local: &Path, remote: &Path) -> Result<(), TransportError>;

    fn make_dirs(&self, worker: &str, remote: &Path) -> Result<(), TransportError>;
}

/// Shells out to `ssh`/`scp` with a private key.
#[derive(Debug, Clone)]
pub struct SshTransport {
    pub hosts: BTreeMap<String, String>,
    pub user: String,
    pub private_key: PathBuf,
    pub timeout: Option<Duration>,
    pub skip_hostkey: bool,
}

impl SshTransport {
    fn destination(&self, worker: &str) -> Result<String, TransportError> {
        // hosts may be addressed with any case
        let address = self.hosts.get(worker).or_else(|| {
            self.hosts
                .iter()
                .find(|(host, _)| host.eq_ignore_ascii_case(worker))
                .map(|(_, address)| address)
        });

        address
            .map(|address| format!("{}@{address}", self.user))
            .ok_or_else(|| TransportError::UnknownHost(worker.to_string()))
    }

    fn options(&self) -> Vec<OsString> {
        let mut options: Vec<OsString> = vec![
            "-i".into(),
            self.private_key.clone().into(),
            "-o".into(),
            "BatchMode=yes".into(),
        ];

        if self.skip_hostkey {
            options.extend(
                [
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "UserKnownHostsFile=/dev/null",
                ]
                .map(OsString::from),
            );
        }

        options
    }

    fn remote_target(&self, worker: &str, remote: &Path) -> Result<OsString, TransportError> {
        let mut target = OsString::from(self.destination(worker)?);
        target.push(":");
        target.push(remote);

        Ok(target)
    }

    fn run(&self, program: &str, args: Vec<OsString>) -> Result<(), TransportError> {
        debug!("Running {program} {args:?}");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Spawn(program.to_string(), e))?;

        let io_error = |source| TransportError::Spawn(program.to_string(), source);

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(io_error)? {
                Some(status) => status,
                None => {
                    // child hasn't exited yet
                    child.kill().map_err(io_error)?;
                    child.wait().map_err(io_error)?;

                    return Err(TransportError::Timeout {
                        program: program.to_string(),
                        timeout,
                    });
                }
            },
            None => child.wait().map_err(io_error)?,
        };

        if status.success() {
            Ok(())
        } else {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }

            Err(TransportError::Remote {
                program: program.to_string(),
                status,
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

impl Transport for SshTransport {
    #[instrument(skip(self))]
    fn put(&self, worker: &str, local: &Path, remote: &Path) -> Result<(), TransportError> {
        let mut args = self.options();
        args.push(local.into());
        args.push(self.remote_target(worker, remote)?);

        self.run("scp", args)
    }

    #[instrument(skip(self))]
    fn put_tree(&self, worker: &str, local: &Path, remote: &Path) -> Result<(), TransportError> {
        let mut args = self.options();
        args.push("-r".into());

        let mut entries = fs::read_dir(local)
            .and_then(|entries| {
                entries
                    .map(|entry| entry.map(|entry| entry.path()))
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|source| TransportError::Io {
                path: local.to_path_buf(),
                source,
            })?;
        if entries.is_empty() {
            warn!(local = ?local, "Source tree is empty, nothing to upload");
            return Ok(());
        }
        entries.sort();

        args.extend(entries.into_iter().map(OsString::from));
        args.push(self.remote_target(worker, remote)?);

        self.run("scp", args)
    }

    #[instrument(skip(self))]
    fn make_dirs(&self, worker: &str, remote: &Path) -> Result<(), TransportError> {
        let mut args = self.options();
        args.push(self.destination(worker)?.into());
        args.push(format!("mkdir -p -- {}", shell_quote(&remote.to_string_lossy())).into());

        self.run("ssh", args)
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Delivers into a locally mounted directory per worker: `{root}/{worker}/{remote}`.
#[derive(Debug, Clone)]
pub struct MountTransport {
    pub root: PathBuf,
}

impl MountTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// remote paths are resolved below the worker's directory, absolute or not
    pub fn resolve(&self, worker: &str, remote: &Path) -> PathBuf {
        let mut path = self.root.join(worker);
        for component in remote.components() {
            if let Component::Normal(part) = component {
                path.push(part);
            }
        }

        path
    }
}

impl Transport for MountTransport {
    fn put(&self, worker: &str, local: &Path, remote: &Path) -> Result<(), TransportError> {
        let target = self.resolve(worker, remote);
        let io_error = |source| TransportError::Io {
            path: target.clone(),
            source,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::copy(local, &target).map_err(io_error)?;

        Ok(())
    }

    fn put_tree(&self, worker: &str, local: &Path, remote: &Path) -> Result<(), TransportError> {
        let target = self.resolve(worker, remote);

        copy_tree(local, &target)
            .map(|copied| debug!("Copied {copied} files to {}", target.display()))
            .map_err(|source| TransportError::Io {
                path: target.clone(),
                source,
            })
    }

    fn make_dirs(&self, worker: &str, remote: &Path) -> Result<(), TransportError> {
        let target = self.resolve(worker, remote);

        fs::create_dir_all(&target).map_err(|source| TransportError::Io {
            path: target.clone(),
            source,
        })
    }
}
