use super::util::{reprefix, rename};
use once_cell::sync::Lazy;
use std::{
    ffi::{OsStr, OsString},
    io,
    ops::Deref,
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};

pub static PROCESSING_PREFIX: Lazy<OsString> = Lazy::new(|| OsString::from("[processing]_"));

pub static DONE_PREFIX: Lazy<OsString> = Lazy::new(|| OsString::from("[done]_"));

pub static FAILED_PREFIX: Lazy<OsString> = Lazy::new(|| OsString::from("[failed]_"));

pub static KILLED_PREFIX: Lazy<OsString> = Lazy::new(|| OsString::from("[killed]_"));

/// A descriptor that was claimed by this process.
///
/// The file lives under the processing prefix while the handle is alive and is
/// renamed to the done prefix on drop, or the failed prefix after
/// [`ClaimedPath::mark_failed`]. Either way the descriptor no longer matches the
/// worker's pattern and a later trigger does not execute it again.
#[derive(Debug)]
pub struct ClaimedPath {
    path: PathBuf,
    failed: bool,
}

impl ClaimedPath {
    /// Try to claim `path` by renaming it with the processing prefix.
    ///
    /// Returns `Ok(None)` if another process got there first.
    pub fn claim(path: &Path) -> Result<Option<Self>, io::Error> {
        let file_name = path.file_name().unwrap_or(OsStr::new(""));
        let mut claimed_name = PROCESSING_PREFIX.clone();
        claimed_name.push(file_name);

        let claimed = path.with_file_name(claimed_name);

        match rename(path, &claimed) {
            Ok(()) => {
                debug!(path = ?claimed, "Claimed descriptor");
                Ok(Some(Self {
                    path: claimed,
                    failed: false,
                }))
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?path, "Skipped since it wasn't found between listing and rename");
                Ok(None)
            }
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = ?path, "Failed to claim descriptor due to permission error");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for ClaimedPath {
    fn drop(&mut self) {
        let file_name = self
            .path
            .file_name()
            .unwrap_or(OsStr::new(""))
            .to_os_string();
        let new_prefix = if self.failed {
            FAILED_PREFIX.clone()
        } else {
            DONE_PREFIX.clone()
        };
        let retired = self
            .path
            .with_file_name(reprefix(&file_name, &PROCESSING_PREFIX, new_prefix));

        match rename(&self.path, &retired) {
            Ok(()) => debug!(path = ?retired, "Finished rename for descriptor"),
            Err(error) => error!(error = ?error, "Failed to retire processing descriptor"),
        }
    }
}

impl Deref for ClaimedPath {
    type Target = PathBuf;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

/// Retire an unclaimed descriptor with the killed prefix.
pub fn retire_killed(path: &Path) -> Result<PathBuf, io::Error> {
    let mut killed_name = KILLED_PREFIX.clone();
    killed_name.push(path.file_name().unwrap_or(OsStr::new("")));
    let killed = path.with_file_name(killed_name);

    rename(path, &killed)?;

    Ok(killed)
}
