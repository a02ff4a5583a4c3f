use ignore::WalkBuilder;
use std::{
    ffi::{OsStr, OsString},
    fs, io,
    os::unix::prelude::OsStrExt,
    path::Path,
};
use tracing::{debug, error};

/// Hostname of this machine, used as the default worker identity.
pub fn hostname() -> Result<String, nix::Error> {
    match nix::unistd::gethostname() {
        Ok(hostname) => Ok(hostname.to_string_lossy().into_owned()),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname: {error}");

            Err(error)
        }
    }
}

/// rename(2), atomic as long as both paths are on the same volume
pub fn rename(from: &Path, to: &Path) -> Result<(), io::Error> {
    fs::rename(from, to)
}

/// Swap `prefix` for `new_prefix`. Names without `prefix` get `new_prefix` prepended.
pub fn reprefix(file_name: &OsStr, prefix: &OsStr, new_prefix: OsString) -> OsString {
    let mut joined = new_prefix;
    joined.push(strip_prefix(
        file_name.to_os_string(),
        prefix.to_os_string(),
        file_name.to_os_string(),
    ));

    joined
}

/// Remove `prefix` from `file_name`, or return `fallback` if it isn't there.
pub fn strip_prefix(file_name: OsString, prefix: OsString, fallback: OsString) -> OsString {
    let bytes = file_name.as_bytes();
    let prefix = prefix.as_bytes();

    if bytes.starts_with(prefix) {
        OsStr::from_bytes(&bytes[prefix.len()..]).to_os_string()
    } else {
        fallback
    }
}

/// Copy `source` to `destination`, recursing into directories.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<u64, io::Error> {
    if !source.is_dir() {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        return fs::copy(source, destination).map(|_| 1);
    }

    let mut copied = 0;

    for entry in WalkBuilder::new(source).standard_filters(false).build() {
        let entry = entry.map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let target = destination.join(relative);

        if entry.file_type().map_or(false, |kind| kind.is_dir()) {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Move `source` to `destination`; falls back to copy and delete across volumes.
pub fn move_path(source: &Path, destination: &Path) -> Result<(), io::Error> {
    match rename(source, destination) {
        Ok(()) => Ok(()),
        Err(error) if error.raw_os_error() == Some(nix::libc::EXDEV) => {
            debug!(source = ?source, destination = ?destination, "Rename crosses volumes, copying instead");
            copy_tree(source, destination)?;

            if source.is_dir() {
                fs::remove_dir_all(source)
            } else {
                fs::remove_file(source)
            }
        }
        Err(error) => Err(error),
    }
}

/// Move every entry of `source` into `destination`, then remove `source`.
pub fn move_contents(source: &Path, destination: &Path) -> Result<usize, io::Error> {
    fs::create_dir_all(destination)?;

    let mut moved = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        move_path(&entry.path(), &destination.join(entry.file_name()))?;
        moved += 1;
    }

    fs::remove_dir(source)?;

    Ok(moved)
}
