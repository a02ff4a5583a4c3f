use crate::descriptor::{match_pattern, DESCRIPTOR_EXTENSION};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{Walk, WalkBuilder};
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Finds the descriptors addressed to one worker in the inbox.
#[derive(Debug, Clone)]
pub struct Discovery {
    inbox_root: PathBuf,
    worker_id: String,
    matcher: GlobMatcher,
}

impl Discovery {
    pub fn new(inbox_root: impl Into<PathBuf>, worker_id: &str) -> Result<Self, globset::Error> {
        let pattern = match_pattern(worker_id);
        // worker ids seen at runtime may differ in case from the ones used at dispatch
        let matcher = GlobBuilder::new(&pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()?
            .compile_matcher();

        debug!("Filtering descriptors with glob: {pattern}");

        Ok(Self {
            inbox_root: inbox_root.into(),
            worker_id: worker_id.to_string(),
            matcher,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn inbox_root(&self) -> &Path {
        &self.inbox_root
    }

    pub fn is_match(&self, path: &Path) -> bool {
        path.extension() == Some(OsStr::new(DESCRIPTOR_EXTENSION))
            && path
                .file_name()
                .map_or(false, |file_name| self.matcher.is_match(file_name))
    }

    /// Lazily list pending descriptors, sorted by file name.
    ///
    /// A missing inbox yields nothing: no work is an expected state.
    pub fn find_pending(&self) -> Pending<'_> {
        let walk = if self.inbox_root.is_dir() {
            let mut builder = WalkBuilder::new(&self.inbox_root);
            builder
                .max_depth(Some(1))
                .standard_filters(false)
                .sort_by_file_name(|left, right| left.cmp(right));

            Some(builder.build())
        } else {
            debug!(inbox = ?self.inbox_root, "Inbox does not exist");
            None
        };

        Pending {
            discovery: self,
            walk,
        }
    }
}

/// Single pass over the inbox, listing again needs a new `find_pending` call.
pub struct Pending<'a> {
    discovery: &'a Discovery,
    walk: Option<Walk>,
}

impl Iterator for Pending<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        let walk = self.walk.as_mut()?;

        for entry in walk {
            match entry {
                Ok(entry) => {
                    if entry.depth() == 0 || !entry.file_type().map_or(false, |kind| kind.is_file()) {
                        continue;
                    }

                    if self.discovery.is_match(entry.path()) {
                        return Some(entry.into_path());
                    }
                }
                Err(error) => {
                    warn!("Failed to list inbox entry: {error}");
                }
            }
        }

        None
    }
}
