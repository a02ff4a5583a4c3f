use crate::{
    descriptor::DESCRIPTOR_EXTENSION,
    distributed::fs::{DONE_PREFIX, FAILED_PREFIX, KILLED_PREFIX, PROCESSING_PREFIX},
    publisher::METADATA_STEM,
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

/// One `param_name` directory of the result hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyStatus {
    pub param_name: String,
    pub jobs: Vec<String>,
    pub has_metadata: bool,
}

/// Descriptor counts of one worker in the inbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboxStatus {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    pub killed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub results_root: PathBuf,
    pub families: Vec<FamilyStatus>,
    pub inbox: BTreeMap<String, InboxStatus>,
}

/// Read the result hierarchy and the inbox. Missing directories count as empty.
pub fn read_status(results_root: &Path, inbox_root: &Path) -> Result<StatusReport, io::Error> {
    let mut families = Vec::new();

    for family in sorted_entries(results_root)? {
        if !family.is_dir() {
            continue;
        }

        let jobs = sorted_entries(&family)?
            .into_iter()
            .filter(|path| path.is_dir())
            .filter_map(|path| file_name(&path))
            .collect_vec();

        families.push(FamilyStatus {
            param_name: file_name(&family).unwrap_or_default(),
            has_metadata: family
                .join(format!("{METADATA_STEM}.{DESCRIPTOR_EXTENSION}"))
                .is_file(),
            jobs,
        });
    }

    let mut inbox: BTreeMap<String, InboxStatus> = BTreeMap::new();
    for path in sorted_entries(inbox_root)? {
        let is_descriptor =
            path.extension().and_then(|e| e.to_str()) == Some(DESCRIPTOR_EXTENSION);
        if !path.is_file() || !is_descriptor {
            continue;
        }
        let Some(name) = file_name(&path) else {
            continue;
        };

        let (name, state) = [
            (PROCESSING_PREFIX.to_string_lossy(), State::Processing),
            (DONE_PREFIX.to_string_lossy(), State::Done),
            (FAILED_PREFIX.to_string_lossy(), State::Failed),
            (KILLED_PREFIX.to_string_lossy(), State::Killed),
        ]
        .into_iter()
        .find_map(|(prefix, state)| {
            name.strip_prefix(&*prefix)
                .map(|rest| (rest.to_string(), state))
        })
        .unwrap_or((name, State::Pending));

        // `_` never appears in a worker id
        let Some((worker, _)) = name.split_once('_') else {
            continue;
        };
        let counts = inbox.entry(worker.to_lowercase()).or_default();
        match state {
            State::Pending => counts.pending += 1,
            State::Processing => counts.processing += 1,
            State::Done => counts.done += 1,
            State::Failed => counts.failed += 1,
            State::Killed => counts.killed += 1,
        }
    }

    Ok(StatusReport {
        results_root: results_root.to_path_buf(),
        families,
        inbox,
    })
}

enum State {
    Pending,
    Processing,
    Done,
    Failed,
    Killed,
}

fn sorted_entries(path: &Path) -> Result<Vec<PathBuf>, io::Error> {
    if !path.is_dir() {
        return Ok(Vec::new());
    }

    fs::read_dir(path)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map(|paths| paths.into_iter().sorted().collect())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Results in {}", self.results_root.display())?;
        if self.families.is_empty() {
            writeln!(f, "  no runs yet")?;
        }
        for family in self.families.iter() {
            writeln!(
                f,
                "  {:<32} {:>4} jobs{}",
                family.param_name,
                family.jobs.len(),
                if family.has_metadata {
                    ""
                } else {
                    " (param2val missing)"
                }
            )?;
        }

        writeln!(f, "Inbox")?;
        if self.inbox.is_empty() {
            writeln!(f, "  no descriptors")?;
        }
        for (worker, counts) in self.inbox.iter() {
            writeln!(
                f,
                "  {worker:<16} pending {:>3} | processing {:>3} | done {:>3} | failed {:>3} | killed {:>3}",
                counts.pending, counts.processing, counts.done, counts.failed, counts.killed
            )?;
        }

        Ok(())
    }
}
