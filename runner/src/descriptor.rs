use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{collections::BTreeMap, path::PathBuf};
use thiserror::Error;

pub const PARAM_NAME: &str = "param_name";
pub const JOB_NAME: &str = "job_name";
pub const SAVE_PATH: &str = "save_path";

/// Keys a ParameterSet must carry before it can be staged
pub const REQUIRED_FIELDS: [&str; 3] = [PARAM_NAME, JOB_NAME, SAVE_PATH];

/// Worker-local keys, never written to the shared family metadata
pub const TRANSIENT_FIELDS: [&str; 1] = [SAVE_PATH];

pub const DESCRIPTOR_EXTENSION: &str = "yaml";

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Descriptor could not be parsed into a parameter mapping: {0}")]
    CorruptDescriptor(#[from] serde_yaml::Error),
    #[error("Job is not ready, missing fields: {0:?}")]
    JobNotReady(Vec<&'static str>),
    #[error("Worker id {0:?} is empty or contains '_', '/' or a path separator")]
    InvalidWorkerId(String),
}

/// Parameters of a single job, keyed by name.
///
/// Always carries `param_name` (the hyperparameter family) and `job_name` (one
/// run of that family) once ready, plus the worker-local `save_path`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, Value>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn param_name(&self) -> Option<&str> {
        self.get_str(PARAM_NAME)
    }

    pub fn job_name(&self) -> Option<&str> {
        self.get_str(JOB_NAME)
    }

    pub fn save_path(&self) -> Option<PathBuf> {
        self.get_str(SAVE_PATH).map(PathBuf::from)
    }

    /// required fields which are absent, null or empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        REQUIRED_FIELDS
            .into_iter()
            .filter(|field| self.get_str(field).is_none())
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Copy shared by the whole family: `job_name` nulled, transient fields removed.
    pub fn family_metadata(&self) -> Self {
        let mut metadata = self.clone();
        for field in TRANSIENT_FIELDS {
            metadata.0.remove(field);
        }
        metadata.0.insert(JOB_NAME.to_string(), Value::Null);

        metadata
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// A ParameterSet addressed to one worker.
///
/// The file name `{worker_id}_{param_name}_{job_name}.yaml` is only produced at
/// the storage boundary, the typed fields are the source of truth.
#[derive(Clone, Debug, PartialEq)]
pub struct JobDescriptor {
    pub worker_id: String,
    pub params: ParameterSet,
}

impl JobDescriptor {
    pub fn new(worker_id: &str, params: ParameterSet) -> Result<Self, DescriptorError> {
        validate_worker_id(worker_id)?;

        let missing = params.missing_fields();
        if !missing.is_empty() {
            return Err(DescriptorError::JobNotReady(missing));
        }

        Ok(Self {
            worker_id: worker_id.to_string(),
            params,
        })
    }

    pub fn param_name(&self) -> &str {
        self.params.param_name().unwrap_or_default()
    }

    pub fn job_name(&self) -> &str {
        self.params.job_name().unwrap_or_default()
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.{DESCRIPTOR_EXTENSION}",
            self.worker_id,
            self.param_name(),
            self.job_name()
        )
    }

    /// serialize the full ParameterSet, transient fields included
    pub fn encode(&self) -> Result<(Vec<u8>, String), DescriptorError> {
        Ok((encode(&self.params)?, self.file_name()))
    }
}

/// `_` separates the parts of a descriptor file name and must not appear in a worker id
fn validate_worker_id(worker_id: &str) -> Result<(), DescriptorError> {
    if worker_id.is_empty()
        || worker_id.contains('_')
        || worker_id.contains(std::path::MAIN_SEPARATOR)
        || worker_id.contains('/')
    {
        Err(DescriptorError::InvalidWorkerId(worker_id.to_string()))
    } else {
        Ok(())
    }
}

pub fn encode(params: &ParameterSet) -> Result<Vec<u8>, DescriptorError> {
    Ok(serde_yaml::to_string(params)?.into_bytes())
}

pub fn decode(bytes: &[u8]) -> Result<ParameterSet, DescriptorError> {
    Ok(serde_yaml::from_slice(bytes)?)
}

/// Glob over descriptor file names for `worker_id`, matched case-insensitively.
pub fn match_pattern(worker_id: &str) -> String {
    format!("{}_*", worker_id.to_lowercase())
}
