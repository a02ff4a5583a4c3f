use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeSet;
use thiserror::Error;

pub const TABLE_EXTENSION: &str = "csv";

const DEFAULT_INDEX_NAME: &str = "index";

#[derive(Error, Debug, PartialEq)]
pub enum ContractError {
    #[error("Output #{position} returned by the job is not a series: {reason}")]
    TypeContractViolation { position: usize, reason: String },
    #[error("Series #{position} returned by the job must have a name that is a unique file name")]
    AttributeContractViolation { position: usize },
    #[error("Series name {0:?} was returned more than once")]
    DuplicateArtifact(String),
}

/// A named index/value table produced by a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Series {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub index_name: Option<String>,
    pub index: Vec<Value>,
    pub values: Vec<Value>,
}

impl Series {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            index_name: None,
            index: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn with_row(mut self, index: impl Into<Value>, value: impl Into<Value>) -> Self {
        self.index.push(index.into());
        self.values.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Render as CSV: the index is kept as a labeled first column.
    pub fn to_csv(&self) -> String {
        let mut lines = Vec::with_capacity(self.len() + 1);

        lines.push(format!(
            "{},{}",
            csv_escape(self.index_name.as_deref().unwrap_or(DEFAULT_INDEX_NAME)),
            csv_escape(self.name.as_deref().unwrap_or_default())
        ));
        for (index, value) in self.index.iter().zip(self.values.iter()) {
            lines.push(format!(
                "{},{}",
                csv_escape(&cell(index)),
                csv_escape(&cell(value))
            ));
        }

        let mut csv = lines.join("\n");
        csv.push('\n');
        csv
    }
}

/// Anything a job hands back. Only `Series` can be published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Series(Series),
    Other(Value),
}

impl From<Series> for JobOutput {
    fn from(series: Series) -> Self {
        Self::Series(series)
    }
}

/// Check the output contract before anything is written.
pub fn validate(outputs: &[JobOutput]) -> Result<Vec<&Series>, ContractError> {
    let mut names = BTreeSet::new();
    let mut series_list = Vec::with_capacity(outputs.len());

    for (position, output) in outputs.iter().enumerate() {
        let series = match output {
            JobOutput::Series(series) => series,
            JobOutput::Other(value) => {
                return Err(ContractError::TypeContractViolation {
                    position,
                    reason: format!("found {}", kind(value)),
                })
            }
        };

        if series.index.len() != series.values.len() {
            return Err(ContractError::TypeContractViolation {
                position,
                reason: format!(
                    "index has {} rows but values has {}",
                    series.index.len(),
                    series.values.len()
                ),
            });
        }
        if let Some(value) = series
            .index
            .iter()
            .chain(series.values.iter())
            .find(|value| !is_scalar(value))
        {
            return Err(ContractError::TypeContractViolation {
                position,
                reason: format!("cells must be scalars, found {}", kind(value)),
            });
        }

        let name = match series.name.as_deref() {
            Some(name) if is_valid_name(name) => name,
            _ => return Err(ContractError::AttributeContractViolation { position }),
        };
        if !names.insert(name) {
            return Err(ContractError::DuplicateArtifact(name.to_string()));
        }

        series_list.push(series);
    }

    Ok(series_list)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn is_scalar(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => true,
        Value::Tagged(tagged) => is_scalar(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => false,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(boolean) => boolean.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(string) => string.clone(),
        Value::Tagged(tagged) => cell(&tagged.value),
        other => serde_yaml::to_string(other)
            .map(|rendered| rendered.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
