//! Core domain model for the datapool landing-zone dispatcher.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dp-core";

/// Timestamp layout used by the uniform conversion output.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Where a signal was measured: a named site or an anonymous coordinate triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Location {
    Site(String),
    Coordinates { x: f64, y: f64, z: f64 },
}

/// One measurement tuple as produced by a conversion script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub timestamp: NaiveDateTime,
    pub parameter: String,
    pub source: String,
    pub value: f64,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    Format,
    Consistency,
    Io,
    InvalidOperation,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Format => "format error",
            ErrorKind::Consistency => "consistency error",
            ErrorKind::Io => "i/o error",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::Fatal => "fatal error",
        };
        f.write_str(label)
    }
}

/// Error value carried through the pipeline alongside progress messages.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, message)
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consistency, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

/// Outcome of one step of a multi-outcome pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    Progress(String),
    Failure(PipelineError),
    Done(T),
}

impl<T> Step<T> {
    pub fn progress(message: impl Into<String>) -> Self {
        Step::Progress(message.into())
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Step::Failure(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEventKind {
    Created,
    Modified,
    /// Moves within the zone and deletions.
    Illegal,
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileEventKind::Created => "created",
            FileEventKind::Modified => "modified",
            FileEventKind::Illegal => "illegal",
        };
        f.write_str(label)
    }
}

/// Filesystem event relative to the landing-zone root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub rel_path: PathBuf,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Picture {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub coordinates: Coordinates,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pictures: Vec<Picture>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialValueDefinition {
    pub categorical_value: String,
    pub numerical_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceType {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special_values: Vec<SpecialValueDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterAveraging {
    pub parameter: String,
    pub integration_length_x: f64,
    pub integration_length_y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    /// Filled from the directory layout when absent from the YAML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub averaging: Vec<ParameterAveraging>,
}

/// Parsed metadata file, one variant per landing-zone YAML kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEntity {
    Site(Site),
    Parameters(Vec<Parameter>),
    SourceType(SourceType),
    Source(Source),
}

impl MetadataEntity {
    pub fn kind(&self) -> &'static str {
        match self {
            MetadataEntity::Site(_) => "site",
            MetadataEntity::Parameters(_) => "parameters",
            MetadataEntity::SourceType(_) => "source type",
            MetadataEntity::Source(_) => "source",
        }
    }

    /// Syntactic checks that need no database access.
    pub fn validate(&self) -> Vec<PipelineError> {
        let mut errors = Vec::new();
        match self {
            MetadataEntity::Site(site) => {
                require_name("site", &site.name, &mut errors);
                let c = site.coordinates;
                if !(c.x.is_finite() && c.y.is_finite() && c.z.is_finite()) {
                    errors.push(PipelineError::format(format!(
                        "site {}: coordinates must be finite numbers",
                        site.name
                    )));
                }
                for picture in &site.pictures {
                    if picture.path.trim().is_empty() {
                        errors.push(PipelineError::format(format!(
                            "site {}: picture entry without path",
                            site.name
                        )));
                    }
                }
            }
            MetadataEntity::Parameters(parameters) => {
                let mut seen = std::collections::BTreeSet::new();
                for parameter in parameters {
                    require_name("parameter", &parameter.name, &mut errors);
                    if parameter.unit.trim().is_empty() {
                        errors.push(PipelineError::format(format!(
                            "parameter {}: unit is empty",
                            parameter.name
                        )));
                    }
                    if !seen.insert(parameter.name.as_str()) {
                        errors.push(PipelineError::consistency(format!(
                            "parameter {} is defined more than once",
                            parameter.name
                        )));
                    }
                }
            }
            MetadataEntity::SourceType(source_type) => {
                require_name("source type", &source_type.name, &mut errors);
                for special in &source_type.special_values {
                    if special.categorical_value.trim().is_empty() {
                        errors.push(PipelineError::format(format!(
                            "source type {}: special value without categorical value",
                            source_type.name
                        )));
                    }
                }
            }
            MetadataEntity::Source(source) => {
                require_name("source", &source.name, &mut errors);
                let mut seen = std::collections::BTreeSet::new();
                for averaging in &source.averaging {
                    if !seen.insert(averaging.parameter.as_str()) {
                        errors.push(PipelineError::consistency(format!(
                            "source {}: averaging for parameter {} given twice",
                            source.name, averaging.parameter
                        )));
                    }
                    if averaging.integration_length_x < 0.0 || averaging.integration_length_y < 0.0 {
                        errors.push(PipelineError::format(format!(
                            "source {}: negative integration length for {}",
                            source.name, averaging.parameter
                        )));
                    }
                }
            }
        }
        errors
    }
}

fn require_name(what: &str, name: &str, errors: &mut Vec<PipelineError>) {
    if name.trim().is_empty() {
        errors.push(PipelineError::format(format!("{what} name is empty")));
    }
}

pub fn from_yaml_str<T: DeserializeOwned>(text: &str) -> Result<T, PipelineError> {
    serde_yaml::from_str(text).map_err(|err| PipelineError::format(format!("invalid yaml: {err}")))
}

pub fn to_yaml_string<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_yaml::to_string(value)
        .map_err(|err| PipelineError::format(format!("cannot serialise yaml: {err}")))
}
