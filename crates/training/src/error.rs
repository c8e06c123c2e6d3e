use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("unknown {kind} '{name}' (available: {})", .known.join(", "))]
    UnknownComponent {
        kind: &'static str,
        name: String,
        known: Vec<String>,
    },
    #[error(
        "output directory {} is not empty; pass --overwrite-output to replace it",
        .0.display()
    )]
    OutputDirConflict(PathBuf),
    #[error("cannot continue training: {0}")]
    MissingCheckpoint(String),
    #[error(
        "checkpoint parameters do not match the model (missing: [{}], unexpected: [{}])",
        .missing.join(", "),
        .unexpected.join(", ")
    )]
    KeyMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("logical batch contains no valid targets; mean reduction is undefined")]
    DegenerateBatch,
    #[error("checksum mismatch for {}", .0.display())]
    Checksum(PathBuf),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn unknown_component(kind: &'static str, name: &str, known: &[&str]) -> Self {
        Self::UnknownComponent {
            kind,
            name: name.to_string(),
            known: known.iter().map(|name| name.to_string()).collect(),
        }
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<toml::ser::Error> for TrainingError {
    fn from(value: toml::ser::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
