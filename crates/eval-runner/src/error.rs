use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the grid builder, the placeholder resolver and the
/// aggregation engine. Each variant aborts only the job or record being
/// processed; skip/abort policy belongs to the caller.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("configuration not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("malformed run specification (custom run {index}): {reason}")]
    MalformedRunSpec { index: usize, reason: String },

    #[error("malformed configuration file {}: {reason}", .path.display())]
    MalformedConfig { path: PathBuf, reason: String },

    #[error("malformed statistics file {}: {reason}", .path.display())]
    MalformedStatistics { path: PathBuf, reason: String },

    #[error("invalid parameter sweep in {parameter_file}: {reason}")]
    InvalidSweep {
        parameter_file: String,
        reason: String,
    },

    #[error("two jobs resolve to the same output directory: {}", .0.display())]
    DuplicateOutputDirectory(PathBuf),

    #[error("unresolved placeholder {token} in '{partial}'")]
    UnresolvedPlaceholder { token: String, partial: String },

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("parameter set not found: {0}")]
    ParameterSetNotFound(String),

    #[error("datasets to join are not a subset of the recorded datasets: {}", .missing.join(", "))]
    NotASubset { missing: Vec<String> },

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EvalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EvalError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable code, used by the CLI's JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            EvalError::ConfigNotFound(_) => "configuration_not_found",
            EvalError::MalformedRunSpec { .. } => "malformed_run_specification",
            EvalError::MalformedConfig { .. } => "malformed_configuration",
            EvalError::MalformedStatistics { .. } => "malformed_statistics_file",
            EvalError::InvalidSweep { .. } => "invalid_parameter_sweep",
            EvalError::DuplicateOutputDirectory(_) => "duplicate_output_directory",
            EvalError::UnresolvedPlaceholder { .. } => "unresolved_placeholder",
            EvalError::DatasetNotFound(_) => "dataset_not_found",
            EvalError::ParameterSetNotFound(_) => "parameter_set_not_found",
            EvalError::NotASubset { .. } => "not_a_subset",
            EvalError::Io { .. } => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, EvalError>;
