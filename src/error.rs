use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VaultError {
    #[error("unsupported file extension for {0} (expected .las or .laz)")]
    InvalidExtension(String),

    #[error("upload exceeds the {limit} byte limit")]
    UploadTooLarge { limit: u64 },

    #[error("upload is empty")]
    EmptyUpload,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid project id: {0}")]
    InvalidProjectId(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("failed to launch converter {program}: {message}")]
    ConverterLaunch { program: String, message: String },

    #[error("no converter configured (set converter.program in pcvault.json)")]
    MissingConverter,

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("no demo project has been set")]
    DemoNotSet,

    #[error("accounting update failed for {owner}: {message}")]
    Accounting { owner: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conversion,
    NotFound,
    Accounting,
    Internal,
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidExtension(_)
            | VaultError::UploadTooLarge { .. }
            | VaultError::EmptyUpload
            | VaultError::MissingField(_)
            | VaultError::InvalidProjectId(_) => ErrorKind::Validation,
            VaultError::Conversion(_) | VaultError::ConverterLaunch { .. } => {
                ErrorKind::Conversion
            }
            VaultError::ProjectNotFound(_) | VaultError::DemoNotSet => ErrorKind::NotFound,
            VaultError::Accounting { .. } => ErrorKind::Accounting,
            VaultError::MissingConverter
            | VaultError::ConfigRead(_)
            | VaultError::ConfigParse(_)
            | VaultError::Filesystem(_)
            | VaultError::Task(_) => ErrorKind::Internal,
        }
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::Task(err.to_string())
    }
}
