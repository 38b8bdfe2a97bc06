use std::{io, path::StripPrefixError};

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use serde_yaml::Error as YamlError;
use sqlx::{migrate::MigrateError, Error as SqlxError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum DocGraphError {
    #[error("Node already exists: {0}")]
    AlreadyExists(String),
    #[error("Cache/Database error: {0}")]
    Cache(String),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Vector dimension mismatch: index holds {expected}-dimensional vectors, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Graph rebuild failed: {0}")]
    Graph(String),
    #[error("Invalid vector: {0}")]
    InvalidVector(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Path resolves outside of the source root: {0}")]
    OutsideRoot(String),
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("File watcher error: {0}")]
    Watch(String),
}

impl DocGraphError {
    /// Whether the error only concerns a single source unit and a batch may continue past it.
    pub fn is_per_unit(&self) -> bool {
        matches!(
            self,
            DocGraphError::Codec(_)
                | DocGraphError::Io(_)
                | DocGraphError::NotFound(_)
                | DocGraphError::PermissionDenied
                | DocGraphError::Serialization(_)
        )
    }
}

impl From<StripPrefixError> for DocGraphError {
    fn from(src: StripPrefixError) -> DocGraphError {
        DocGraphError::OutsideRoot(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for DocGraphError {
    fn from(src: toml::de::Error) -> DocGraphError {
        DocGraphError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for DocGraphError {
    fn from(src: toml::ser::Error) -> DocGraphError {
        DocGraphError::Config(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for DocGraphError {
    fn from(src: JsonError) -> DocGraphError {
        DocGraphError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<YamlError> for DocGraphError {
    fn from(src: YamlError) -> DocGraphError {
        DocGraphError::Serialization(format!("YAML (de)serialization error: {src}"))
    }
}

impl From<uuid::Error> for DocGraphError {
    fn from(src: uuid::Error) -> DocGraphError {
        DocGraphError::Serialization(format!("UUID conversion failed: {src}"))
    }
}

impl From<io::Error> for DocGraphError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => DocGraphError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => DocGraphError::PermissionDenied,
            io::ErrorKind::AlreadyExists => DocGraphError::AlreadyExists(format!("{x}")),
            _ => DocGraphError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<getrandom::Error> for DocGraphError {
    fn from(x: getrandom::Error) -> Self {
        DocGraphError::Io(format!("random source unavailable: {x}"))
    }
}

impl From<SqlxError> for DocGraphError {
    fn from(db_error: SqlxError) -> Self {
        DocGraphError::Cache(format!("database error: {db_error:?}"))
    }
}

impl From<MigrateError> for DocGraphError {
    fn from(migrate_error: MigrateError) -> Self {
        DocGraphError::Cache(format!("database migration error: {migrate_error}"))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for DocGraphError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => DocGraphError::Watch(format!(
                "notify: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => DocGraphError::Watch(format!(
                "notify: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => DocGraphError::NotFound(format!(
                "notify: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => DocGraphError::NotFound(format!(
                "notify: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                DocGraphError::Watch("notify invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                DocGraphError::Watch("notify max file watch limit reached".to_string())
            }
        }
    }
}
