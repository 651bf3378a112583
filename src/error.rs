use std::path::PathBuf;
use thiserror::Error;

use crate::lifecycle::Status;

/// Problems with the YAML settings or the builder.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration YAML file not provided, usage: <program> <settings.yml>")]
    MissingArgument,

    #[error("Unable to load '{file}': {reason}")]
    Load { file: String, reason: String },

    #[error("Cannot set persistence-unit with any other database settings")]
    ConflictingDatabaseSettings,

    #[error("You enabled logging to a file, but didn't specify the file name")]
    MissingLogFilename,

    #[error("Unknown database dialect '{0}'")]
    UnknownDialect(String),

    #[error("No database URL for persistence unit '{0}', set DATABASE_URL_{1} or DATABASE_URL")]
    MissingDatabaseUrl(String, String),

    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),

    #[error("Mount path '{0}' must start with '/'")]
    InvalidMountPath(String),

    #[error("Page '{page}' mounted at '{path}' is not registered")]
    UnknownPage { path: String, page: String },

    #[error("Resource '{resource}' mounted at '{path}' is not registered")]
    UnknownResource { path: String, resource: String },
}

/// Persistence service, unit of work and session failures.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Persistence service was already initialized")]
    AlreadyStarted,

    #[error("Persistence service is not running")]
    NotRunning,

    #[error("Work already begun on this unit of work, begin() was called twice without a balancing end()")]
    AlreadyBegun,

    #[error("Requested a session outside of a unit of work")]
    OutsideUnitOfWork,

    #[error("No session factory registered for persistence unit '{0}'")]
    UnknownUnit(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("No transaction is active")]
    NoTransaction,

    #[error("A transaction is already active")]
    TransactionActive,

    #[error("Entity has not been persisted yet")]
    NotPersisted,

    #[error("Unknown column '{column}' on '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Live handle is in use and cannot be snapshotted")]
    HandleInUse,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum PidError {
    #[error("Pid file already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Unable to write pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Unable to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Status machine, listener and managed module failures.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Illegal status transition from {from} to {to}")]
    IllegalTransition { from: Status, to: Status },

    #[error("Unable to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Module '{name}' failed: {source}")]
    Module {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Everything that can stop the application from starting.
#[derive(Debug, Error)]
pub enum CroquetError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Pid(#[from] PidError),

    #[error(transparent)]
    Logging(#[from] LoggingError),
}
