//! Error types for the orchestration layer

use starwatch_devices::DeviceError;
use starwatch_imaging::FitsError;
use std::path::PathBuf;
use thiserror::Error;

/// Problems with the configuration file or driver resolution; fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Unknown {role} driver: {driver}")]
    UnknownDriver { role: String, driver: String },

    #[error("{role} driver {driver} does not support the {transport} transport")]
    UnsupportedTransport {
        role: String,
        driver: String,
        transport: String,
    },

    #[error("Invalid arguments for {role} driver {driver}: {reason}")]
    InvalidArgs {
        role: String,
        driver: String,
        reason: String,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors returned by observatory operations
#[derive(Error, Debug)]
pub enum ObservatoryError {
    #[error("No {0} is installed")]
    MissingDevice(String),

    #[error("{0} is not connected")]
    NotConnected(String),

    #[error("The mount cannot slew to coordinates")]
    CannotSlew,

    #[error("Target altitude {altitude:.2} deg is at or below the minimum altitude {minimum:.2} deg")]
    BelowMinimumAltitude { altitude: f64, minimum: f64 },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("The observatory has been shut down; reset safety before operating")]
    ShutDown,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObservatoryError {
    pub fn missing(what: &str) -> Self {
        Self::MissingDevice(what.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ObservatoryError>;
