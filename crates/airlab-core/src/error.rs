//! Error types for airlab-core

use std::fmt::Write;
use std::time::Duration;

use thiserror::Error;

use crate::validate::ValidationReport;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for airlab-core
#[derive(Error, Debug)]
pub enum Error {
    /// Message bus transport errors
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// No message was accepted before the overall deadline
    #[error("No data received within {}s", .timeout.as_secs())]
    NoData { timeout: Duration },

    /// The episode finished but the merged reading holds no metrics
    #[error("Empty reading")]
    EmptyReading,

    /// The merged reading has at least one implausible metric
    #[error("Reading failed validation: {0}")]
    Validation(ValidationReport),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled (signal or shutdown request)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Runtime errors (task joins, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Process exit code for this failure.
    ///
    /// Validation rejections get their own code so cron wrappers can tell an
    /// implausible reading apart from a broken installation.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::NoData { .. } | Self::EmptyReading => 3,
            Self::Bus(_) => 4,
            Self::Storage(_) => 5,
            Self::Config(_) => 6,
            Self::Cancelled(_) => 130,
            Self::Io(_) | Self::Json(_) | Self::Runtime(_) => 1,
        }
    }

    /// Whether this outcome is an anticipated data condition rather than a
    /// software or infrastructure fault. Such outcomes are logged as warnings.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Bus(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::NoData { .. } | Self::EmptyReading => Some(
                Remediation::new("The sensor published nothing usable before the deadline.")
                    .command("Watch raw traffic", "airlab discover")
                    .alternative("Raise the overall wait with --timeout.")
                    .alternative("Check that MQTT_BASE_TOPIC matches what the sensor publishes."),
            ),
            Self::Validation(_) => None,
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Inspect database directory", "ls -la \"$(dirname \"$DB_PATH\")\"")
                    .alternative("Verify the database directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
            Self::Cancelled(_) => None,
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command.")
                    .command("Verbose run", "RUST_LOG=airlab_core=debug airlab collect"),
            ),
        }
    }
}

/// Message bus transport errors
#[derive(Error, Debug)]
pub enum BusError {
    /// Broker unreachable or the network connection failed
    #[error("Could not connect to MQTT broker {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    /// Broker answered CONNACK with a non-success code (bad credentials, etc.)
    #[error("MQTT connection refused: {0}")]
    Refused(String),

    /// No CONNACK within the connect timeout
    #[error("Timed out after {}s waiting for broker acknowledgement", .0.as_secs())]
    ConnectTimeout(Duration),

    /// SUBSCRIBE request could not be queued
    #[error("Subscribe to {pattern} failed: {reason}")]
    Subscribe { pattern: String, reason: String },

    /// DISCONNECT could not be delivered
    #[error("Disconnect failed: {0}")]
    Disconnect(String),

    /// The transport has already been torn down
    #[error("Bus connection is closed")]
    Closed,
}

impl BusError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ConnectFailed { host, port, .. } => {
                Remediation::new(format!("Make sure an MQTT broker is reachable at {host}:{port}."))
                    .command("Probe broker", format!("nc -vz {host} {port}"))
                    .alternative("Set MQTT_HOST / MQTT_PORT or the [bus] section of the config.")
            }
            Self::Refused(_) => Remediation::new("The broker rejected the session.")
                .command("Check credentials", "echo \"$MQTT_USERNAME\"")
                .alternative("Set MQTT_USERNAME / MQTT_PASSWORD to an account the broker accepts."),
            Self::ConnectTimeout(_) => Remediation::new("The broker accepted TCP but never answered.")
                .command("Verbose run", "RUST_LOG=rumqttc=debug airlab collect")
                .alternative("Raise bus.connect_timeout_secs in the config file."),
            Self::Subscribe { .. } | Self::Disconnect(_) | Self::Closed => {
                Remediation::new("The broker connection dropped mid-episode. Retry.")
                    .command("Watch raw traffic", "airlab discover")
            }
        }
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Lock contention (SQLITE_BUSY / SQLITE_LOCKED). The only retryable class.
    #[error("Database is locked: {0}")]
    Busy(String),

    /// Generic database failure (schema mismatch, constraint, I/O)
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database corruption detected: {details}")]
    Corruption { details: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Disk full: {0}")]
    DiskFull(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Busy(_) => Remediation::new(
                "Another process kept the database locked through every write attempt.",
            )
            .command("Find lock holders", "fuser \"$DB_PATH\"")
            .alternative("Stagger cron schedules of tools writing to the same database."),
            Self::Database(_) => Remediation::new("Database operation failed. Check the schema and retry.")
                .command("Inspect schema", "sqlite3 \"$DB_PATH\" .schema")
                .alternative("Point DB_PATH at a fresh file to let the collector create the schema."),
            Self::Corruption { .. } => Remediation::new(
                "Database corruption detected. Automatic recovery is not possible.",
            )
            .command("Integrity check", "sqlite3 \"$DB_PATH\" 'PRAGMA integrity_check'")
            .alternative("Restore the database from a backup."),
            Self::PermissionDenied(_) => Remediation::new("The database file is not writable.")
                .command("Inspect permissions", "ls -la \"$DB_PATH\"")
                .alternative("Run the collector as the user owning the database."),
            Self::DiskFull(_) => Remediation::new("The filesystem holding the database is full.")
                .command("Check free space", "df -h \"$(dirname \"$DB_PATH\")\""),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let message = err.to_string();
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Busy(message),
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
                Self::Corruption { details: message }
            }
            Some(ErrorCode::PermissionDenied | ErrorCode::ReadOnly | ErrorCode::CannotOpen) => {
                Self::PermissionDenied(message)
            }
            Some(ErrorCode::DiskFull) => Self::DiskFull(message),
            _ => Self::Database(message),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => Remediation::new(format!("Make {path} readable or drop --config."))
                .command("Inspect file", format!("ls -la {path}")),
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Show defaults", "airlab --help"),
            Self::Invalid(_) => Remediation::new("Correct the offending config value.")
                .command("Show defaults", "airlab --help"),
        }
    }
}
