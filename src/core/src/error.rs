use thiserror::Error;

/// Hostlink error types
#[derive(Error, Debug)]
pub enum HostlinkError {
    /// A worker's host prerequisites could not be installed
    #[error("error setting up dependencies for '{process}': {message}")]
    DependencyError { process: String, message: String },

    /// An external command failed
    #[error("command failed: {command}: {message}")]
    CommandError { command: String, message: String },

    /// A supervised worker failed
    #[error("{name}: {message}")]
    ProcessError { name: String, message: String },

    /// A worker is not running
    #[error("{0} is not running")]
    NotRunning(String),

    /// Virtual network error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Malformed packet or protocol message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Daemon lifecycle error
    #[error("Daemon error: {0}")]
    DaemonError(String),

    /// File watching error
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl HostlinkError {
    /// Build a [`HostlinkError::CommandError`] from an argv slice.
    pub fn command(args: &[&str], message: impl Into<String>) -> Self {
        HostlinkError::CommandError {
            command: args.join(" "),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HostlinkError {
    fn from(err: serde_json::Error) -> Self {
        HostlinkError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for HostlinkError {
    fn from(err: serde_yaml::Error) -> Self {
        HostlinkError::SerializationError(err.to_string())
    }
}

/// Result type alias for hostlink operations
pub type Result<T> = std::result::Result<T, HostlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_error_display() {
        let error = HostlinkError::DependencyError {
            process: "vmnet".to_string(),
            message: "sudo: a password is required".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "error setting up dependencies for 'vmnet': sudo: a password is required"
        );
    }

    #[test]
    fn test_command_error_helper() {
        let error = HostlinkError::command(&["sudo", "mkdir", "-p", "/opt/hostlink"], "exit status 1");
        assert_eq!(
            error.to_string(),
            "command failed: sudo mkdir -p /opt/hostlink: exit status 1"
        );
    }

    #[test]
    fn test_process_error_display() {
        let error = HostlinkError::ProcessError {
            name: "gvproxy".to_string(),
            message: "listener closed".to_string(),
        };
        assert_eq!(error.to_string(), "gvproxy: listener closed");
    }

    #[test]
    fn test_not_running_display() {
        let error = HostlinkError::NotRunning("inotify".to_string());
        assert_eq!(error.to_string(), "inotify is not running");
    }

    #[test]
    fn test_timeout_error_display() {
        let error = HostlinkError::TimeoutError("daemon did not stop within 60s".to_string());
        assert_eq!(error.to_string(), "Timeout: daemon did not stop within 60s");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: HostlinkError = io_error.into();
        assert!(matches!(error, HostlinkError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: HostlinkError = result.unwrap_err().into();
        assert!(matches!(error, HostlinkError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: HostlinkError = result.unwrap_err().into();
        assert!(matches!(error, HostlinkError::SerializationError(_)));
    }

    #[test]
    fn test_other_error_display() {
        let error = HostlinkError::Other("Unknown error occurred".to_string());
        assert_eq!(error.to_string(), "Unknown error occurred");
    }
}
