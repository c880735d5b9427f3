//! Error types for the Sidero integration harness

use thiserror::Error;

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Local filesystem or subprocess I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid harness configuration (flags, CIDR, registry mirrors)
    #[error("configuration error: {0}")]
    Config(String),

    /// Bootstrap cluster provisioning error
    #[error("provision error: {0}")]
    Provision(String),

    /// Cluster API / Sidero installation error
    #[error("CAPI installation error: {0}")]
    CapiInstallation(String),

    /// External command exited unsuccessfully
    #[error("command failed: {0}")]
    Command(String),

    /// A polling loop ran out of time
    #[error("timeout waiting for {operation}: {message}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Last observed reason the condition was not met
        message: String,
    },

    /// An integration test assertion did not hold
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provisioning error with the given message
    pub fn provision(msg: impl Into<String>) -> Self {
        Self::Provision(msg.into())
    }

    /// Create a CAPI installation error with the given message
    pub fn capi_installation(msg: impl Into<String>) -> Self {
        Self::CapiInstallation(msg.into())
    }

    /// Create a command failure error with the given message
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create an assertion failure with the given message
    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::Assertion(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation Through a Harness Run
    // ==========================================================================

    /// Story: bad flags are rejected before any VM is started
    #[test]
    fn story_config_errors_stop_the_run_early() {
        let err = Error::config("unexpected registry mirror format: \"docker.io\"");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("docker.io"));

        match Error::config("any message") {
            Error::Config(msg) => assert_eq!(msg, "any message"),
            _ => panic!("Expected Config variant"),
        }
    }

    /// Story: a polling loop that never converges names what it waited for
    #[test]
    fn story_timeouts_name_the_operation() {
        let err = Error::timeout("servers to register", "3 != 4");
        let msg = err.to_string();
        assert!(msg.contains("servers to register"));
        assert!(msg.contains("3 != 4"));
    }

    /// Story: failed assertions are reported as test failures
    #[test]
    fn story_assertion_errors_describe_mismatch() {
        let err = Error::assertion("server \"abc\" is not ready");
        assert!(err.to_string().starts_with("assertion failed"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn read() -> Result<(), Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "talosctl"))?;
            Ok(())
        }
        let err = read().unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn kube_errors_convert_with_question_mark() {
        fn get() -> Result<(), Error> {
            Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "environments.metal.sidero.dev \"default\" not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            }))?;
            Ok(())
        }
        let err = get().unwrap_err();
        assert!(matches!(err, Error::Kube(_)));
        assert!(err.to_string().contains("not found"));
    }
}
