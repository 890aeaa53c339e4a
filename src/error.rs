//! Error types for the sandbox runtime.

use thiserror::Error;

/// Main error type for the sandbox runtime.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("invalid configuration ({field}): {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("sandbox already initialized with a different configuration")]
    AlreadyInitialized,

    #[error("another sandbox manager is live in this process")]
    ManagerAlreadyLive,

    #[error("failed to bind {which} proxy on port {port}: {cause}")]
    ProxyBind {
        which: &'static str,
        port: u16,
        cause: std::io::Error,
    },

    #[error("no supported sandbox host detected")]
    HostNotSupported,

    #[error("required tool missing: {tool}")]
    ToolchainMissing { tool: String },

    #[error("pre-command failed with exit code {exit_code}")]
    PreCommandFailed { exit_code: i32 },

    #[error("sandbox manager not initialized")]
    NotInitialized,

    #[error("unsupported path pattern '{pattern}': {reason}")]
    InvalidPathPattern { pattern: String, reason: String },

    #[error("internal error: {context}")]
    Internal { context: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Build an `InvalidConfig` error for a named field.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SandboxError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build an `Internal` error with context.
    pub fn internal(context: impl Into<String>) -> Self {
        SandboxError::Internal {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
