use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`ProvisionError`].
///
/// Callers switch on the kind instead of inspecting concrete variants:
/// transport failures may be retried by a higher layer, command failures
/// trigger state-local rollback, protocol errors mean the artifact or input is
/// bad, and fatal errors abort the whole provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Command,
    Protocol,
    Fatal,
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid cache source: {0}")]
    InvalidSource(String),

    #[error("stream unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt payload: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout waiting for reboot after {0:?}")]
    RebootTimeout(Duration),

    #[error("invalid partition number {0}")]
    InvalidPartition(String),

    #[error("failure while reverting, {original}: {revert}")]
    Revert {
        original: Box<ProvisionError>,
        revert: Box<ProvisionError>,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ProvisionError>),

    #[error("operation error: {0}")]
    Operation(String),

    #[error("{context}, {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProvisionError>,
    },
}

fn join_errors(errors: &[ProvisionError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Ssh(_) | Self::Transport(_) | Self::Unavailable(_) => {
                ErrorKind::Transport
            }
            Self::CommandFailed { .. }
            | Self::Validation(_)
            | Self::NotFound(_)
            | Self::Operation(_) => ErrorKind::Command,
            Self::InvalidSource(_) | Self::Corrupt(_) => ErrorKind::Protocol,
            Self::Config(_)
            | Self::RebootTimeout(_)
            | Self::InvalidPartition(_)
            | Self::Revert { .. } => ErrorKind::Fatal,
            Self::Multiple(errors) => {
                if errors.iter().any(|e| e.kind() == ErrorKind::Fatal) {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Command
                }
            }
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// Returns true when no further provisioning step may run after this error.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Prefixes the error with a human readable message, keeping its kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error below any context wrappers.
    pub fn root(&self) -> &ProvisionError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Adds [`ProvisionError::context`] to results.
pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

pub type Error = ProvisionError;
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_context() {
        let err = ProvisionError::InvalidPartition("7".to_string())
            .context("failed to get root part number");
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(
            err.to_string(),
            "failed to get root part number, invalid partition number 7"
        );
        assert!(matches!(err.root(), ProvisionError::InvalidPartition(_)));
    }

    #[test]
    fn test_revert_is_fatal() {
        let err = ProvisionError::Revert {
            original: Box::new(ProvisionError::Validation("boom".to_string())),
            revert: Box::new(ProvisionError::Transport("gone".to_string())),
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "failure while reverting, boom: Transport error: gone"
        );
    }

    #[test]
    fn test_multiple_joins_messages() {
        let err = ProvisionError::Multiple(vec![
            ProvisionError::Validation("kernel".to_string()),
            ProvisionError::Validation("root".to_string()),
        ]);
        assert_eq!(err.to_string(), "kernel; root");
        assert_eq!(err.kind(), ErrorKind::Command);
    }

    #[test]
    fn test_protocol_and_transport_are_distinct() {
        let corrupt = ProvisionError::Corrupt("bad proto".to_string());
        let short = ProvisionError::Unavailable("short read".to_string());
        assert_eq!(corrupt.kind(), ErrorKind::Protocol);
        assert_eq!(short.kind(), ErrorKind::Transport);
    }
}
