//! Core error types and utilities

use std::process::ExitStatus;
use thiserror::Error;

/// Errors produced by process handles and their owning shell
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TetherError {
    /// `start` (or a capture helper) was called a second time
    #[error("already called start")]
    AlreadyStarted,

    /// `wait` was called a second time, or an await came after it
    #[error("already called wait")]
    AlreadyCalledWait,

    /// The operation needs a launched process
    #[error("did not call start")]
    DidNotCallStart,

    /// The child exited before the awaited condition held
    #[error("process exited")]
    ProcessExited,

    /// Both literal stdin text and a stdin pipe were requested
    #[error("cannot both set stdin text and open a stdin pipe")]
    ConflictingStdinConfiguration,

    /// The parent's own stdout was passed as a closable sink
    #[error("wrap the parent's stdout in NopCloser to prevent it from being closed")]
    CloseParentStdout,

    /// The parent's own stderr was passed as a closable sink
    #[error("wrap the parent's stderr in NopCloser to prevent it from being closed")]
    CloseParentStderr,

    /// The owning shell has begun cleanup
    #[error("shell cleanup has begun")]
    OwnerShuttingDown,

    /// The shell halts after an earlier error; carries that error
    #[error("shell halted after error: {0}")]
    Halted(String),

    /// No executable with this name on `PATH`
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    /// The OS refused to launch the child
    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    /// Sending a signal failed for a reason other than `ESRCH`
    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    /// Waiting on the child failed
    #[error("Process wait error: {0}")]
    ProcessWait(String),

    /// The child exited unsuccessfully, including death by signal
    #[error("process exited unsuccessfully: {0}")]
    NonZeroExit(ExitStatus),

    /// A control line on stdout could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Copying child output into a sink failed
    #[error("Stream copy error: {0}")]
    StreamCopy(String),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Options could not be loaded
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Options were loaded but are invalid
    #[error("Validation error: {0}")]
    Validation(String),
}

impl TetherError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            TetherError::AlreadyStarted => "TETHER001",
            TetherError::AlreadyCalledWait => "TETHER002",
            TetherError::DidNotCallStart => "TETHER003",
            TetherError::ProcessExited => "TETHER004",
            TetherError::ConflictingStdinConfiguration => "TETHER005",
            TetherError::CloseParentStdout => "TETHER006",
            TetherError::CloseParentStderr => "TETHER007",
            TetherError::OwnerShuttingDown => "TETHER008",
            TetherError::Halted(_) => "TETHER009",
            TetherError::ExecutableNotFound(_) => "TETHER010",
            TetherError::ProcessSpawn(_) => "TETHER011",
            TetherError::ProcessSignal(_) => "TETHER012",
            TetherError::ProcessWait(_) => "TETHER013",
            TetherError::NonZeroExit(_) => "TETHER014",
            TetherError::Protocol(_) => "TETHER015",
            TetherError::StreamCopy(_) => "TETHER016",
            TetherError::Io(_) => "TETHER017",
            TetherError::Serialization(_) => "TETHER018",
            TetherError::Configuration(_) => "TETHER019",
            TetherError::Validation(_) => "TETHER020",
        }
    }

    /// Whether this is a misuse of the handle API (wrong state window)
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            TetherError::AlreadyStarted
                | TetherError::AlreadyCalledWait
                | TetherError::DidNotCallStart
                | TetherError::ConflictingStdinConfiguration
                | TetherError::CloseParentStdout
                | TetherError::CloseParentStderr
        )
    }

    /// Whether this is a plain unsuccessful exit of the child
    pub fn is_exit_error(&self) -> bool {
        matches!(self, TetherError::NonZeroExit(_))
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Serialization(err.to_string())
    }
}

impl From<schema::ProtocolError> for TetherError {
    fn from(err: schema::ProtocolError) -> Self {
        TetherError::Protocol(err.to_string())
    }
}
