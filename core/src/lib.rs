//! Core functionality for the Tether project
//!
//! A [`ProcessHandle`] launches one child process, tees its output into any
//! number of sinks, and lets the parent wait for control messages the child
//! prints on stdout (readiness and key/value variables) before the child
//! exits. Handles are created by a [`Shell`], which owns shared options, the
//! error policy, and cleanup of every child it launched.
//!
//! Children speak the protocol through [`child::send_ready`] and
//! [`child::send_vars`].
//!
//! Process launch and signalling are Unix only.

pub mod child;
pub mod config;
pub mod decoder;
pub mod error;
pub mod handle;
pub mod handshake;
mod mux;
pub mod pipe;
pub mod process;
mod reaper;
pub mod shell;
pub mod sink;


// Re-export schema types for convenience
pub use schema::*;

pub use config::{load_options_from_toml_path, load_options_from_toml_str, ShellOptions};
pub use error::{Result, TetherError};
pub use handle::{HandleOptions, HandleState, ProcessHandle};
pub use handshake::{Handshake, HandshakeState};
pub use nix::sys::signal::Signal;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use shell::Shell;
pub use sink::{shared, CaptureBuffer, FileSink, NopCloser, ParentStream, SharedSink, WriteCloser};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level` when set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::TetherError::Configuration(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
