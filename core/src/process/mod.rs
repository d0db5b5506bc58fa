//! OS process boundary
//!
//! Launching and signalling child processes. Everything above this module
//! (multiplexing, handshake, reaping) is platform independent; everything
//! that touches pids and signals lives here.
//!
//! ## Platform Support
//!
//! - **Unix**: launch via `tokio::process`, signals via `nix`

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
