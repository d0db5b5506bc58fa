//! Schema definitions for Tether
//!
//! This crate contains the wire-level contract shared by a parent that
//! supervises a child process and the child itself: the control messages a
//! child embeds in its stdout, and the environment conventions the parent sets
//! at launch. All wire types implement JSON Schema generation for external
//! consumption.

pub mod control;
pub mod env;


pub use control::{ControlMessage, ProtocolError, MSG_PREFIX};
pub use env::{ENV_CHILD_OUTPUT_DIR, ENV_EXIT_AFTER, ENV_PROPAGATE_CHILD_OUTPUT, ENV_WATCH_PARENT};
