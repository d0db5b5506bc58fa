//! Environment variable conventions
//!
//! The parent sets [`ENV_WATCH_PARENT`] and [`ENV_EXIT_AFTER`] on every child
//! it launches. They are interpreted by a cooperating runtime inside the
//! child; the parent never checks whether the child honours them.

/// Present (set to `"1"`) unless the handle opted out of parent watching.
/// A cooperating child exits when its parent goes away.
pub const ENV_WATCH_PARENT: &str = "TETHER_WATCH_PARENT";

/// Present only when a non-zero self-exit duration is configured.
/// The value uses the `Debug` format of `std::time::Duration`, e.g. `1.5s`.
pub const ENV_EXIT_AFTER: &str = "TETHER_EXIT_AFTER";

/// Parent-side: directory in which to record every child's stdout/stderr
pub const ENV_CHILD_OUTPUT_DIR: &str = "TETHER_CHILD_OUTPUT_DIR";

/// Parent-side: when `1`/`true`, child output is copied to the parent's own streams
pub const ENV_PROPAGATE_CHILD_OUTPUT: &str = "TETHER_PROPAGATE_CHILD_OUTPUT";
