//! Shared handshake state between a handle, its decoder and its reaper
//!
//! One [`Handshake`] exists per process handle. The decoder publishes
//! readiness and variables, the reaper publishes exit, and any number of
//! waiters block until their predicate holds. Every change notifies every
//! waiter; each waiter re-checks its own predicate after waking.

use crate::{Result, TetherError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tokio::sync::watch;

/// Snapshot of what the parent has learned about its child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeState {
    /// The reaper has observed exit and the output streams are drained
    pub exited: bool,
    /// The child sent a `ready` message
    pub ready: bool,
    /// Union of every `vars` message, later values winning
    pub vars: HashMap<String, String>,
}

/// Monitor guarding a [`HandshakeState`]
#[derive(Debug)]
pub struct Handshake {
    state: watch::Sender<HandshakeState>,
    pid: OnceLock<u32>,
    reaped: AtomicBool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// Create the monitor for a handle that has not started yet
    pub fn new() -> Self {
        let (state, _) = watch::channel(HandshakeState::default());
        Self {
            state,
            pid: OnceLock::new(),
            reaped: AtomicBool::new(false),
        }
    }

    /// Current state
    pub fn snapshot(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    pub(crate) fn mark_ready(&self) {
        self.state.send_modify(|s| s.ready = true);
    }

    pub(crate) fn merge_vars(&self, vars: BTreeMap<String, String>) {
        self.state.send_modify(|s| s.vars.extend(vars));
    }

    pub(crate) fn mark_exited(&self) {
        self.state.send_modify(|s| s.exited = true);
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    /// OS pid, once the process has been launched
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// The OS has reported exit; the pid may already belong to someone else
    pub(crate) fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    /// Launched and not yet reaped.
    ///
    /// The reaper sets the flag right after the OS wait returns, so a `true`
    /// observed at that instant may refer to a pid that was just released.
    pub fn is_running(&self) -> bool {
        self.pid().is_some() && !self.reaped.load(Ordering::SeqCst) && !self.state.borrow().exited
    }

    /// Wait until the child is ready or has exited.
    ///
    /// Fails with [`TetherError::ProcessExited`] when exit came without readiness.
    pub async fn await_ready(&self) -> Result<()> {
        let state = self.await_state(|s| s.ready || s.exited).await?;
        if !state.ready {
            return Err(TetherError::ProcessExited);
        }
        Ok(())
    }

    /// Wait until every key is present or the child has exited.
    ///
    /// Returns only the requested keys.
    pub async fn await_vars(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let has_all = |s: &HandshakeState| keys.iter().all(|k| s.vars.contains_key(*k));
        let state = self.await_state(|s| s.exited || has_all(s)).await?;
        if !has_all(&state) {
            return Err(TetherError::ProcessExited);
        }
        Ok(keys
            .iter()
            .filter_map(|k| state.vars.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect())
    }

    /// Wait until the reaper has published exit
    pub async fn await_exit(&self) -> Result<()> {
        self.await_state(|s| s.exited).await.map(|_| ())
    }

    async fn await_state<F>(&self, mut done: F) -> Result<HandshakeState>
    where
        F: FnMut(&HandshakeState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| done(s))
            .await
            .map_err(|_| TetherError::ProcessWait("handshake state dropped".to_string()))?;
        Ok(state.clone())
    }
}
