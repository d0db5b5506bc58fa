//! Shell: the owner of every handle it creates
//!
//! A shell holds the options and base environment for new handles, the error
//! policy every handle reports to, and the cleanup lock. Once [`Shell::cleanup`]
//! begins no handle of this shell can launch a process; the lock is held for
//! the whole of process creation so a launch never races cleanup.

use crate::config::ShellOptions;
use crate::handle::ProcessHandle;
use crate::handshake::Handshake;
use crate::process;
use crate::{Result, TetherError};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Errors a shell retains until [`Shell::take_errors`] drains them
pub const MAX_RECORDED_ERRORS: usize = 32;

/// Creates process handles and cleans up after them
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    options: ShellOptions,
    vars: HashMap<String, String>,
    cleanup: Mutex<Launches>,
    errors: Mutex<Vec<TetherError>>,
}

/// State guarded by the cleanup lock
#[derive(Default)]
pub(crate) struct Launches {
    shutting_down: bool,
    handles: Vec<Arc<Handshake>>,
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("options", &self.inner.options)
            .field("vars", &self.inner.vars.len())
            .finish()
    }
}

impl Shell {
    /// Create a shell whose handles start from the parent's current environment
    pub fn new(options: ShellOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_vars(options, std::env::vars().collect()))
    }

    /// Create a shell configured from `TETHER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ShellOptions::from_env()?)
    }

    /// Create a shell with an explicit base environment
    pub fn with_vars(options: ShellOptions, vars: HashMap<String, String>) -> Self {
        Self {
            inner: Arc::new(ShellInner {
                options,
                vars,
                cleanup: Mutex::new(Launches::default()),
                errors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Options shared by every handle of this shell
    pub fn options(&self) -> &ShellOptions {
        &self.inner.options
    }

    /// Base environment copied into each new handle
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.inner.vars
    }

    /// Create a handle for `name`.
    ///
    /// A bare name is looked up on `PATH`; anything containing a path
    /// separator is used as given.
    pub fn cmd<I, S>(&self, name: &str, args: I) -> Result<ProcessHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ok()?;
        let result = resolve_executable(name).and_then(|path| {
            ProcessHandle::new(
                self.clone(),
                self.inner.vars.clone(),
                path,
                args.into_iter().map(Into::into).collect(),
            )
        });
        if let Err(e) = &result {
            self.handle_error(e);
        }
        result
    }

    /// Register a handle's monitor so cleanup can find it
    pub(crate) fn register(&self, handshake: Arc<Handshake>) -> Result<()> {
        let mut launches = self.launch_guard()?;
        launches.handles.push(handshake);
        Ok(())
    }

    /// Hold the cleanup lock, failing if cleanup has begun
    pub(crate) fn launch_guard(&self) -> Result<MutexGuard<'_, Launches>> {
        let launches = self.lock_launches();
        if launches.shutting_down {
            return Err(TetherError::OwnerShuttingDown);
        }
        Ok(launches)
    }

    fn lock_launches(&self) -> MutexGuard<'_, Launches> {
        self.inner
            .cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_errors(&self) -> MutexGuard<'_, Vec<TetherError>> {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an error reported by one of this shell's handles.
    ///
    /// At most [`MAX_RECORDED_ERRORS`] are kept. The oldest are dropped first,
    /// except the first one while halting, since that is the halt reason.
    pub fn handle_error(&self, err: &TetherError) {
        error!("[{}] {}", err.code(), err);
        let mut errors = self.lock_errors();
        if errors.len() >= MAX_RECORDED_ERRORS {
            let oldest = usize::from(self.inner.options.halt_on_error);
            errors.remove(oldest);
        }
        errors.push(err.clone());
    }

    /// Readiness guard consulted before every handle operation.
    ///
    /// With `halt_on_error` set, fails while a reported error is pending.
    pub fn ok(&self) -> Result<()> {
        if !self.inner.options.halt_on_error {
            return Ok(());
        }
        match self.lock_errors().first() {
            Some(first) => Err(TetherError::Halted(first.to_string())),
            None => Ok(()),
        }
    }

    /// Drain every recorded error, clearing a halt
    pub fn take_errors(&self) -> Vec<TetherError> {
        std::mem::take(&mut *self.lock_errors())
    }

    /// Whether cleanup has begun
    pub fn is_shutting_down(&self) -> bool {
        self.lock_launches().shutting_down
    }

    /// Stop accepting launches, send `sig` to every running child, and wait
    /// until each one has been reaped.
    ///
    /// Calling it again only waits for children still being reaped.
    pub async fn cleanup(&self, sig: Signal) {
        let running: Vec<Arc<Handshake>> = {
            let mut launches = self.lock_launches();
            launches.shutting_down = true;
            launches
                .handles
                .iter()
                .filter(|h| h.pid().is_some())
                .cloned()
                .collect()
        };
        info!("Cleaning up {} child process(es)", running.len());

        for handshake in &running {
            if !handshake.is_running() {
                continue;
            }
            if let Some(pid) = handshake.pid() {
                if let Err(e) = process::signal(pid, sig) {
                    warn!("Failed to signal process {} during cleanup: {}", pid, e);
                }
            }
        }
        for handshake in &running {
            if let Err(e) = handshake.await_exit().await {
                debug!("Stopped waiting for a child during cleanup: {}", e);
            }
        }
    }
}

fn resolve_executable(name: &str) -> Result<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(name));
    }
    which::which(name).map_err(|e| {
        debug!("Lookup of '{}' failed: {}", name, e);
        TetherError::ExecutableNotFound(name.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(halt_on_error: bool) -> Shell {
        Shell::with_vars(
            ShellOptions {
                halt_on_error,
                ..Default::default()
            },
            HashMap::new(),
        )
    }

    #[test]
    fn test_resolve_executable() {
        assert_eq!(
            resolve_executable("/bin/sh").unwrap(),
            PathBuf::from("/bin/sh")
        );
        assert_eq!(
            resolve_executable("./local-tool").unwrap(),
            PathBuf::from("./local-tool")
        );
        assert!(resolve_executable("sh").unwrap().is_absolute());
        assert_eq!(
            resolve_executable("no-such-binary-4242").unwrap_err(),
            TetherError::ExecutableNotFound("no-such-binary-4242".to_string())
        );
    }

    #[test]
    fn test_halt_on_error() {
        let sh = shell(true);
        assert!(sh.ok().is_ok());
        sh.handle_error(&TetherError::ProcessExited);
        assert_eq!(
            sh.ok(),
            Err(TetherError::Halted("process exited".to_string()))
        );
        assert_eq!(sh.take_errors(), vec![TetherError::ProcessExited]);
        assert!(sh.ok().is_ok());
    }

    #[test]
    fn test_errors_are_recorded_without_halting() {
        let sh = shell(false);
        sh.handle_error(&TetherError::DidNotCallStart);
        assert!(sh.ok().is_ok());
        assert_eq!(sh.take_errors().len(), 1);
        assert!(sh.take_errors().is_empty());
    }

    #[test]
    fn test_recorded_errors_are_capped() {
        let sh = shell(false);
        for _ in 0..MAX_RECORDED_ERRORS {
            sh.handle_error(&TetherError::ProcessExited);
        }
        sh.handle_error(&TetherError::DidNotCallStart);
        let errors = sh.take_errors();
        assert_eq!(errors.len(), MAX_RECORDED_ERRORS);
        assert_eq!(errors.last(), Some(&TetherError::DidNotCallStart));

        // While halting, the first error is the one reported.
        let sh = shell(true);
        sh.handle_error(&TetherError::AlreadyStarted);
        for _ in 0..MAX_RECORDED_ERRORS {
            sh.handle_error(&TetherError::ProcessExited);
        }
        assert_eq!(
            sh.ok(),
            Err(TetherError::Halted("already called start".to_string()))
        );
        assert_eq!(sh.take_errors().len(), MAX_RECORDED_ERRORS);
    }

    #[test]
    fn test_cmd_reports_missing_executable() {
        let sh = shell(false);
        let err = sh.cmd("no-such-binary-4242", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, TetherError::ExecutableNotFound(_)));
        assert_eq!(sh.take_errors(), vec![err]);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_new_handles() {
        let sh = shell(false);
        sh.cleanup(Signal::SIGTERM).await;
        assert!(sh.is_shutting_down());
        assert_eq!(
            sh.cmd("/bin/sh", ["-c", "true"]).unwrap_err(),
            TetherError::OwnerShuttingDown
        );
    }

    #[test]
    fn test_new_validates_options() {
        let options = ShellOptions {
            child_output_dir: Some(PathBuf::new()),
            ..Default::default()
        };
        assert!(matches!(Shell::new(options), Err(TetherError::Validation(_))));
    }
}
