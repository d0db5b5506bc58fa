//! Unix process launch and signalling
//!
//! ## Error Handling
//!
//! - Spawn failures are reported as [`TetherError::ProcessSpawn`] carrying the
//!   OS message verbatim
//! - `ESRCH` when signalling means the process already finished; that race is
//!   treated as success
//! - Any other signalling failure is a [`TetherError::ProcessSignal`]

use crate::{Result, TetherError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error};

/// Everything needed to launch one child
#[derive(Debug)]
pub struct LaunchSpec<'a> {
    /// Resolved executable path
    pub path: &'a Path,
    /// Full argument vector; `args[0]` becomes the child's `argv[0]`
    pub args: &'a [String],
    /// Complete environment of the child (nothing else is inherited)
    pub env: &'a HashMap<String, String>,
    /// Open a pipe for stdin (otherwise the null device)
    pub stdin: bool,
    /// Open a pipe for stdout (otherwise the null device)
    pub stdout: bool,
    /// Open a pipe for stderr (otherwise the null device)
    pub stderr: bool,
}

/// A launched child process
#[derive(Debug)]
pub struct ChildProcess {
    /// The process ID of the spawned process
    pid: Pid,
    /// The underlying Child handle for waiting and status checking
    child: Child,
}

fn stdio(piped: bool) -> Stdio {
    if piped {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

/// Launch a child process as described by `spec`
pub fn spawn(spec: &LaunchSpec<'_>) -> Result<ChildProcess> {
    debug!("Spawning process: {} {:?}", spec.path.display(), spec.args);

    let mut command = Command::new(spec.path);
    if let Some((arg0, rest)) = spec.args.split_first() {
        command.arg0(arg0);
        command.args(rest);
    }
    command
        .env_clear()
        .envs(spec.env)
        .stdin(stdio(spec.stdin))
        .stdout(stdio(spec.stdout))
        .stderr(stdio(spec.stderr));

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", spec.path.display(), e);
        TetherError::ProcessSpawn(format!("{}: {}", spec.path.display(), e))
    })?;

    // tokio::process::Child::id() is None only once the child has been reaped
    let raw_pid = child
        .id()
        .ok_or_else(|| TetherError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("Successfully spawned process {}", pid);

    Ok(ChildProcess { pid, child })
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the process to exit and return its exit status
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|e| {
            TetherError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Take the stdin handle, if it was piped
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the stdout handle for async reading, if available
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle for async reading, if available
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

/// Send `sig` to process `pid`
///
/// `ESRCH` (No such process) is treated as success since it means the
/// process has already exited.
pub fn signal(pid: u32, sig: Signal) -> Result<()> {
    let pid = Pid::from_raw(pid as i32);
    debug!("Sending {} to process {}", sig, pid);

    match kill(pid, sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => {
            debug!("Process {} already exited", pid);
            Ok(())
        }
        Err(e) => {
            error!("Failed to send {} to process {}: {}", sig, pid, e);
            Err(TetherError::ProcessSignal(format!(
                "Failed to send {} to process {}: {}",
                sig, pid, e
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> (Vec<String>, HashMap<String, String>) {
        let args = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        (args, HashMap::new())
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let (args, env) = sh("exit 3");
        let spec = LaunchSpec {
            path: Path::new("/bin/sh"),
            args: &args,
            env: &env,
            stdin: false,
            stdout: false,
            stderr: false,
        };
        let mut child = spawn(&spec).expect("Failed to spawn sh");
        assert!(child.pid() > 0);
        assert!(child.take_stdout().is_none());
        let status = child.wait().await.expect("Failed to wait for process");
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_environment_is_exactly_the_given_map() {
        use tokio::io::AsyncReadExt;

        let (args, mut env) = sh("echo \"$ONLY_THIS:$HOME\"");
        env.insert("ONLY_THIS".to_string(), "yes".to_string());
        let spec = LaunchSpec {
            path: Path::new("/bin/sh"),
            args: &args,
            env: &env,
            stdin: false,
            stdout: true,
            stderr: false,
        };
        let mut child = spawn(&spec).expect("Failed to spawn sh");
        let mut out = String::new();
        child
            .take_stdout()
            .expect("stdout piped")
            .read_to_string(&mut out)
            .await
            .unwrap();
        child.wait().await.unwrap();
        assert_eq!(out, "yes:\n");
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let args = vec!["/nonexistent/command_12345".to_string()];
        let env = HashMap::new();
        let spec = LaunchSpec {
            path: Path::new("/nonexistent/command_12345"),
            args: &args,
            env: &env,
            stdin: false,
            stdout: false,
            stderr: false,
        };
        match spawn(&spec) {
            Err(TetherError::ProcessSpawn(_)) => {} // Expected error type
            other => panic!("Expected ProcessSpawn error, got: {:?}", other.map(|c| c.pid())),
        }
    }

    #[tokio::test]
    async fn test_signal_finished_process_is_ok() {
        let (args, env) = sh("exit 0");
        let spec = LaunchSpec {
            path: Path::new("/bin/sh"),
            args: &args,
            env: &env,
            stdin: false,
            stdout: false,
            stderr: false,
        };
        let mut child = spawn(&spec).unwrap();
        let pid = child.pid();
        child.wait().await.unwrap();

        // Reaped: the pid is gone, so ESRCH is expected and tolerated.
        assert!(signal(pid, Signal::SIGTERM).is_ok());
    }
}
