//! Process handle: one child process from configuration to exit
//!
//! A handle moves through three states:
//!
//! - **Configuring**: environment, options, stdin and output sinks may be set
//! - **Started**: the child runs; the parent may await readiness or vars,
//!   signal it, or wait for it
//! - **Exited**: the reaper has observed exit, drained output and released
//!   every registered sink
//!
//! Each public operation first consults the owning shell's readiness guard
//! and afterwards reports any error to the shell, unless the error is a
//! non-zero exit the handle was told to accept.
//!
//! All operations that launch or wait must run inside a Tokio runtime.

use crate::decoder::ControlDecoder;
use crate::handshake::Handshake;
use crate::mux;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::process::{self, LaunchSpec};
use crate::reaper::{spawn_reaper, Copiers};
use crate::shell::Shell;
use crate::sink::{lock_sink, shared, CaptureBuffer, ParentStream, ResourceRegistry, SharedSink};
use crate::{Result, TetherError};
use nix::sys::signal::Signal;
use schema::{ENV_EXIT_AFTER, ENV_WATCH_PARENT};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::debug;

/// Per-handle launch options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleOptions {
    /// Tee the child's output to the parent's stdout/stderr
    pub propagate_output: bool,
    /// Record the child's output into timestamped files in this directory
    pub output_dir: Option<PathBuf>,
    /// Treat a non-zero exit status as success
    pub exit_error_is_ok: bool,
    /// Do not ask the child to exit when the parent does
    pub ignore_parent_exit: bool,
    /// Ask the child to exit after this long; zero means never
    pub exit_after: Duration,
}

/// Lifecycle state of a [`ProcessHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Not started; configuration may still change
    Configuring,
    /// Launched and not yet reaped
    Started,
    /// Reaped, or launch failed; nothing runs and nothing will
    Exited,
}

struct StdinPipe {
    writer: PipeWriter,
    reader: Option<PipeReader>,
}

/// Handle to a child process
pub struct ProcessHandle {
    path: PathBuf,
    args: Vec<String>,
    /// Environment of the child, exactly; nothing else is inherited
    pub vars: HashMap<String, String>,
    /// Launch options; changes after start have no effect
    pub opts: HandleOptions,

    stdin_text: Option<String>,
    stdin_pipe: Option<StdinPipe>,
    stdout_sinks: Vec<SharedSink>,
    stderr_sinks: Vec<SharedSink>,
    resources: ResourceRegistry,

    handshake: Arc<Handshake>,
    called_start: bool,
    called_wait: bool,
    started: bool,
    completion: Option<oneshot::Receiver<Result<()>>>,
    last_error: Option<TetherError>,
    shell: Shell,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("opts", &self.opts)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl ProcessHandle {
    pub(crate) fn new(
        shell: Shell,
        vars: HashMap<String, String>,
        path: PathBuf,
        args: Vec<String>,
    ) -> Result<Self> {
        let handshake = Arc::new(Handshake::new());
        shell.register(handshake.clone())?;

        let opts = HandleOptions {
            propagate_output: shell.options().propagate_child_output,
            output_dir: shell.options().child_output_dir.clone(),
            ..Default::default()
        };
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(path.to_string_lossy().into_owned());
        argv.extend(args);

        Ok(Self {
            path,
            args: argv,
            vars,
            opts,
            stdin_text: None,
            stdin_pipe: None,
            stdout_sinks: Vec::new(),
            stderr_sinks: Vec::new(),
            resources: ResourceRegistry::new(),
            handshake,
            called_start: false,
            called_wait: false,
            started: false,
            completion: None,
            last_error: None,
            shell,
        })
    }

    /// Resolved executable path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Argument vector; the first element is the executable path
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandleState {
        if !self.called_start {
            HandleState::Configuring
        } else if self.started && !self.handshake.snapshot().exited {
            HandleState::Started
        } else {
            HandleState::Exited
        }
    }

    /// OS process id, once started
    pub fn pid(&self) -> Option<u32> {
        self.handshake.pid()
    }

    /// Started and not yet reaped
    pub fn is_running(&self) -> bool {
        self.handshake.is_running()
    }

    /// Error of the most recent operation, including an accepted non-zero exit
    pub fn last_error(&self) -> Option<&TetherError> {
        self.last_error.as_ref()
    }

    /// New unstarted handle with this handle's path, args, vars and options.
    ///
    /// Stdin and output sinks are not copied.
    pub fn clone_config(&mut self) -> Result<ProcessHandle> {
        self.shell.ok()?;
        let result = ProcessHandle::new(
            self.shell.clone(),
            self.vars.clone(),
            self.path.clone(),
            self.args.iter().skip(1).cloned().collect(),
        )
        .map(|mut handle| {
            handle.opts = self.opts.clone();
            handle
        });
        self.record(result)
    }

    /// Feed `text` to the child's stdin, then close it
    pub fn set_stdin(&mut self, text: impl Into<String>) -> Result<()> {
        self.shell.ok()?;
        let result = if self.called_start {
            Err(TetherError::AlreadyStarted)
        } else if self.stdin_pipe.is_some() {
            Err(TetherError::ConflictingStdinConfiguration)
        } else {
            self.stdin_text = Some(text.into());
            Ok(())
        };
        self.record(result)
    }

    /// Writer connected to the child's stdin.
    ///
    /// Repeated calls return the same pipe. Close the writer to send EOF;
    /// it is closed for you when the child exits.
    pub fn stdin_pipe(&mut self) -> Result<PipeWriter> {
        self.shell.ok()?;
        let result = if self.called_start {
            Err(TetherError::AlreadyStarted)
        } else if self.stdin_text.is_some() {
            Err(TetherError::ConflictingStdinConfiguration)
        } else {
            match &self.stdin_pipe {
                Some(stdin) => Ok(stdin.writer.clone()),
                None => {
                    let (writer, reader) = pipe();
                    self.resources.register(shared(writer.clone()));
                    self.stdin_pipe = Some(StdinPipe {
                        writer: writer.clone(),
                        reader: Some(reader),
                    });
                    Ok(writer)
                }
            }
        };
        self.record(result)
    }

    /// Reader receiving a full copy of the child's stdout
    pub fn stdout_pipe(&mut self) -> Result<PipeReader> {
        self.shell.ok()?;
        let result = self.output_pipe(ParentStream::Stdout);
        self.record(result)
    }

    /// Reader receiving a full copy of the child's stderr
    pub fn stderr_pipe(&mut self) -> Result<PipeReader> {
        self.shell.ok()?;
        let result = self.output_pipe(ParentStream::Stderr);
        self.record(result)
    }

    /// Tee the child's stdout into `sink`; the sink is closed when the child exits
    pub fn add_stdout_sink(&mut self, sink: SharedSink) -> Result<()> {
        self.shell.ok()?;
        let result = self.add_sink(sink, ParentStream::Stdout);
        self.record(result)
    }

    /// Tee the child's stderr into `sink`; the sink is closed when the child exits
    pub fn add_stderr_sink(&mut self, sink: SharedSink) -> Result<()> {
        self.shell.ok()?;
        let result = self.add_sink(sink, ParentStream::Stderr);
        self.record(result)
    }

    /// Launch the child
    pub fn start(&mut self) -> Result<()> {
        self.shell.ok()?;
        let result = self.start_inner();
        self.record(result)
    }

    /// Wait until the child reports ready.
    ///
    /// Fails with [`TetherError::ProcessExited`] if it exits first.
    pub async fn await_ready(&mut self) -> Result<()> {
        self.shell.ok()?;
        let result = match self.check_awaitable() {
            Ok(()) => self.handshake.await_ready().await,
            Err(e) => Err(e),
        };
        self.record(result)
    }

    /// Wait until the child has sent every key in `keys`; returns just those keys.
    ///
    /// Fails with [`TetherError::ProcessExited`] if it exits first.
    pub async fn await_vars(&mut self, keys: &[&str]) -> Result<HashMap<String, String>> {
        self.shell.ok()?;
        let result = match self.check_awaitable() {
            Ok(()) => self.handshake.await_vars(keys).await,
            Err(e) => Err(e),
        };
        self.record(result)
    }

    /// Wait for the child to exit and its output to be drained
    pub async fn wait(&mut self) -> Result<()> {
        self.shell.ok()?;
        let result = self.wait_inner().await;
        let result = self.record(result);
        self.excuse(result)
    }

    /// Send `sig` to the child; a no-op unless it is running
    pub fn signal(&mut self, sig: Signal) -> Result<()> {
        self.shell.ok()?;
        let result = self.signal_inner(sig);
        self.record(result)
    }

    /// Send `sig`, then wait; an unsuccessful exit status counts as success
    pub async fn terminate(&mut self, sig: Signal) -> Result<()> {
        self.shell.ok()?;
        let result = match self.signal_inner(sig) {
            Ok(()) => match self.wait_inner().await {
                Err(e) if e.is_exit_error() => Ok(()),
                other => other,
            },
            Err(e) => Err(e),
        };
        self.record(result)
    }

    /// Start, then wait
    pub async fn run(&mut self) -> Result<()> {
        self.shell.ok()?;
        let result = self.run_inner().await;
        let result = self.record(result);
        self.excuse(result)
    }

    /// Run and return everything the child wrote to stdout
    pub async fn stdout(&mut self) -> Result<String> {
        self.shell.ok()?;
        let out = CaptureBuffer::new();
        let result = self.run_capturing(Some(shared(out.clone())), None).await;
        let result = self.record(result);
        self.excuse(result).map(|()| out.contents())
    }

    /// Run and return stdout and stderr separately
    pub async fn stdout_stderr(&mut self) -> Result<(String, String)> {
        self.shell.ok()?;
        let out = CaptureBuffer::new();
        let err = CaptureBuffer::new();
        let result = self
            .run_capturing(Some(shared(out.clone())), Some(shared(err.clone())))
            .await;
        let result = self.record(result);
        self.excuse(result).map(|()| (out.contents(), err.contents()))
    }

    /// Run and return stdout and stderr interleaved in one buffer
    pub async fn combined_output(&mut self) -> Result<String> {
        self.shell.ok()?;
        let both = CaptureBuffer::new();
        let sink = shared(both.clone());
        let result = self.run_capturing(Some(sink.clone()), Some(sink)).await;
        let result = self.record(result);
        self.excuse(result).map(|()| both.contents())
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(e) => {
                self.last_error = Some(e.clone());
                if !self.error_is_ok(e) {
                    self.shell.handle_error(e);
                }
            }
        }
        result
    }

    fn error_is_ok(&self, err: &TetherError) -> bool {
        self.opts.exit_error_is_ok && err.is_exit_error()
    }

    fn excuse(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if self.error_is_ok(&e) => {
                debug!("Accepting {} from {}", e, self.path.display());
                Ok(())
            }
            other => other,
        }
    }

    fn output_pipe(&mut self, stream: ParentStream) -> Result<PipeReader> {
        if self.called_start {
            return Err(TetherError::AlreadyStarted);
        }
        let (writer, reader) = pipe();
        self.attach(shared(writer), stream);
        Ok(reader)
    }

    fn add_sink(&mut self, sink: SharedSink, stream: ParentStream) -> Result<()> {
        if self.called_start {
            return Err(TetherError::AlreadyStarted);
        }
        let parent = lock_sink(&sink).parent_stream();
        match parent {
            Some(ParentStream::Stdout) => return Err(TetherError::CloseParentStdout),
            Some(ParentStream::Stderr) => return Err(TetherError::CloseParentStderr),
            None => {}
        }
        self.attach(sink, stream);
        Ok(())
    }

    fn attach(&mut self, sink: SharedSink, stream: ParentStream) {
        self.resources.register(sink.clone());
        match stream {
            ParentStream::Stdout => self.stdout_sinks.push(sink),
            ParentStream::Stderr => self.stderr_sinks.push(sink),
        }
    }

    fn check_awaitable(&self) -> Result<()> {
        if !self.started {
            Err(TetherError::DidNotCallStart)
        } else if self.called_wait {
            Err(TetherError::AlreadyCalledWait)
        } else {
            Ok(())
        }
    }

    fn start_inner(&mut self) -> Result<()> {
        if self.called_start {
            return Err(TetherError::AlreadyStarted);
        }
        self.called_start = true;
        let result = self.launch();
        if result.is_err() {
            let released = self.resources.release_all();
            debug!("Launch failed; released {} resource(s)", released);
        }
        result
    }

    fn launch(&mut self) -> Result<()> {
        let shell = self.shell.clone();
        let _launches = shell.launch_guard()?;

        let env = self.launch_env();
        let (stdout_sinks, stderr_sinks) = self.assemble_sinks()?;
        let plan = mux::assemble(stdout_sinks, stderr_sinks);
        let stdin_text = self.stdin_text.take();
        let stdin_reader = self.stdin_pipe.as_mut().and_then(|p| p.reader.take());

        let spec = LaunchSpec {
            path: &self.path,
            args: &self.args,
            env: &env,
            stdin: stdin_text.is_some() || stdin_reader.is_some(),
            stdout: plan.stdout.is_some(),
            stderr: plan.stderr.is_some(),
        };
        let mut child = process::spawn(&spec)?;
        let pid = child.pid();
        self.handshake.set_pid(pid);
        self.started = true;

        let stdin = match (child.take_stdin(), stdin_text, stdin_reader) {
            (Some(mut stdin), Some(text), _) => Some(tokio::spawn(async move {
                stdin.write_all(text.as_bytes()).await?;
                stdin.shutdown().await
            })),
            (Some(mut stdin), None, Some(mut reader)) => {
                // Ends when the pipe is closed by the caller or at exit.
                tokio::spawn(async move {
                    if let Err(e) = tokio::io::copy(&mut reader, &mut stdin).await {
                        debug!("Copying into stdin of process {} stopped: {}", pid, e);
                    }
                });
                None
            }
            _ => None,
        };
        let copiers = Copiers {
            stdout: child
                .take_stdout()
                .zip(plan.stdout)
                .map(|(out, fanout)| tokio::spawn(mux::pump(out, fanout, "stdout"))),
            stderr: child
                .take_stderr()
                .zip(plan.stderr)
                .map(|(err, fanout)| tokio::spawn(mux::pump(err, fanout, "stderr"))),
            stdin,
        };

        let (done, completion) = oneshot::channel();
        self.completion = Some(completion);
        spawn_reaper(
            child,
            copiers,
            self.handshake.clone(),
            std::mem::take(&mut self.resources),
            done,
        );
        Ok(())
    }

    fn launch_env(&self) -> HashMap<String, String> {
        let mut env = self.vars.clone();
        if self.opts.ignore_parent_exit {
            env.remove(ENV_WATCH_PARENT);
        } else {
            env.insert(ENV_WATCH_PARENT.to_string(), "1".to_string());
        }
        if self.opts.exit_after.is_zero() {
            env.remove(ENV_EXIT_AFTER);
        } else {
            env.insert(ENV_EXIT_AFTER.to_string(), format!("{:?}", self.opts.exit_after));
        }
        env
    }

    fn assemble_sinks(&mut self) -> io::Result<(Vec<SharedSink>, Vec<SharedSink>)> {
        let mut stdout = vec![shared(ControlDecoder::new(self.handshake.clone()))];
        stdout.append(&mut self.stdout_sinks);
        let mut stderr = std::mem::take(&mut self.stderr_sinks);

        if self.opts.propagate_output {
            stdout.push(shared(io::stdout()));
            stderr.push(shared(io::stderr()));
        }
        if let Some(dir) = &self.opts.output_dir {
            let (out_file, err_file) = mux::open_output_files(dir, &self.path)?;
            self.resources.register(out_file.clone());
            self.resources.register(err_file.clone());
            stdout.push(out_file);
            stderr.push(err_file);
        }
        Ok((stdout, stderr))
    }

    async fn wait_inner(&mut self) -> Result<()> {
        if !self.started {
            return Err(TetherError::DidNotCallStart);
        }
        if self.called_wait {
            return Err(TetherError::AlreadyCalledWait);
        }
        self.called_wait = true;
        let completion = self.completion.take().ok_or(TetherError::DidNotCallStart)?;
        completion.await.unwrap_or_else(|_| {
            Err(TetherError::ProcessWait(
                "reaper stopped without a result".to_string(),
            ))
        })
    }

    fn signal_inner(&self, sig: Signal) -> Result<()> {
        match self.handshake.pid() {
            Some(pid) if self.handshake.is_running() => process::signal(pid, sig),
            _ => {
                debug!("Not signalling {}: not running", self.path.display());
                Ok(())
            }
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.start_inner()?;
        self.wait_inner().await
    }

    async fn run_capturing(
        &mut self,
        stdout: Option<SharedSink>,
        stderr: Option<SharedSink>,
    ) -> Result<()> {
        if self.called_start {
            return Err(TetherError::AlreadyStarted);
        }
        if let Some(sink) = stdout {
            self.attach(sink, ParentStream::Stdout);
        }
        if let Some(sink) = stderr {
            self.attach(sink, ParentStream::Stderr);
        }
        self.run_inner().await
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Only non-empty when the handle never launched.
        self.resources.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellOptions;
    use crate::sink::NopCloser;

    fn shell() -> Shell {
        Shell::with_vars(ShellOptions::default(), HashMap::new())
    }

    fn handle(sh: &Shell) -> ProcessHandle {
        sh.cmd("/bin/sh", ["-c", "true"]).unwrap()
    }

    #[test]
    fn test_args_start_with_path() {
        let sh = shell();
        let h = handle(&sh);
        assert_eq!(h.args(), ["/bin/sh", "-c", "true"]);
        assert_eq!(h.path(), Path::new("/bin/sh"));
        assert_eq!(h.state(), HandleState::Configuring);
        assert_eq!(h.pid(), None);
        assert!(!h.is_running());
    }

    #[test]
    fn test_stdin_text_and_pipe_conflict() {
        let sh = shell();
        let mut h = handle(&sh);
        h.set_stdin("hello").unwrap();
        assert_eq!(
            h.stdin_pipe().unwrap_err(),
            TetherError::ConflictingStdinConfiguration
        );
        assert_eq!(
            h.last_error(),
            Some(&TetherError::ConflictingStdinConfiguration)
        );

        let mut h = handle(&sh);
        let first = h.stdin_pipe().unwrap();
        let second = h.stdin_pipe().unwrap();
        let mut closer = first.clone();
        crate::sink::WriteCloser::close(&mut closer).unwrap();
        assert!(second.is_closed());
        assert_eq!(
            h.set_stdin("late").unwrap_err(),
            TetherError::ConflictingStdinConfiguration
        );
    }

    #[test]
    fn test_parent_streams_must_be_wrapped() {
        let sh = shell();
        let mut h = handle(&sh);
        assert_eq!(
            h.add_stdout_sink(shared(io::stdout())).unwrap_err(),
            TetherError::CloseParentStdout
        );
        assert_eq!(
            h.add_stderr_sink(shared(io::stderr())).unwrap_err(),
            TetherError::CloseParentStderr
        );
        h.add_stdout_sink(shared(NopCloser(io::stdout()))).unwrap();
        assert_eq!(sh.take_errors().len(), 2);
    }

    #[tokio::test]
    async fn test_waiting_before_start_is_misuse() {
        let sh = shell();
        let mut h = handle(&sh);
        assert_eq!(h.wait().await, Err(TetherError::DidNotCallStart));
        assert_eq!(h.await_ready().await, Err(TetherError::DidNotCallStart));
        assert_eq!(h.await_vars(&["a"]).await, Err(TetherError::DidNotCallStart));
        assert_eq!(h.signal(Signal::SIGTERM), Ok(()));
    }

    #[test]
    fn test_clone_config_copies_configuration_only() {
        let sh = shell();
        let mut h = handle(&sh);
        h.vars.insert("A".to_string(), "1".to_string());
        h.opts.exit_error_is_ok = true;
        h.set_stdin("not copied").unwrap();

        let mut copy = h.clone_config().unwrap();
        assert_eq!(copy.args(), h.args());
        assert_eq!(copy.vars, h.vars);
        assert_eq!(copy.opts, h.opts);
        // No stdin text was carried over, so a pipe is allowed.
        assert!(copy.stdin_pipe().is_ok());
    }

    #[test]
    fn test_launch_env_conventions() {
        let sh = shell();
        let mut h = handle(&sh);
        h.vars.insert(ENV_EXIT_AFTER.to_string(), "stale".to_string());
        let env = h.launch_env();
        assert_eq!(env.get(ENV_WATCH_PARENT).map(String::as_str), Some("1"));
        assert!(!env.contains_key(ENV_EXIT_AFTER));

        h.opts.ignore_parent_exit = true;
        h.opts.exit_after = Duration::from_millis(1500);
        h.vars.insert(ENV_WATCH_PARENT.to_string(), "1".to_string());
        let env = h.launch_env();
        assert!(!env.contains_key(ENV_WATCH_PARENT));
        assert_eq!(env.get(ENV_EXIT_AFTER).map(String::as_str), Some("1.5s"));
    }

    #[test]
    fn test_propagation_appends_parent_streams_without_owning_them() {
        let sh = shell();
        let mut h = handle(&sh);
        h.add_stdout_sink(shared(CaptureBuffer::new())).unwrap();
        h.opts.propagate_output = true;
        let registered = h.resources.len();

        let (stdout, stderr) = h.assemble_sinks().unwrap();
        assert_eq!(h.resources.len(), registered);
        assert_eq!(stdout.len(), 3);
        assert_eq!(stderr.len(), 1);
        let last_stream =
            |sinks: &[SharedSink]| sinks.last().and_then(|s| lock_sink(s).parent_stream());
        assert_eq!(last_stream(&stdout), Some(ParentStream::Stdout));
        assert_eq!(last_stream(&stderr), Some(ParentStream::Stderr));

        // Propagation alone gives stderr a sink, so both streams share the lock.
        let plan = mux::assemble(stdout, stderr);
        assert!(plan.stdout.is_some_and(|f| f.is_locked()));
        assert!(plan.stderr.is_some_and(|f| f.is_locked()));
    }

    #[test]
    fn test_shell_propagation_option_reaches_handles() {
        let sh = Shell::with_vars(
            ShellOptions {
                propagate_child_output: true,
                ..Default::default()
            },
            HashMap::new(),
        );
        assert!(handle(&sh).opts.propagate_output);
        assert!(!handle(&shell()).opts.propagate_output);
    }

    #[test]
    fn test_exit_error_acceptance() {
        let sh = shell();
        let mut h = handle(&sh);
        let exit = TetherError::NonZeroExit(exit_status(7));
        assert!(!h.error_is_ok(&exit));
        h.opts.exit_error_is_ok = true;
        assert!(h.error_is_ok(&exit));
        assert!(!h.error_is_ok(&TetherError::ProcessExited));
        assert_eq!(h.excuse(Err(exit)), Ok(()));
    }

    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }
}
