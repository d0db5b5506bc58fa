//! Exit reaper: the one task that learns of a child's exit
//!
//! Spawned right after launch. Once the OS reports exit and both output
//! streams are drained it, in order, publishes `exited`, releases the
//! handle's resources, and delivers the terminal result. Nothing else sets
//! `exited` or writes the completion channel.

use crate::decoder::protocol_error;
use crate::handshake::Handshake;
use crate::process::ChildProcess;
use crate::sink::ResourceRegistry;
use crate::{Result, TetherError};
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Background activity attached to one running child
pub(crate) struct Copiers {
    pub(crate) stdout: Option<JoinHandle<io::Result<()>>>,
    pub(crate) stderr: Option<JoinHandle<io::Result<()>>>,
    /// Writer of literal stdin text; its failures never affect the result
    pub(crate) stdin: Option<JoinHandle<io::Result<()>>>,
}

pub(crate) fn spawn_reaper(
    mut child: ChildProcess,
    copiers: Copiers,
    handshake: Arc<Handshake>,
    mut resources: ResourceRegistry,
    done: oneshot::Sender<Result<()>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pid = child.pid();
        let waited = child.wait().await;
        // The pid is free for reuse from here on. Until the flag is set a
        // concurrent `signal` can still reach `kill`; the window is the gap
        // between the waitpid returning and this task being polled again.
        handshake.mark_reaped();

        let stdout = join_copier(copiers.stdout, "stdout").await;
        let stderr = join_copier(copiers.stderr, "stderr").await;
        if let Some(stdin) = copiers.stdin {
            if let Ok(Err(e)) = stdin.await {
                debug!("Writing stdin of process {} stopped early: {}", pid, e);
            }
        }

        let result = match waited {
            Err(e) => Err(e),
            Ok(status) if !status.success() => Err(TetherError::NonZeroExit(status)),
            Ok(_) => stdout.and(stderr),
        };
        match &result {
            Ok(()) => info!("Process {} exited successfully", pid),
            Err(e) => info!("Process {} finished: {}", pid, e),
        }

        handshake.mark_exited();
        let released = resources.release_all();
        debug!("Released {} resource(s) of process {}", released, pid);

        // The handle may have been dropped without waiting; nothing to deliver to.
        let _ = done.send(result);
    })
}

async fn join_copier(task: Option<JoinHandle<io::Result<()>>>, stream: &str) -> Result<()> {
    let Some(task) = task else {
        return Ok(());
    };
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(copy_error(&e)),
        Err(join) => {
            warn!("Copier for child {} did not complete: {}", stream, join);
            Err(TetherError::StreamCopy(format!("{stream}: {join}")))
        }
    }
}

fn copy_error(err: &io::Error) -> TetherError {
    match protocol_error(err) {
        Some(protocol) => TetherError::Protocol(protocol.to_string()),
        None => TetherError::StreamCopy(err.to_string()),
    }
}
