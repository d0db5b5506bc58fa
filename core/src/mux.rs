//! Output multiplexer: fans a child's stdout/stderr out to sinks
//!
//! When both streams have subscribers, their fan-outs share one lock, so a
//! sink subscribed to both never sees a stdout write torn by a stderr write.
//! Which stream's bytes land first is still decided by the OS; the lock only
//! serializes writes.

use crate::sink::{lock_sink, shared, FileSink, SharedSink};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Writes every chunk to each sink of one stream, in registration order
pub(crate) struct FanOut {
    sinks: Vec<SharedSink>,
    stream_lock: Option<Arc<Mutex<()>>>,
}

impl FanOut {
    fn new(sinks: Vec<SharedSink>, stream_lock: Option<Arc<Mutex<()>>>) -> Self {
        Self { sinks, stream_lock }
    }

    /// Write `buf` to every sink, even past a failing one; returns the first failure
    pub(crate) fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let _guard = self
            .stream_lock
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(|p| p.into_inner()));
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = lock_sink(sink).write_all(buf) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.stream_lock.is_some()
    }
}

/// Fan-outs for both streams; `None` means the stream goes to the null device
pub(crate) struct OutputPlan {
    pub(crate) stdout: Option<FanOut>,
    pub(crate) stderr: Option<FanOut>,
}

/// Combine the assembled sink lists into per-stream fan-outs
pub(crate) fn assemble(stdout: Vec<SharedSink>, stderr: Vec<SharedSink>) -> OutputPlan {
    match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => {
            let lock = Arc::new(Mutex::new(()));
            OutputPlan {
                stdout: Some(FanOut::new(stdout, Some(lock.clone()))),
                stderr: Some(FanOut::new(stderr, Some(lock))),
            }
        }
        (false, true) => OutputPlan {
            stdout: Some(FanOut::new(stdout, None)),
            stderr: None,
        },
        (true, false) => OutputPlan {
            stdout: None,
            stderr: Some(FanOut::new(stderr, None)),
        },
        (true, true) => OutputPlan {
            stdout: None,
            stderr: None,
        },
    }
}

/// Exclusively create `<dir>/<base>.<timestamp>.stdout` and `.stderr`
pub(crate) fn open_output_files(dir: &Path, exe: &Path) -> io::Result<(SharedSink, SharedSink)> {
    let base = exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "child".to_string());
    let stamp = chrono::Local::now().format("%Y%m%d.%H%M%S.%6f");
    let stem = dir.join(format!("{base}.{stamp}"));

    let stdout = create_exclusive(&suffixed(&stem, "stdout"))?;
    let stderr = create_exclusive(&suffixed(&stem, "stderr"))?;
    Ok((shared(stdout), shared(stderr)))
}

fn create_exclusive(path: &Path) -> io::Result<FileSink> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    debug!("Recording child output to {}", path.display());
    options.open(path).map(FileSink::new)
}

// `Path::with_extension` would replace the fractional seconds.
fn suffixed(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    name.into()
}

/// Copy a child stream into its fan-out until EOF.
///
/// A failing sink neither stops the copy nor starves the other sinks: the
/// child never blocks on a full pipe and every healthy sink sees the whole
/// stream. The first failure is returned once EOF is reached.
pub(crate) async fn pump<R>(mut reader: R, fanout: FanOut, stream: &'static str) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut failure: Option<io::Error> = None;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = fanout.write_all(&buf[..n]) {
            if failure.is_none() {
                warn!("Failed to copy child {}: {}", stream, e);
                failure = Some(e);
            }
        }
    }
    failure.map_or(Ok(()), Err)
}
