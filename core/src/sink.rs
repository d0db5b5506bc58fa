//! Closable output sinks and the registry that releases them
//!
//! Every destination a child's output can be teed into is a [`WriteCloser`].
//! Sinks are shared as [`SharedSink`] so the same sink can subscribe to both
//! stdout and stderr. A handle's [`ResourceRegistry`] closes each distinct sink
//! exactly once when the process exits (or when launch fails).

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A byte sink that can be closed
pub trait WriteCloser: Write + Send {
    /// Release the sink. Later writes may fail.
    fn close(&mut self) -> io::Result<()>;

    /// Which of the parent's own standard streams this sink is, if any
    fn parent_stream(&self) -> Option<ParentStream> {
        None
    }
}

/// The parent's inherited standard output streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStream {
    /// The parent's stdout
    Stdout,
    /// The parent's stderr
    Stderr,
}

/// Sink shared between the multiplexer and the registry
pub type SharedSink = Arc<Mutex<dyn WriteCloser>>;

/// Wrap a sink for sharing
pub fn shared<W: WriteCloser + 'static>(sink: W) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

/// Lock a sink, recovering from a poisoned mutex
pub(crate) fn lock_sink(sink: &SharedSink) -> MutexGuard<'_, dyn WriteCloser + 'static> {
    sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WriteCloser for io::Stdout {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }

    fn parent_stream(&self) -> Option<ParentStream> {
        Some(ParentStream::Stdout)
    }
}

impl WriteCloser for io::Stderr {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }

    fn parent_stream(&self) -> Option<ParentStream> {
        Some(ParentStream::Stderr)
    }
}

/// Extends any writer to a [`WriteCloser`] whose close only flushes.
///
/// Also the way to tee into the parent's own stdout/stderr, which must never
/// be closed.
#[derive(Debug)]
pub struct NopCloser<W>(pub W);

impl<W: Write> Write for NopCloser<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> WriteCloser for NopCloser<W> {
    fn close(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// In-memory capture of a stream, readable after the process exits
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far, lossily decoded as UTF-8
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.bytes.lock().unwrap_or_else(|p| p.into_inner());
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteCloser for CaptureBuffer {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A file that releases its descriptor on close
#[derive(Debug)]
pub struct FileSink {
    file: Option<File>,
}

impl FileSink {
    /// Take ownership of an open file
    pub fn new(file: File) -> Self {
        Self { file: Some(file) }
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "file sink closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl WriteCloser for FileSink {
    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

/// Close obligations owned by a process handle
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Vec<SharedSink>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sink that must be closed at release time
    pub fn register(&mut self, sink: SharedSink) {
        self.entries.push(sink);
    }

    /// Number of registered entries, duplicates included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every distinct sink once and forget all entries.
    ///
    /// Close errors are logged and discarded. Returns the number of sinks closed.
    pub fn release_all(&mut self) -> usize {
        let mut seen = HashSet::new();
        let mut closed = 0;
        for sink in self.entries.drain(..) {
            // Identity, not equality: the data pointer of the Arc.
            let id = Arc::as_ptr(&sink) as *const () as usize;
            if !seen.insert(id) {
                continue;
            }
            if let Err(e) = lock_sink(&sink).close() {
                debug!("Ignoring error while releasing sink: {}", e);
            }
            closed += 1;
        }
        closed
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        closes: Arc<AtomicUsize>,
    }

    impl Write for CountingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WriteCloser for CountingSink {
        fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "close failed"))
        }
    }

    #[test]
    fn test_release_closes_each_identity_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let a = shared(CountingSink { closes: closes.clone() });
        let b = shared(CountingSink { closes: closes.clone() });

        let mut registry = ResourceRegistry::new();
        registry.register(a.clone());
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.len(), 3);

        // Close errors are swallowed.
        assert_eq!(registry.release_all(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());

        // Nothing left to release a second time.
        assert_eq!(registry.release_all(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parent_streams_are_recognized() {
        assert_eq!(io::stdout().parent_stream(), Some(ParentStream::Stdout));
        assert_eq!(io::stderr().parent_stream(), Some(ParentStream::Stderr));
        assert_eq!(NopCloser(io::stdout()).parent_stream(), None);
    }

    #[test]
    fn test_file_sink_rejects_writes_after_close() {
        let file = tempfile::tempfile().expect("tempfile");
        let mut sink = FileSink::new(file);
        sink.write_all(b"hello").expect("write before close");
        sink.close().expect("close");
        sink.close().expect("second close is a no-op");
        let err = sink.write_all(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_capture_buffer_shares_contents_between_clones() {
        let buf = CaptureBuffer::new();
        let mut writer = buf.clone();
        writer.write_all(b"abc").unwrap();
        assert_eq!(buf.contents(), "abc");
    }
}
