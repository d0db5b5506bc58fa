//! Unbounded in-memory pipe
//!
//! Writes never block, so the stream copiers feeding a pipe can never stall
//! behind a slow reader. The writer half is a [`WriteCloser`] and can be cloned;
//! closing any clone closes the pipe for all of them. The reader half implements
//! [`tokio::io::AsyncRead`] and sees EOF once the pipe is closed and drained.
//! Dropping the reader discards whatever is written afterwards.

use crate::sink::WriteCloser;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Create a connected writer/reader pair
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PipeWriter {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

/// Writing half of a [`pipe`]
#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl PipeWriter {
    /// Whether the pipe has been closed
    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let tx = guard.as_ref().ok_or_else(broken)?;
        if buf.is_empty() {
            return Ok(0);
        }
        // A reader that went away is not the writer's failure; drop the bytes.
        let _ = tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteCloser for PipeWriter {
    fn close(&mut self) -> io::Result<()> {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        Ok(())
    }
}

/// Reading half of a [`pipe`]
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pos >= this.chunk.len() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.chunk = chunk;
                    this.pos = 0;
                }
                // Every sender is gone: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(this.chunk.len() - this.pos);
        buf.put_slice(&this.chunk[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}
