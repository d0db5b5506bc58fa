//! Stdout sink that decodes control messages
//!
//! The decoder sees the child's raw stdout, one write at a time, and keeps just
//! enough per-line state to recognize [`MSG_PREFIX`] without buffering ordinary
//! output: once the first `MSG_PREFIX.len()` bytes of a line fail to match, the
//! rest of that line is skipped.

use crate::handshake::Handshake;
use crate::sink::WriteCloser;
use schema::{ControlMessage, ProtocolError, MSG_PREFIX};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    /// Still collecting the first `MSG_PREFIX.len()` bytes
    Prefix,
    /// Prefix matched; collecting the JSON payload
    Payload,
    /// Not a control line
    Skip,
}

/// Control-message decoder feeding a [`Handshake`]
#[derive(Debug)]
pub struct ControlDecoder {
    handshake: Arc<Handshake>,
    buf: Vec<u8>,
    state: LineState,
}

impl ControlDecoder {
    /// Create a decoder publishing into `handshake`
    pub fn new(handshake: Arc<Handshake>) -> Self {
        Self {
            handshake,
            buf: Vec::new(),
            state: LineState::Prefix,
        }
    }

    fn end_line(&mut self) -> Result<(), ProtocolError> {
        let result = match self.state {
            LineState::Payload => self.apply(),
            LineState::Prefix | LineState::Skip => Ok(()),
        };
        self.buf.clear();
        self.state = LineState::Prefix;
        result
    }

    fn apply(&self) -> Result<(), ProtocolError> {
        match ControlMessage::decode(&self.buf)? {
            ControlMessage::Ready => {
                debug!("Child reported ready");
                self.handshake.mark_ready();
            }
            ControlMessage::Vars { vars } => {
                debug!("Child sent {} var(s)", vars.len());
                self.handshake.merge_vars(vars);
            }
        }
        Ok(())
    }

    fn push(&mut self, b: u8) {
        match self.state {
            LineState::Skip => {}
            LineState::Payload => self.buf.push(b),
            LineState::Prefix => {
                self.buf.push(b);
                if self.buf.len() == MSG_PREFIX.len() {
                    self.state = if self.buf == MSG_PREFIX.as_bytes() {
                        LineState::Payload
                    } else {
                        LineState::Skip
                    };
                    self.buf.clear();
                }
            }
        }
    }
}

impl Write for ControlDecoder {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        // The whole chunk is consumed even past a bad line.
        let mut first_err = None;
        for &b in data {
            if b == b'\n' {
                if let Err(e) = self.end_line() {
                    first_err.get_or_insert(e);
                }
            } else {
                self.push(b);
            }
        }
        match first_err {
            Some(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(data.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteCloser for ControlDecoder {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Recover the protocol error behind a failed decoder write, if that is what it was
pub(crate) fn protocol_error(err: &io::Error) -> Option<&ProtocolError> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<ProtocolError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeState;

    fn decoder() -> (ControlDecoder, Arc<Handshake>) {
        let hs = Arc::new(Handshake::new());
        (ControlDecoder::new(hs.clone()), hs)
    }

    #[test]
    fn test_ready_line() {
        let (mut dec, hs) = decoder();
        dec.write_all(b"starting up\n#tether {\"type\":\"ready\"}\n").unwrap();
        assert!(hs.snapshot().ready);
    }

    #[test]
    fn test_line_split_across_writes() {
        let (mut dec, hs) = decoder();
        dec.write_all(b"#teth").unwrap();
        dec.write_all(b"er {\"type\":\"vars\",").unwrap();
        assert!(hs.snapshot().vars.is_empty());
        dec.write_all(b"\"vars\":{\"a\":\"1\"}}\n").unwrap();
        assert_eq!(hs.snapshot().vars["a"], "1");
    }

    #[test]
    fn test_vars_merge_in_order() {
        let (mut dec, hs) = decoder();
        dec.write_all(b"#tether {\"type\":\"vars\",\"vars\":{\"a\":\"1\"}}\n")
            .unwrap();
        dec.write_all(b"#tether {\"type\":\"vars\",\"vars\":{\"a\":\"2\",\"b\":\"3\"}}\n")
            .unwrap();
        let vars = hs.snapshot().vars;
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["a"], "2");
        assert_eq!(vars["b"], "3");
    }

    #[test]
    fn test_non_marker_lines_are_inert() {
        let (mut dec, hs) = decoder();
        dec.write_all(b"#tethe\n  #tether {\"type\":\"ready\"}\n{\"type\":\"ready\"}\nshort\n")
            .unwrap();
        assert_eq!(hs.snapshot(), HandshakeState::default());
    }

    #[test]
    fn test_invalid_json_fails_write() {
        let (mut dec, _hs) = decoder();
        let err = dec.write_all(b"#tether {not json\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(protocol_error(&err), Some(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_unknown_type_fails_write() {
        let (mut dec, hs) = decoder();
        let err = dec.write_all(b"#tether {\"type\":\"bogus\"}\n").unwrap_err();
        assert_eq!(
            protocol_error(&err),
            Some(&ProtocolError::UnknownType("bogus".to_string()))
        );
        // The decoder recovers for the following line.
        dec.write_all(b"#tether {\"type\":\"ready\"}\n").unwrap();
        assert!(hs.snapshot().ready);
    }

    #[test]
    fn test_bad_line_does_not_hide_the_rest_of_the_chunk() {
        let (mut dec, hs) = decoder();
        let err = dec
            .write(b"#tether {oops\n#tether {\"type\":\"ready\"}\n")
            .unwrap_err();
        assert!(protocol_error(&err).is_some());
        assert!(hs.snapshot().ready);
    }

    #[test]
    fn test_unterminated_marker_line_is_ignored() {
        let (mut dec, hs) = decoder();
        dec.write_all(b"#tether {\"type\":\"ready\"}").unwrap();
        dec.close().unwrap();
        assert!(!hs.snapshot().ready);
    }
}
