//! Child side of the handshake protocol
//!
//! A process launched by a [`ProcessHandle`](crate::ProcessHandle) reports
//! readiness and variables to its parent by printing control lines on its own
//! stdout. These helpers write one complete line and flush it, so the line is
//! never split around other output from the same process.

use crate::Result;
use schema::ControlMessage;
use std::io::{self, Write};

/// Tell the parent this process is ready
pub fn send_ready() -> Result<()> {
    write_message(&mut io::stdout().lock(), &ControlMessage::Ready)
}

/// Send key/value pairs to the parent; later values for a key win
pub fn send_vars<I, K, V>(vars: I) -> Result<()>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    write_message(&mut io::stdout().lock(), &ControlMessage::vars(vars))
}

/// Write one control line to `out` and flush it
pub fn write_message<W: Write>(out: &mut W, msg: &ControlMessage) -> Result<()> {
    out.write_all(msg.encode_line().as_bytes())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ControlDecoder;
    use crate::handshake::Handshake;
    use std::sync::Arc;

    #[test]
    fn test_lines_round_trip_through_decoder() {
        let handshake = Arc::new(Handshake::new());
        let mut decoder = ControlDecoder::new(handshake.clone());
        write_message(&mut decoder, &ControlMessage::vars([("port", "8080")])).unwrap();
        write_message(&mut decoder, &ControlMessage::Ready).unwrap();

        let state = handshake.snapshot();
        assert!(state.ready);
        assert_eq!(state.vars.get("port").map(String::as_str), Some("8080"));
    }
}
