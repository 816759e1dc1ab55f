//! Shared test utilities for the unit-test modules.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::error::{AttachError, Result};

/// In-memory [`Connection`] that records writes and serves a canned reply.
///
/// Writes go to a shared sink so tests keep visibility after handing the
/// connection to a session that owns it.
pub(crate) struct ScriptedConnection {
    pub(crate) written: Arc<Mutex<Vec<u8>>>,
    pub(crate) reply: VecDeque<u8>,
    pub(crate) closed: bool,
    /// When set, `write` accepts at most this many bytes per call.
    pub(crate) write_limit: Option<usize>,
}

impl ScriptedConnection {
    pub(crate) fn replying(reply: &[u8]) -> Self {
        ScriptedConnection {
            written: Arc::new(Mutex::new(Vec::new())),
            reply: reply.iter().copied().collect(),
            closed: false,
            write_limit: None,
        }
    }

    /// Handle onto everything written so far.
    pub(crate) fn sink(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

/// Snapshot a sink's contents.
pub(crate) fn written_bytes(sink: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    sink.lock().unwrap().clone()
}

impl Connection for ScriptedConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut count = 0;
        while count < buf.len() {
            match self.reply.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = self.written.lock().unwrap();
        if let Some(limit) = self.write_limit {
            if buf.len() > limit {
                written.extend_from_slice(&buf[..limit]);
                return Err(AttachError::IoShort);
            }
        }
        written.extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
