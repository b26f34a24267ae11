//! Uniform closable wrappers around byte sources and sinks.
//!
//! Rust streams close implicitly on drop, but the engine needs an explicit
//! close seam so a replaced stdin or a captured output buffer can be shut
//! down (or deliberately left readable) at a chosen point. The traits here
//! add that seam with a no-op default, and the adapter types cover the
//! degenerate ends of the spectrum:
//!
//! - **Discard**: silence output deterministically
//! - **Input**: lend closability to any plain reader
//! - **Output**: capture output in memory for replay or verification
//!
//! None of these types synchronize; serialization of writes is the
//! session's job.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// Byte sink with an explicit close operation.
pub trait WriteSink: Write + Send {
    /// Close the sink. Defaults to a no-op.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteSink for io::Stdout {}

impl WriteSink for io::Stderr {}

impl WriteSink for std::fs::File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Byte source with an explicit close operation.
pub trait ReadSource: Read + Send {
    /// Close the source. Defaults to a no-op.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReadSource for io::Stdin {}

impl ReadSource for std::fs::File {}

/// Sink that accepts and discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Discard;

impl Discard {
    pub fn new() -> Self {
        Discard
    }
}

impl Write for Discard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteSink for Discard {}

/// Adapter lending `ReadSource` to any plain reader.
///
/// Sources without a close of their own get the no-op default, so an
/// in-memory cursor or a network stream can stand wherever a closable
/// reader is required.
pub struct Input<R> {
    reader: R,
}

impl<R: Read + Send> Input<R> {
    pub fn new(reader: R) -> Self {
        Input { reader }
    }

    /// Recover the wrapped reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> Read for Input<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R: Read + Send> ReadSource for Input<R> {}

/// Shared in-memory capture buffer exposed as a closable sink.
///
/// Cloning yields another handle over the same buffer, so captured content
/// stays readable after a session has taken ownership of the sink. Close
/// is a no-op; the contents survive it.
#[derive(Clone, Debug, Default)]
pub struct Output {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Output {
    pub fn new() -> Self {
        Output::default()
    }

    /// Copy of the captured bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    /// Captured bytes as a string, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Number of captured bytes.
    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().unwrap().is_empty()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteSink for Output {}

/// Interactive terminal attached to a session.
///
/// The terminal owns its own cursor and rendering; the session only routes
/// text to it. Result text goes through `write`, diagnostics through
/// `write_error`.
pub trait VirtualTerminal: Send {
    fn write(&mut self, text: &str) -> io::Result<()>;

    fn write_error(&mut self, text: &str) -> io::Result<()>;
}
