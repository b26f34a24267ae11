//! Session coordination for a SQL-over-flat-files query engine.
//!
//! This crate arbitrates concurrent access to the process stdin and routes
//! result and diagnostic output to a terminal, plain streams, or a file.
//!
//! Multiple query executions within one process invocation may reference
//! `STDIN` as a virtual table. This crate guarantees that:
//!
//! - the stream is consumed at most once (repeated references return the
//!   cached view)
//! - replacement of the input stream is mutually exclusive with reads
//! - writes to shared output sinks never interleave at the byte level
//!
//! # Components
//!
//! ```text
//! Session (one per invocation, shared by worker threads)
//! ├── StdinLocker  - cancellable, non-fair reader/writer lock
//! ├── ViewMap      - resolved path → cached View
//! └── output sinks - VirtualTerminal | raw stream | out-file
//! ```
//!
//! The SQL front end, the file-format decoders, and the byte-to-view
//! parsing routine are collaborators outside this crate; the session talks
//! to the last of these through the [`ViewLoader`] trait.
//!
//! # Usage
//!
//! ```text
//! let flags = Flags::load();                 // defaults + config file
//! let session = Session::new();              // probes the real stdin
//!
//! // a query referencing STDIN:
//! let view = session.get_stdin_view(
//!     &CancelToken::with_timeout(timeout),
//!     &flags,
//!     &loader,
//!     FileInfo::for_stdin(&flags),
//!     &SourceRef::stdin(),
//! )?;
//!
//! // result emission:
//! session.write_to_stdout_with_line_break(&rendered)?;
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod io;

pub use crate::config::{Encoding, FlagError, Flags, Format, LineBreak};
pub use crate::core::locker::{CancelToken, StdinLocker};
pub use crate::core::session::{Session, StdinStream};
pub use crate::core::view::{FileInfo, SourceRef, View, ViewLoader, ViewMap, STDIN_TABLE_NAME};
pub use crate::error::{Result, SessionError};
pub use crate::io::{Discard, Input, Output, ReadSource, VirtualTerminal, WriteSink};
