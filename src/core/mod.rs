//! Core session coordination components.
//!
//! This module contains the concurrency heart of the engine:
//!
//! - **locker**: cancellable reader/writer lock over the stdin resource
//! - **view**: parsed-view cache and the loader collaborator boundary
//! - **session**: the session composing lock, cache, and output routing
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── StdinLocker (exclusive/shared holds over the stdin stream)
//! ├── ViewMap (resolved path → cached View)
//! └── output sinks
//!     ├── VirtualTerminal (interactive)
//!     ├── raw streams (stdout / stderr)
//!     └── out-file sink
//! ```

pub mod locker;
pub mod session;
pub mod view;
