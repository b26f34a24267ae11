//! Cached table views and the parsing-collaborator boundary.
//!
//! A `View` is the structured, in-memory form of a parsed data source; the
//! session only cares about its resolved path, which keys the `ViewMap`
//! memoizing stdin reads. Actual byte-to-view parsing belongs to a
//! `ViewLoader` collaborator outside this layer.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Encoding, Flags, Format, LineBreak};
use crate::core::locker::CancelToken;

/// Name of the pseudo table backed by the process stdin.
pub const STDIN_TABLE_NAME: &str = "STDIN";

/// Reference to a data source as it appears in a query.
///
/// Carries the stable string form used for error attribution and the
/// resolved path used as the cache key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRef {
    text: String,
    path: PathBuf,
}

impl SourceRef {
    /// Reference to the stdin pseudo table.
    pub fn stdin() -> Self {
        SourceRef {
            text: STDIN_TABLE_NAME.to_string(),
            path: PathBuf::from(STDIN_TABLE_NAME),
        }
    }

    /// Reference to a file-backed source.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        SourceRef {
            text: path.display().to_string(),
            path,
        }
    }

    /// The resolved path identifying the source.
    pub fn resolved_path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Metadata describing how a source should be parsed.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Resolved path identifying the source.
    pub path: PathBuf,
    /// Field delimiter.
    pub delimiter: char,
    /// Data format of the source.
    pub format: Format,
    /// Text encoding of the source bytes.
    pub encoding: Encoding,
    /// Line break style used when the source is written back.
    pub line_break: LineBreak,
    /// The first record is data, not a header row.
    pub no_header: bool,
}

impl FileInfo {
    /// Metadata for the stdin pseudo table, derived from the invocation
    /// flags.
    pub fn for_stdin(flags: &Flags) -> Self {
        FileInfo {
            path: PathBuf::from(STDIN_TABLE_NAME),
            delimiter: flags.delimiter.unwrap_or(','),
            format: flags.format,
            encoding: flags.encoding,
            line_break: flags.line_break,
            no_header: flags.no_header,
        }
    }
}

/// Structured, in-memory representation of a parsed data source.
///
/// The session treats views as opaque payloads owned by the cache and
/// shared by reference with every caller; other engine layers give them
/// their tabular meaning.
#[derive(Clone, Debug)]
pub struct View {
    pub file_info: FileInfo,
    /// Column names, empty when the source has no header row.
    pub header: Vec<String>,
    /// Field values per record; `None` represents SQL NULL.
    pub records: Vec<Vec<Option<String>>>,
}

impl View {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn field_count(&self) -> usize {
        self.header.len()
    }
}

/// Memoized views keyed by resolved source path.
///
/// Keys are folded to upper case, matching the engine's case-insensitive
/// identifier handling. Entries are only ever added one at a time and
/// removed wholesale; there is no partial invalidation.
#[derive(Debug, Default)]
pub struct ViewMap {
    views: HashMap<String, Arc<View>>,
}

impl ViewMap {
    pub fn new() -> Self {
        ViewMap::default()
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().to_uppercase()
    }

    /// Whether a view is cached for `path`.
    pub fn exists(&self, path: &Path) -> bool {
        self.views.contains_key(&ViewMap::key(path))
    }

    /// The cached view for a reference, if any.
    pub fn get(&self, reference: &SourceRef) -> Option<Arc<View>> {
        self.views
            .get(&ViewMap::key(reference.resolved_path()))
            .cloned()
    }

    /// Cache a view under its own resolved path, replacing any previous
    /// entry for that path.
    pub fn store(&mut self, view: View) -> Arc<View> {
        let key = ViewMap::key(&view.file_info.path);
        let view = Arc::new(view);
        self.views.insert(key, Arc::clone(&view));
        view
    }

    /// Drop every cached view.
    pub fn clear(&mut self) {
        self.views.clear();
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Parsing collaborator turning raw source bytes into a `View`.
///
/// Implementations live with the file-format decoders, not here. Errors
/// that are not already `SessionError` values are wrapped as
/// `DataParsing` at the session boundary.
pub trait ViewLoader {
    fn load(
        &self,
        token: &CancelToken,
        data: &[u8],
        flags: &Flags,
        file_info: FileInfo,
        without_null: bool,
    ) -> std::result::Result<View, Box<dyn Error + Send + Sync>>;
}
