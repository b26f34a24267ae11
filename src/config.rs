//! Per-invocation configuration for the query engine.
//!
//! The engine resolves its flag set once at process start (built-in
//! defaults, then an optional user defaults file, then the command-line
//! setters) and passes it by reference to every component that needs it.
//! Nothing in this module is a process-wide singleton.
//!
//! # Defaults File
//!
//! User defaults are read from `~/.flatq/config.toml`:
//!
//! ```toml
//! # Field delimiter for delimited sources
//! delimiter = ","
//!
//! # Text encoding: utf8 | sjis
//! encoding = "utf8"
//!
//! # Base directory for table files
//! repository = "."
//!
//! # Output format: text | csv | tsv | json
//! format = "text"
//!
//! # Line break style for written output: lf | cr | crlf
//! line_break = "lf"
//! ```
//!
//! A missing or malformed defaults file never aborts the process; the
//! built-in defaults are used instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors raised by the flag setters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlagError {
    #[error("delimiter must be 1 character")]
    Delimiter,

    #[error("encoding must be one of utf8|sjis")]
    Encoding,

    #[error("line-break must be one of crlf|lf|cr")]
    LineBreak,

    #[error("format must be one of csv|tsv|json|text")]
    Format,

    #[error("repository does not exist")]
    RepositoryNotFound,

    #[error("repository must be a directory path")]
    RepositoryNotDirectory,

    #[error("file passed in out option already exists")]
    OutFileExists,
}

/// Text encoding of a data source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Utf8,
    Sjis,
}

impl FromStr for Encoding {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, FlagError> {
        match s.to_uppercase().as_str() {
            "" | "UTF8" => Ok(Encoding::Utf8),
            "SJIS" => Ok(Encoding::Sjis),
            _ => Err(FlagError::Encoding),
        }
    }
}

/// Line break style used when writing output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineBreak {
    Cr,
    #[default]
    Lf,
    Crlf,
}

impl LineBreak {
    /// The literal break bytes.
    pub fn as_str(&self) -> &'static str {
        match self {
            LineBreak::Cr => "\r",
            LineBreak::Lf => "\n",
            LineBreak::Crlf => "\r\n",
        }
    }
}

impl FromStr for LineBreak {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, FlagError> {
        match s.to_uppercase().as_str() {
            "CR" => Ok(LineBreak::Cr),
            "LF" => Ok(LineBreak::Lf),
            "CRLF" => Ok(LineBreak::Crlf),
            _ => Err(FlagError::LineBreak),
        }
    }
}

/// Data format of a source or of written output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Csv,
    Tsv,
    Json,
}

impl FromStr for Format {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, FlagError> {
        match s.to_uppercase().as_str() {
            "TEXT" => Ok(Format::Text),
            "CSV" => Ok(Format::Csv),
            "TSV" => Ok(Format::Tsv),
            "JSON" => Ok(Format::Json),
            _ => Err(FlagError::Format),
        }
    }
}

/// Per-invocation flag set.
///
/// Built once during startup and treated as immutable afterwards. The
/// setters validate their input and leave the flag set unchanged on
/// failure, so a rejected command-line option never half-applies.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Field delimiter for delimited sources; `None` leaves the choice to
    /// the decoder.
    pub delimiter: Option<char>,
    /// Read-side text encoding.
    pub encoding: Encoding,
    /// Base directory for table files.
    pub repository: PathBuf,
    /// Treat the first record of a source as data, not a header.
    pub no_header: bool,
    /// Read empty fields as empty strings instead of NULLs.
    pub without_null: bool,
    /// Write-side text encoding.
    pub write_encoding: Encoding,
    /// Line break style for written output.
    pub line_break: LineBreak,
    /// Result output file.
    pub out_file: Option<PathBuf>,
    /// Result output format.
    pub format: Format,
    /// Omit the header row from written output.
    pub without_header: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            delimiter: None,
            encoding: Encoding::Utf8,
            repository: PathBuf::from("."),
            no_header: false,
            without_null: false,
            write_encoding: Encoding::Utf8,
            line_break: LineBreak::Lf,
            out_file: None,
            format: Format::Text,
            without_header: false,
        }
    }
}

impl Flags {
    /// Load defaults from the user config file.
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Flags::load_from(&path),
            None => Flags::default(),
        }
    }

    /// Load defaults from `path`, falling back to the built-in defaults
    /// when the file is absent or malformed.
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                if let Ok(flags) = toml::from_str(&content) {
                    return flags;
                }
            }
        }
        Flags::default()
    }

    /// Set the field delimiter from a command-line value.
    ///
    /// The value is backslash-unescaped first, so `\t` selects a tab. An
    /// empty value leaves the delimiter unchanged.
    pub fn set_delimiter(&mut self, s: &str) -> Result<(), FlagError> {
        if s.is_empty() {
            return Ok(());
        }

        let unescaped = unescape(s);
        let mut chars = unescaped.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                self.delimiter = Some(c);
                Ok(())
            }
            _ => Err(FlagError::Delimiter),
        }
    }

    /// Set the read-side encoding from a command-line value.
    pub fn set_encoding(&mut self, s: &str) -> Result<(), FlagError> {
        self.encoding = s.parse()?;
        Ok(())
    }

    /// Set the write-side encoding from a command-line value.
    pub fn set_write_encoding(&mut self, s: &str) -> Result<(), FlagError> {
        self.write_encoding = s.parse()?;
        Ok(())
    }

    /// Set the output line break style. An empty value leaves it unchanged.
    pub fn set_line_break(&mut self, s: &str) -> Result<(), FlagError> {
        if s.is_empty() {
            return Ok(());
        }
        self.line_break = s.parse()?;
        Ok(())
    }

    /// Set the table file repository. Must name an existing directory; an
    /// empty value leaves it unchanged.
    pub fn set_repository(&mut self, s: &str) -> Result<(), FlagError> {
        if s.is_empty() {
            return Ok(());
        }

        let meta = fs::metadata(s).map_err(|_| FlagError::RepositoryNotFound)?;
        if !meta.is_dir() {
            return Err(FlagError::RepositoryNotDirectory);
        }
        self.repository = PathBuf::from(s);
        Ok(())
    }

    /// Set the result output file. The target must not already exist; an
    /// empty value leaves it unchanged.
    pub fn set_out_file(&mut self, s: &str) -> Result<(), FlagError> {
        if s.is_empty() {
            return Ok(());
        }

        if Path::new(s).exists() {
            return Err(FlagError::OutFileExists);
        }
        self.out_file = Some(PathBuf::from(s));
        Ok(())
    }

    /// Set the result output format.
    ///
    /// An empty value infers the format from the out-file extension
    /// (.csv/.tsv/.json) and leaves it unchanged for any other extension.
    pub fn set_format(&mut self, s: &str) -> Result<(), FlagError> {
        if s.is_empty() {
            let ext = self
                .out_file
                .as_deref()
                .and_then(Path::extension)
                .map(|e| e.to_string_lossy().to_uppercase());
            match ext.as_deref() {
                Some("CSV") => self.format = Format::Csv,
                Some("TSV") => self.format = Format::Tsv,
                Some("JSON") => self.format = Format::Json,
                _ => {}
            }
            return Ok(());
        }

        self.format = s.parse()?;
        Ok(())
    }

    pub fn set_no_header(&mut self, b: bool) {
        self.no_header = b;
    }

    pub fn set_without_null(&mut self, b: bool) {
        self.without_null = b;
    }

    pub fn set_without_header(&mut self, b: bool) {
        self.without_header = b;
    }
}

/// Decode C-style backslash escapes.
///
/// Unknown escapes and a trailing backslash pass through unchanged, so the
/// function is total over arbitrary input.
pub fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => result.push('\x07'),
            Some('b') => result.push('\x08'),
            Some('f') => result.push('\x0c'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('v') => result.push('\x0b'),
            Some('"') => result.push('"'),
            Some('\\') => result.push('\\'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

/// Path of the user defaults file.
fn config_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".flatq").join("config.toml"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
