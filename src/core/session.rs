//! Session management
//!
//! One `Session` exists per process invocation and is the coordination
//! point shared by every worker thread: it owns the live standard stream
//! handles, the piped-input-availability flag, the stdin view cache, and
//! the output sinks.
//!
//! Two independent synchronization domains keep it consistent:
//!
//! - the stdin domain: `StdinLocker` serializes stream replacement against
//!   reads of the stream and its derived view cache
//! - the output domain: a general mutex serializes sink reassignment and
//!   every write, so no two writes interleave at the byte level
//!
//! No operation holds both domains at once, so there is no lock ordering
//! between them.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crossterm::tty::IsTty;
use tracing::debug;

use crate::config::Flags;
use crate::core::locker::{CancelToken, StdinLocker};
use crate::core::view::{FileInfo, SourceRef, View, ViewLoader, ViewMap};
use crate::error::{Result, SessionError};
use crate::io::{ReadSource, VirtualTerminal, WriteSink};

/// True when the process stdin is a pipe or a redirected file with data
/// rather than an attached interactive terminal.
fn readable_from_pipe_or_redirection() -> bool {
    let stdin = io::stdin();
    if stdin.is_tty() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        fd_is_pipe_or_nonempty_file(stdin.as_raw_fd())
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(unix)]
fn fd_is_pipe_or_nonempty_file(fd: std::os::unix::io::RawFd) -> bool {
    use std::mem::ManuallyDrop;
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::io::FromRawFd;

    // Borrow the descriptor without adopting ownership.
    let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    match file.metadata() {
        Ok(meta) => meta.file_type().is_fifo() || meta.len() > 0,
        Err(_) => false,
    }
}

/// True when a redirected file can deliver data: a named pipe, or a
/// regular file with nonzero size.
fn file_has_data(file: &File) -> bool {
    match file.metadata() {
        Ok(meta) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                if meta.file_type().is_fifo() {
                    return true;
                }
            }
            meta.len() > 0
        }
        Err(_) => false,
    }
}

/// Input stream installed as the session stdin.
///
/// The variant fixes at assignment time whether the stream can deliver
/// data: a redirected file counts only when it is a named pipe or has
/// nonzero size, while an arbitrary byte source is always considered
/// readable.
pub enum StdinStream {
    /// The process's inherited standard input.
    Inherited(io::Stdin),
    /// A redirected file.
    File(File),
    /// Any other byte source.
    Reader(Box<dyn ReadSource>),
}

impl StdinStream {
    fn can_deliver(&self) -> bool {
        match self {
            StdinStream::Inherited(_) => readable_from_pipe_or_redirection(),
            StdinStream::File(file) => file_has_data(file),
            StdinStream::Reader(_) => true,
        }
    }

    /// Close the stream. Only a wrapped byte source has its own close;
    /// the inherited handle and redirected files close on drop.
    pub fn close(&mut self) -> io::Result<()> {
        match self {
            StdinStream::Reader(source) => source.close(),
            _ => Ok(()),
        }
    }
}

impl Read for StdinStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StdinStream::Inherited(stdin) => stdin.read(buf),
            StdinStream::File(file) => file.read(buf),
            StdinStream::Reader(source) => source.read(buf),
        }
    }
}

/// Output channel selected by a write operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Channel {
    Stdout,
    Stderr,
}

/// Sink resolved for a single write: a closed set chosen from the current
/// output assignments.
enum SinkRef<'a> {
    Terminal(&'a mut dyn VirtualTerminal),
    Stream(&'a mut dyn WriteSink),
    Null,
}

struct OutputState {
    stdout: Option<Box<dyn WriteSink>>,
    stderr: Option<Box<dyn WriteSink>>,
    out_file: Option<Box<dyn WriteSink>>,
    terminal: Option<Box<dyn VirtualTerminal>>,
}

impl OutputState {
    /// An attached terminal takes the write regardless of channel; a raw
    /// stream takes it otherwise; an unassigned channel swallows it.
    fn sink_for(&mut self, channel: Channel) -> SinkRef<'_> {
        if let Some(terminal) = self.terminal.as_deref_mut() {
            return SinkRef::Terminal(terminal);
        }
        let stream = match channel {
            Channel::Stdout => self.stdout.as_deref_mut(),
            Channel::Stderr => self.stderr.as_deref_mut(),
        };
        match stream {
            Some(stream) => SinkRef::Stream(stream),
            None => SinkRef::Null,
        }
    }
}

struct StdinState {
    stream: Option<StdinStream>,
    can_read: bool,
    views: ViewMap,
}

/// Process-wide coordination point for stdin, output sinks, and the view
/// cache derived from stdin.
pub struct Session {
    /// The controlling screen is an interactive terminal.
    screen_is_terminal: bool,
    /// Stdin-domain state. The mutex provides memory safety; replacement
    /// is additionally serialized through `stdin_locker`.
    stdin: Mutex<StdinState>,
    /// Serializes stdin replacement against reads of the stream.
    stdin_locker: StdinLocker,
    /// Output-domain state; every write holds this mutex for its duration.
    out: Mutex<OutputState>,
}

impl Session {
    /// Create a session wired to the process's real standard streams.
    ///
    /// Whether stdin currently has data is probed once here: piped input
    /// or a redirected file with content seeds the flag true, an attached
    /// interactive terminal seeds it false.
    pub fn new() -> Self {
        let can_read = readable_from_pipe_or_redirection();

        Session {
            screen_is_terminal: io::stdin().is_tty(),
            stdin: Mutex::new(StdinState {
                stream: Some(StdinStream::Inherited(io::stdin())),
                can_read,
                views: ViewMap::new(),
            }),
            stdin_locker: StdinLocker::new(),
            out: Mutex::new(OutputState {
                stdout: Some(Box::new(io::stdout())),
                stderr: Some(Box::new(io::stderr())),
                out_file: None,
                terminal: None,
            }),
        }
    }

    /// Whether the controlling screen is an interactive terminal.
    pub fn screen_is_terminal(&self) -> bool {
        self.screen_is_terminal
    }

    /// Whether stdin currently has piped or redirected data to read.
    pub fn can_read_stdin(&self) -> bool {
        self.stdin.lock().unwrap().can_read
    }

    /// Whether an interactive terminal is attached.
    pub fn has_terminal(&self) -> bool {
        self.out.lock().unwrap().terminal.is_some()
    }

    /// Whether an out-file sink is attached.
    pub fn has_out_file(&self) -> bool {
        self.out.lock().unwrap().out_file.is_some()
    }

    /// Return the view parsed from stdin for `expr`, reading the stream at
    /// most once.
    ///
    /// A cached view is returned as-is without touching the stream. The
    /// first call for a reference reads the entire current stdin into
    /// memory, hands the bytes to `loader`, and caches the result under
    /// its resolved path, so repeated calls on an unmodified stream return
    /// the identical view.
    ///
    /// Stream replacement via [`Session::set_stdin_context`] holds the
    /// exclusive stdin lock, but this read path takes no hold on it;
    /// callers interleaving reads with replacement must serialize
    /// externally.
    pub fn get_stdin_view(
        &self,
        token: &CancelToken,
        flags: &Flags,
        loader: &dyn ViewLoader,
        file_info: FileInfo,
        expr: &SourceRef,
    ) -> Result<Arc<View>> {
        let mut state = self.stdin.lock().unwrap();

        if let Some(view) = state.views.get(expr) {
            return Ok(view);
        }

        if !state.can_read {
            return Err(SessionError::StdinEmpty {
                reference: expr.to_string(),
            });
        }

        let stream = match state.stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(SessionError::StdinEmpty {
                    reference: expr.to_string(),
                })
            }
        };

        let mut data = Vec::new();
        if let Err(err) = stream.read_to_end(&mut data) {
            return Err(SessionError::Io {
                reference: expr.to_string(),
                message: err.to_string(),
            });
        }

        let path = file_info.path.clone();
        let view = loader
            .load(token, &data, flags, file_info, flags.without_null)
            .map_err(|err| match err.downcast::<SessionError>() {
                Ok(domain) => *domain,
                Err(other) => SessionError::DataParsing {
                    path,
                    message: other.to_string(),
                },
            })?;

        debug!(reference = %expr, records = view.record_count(), "cached stdin view");
        Ok(state.views.store(view))
    }

    /// Replace the session stdin, waiting indefinitely for the exclusive
    /// lock.
    pub fn set_stdin(&self, stream: Option<StdinStream>) -> Result<()> {
        self.set_stdin_context(&CancelToken::new(), stream)
    }

    /// Replace the session stdin.
    ///
    /// Takes the exclusive stdin lock, propagating `LockTimeout` when
    /// `token` fires first; on success recomputes data availability for
    /// the new stream, drops every cached view, and installs the stream.
    /// The lock is released on every exit path.
    pub fn set_stdin_context(
        &self,
        token: &CancelToken,
        stream: Option<StdinStream>,
    ) -> Result<()> {
        self.stdin_locker.lock_context(token)?;

        {
            let mut state = self.stdin.lock().unwrap();
            state.can_read = stream.as_ref().map_or(false, StdinStream::can_deliver);
            state.stream = stream;
            state.views.clear();
        }
        debug!("stdin stream replaced, view cache cleared");

        self.stdin_locker.unlock()
    }

    /// Route stdout writes to `sink`; `None` drops them.
    pub fn set_stdout(&self, sink: Option<Box<dyn WriteSink>>) {
        self.out.lock().unwrap().stdout = sink;
    }

    /// Route stderr writes to `sink`; `None` drops them.
    pub fn set_stderr(&self, sink: Option<Box<dyn WriteSink>>) {
        self.out.lock().unwrap().stderr = sink;
    }

    /// Attach or detach the result out-file sink.
    pub fn set_out_file(&self, sink: Option<Box<dyn WriteSink>>) {
        self.out.lock().unwrap().out_file = sink;
    }

    /// Attach or detach an interactive terminal. While attached it
    /// receives every stdout and stderr write.
    pub fn set_terminal(&self, terminal: Option<Box<dyn VirtualTerminal>>) {
        self.out.lock().unwrap().terminal = terminal;
    }

    /// Write result text to the stdout channel.
    pub fn write_to_stdout(&self, text: &str) -> io::Result<()> {
        self.emit(Channel::Stdout, text)
    }

    /// Write result text to the stdout channel, terminated with exactly
    /// one line break.
    pub fn write_to_stdout_with_line_break(&self, text: &str) -> io::Result<()> {
        self.emit_with_line_break(Channel::Stdout, text)
    }

    /// Write diagnostic text to the stderr channel.
    pub fn write_to_stderr(&self, text: &str) -> io::Result<()> {
        self.emit(Channel::Stderr, text)
    }

    /// Write diagnostic text to the stderr channel, terminated with
    /// exactly one line break.
    pub fn write_to_stderr_with_line_break(&self, text: &str) -> io::Result<()> {
        self.emit_with_line_break(Channel::Stderr, text)
    }

    /// Write to the attached out-file; a no-op when none is attached.
    pub fn write_to_out_file(&self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock().unwrap();
        match out.out_file.as_mut() {
            Some(sink) => sink.write_all(text.as_bytes()),
            None => Ok(()),
        }
    }

    fn emit(&self, channel: Channel, text: &str) -> io::Result<()> {
        let mut out = self.out.lock().unwrap();
        match out.sink_for(channel) {
            SinkRef::Terminal(terminal) => match channel {
                Channel::Stdout => terminal.write(text),
                Channel::Stderr => terminal.write_error(text),
            },
            SinkRef::Stream(stream) => stream.write_all(text.as_bytes()),
            SinkRef::Null => Ok(()),
        }
    }

    fn emit_with_line_break(&self, channel: Channel, text: &str) -> io::Result<()> {
        if !text.is_empty() && !text.ends_with('\n') {
            let mut line = String::with_capacity(text.len() + 1);
            line.push_str(text);
            line.push('\n');
            return self.emit(channel, &line);
        }
        self.emit(channel, text)
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Input, Output};
    use std::error::Error;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Loader splitting lines on commas; the first record is the header.
    struct LineLoader {
        calls: AtomicUsize,
    }

    impl LineLoader {
        fn new() -> Self {
            LineLoader {
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ViewLoader for LineLoader {
        fn load(
            &self,
            _token: &CancelToken,
            data: &[u8],
            _flags: &Flags,
            file_info: FileInfo,
            without_null: bool,
        ) -> std::result::Result<View, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let text = std::str::from_utf8(data)?;
            let mut lines = text.lines();
            let header: Vec<String> = lines
                .next()
                .unwrap_or("")
                .split(',')
                .map(str::to_string)
                .collect();
            let records = lines
                .map(|line| {
                    line.split(',')
                        .map(|field| {
                            if field.is_empty() && !without_null {
                                None
                            } else {
                                Some(field.to_string())
                            }
                        })
                        .collect()
                })
                .collect();

            Ok(View {
                file_info,
                header,
                records,
            })
        }
    }

    /// Loader that always fails with the given message.
    struct FailingLoader {
        message: &'static str,
        domain: bool,
    }

    impl ViewLoader for FailingLoader {
        fn load(
            &self,
            _token: &CancelToken,
            _data: &[u8],
            _flags: &Flags,
            file_info: FileInfo,
            _without_null: bool,
        ) -> std::result::Result<View, Box<dyn Error + Send + Sync>> {
            if self.domain {
                Err(Box::new(SessionError::StdinEmpty {
                    reference: file_info.path.display().to_string(),
                }))
            } else {
                Err(self.message.into())
            }
        }
    }

    /// Terminal double recording every routed write.
    #[derive(Clone, Default)]
    struct RecordingTerminal {
        writes: Arc<Mutex<Vec<String>>>,
        error_writes: Arc<Mutex<Vec<String>>>,
    }

    impl VirtualTerminal for RecordingTerminal {
        fn write(&mut self, text: &str) -> io::Result<()> {
            self.writes.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn write_error(&mut self, text: &str) -> io::Result<()> {
            self.error_writes.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn piped_session(content: &str) -> Session {
        let session = Session::new();
        let stream = StdinStream::Reader(Box::new(Input::new(Cursor::new(
            content.as_bytes().to_vec(),
        ))));
        session.set_stdin(Some(stream)).unwrap();
        session
    }

    #[test]
    fn test_get_stdin_view_reads_stream_once() {
        let session = piped_session("a,b\n1,2\n");
        let loader = LineLoader::new();
        let flags = Flags::default();
        let expr = SourceRef::stdin();

        let first = session
            .get_stdin_view(
                &CancelToken::new(),
                &flags,
                &loader,
                FileInfo::for_stdin(&flags),
                &expr,
            )
            .unwrap();
        assert_eq!(first.header, vec!["a", "b"]);
        assert_eq!(first.record_count(), 1);

        let second = session
            .get_stdin_view(
                &CancelToken::new(),
                &flags,
                &loader,
                FileInfo::for_stdin(&flags),
                &expr,
            )
            .unwrap();

        // Same cached view object, one stream read, one parse.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.call_count(), 1);
    }

    #[test]
    fn test_get_stdin_view_without_data_is_stdin_empty() {
        let session = Session::new();
        session.set_stdin(None).unwrap();
        assert!(!session.can_read_stdin());

        let loader = LineLoader::new();
        let flags = Flags::default();
        let result = session.get_stdin_view(
            &CancelToken::new(),
            &flags,
            &loader,
            FileInfo::for_stdin(&flags),
            &SourceRef::stdin(),
        );

        assert!(matches!(result, Err(SessionError::StdinEmpty { .. })));
        assert_eq!(loader.call_count(), 0);
    }

    #[test]
    fn test_set_stdin_clears_the_cache() {
        let session = piped_session("a,b\n1,2\n");
        let loader = LineLoader::new();
        let flags = Flags::default();
        let expr = SourceRef::stdin();

        let first = session
            .get_stdin_view(
                &CancelToken::new(),
                &flags,
                &loader,
                FileInfo::for_stdin(&flags),
                &expr,
            )
            .unwrap();

        let replacement = StdinStream::Reader(Box::new(Input::new(Cursor::new(
            b"x,y\n9,8\n".to_vec(),
        ))));
        session.set_stdin(Some(replacement)).unwrap();

        let second = session
            .get_stdin_view(
                &CancelToken::new(),
                &flags,
                &loader,
                FileInfo::for_stdin(&flags),
                &expr,
            )
            .unwrap();

        // The stale view is gone; the new stream was read and parsed.
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.header, vec!["x", "y"]);
        assert_eq!(loader.call_count(), 2);
    }

    #[test]
    fn test_set_stdin_context_propagates_lock_timeout() {
        let session = Session::new();
        session.stdin_locker.rlock().unwrap();

        let token = CancelToken::with_timeout(Duration::from_millis(30));
        let result = session.set_stdin_context(&token, None);
        assert!(matches!(result, Err(SessionError::LockTimeout { .. })));

        // The failed replacement left the session untouched.
        session.stdin_locker.runlock().unwrap();
        session.set_stdin(None).unwrap();
    }

    #[test]
    fn test_redirected_file_availability() {
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piped.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "a,b").unwrap();

        let session = Session::new();
        session
            .set_stdin(Some(StdinStream::File(File::open(&path).unwrap())))
            .unwrap();
        assert!(session.can_read_stdin());

        let empty = dir.path().join("empty.csv");
        std::fs::File::create(&empty).unwrap();
        session
            .set_stdin(Some(StdinStream::File(File::open(&empty).unwrap())))
            .unwrap();
        assert!(!session.can_read_stdin());
    }

    #[test]
    fn test_non_domain_loader_error_is_wrapped() {
        let session = piped_session("a,b\n");
        let loader = FailingLoader {
            message: "broken quoting",
            domain: false,
        };
        let flags = Flags::default();

        let result = session.get_stdin_view(
            &CancelToken::new(),
            &flags,
            &loader,
            FileInfo::for_stdin(&flags),
            &SourceRef::stdin(),
        );

        match result {
            Err(SessionError::DataParsing { path, message }) => {
                assert_eq!(path.to_string_lossy(), "STDIN");
                assert_eq!(message, "broken quoting");
            }
            other => panic!("expected DataParsing, got {:?}", other),
        }
    }

    #[test]
    fn test_domain_loader_error_passes_through() {
        let session = piped_session("a,b\n");
        let loader = FailingLoader {
            message: "",
            domain: true,
        };
        let flags = Flags::default();

        let result = session.get_stdin_view(
            &CancelToken::new(),
            &flags,
            &loader,
            FileInfo::for_stdin(&flags),
            &SourceRef::stdin(),
        );

        assert!(matches!(result, Err(SessionError::StdinEmpty { .. })));
    }

    #[test]
    fn test_write_with_line_break_appends_exactly_one() {
        let session = Session::new();
        let captured = Output::new();
        session.set_stdout(Some(Box::new(captured.clone())));

        session.write_to_stdout_with_line_break("result").unwrap();
        assert_eq!(captured.text(), "result\n");

        session.write_to_stdout_with_line_break("done\n").unwrap();
        assert_eq!(captured.text(), "result\ndone\n");

        session.write_to_stdout_with_line_break("").unwrap();
        assert_eq!(captured.text(), "result\ndone\n");
    }

    #[test]
    fn test_terminal_takes_every_channel_write() {
        let session = Session::new();
        let captured = Output::new();
        session.set_stdout(Some(Box::new(captured.clone())));
        session.set_stderr(Some(Box::new(captured.clone())));

        let terminal = RecordingTerminal::default();
        session.set_terminal(Some(Box::new(terminal.clone())));

        session.write_to_stdout("result").unwrap();
        session.write_to_stderr_with_line_break("warning").unwrap();

        assert_eq!(*terminal.writes.lock().unwrap(), vec!["result"]);
        assert_eq!(*terminal.error_writes.lock().unwrap(), vec!["warning\n"]);
        // The raw streams saw nothing while the terminal was attached.
        assert!(captured.is_empty());

        session.set_terminal(None);
        session.write_to_stdout("plain").unwrap();
        assert_eq!(captured.text(), "plain");
    }

    #[test]
    fn test_write_without_sink_is_a_noop() {
        let session = Session::new();
        session.set_stdout(None);
        session.set_stderr(None);

        assert!(session.write_to_stdout("dropped").is_ok());
        assert!(session.write_to_stderr("dropped").is_ok());
    }

    #[test]
    fn test_out_file_writes() {
        let session = Session::new();
        assert!(!session.has_out_file());

        // Without a sink the write is a no-op.
        session.write_to_out_file("dropped").unwrap();

        let captured = Output::new();
        session.set_out_file(Some(Box::new(captured.clone())));
        assert!(session.has_out_file());

        session.write_to_out_file("1,2\n").unwrap();
        assert_eq!(captured.text(), "1,2\n");
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let session = Arc::new(Session::new());
        let captured = Output::new();
        session.set_stdout(Some(Box::new(captured.clone())));

        let mut handles = Vec::new();
        for line in ["aaaa", "bbbb"] {
            let session = Arc::clone(&session);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    session.write_to_stdout_with_line_break(line).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let text = captured.text();
        assert_eq!(text.lines().count(), 200);
        for line in text.lines() {
            assert!(line == "aaaa" || line == "bbbb", "interleaved: {}", line);
        }
    }
}
