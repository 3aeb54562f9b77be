//! Orchestration module for service runtimes
//!
//! Provides the low-level start collaborator behind one trait:
//! - Rootless Podman containers
//! - Host processes (no isolation)
//! - A scripted mock for tests

mod dial;
mod exec;
mod factory;
mod local_process;
mod mock;
mod native_podman;
mod runtime;

pub use exec::{CacheMount, ExecSpec};
pub use factory::{create_runtime, Backend};
pub use local_process::HostProcessRuntime;
pub use mock::MockRuntime;
pub use native_podman::NativePodmanRuntime;
pub use runtime::{OutputStream, ProcessExit, ProcessHandle, Runtime, Signal, StartedProcess};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Max number of output lines to include in service error messages.
const ERROR_TAIL_LINES: usize = 50;

/// Rolling buffer of the most recent output lines of a resource
#[derive(Clone, Default)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    /// Create an empty tail
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one line, evicting the oldest beyond the limit
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == ERROR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Render the tail for error diagnostics
    ///
    /// Returns an empty string when nothing was captured, otherwise a
    /// newline-prefixed block so it can be appended to a message.
    pub fn render(&self) -> String {
        let lines = self.lines.lock();
        if lines.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n");
        out.push_str(&lines.iter().cloned().collect::<Vec<_>>().join("\n"));
        out
    }
}

/// Stream stdout+stderr of a resource, calling `on_output` for each line.
///
/// Runs until both streams reach EOF or fail. Absent streams count as
/// already closed. Invalid UTF-8 is replaced rather than ending the stream.
pub async fn stream_output<R1, R2>(
    stdout: Option<R1>,
    stderr: Option<R2>,
    on_output: &(dyn Fn(String) + Send + Sync),
) where
    R1: AsyncRead + Unpin,
    R2: AsyncRead + Unpin,
{
    let mut stdout_reader = stdout.map(LineReader::new);
    let mut stderr_reader = stderr.map(LineReader::new);

    let mut stdout_done = stdout_reader.is_none();
    let mut stderr_done = stderr_reader.is_none();

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = next_line(&mut stderr_reader), if !stderr_done => {
                match line {
                    Some(line) => on_output(line),
                    None => stderr_done = true,
                }
            }
            line = next_line(&mut stdout_reader), if !stdout_done => {
                match line {
                    Some(line) => on_output(line),
                    None => stdout_done = true,
                }
            }
        }
    }
}

/// Byte-oriented line reader
///
/// Partial reads stay in `buf` when a read is interrupted by the other
/// stream, so no output is lost between calls.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(_) if self.buf.is_empty() => None,
            Ok(_) => {
                let mut line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Some(line)
            }
            Err(_) => None,
        }
    }
}

async fn next_line<R: AsyncRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Option<String> {
    match reader {
        Some(lines) => lines.next().await,
        None => None,
    }
}
