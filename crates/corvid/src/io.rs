use std::{
    borrow::Cow,
    io::{self, Write as _},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::exception_private::RunResult;

/// Destination for output from the `print()` builtin.
///
/// Implement this trait to capture or redirect what programs print. The runtime holds one
/// writer behind a lock, so sessions on several threads interleave whole `print` calls.
pub trait PrintWriter: Send {
    /// Writes one formatted argument, without separators or a terminator.
    fn stdout_write(&mut self, output: Cow<'_, str>) -> RunResult<()>;

    /// Adds a single character, used for separators and line ends.
    fn stdout_push(&mut self, end: char) -> RunResult<()>;

    /// Called after each `print` with `flush=True` and when a session finishes.
    fn flush(&mut self) -> RunResult<()> {
        Ok(())
    }
}

/// Default writer: buffers and writes to the process's stdout.
///
/// Output is flushed at every newline-terminated `print` batch the runtime completes and
/// when the writer is dropped.
#[derive(Debug, Default)]
pub struct StdPrint {
    buffer: String,
}

impl StdPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(self.buffer.as_bytes());
        let _ = stdout.flush();
        self.buffer.clear();
    }
}

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> RunResult<()> {
        self.buffer.push_str(&output);
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> RunResult<()> {
        self.buffer.push(end);
        if end == '\n' && self.buffer.len() > 8 * 1024 {
            self.flush_buffer();
        }
        Ok(())
    }

    fn flush(&mut self) -> RunResult<()> {
        self.flush_buffer();
        Ok(())
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        self.flush_buffer();
    }
}

/// Collects everything printed into a shared string.
///
/// Clones share the buffer, so a test can hand one clone to the runtime and read the
/// output through another.
#[derive(Debug, Clone, Default)]
pub struct CollectStringPrint(Arc<Mutex<String>>);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> String {
        self.0.lock().clone()
    }

    /// Returns the output so far and empties the buffer.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.0.lock())
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> RunResult<()> {
        self.0.lock().push_str(&output);
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> RunResult<()> {
        self.0.lock().push(end);
        Ok(())
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) -> RunResult<()> {
        Ok(())
    }

    fn stdout_push(&mut self, _end: char) -> RunResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn collected_output_is_shared_between_clones() {
        let reader = CollectStringPrint::new();
        let mut writer = reader.clone();
        writer.stdout_write(Cow::Borrowed("hello")).unwrap();
        writer.stdout_push('\n').unwrap();
        assert_eq!(reader.output(), "hello\n");
        assert_eq!(reader.take(), "hello\n");
        assert_eq!(reader.output(), "");
    }
}
