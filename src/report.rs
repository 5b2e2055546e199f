//! Ordered text reporting for pass statistics.
//!
//! Passes aggregate their counters during the parallel phase and emit human-readable
//! summaries once per pass through a [`ReportSink`]. The sink serializes writers behind a
//! mutex so concurrent per-function verbose output stays line-atomic.

use std::{
    fmt::Arguments,
    io::Write,
    sync::{Arc, Mutex},
};

/// Thread-safe ordered text output for optimizer statistics.
///
/// # Examples
///
/// ```rust
/// use reforge::report::ReportSink;
///
/// let (sink, buffer) = ReportSink::buffered();
/// sink.info(format_args!("removed {} empty blocks", 3));
/// assert!(String::from_utf8(buffer.lock().unwrap().clone())
///     .unwrap()
///     .contains("removed 3 empty blocks"));
/// ```
#[derive(Clone)]
pub struct ReportSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ReportSink {
    /// Creates a sink writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        ReportSink {
            writer: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
        }
    }

    /// Creates a sink that discards everything.
    #[must_use]
    pub fn sink() -> Self {
        ReportSink {
            writer: Arc::new(Mutex::new(Box::new(std::io::sink()))),
        }
    }

    /// Creates a sink writing into a shared in-memory buffer, returning both.
    ///
    /// Used by tests to assert on emitted statistics.
    #[must_use]
    pub fn buffered() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = ReportSink {
            writer: Arc::new(Mutex::new(Box::new(SharedBuffer(Arc::clone(&buffer))))),
        };
        (sink, buffer)
    }

    /// Writes an informational line.
    pub fn info(&self, args: Arguments<'_>) {
        self.write_line("REFORGE-INFO: ", args);
    }

    /// Writes a warning line.
    pub fn warning(&self, args: Arguments<'_>) {
        self.write_line("REFORGE-WARNING: ", args);
    }

    /// Writes an error line.
    pub fn error(&self, args: Arguments<'_>) {
        self.write_line("REFORGE-ERROR: ", args);
    }

    /// Writes a raw line without a severity prefix.
    pub fn raw(&self, args: Arguments<'_>) {
        self.write_line("", args);
    }

    fn write_line(&self, prefix: &str, args: Arguments<'_>) {
        if let Ok(mut writer) = self.writer.lock() {
            // A failing stats write must never abort the optimization itself.
            let _ = write!(writer, "{prefix}");
            let _ = writer.write_fmt(args);
            let _ = writeln!(writer);
        }
    }
}

impl Default for ReportSink {
    fn default() -> Self {
        ReportSink::stdout()
    }
}

impl std::fmt::Debug for ReportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportSink").finish_non_exhaustive()
    }
}

struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::other("poisoned report buffer"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_prefixes() {
        let (sink, buffer) = ReportSink::buffered();
        sink.info(format_args!("a"));
        sink.warning(format_args!("b"));
        sink.error(format_args!("c"));
        sink.raw(format_args!("d"));

        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(
            text,
            "REFORGE-INFO: a\nREFORGE-WARNING: b\nREFORGE-ERROR: c\nd\n"
        );
    }
}
