//! Minimal operator-facing output.
//!
//! Everything else goes to the harness log file via `tracing`.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared buffer handed out by [`Console::buffered`].
pub type CapturedOutput = Arc<Mutex<Vec<u8>>>;

/// Line-oriented writer for `[PASS]`/`[FAIL]`/`[SKIP]`/`[HARNESS]` lines.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Console writing into memory; returns the buffer for inspection.
    pub fn buffered() -> (Self, CapturedOutput) {
        let buffer: CapturedOutput = Arc::new(Mutex::new(Vec::new()));
        let console = Self::new(Box::new(SharedWriter(Arc::clone(&buffer))));
        (console, buffer)
    }

    fn line(&self, text: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Best-effort: a closed stdout must not abort a run.
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }

    pub fn harness(&self, message: &str) {
        self.line(&format!("[HARNESS] {message}"));
    }

    pub fn pass(&self, name: &str, duration: Duration) {
        self.line(&format!("[PASS] {name} ({:.1}s)", duration.as_secs_f64()));
    }

    pub fn fail(&self, name: &str, duration: Duration) {
        self.line(&format!(
            "[FAIL] {name} ({:.1}s) - see harness.log",
            duration.as_secs_f64()
        ));
    }

    pub fn skip(&self, name: &str, reason: &str) {
        self.line(&format!("[SKIP] {name} - {reason}"));
    }

    pub fn summary(&self, passed: usize, total: usize, failed: usize, duration: Duration) {
        self.harness(&format!(
            "Complete: {passed}/{total} passed, {failed} failed ({:.1}s total)",
            duration.as_secs_f64()
        ));
    }
}

struct SharedWriter(CapturedOutput);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = match self.0.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode a captured buffer for assertions.
pub fn captured_text(buffer: &CapturedOutput) -> String {
    let bytes = match buffer.lock() {
        Ok(bytes) => bytes.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}
