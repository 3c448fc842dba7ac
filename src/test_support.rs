//! Test utilities shared across modules.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// In-memory log sink for asserting on what a code path emitted.
///
/// ```ignore
/// let logs = CapturedLogs::default();
/// tracing::subscriber::with_default(logs.subscriber(), || do_work());
/// assert!(logs.text().contains("WARN"));
/// ```
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// A plain-text fmt subscriber that writes every event into this sink.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_target(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || sink.clone())
            .finish()
    }

    /// Everything logged so far.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
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
    fn test_captures_events() {
        let logs = CapturedLogs::default();
        tracing::subscriber::with_default(logs.subscriber(), || {
            tracing::warn!(pid = 7, "hello");
        });
        let text = logs.text();
        assert!(text.contains("WARN"));
        assert!(text.contains("hello"));
        assert!(text.contains("pid=7"));
    }
}
