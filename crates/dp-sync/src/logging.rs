//! Tracing setup and the in-memory log ring served by `/logs`.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_LINES: usize = 10_000;

/// Bounded buffer of the most recent formatted log lines.
#[derive(Clone)]
pub struct LogRing {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LINES)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A poisoned ring still holds valid lines.
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_line(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writer handed to the fmt layer; completed lines land in the ring.
pub struct LogRingWriter {
    ring: LogRing,
    pending: Vec<u8>,
}

impl LogRingWriter {
    fn drain_lines(&mut self, flush_partial: bool) {
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.ring.push_line(text);
        }
        if flush_partial && !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.ring.push_line(text);
        }
    }
}

impl io::Write for LogRingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.drain_lines(false);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_lines(true);
        Ok(())
    }
}

impl Drop for LogRingWriter {
    fn drop(&mut self) {
        self.drain_lines(true);
    }
}

impl<'a> MakeWriter<'a> for LogRing {
    type Writer = LogRingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogRingWriter {
            ring: self.clone(),
            pending: Vec::new(),
        }
    }
}

/// Install the global subscriber: stderr output plus a copy into `ring`.
///
/// `RUST_LOG` overrides `default_directive`. Returns `false` when a subscriber was
/// already installed.
pub fn init_tracing(ring: &LogRing, default_directive: &str) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(ring.clone()),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ring_keeps_only_the_newest_lines() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push_line(format!("line {i}"));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.tail(2), vec!["line 3", "line 4"]);
        assert_eq!(ring.tail(10).len(), 3);
    }

    #[test]
    fn writer_splits_on_newlines() {
        let ring = LogRing::new(10);
        {
            let mut writer = ring.make_writer();
            writer.write_all(b"first\nsec").expect("write");
            writer.write_all(b"ond\nthird").expect("write");
        }
        assert_eq!(ring.tail(10), vec!["first", "second", "third"]);
    }

    #[test]
    fn subscriber_feeds_the_ring() {
        let ring = LogRing::new(100);
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(ring.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(path = "data/a.raw", "dispatched");
        });
        let lines = ring.tail(1);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("dispatched"));
        assert!(lines[0].contains("data/a.raw"));
    }
}
