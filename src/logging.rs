//! Log tail and tracing setup.
//!
//! Everything the dashboard shows in its log pane goes through a [`LogSink`].
//! `tracing` output is routed into the same sink by [`TailMakeWriter`], so bot
//! reports, gateway errors and internal diagnostics end up in one place.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "hydra=debug,info";

/// Destination for log lines. The sink owns its retention policy.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);

    /// The most recent `n` lines, oldest first.
    fn tail(&self, n: usize) -> Vec<String>;
}

/// In-memory ring of the last `retention` lines.
pub struct LogTail {
    lines: Mutex<VecDeque<String>>,
    retention: usize,
}

impl LogTail {
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(retention)),
            retention,
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.lines.lock().expect("log tail mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("log tail mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl LogSink for LogTail {
    fn append(&self, line: &str) {
        let mut lines = self.lines.lock().expect("log tail mutex poisoned");
        lines.push_back(line.trim_end().to_string());
        while lines.len() > self.retention {
            lines.pop_front();
        }
    }

    fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("log tail mutex poisoned");
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }
}

/// `MakeWriter` that hands formatted tracing records to a [`LogSink`].
#[derive(Clone)]
pub struct TailMakeWriter {
    sink: Arc<dyn LogSink>,
}

impl TailMakeWriter {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl<'a> MakeWriter<'a> for TailMakeWriter {
    type Writer = TailWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TailWriter {
            sink: Arc::clone(&self.sink),
            buf: Vec::new(),
        }
    }
}

/// Buffers one record and appends it line by line when dropped.
pub struct TailWriter {
    sink: Arc<dyn LogSink>,
    buf: Vec<u8>,
}

impl io::Write for TailWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TailWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            self.sink.append(line);
        }
    }
}

/// Install the global subscriber: an `EnvFilter` (default
/// `hydra=debug,info`, overridden by `RUST_LOG`), a layer writing into the log
/// tail and, when `log_file` is set, a plain-text file layer.
pub fn init_tracing(sink: Arc<dyn LogSink>, log_file: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let tail_layer = tracing_subscriber::fmt::layer()
        .with_writer(TailMakeWriter::new(sink))
        .with_ansi(false)
        .with_target(false)
        .without_time();

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        None => None,
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(tail_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn tail_keeps_only_the_newest_lines() {
        let tail = LogTail::new(3);
        for i in 0..5 {
            tail.append(&format!("line {i}"));
        }
        assert_eq!(tail.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(tail.tail(2), vec!["line 3", "line 4"]);
        assert_eq!(tail.tail(10).len(), 3);
    }

    #[test]
    fn zero_retention_still_keeps_one_line() {
        let tail = LogTail::new(0);
        tail.append("a");
        tail.append("b");
        assert_eq!(tail.lines(), vec!["b"]);
    }

    #[test]
    fn writer_splits_records_into_lines_on_drop() {
        let tail = Arc::new(LogTail::new(10));
        let make = TailMakeWriter::new(tail.clone());
        {
            let mut writer = make.make_writer();
            writer.write_all(b" INFO first\n").unwrap();
            writer.write_all(b" WARN second\n\n").unwrap();
            assert!(tail.is_empty());
        }
        assert_eq!(tail.lines(), vec![" INFO first", " WARN second"]);
    }
}
