//! Log sink and tracing setup.
//!
//! Every process in the tree (master, workers, service children before
//! exec) logs through one [`LogSink`]. The sink writes to stderr or to an
//! append-mode file, and can be reopened after a fork or after the file was
//! rotated away.

use marionette_common::config::LogLevel;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

enum SinkTarget {
    Stderr,
    File(File),
}

/// Reopenable log destination, usable as a `tracing_subscriber` writer.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<SinkTarget>>,
    path: Option<PathBuf>,
}

impl LogSink {
    /// Sink writing to stderr.
    pub fn stderr() -> Self {
        Self {
            target: Arc::new(Mutex::new(SinkTarget::Stderr)),
            path: None,
        }
    }

    /// Sink appending to `path`, created if missing.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            target: Arc::new(Mutex::new(SinkTarget::File(file))),
            path: Some(path.to_path_buf()),
        })
    }

    /// Backing file path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reopen the backing file. No-op for stderr.
    pub fn reopen(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            let file = open_append(path)?;
            *self.target.lock() = SinkTarget::File(file);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").field("path", &self.path).finish()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writer handed out per event by [`LogSink`].
pub struct SinkWriter {
    target: Arc<Mutex<SinkTarget>>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.target.lock() {
            SinkTarget::Stderr => io::stderr().write(buf),
            SinkTarget::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.target.lock() {
            SinkTarget::Stderr => io::stderr().flush(),
            SinkTarget::File(file) => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            target: Arc::clone(&self.target),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level; `verbose` forces DEBUG.
/// Installing twice is silently ignored.
pub fn init_tracing(sink: &LogSink, level: LogLevel, verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink.clone())
        .with_ansi(sink.path().is_none());

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.log");
        let sink = LogSink::file(&path).unwrap();

        sink.make_writer().write_all(b"one\n").unwrap();
        sink.make_writer().write_all(b"two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        assert_eq!(sink.path(), Some(path.as_path()));
    }

    #[test]
    fn test_reopen_follows_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.log");
        let rotated = dir.path().join("m.log.1");
        let sink = LogSink::file(&path).unwrap();

        sink.make_writer().write_all(b"before\n").unwrap();
        std::fs::rename(&path, &rotated).unwrap();
        sink.reopen().unwrap();
        sink.make_writer().write_all(b"after\n").unwrap();

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "before\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn test_stderr_reopen_is_noop() {
        let sink = LogSink::stderr();
        assert!(sink.path().is_none());
        assert!(sink.reopen().is_ok());
    }
}
