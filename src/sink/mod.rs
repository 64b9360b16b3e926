//! Rotating log file sink.
//!
//! A [`LogSink`] is a handle to a single-writer worker thread that owns the
//! output file. Producers enqueue lines on a bounded mailbox and wait for
//! acknowledgments on control messages. [`SinkRegistry`] hands out one shared
//! worker per `(pattern, symlink)` pair.

pub mod pattern;
mod writer;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::clock::Clock;

use self::pattern::FilenamePattern;
use self::writer::{SinkMessage, SinkWorker};

/// Errors raised by the log sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("opening {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("linking {} -> {}: {source}", .link.display(), .target.display())]
    Symlink {
        link: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid filename pattern {pattern:?}")]
    Pattern { pattern: String },

    #[error("{} is a directory", .path.display())]
    IsDirectory { path: PathBuf },

    #[error("starting sink worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("log sink worker stopped")]
    Closed,
}

/// State the worker publishes for handles.
#[derive(Debug, Default)]
pub(crate) struct SinkShared {
    lines_written: AtomicU64,
    current_file: Mutex<Option<PathBuf>>,
    terminated: AtomicBool,
}

/// Handle to a running sink worker. Clones share the worker.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<SinkMessage>,
    shared: Arc<SinkShared>,
    pattern: FilenamePattern,
}

impl LogSink {
    /// Starts a worker thread writing to files named by `pattern`.
    pub fn start(
        pattern: FilenamePattern,
        symlink: Option<PathBuf>,
        clock: Clock,
        capacity: usize,
    ) -> Result<Self, SinkError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(SinkShared::default());
        let worker = SinkWorker::new(pattern.clone(), symlink, clock, Arc::clone(&shared));

        let name = pattern.as_str().to_string();
        std::thread::Builder::new()
            .name("log-sink".to_string())
            .spawn(move || {
                if let Err(e) = worker.run(rx) {
                    error!(pattern = %name, error = %e, "log sink failed");
                }
            })
            .map_err(SinkError::Spawn)?;

        info!(pattern = pattern.as_str(), capacity, "log sink started");
        Ok(Self {
            tx,
            shared,
            pattern,
        })
    }

    pub fn pattern(&self) -> &FilenamePattern {
        &self.pattern
    }

    /// Lines written so far by the worker.
    pub fn lines_written(&self) -> u64 {
        self.shared.lines_written.load(Ordering::Acquire)
    }

    /// File the worker currently has open.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.shared.current_file.lock().clone()
    }

    /// False once the worker terminated or failed.
    pub fn is_running(&self) -> bool {
        !self.shared.terminated.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queues one line, waiting while the mailbox is full. The bytes are
    /// written as given, followed by a newline.
    pub async fn submit_line(&self, line: impl Into<Vec<u8>>) -> Result<(), SinkError> {
        self.tx
            .send(SinkMessage::Line(line.into()))
            .await
            .map_err(|_| SinkError::Closed)
    }

    /// Flushes buffered lines to stable storage and returns the line count.
    pub async fn commit(&self) -> Result<u64, SinkError> {
        self.control(SinkMessage::Commit).await
    }

    /// Closes the current file; the next line reopens it.
    pub async fn end(&self) -> Result<u64, SinkError> {
        self.control(SinkMessage::End).await
    }

    /// Closes the current file and stops the worker. Repeated calls return
    /// the final count.
    pub async fn terminate(&self) -> Result<u64, SinkError> {
        self.control(SinkMessage::Terminate).await
    }

    async fn control(
        &self,
        message: fn(oneshot::Sender<u64>) -> SinkMessage,
    ) -> Result<u64, SinkError> {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(message(ack)).await.is_err() {
            return self.after_stop();
        }
        match rx.await {
            Ok(lines) => Ok(lines),
            Err(_) => self.after_stop(),
        }
    }

    fn after_stop(&self) -> Result<u64, SinkError> {
        if self.shared.terminated.load(Ordering::Acquire) {
            Ok(self.lines_written())
        } else {
            Err(SinkError::Closed)
        }
    }
}

type SinkKey = (FilenamePattern, Option<PathBuf>);

/// Find-or-start registry of sinks keyed by `(pattern, symlink)`.
#[derive(Debug)]
pub struct SinkRegistry {
    sinks: Mutex<HashMap<SinkKey, LogSink>>,
    clock: Clock,
    capacity: usize,
}

impl SinkRegistry {
    pub fn new(clock: Clock, capacity: usize) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            clock,
            capacity,
        }
    }

    /// Returns the running sink for the pair, starting one if there is none
    /// or the previous worker has stopped.
    pub fn acquire(&self, pattern: &str, symlink: Option<&Path>) -> Result<LogSink, SinkError> {
        let pattern = FilenamePattern::new(pattern)?;
        let key = (pattern, symlink.map(Path::to_path_buf));

        let mut sinks = self.sinks.lock();
        if let Some(sink) = sinks.get(&key) {
            if sink.is_running() {
                return Ok(sink.clone());
            }
            info!(pattern = key.0.as_str(), "restarting stopped log sink");
        }

        let sink = LogSink::start(key.0.clone(), key.1.clone(), self.clock.clone(), self.capacity)?;
        sinks.insert(key, sink.clone());
        Ok(sink)
    }

    /// Number of registered sinks, running or not.
    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
