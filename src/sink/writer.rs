//! The sink worker. Runs on its own OS thread and is the only owner of the
//! output file handle.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::clock::Clock;

use super::pattern::FilenamePattern;
use super::{SinkError, SinkShared};

/// Mailbox vocabulary of the sink worker. Control messages carry the reply
/// channel for the acknowledgment.
#[derive(Debug)]
pub(crate) enum SinkMessage {
    Line(Vec<u8>),
    Commit(oneshot::Sender<u64>),
    End(oneshot::Sender<u64>),
    Terminate(oneshot::Sender<u64>),
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

pub(crate) struct SinkWorker {
    pattern: FilenamePattern,
    symlink: Option<PathBuf>,
    clock: Clock,
    current: Option<OpenFile>,
    lines_written: u64,
    shared: Arc<SinkShared>,
}

impl SinkWorker {
    pub(crate) fn new(
        pattern: FilenamePattern,
        symlink: Option<PathBuf>,
        clock: Clock,
        shared: Arc<SinkShared>,
    ) -> Self {
        let lines_written = shared.lines_written.load(Ordering::Acquire);
        Self {
            pattern,
            symlink,
            clock,
            current: None,
            lines_written,
            shared,
        }
    }

    /// Processes messages until `Terminate` or until every producer is gone.
    /// Buffered lines are flushed whenever the mailbox runs empty.
    pub(crate) fn run(mut self, mut rx: mpsc::Receiver<SinkMessage>) -> Result<(), SinkError> {
        loop {
            let msg = match rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => {
                    self.flush()?;
                    match rx.blocking_recv() {
                        Some(msg) => msg,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            match msg {
                SinkMessage::Line(line) => self.write_line(&line)?,
                SinkMessage::Commit(ack) => {
                    self.commit()?;
                    let _ = ack.send(self.lines_written);
                }
                SinkMessage::End(ack) => {
                    self.close()?;
                    let _ = ack.send(self.lines_written);
                }
                SinkMessage::Terminate(ack) => {
                    self.close()?;
                    self.shared.terminated.store(true, Ordering::Release);
                    let _ = ack.send(self.lines_written);
                    info!(lines = self.lines_written, pattern = self.pattern.as_str(), "log sink terminated");
                    return Ok(());
                }
            }
        }

        debug!(pattern = self.pattern.as_str(), "log sink mailbox closed");
        self.close()
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
        let file = self.rotate()?;
        let write = file
            .writer
            .write_all(line)
            .and_then(|()| file.writer.write_all(b"\n"));
        if let Err(source) = write {
            return Err(SinkError::Write {
                path: file.path.clone(),
                source,
            });
        }
        self.lines_written += 1;
        self.shared
            .lines_written
            .store(self.lines_written, Ordering::Release);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SinkError> {
        let lines = self.lines_written;
        let file = self.rotate()?;
        file.writer
            .flush()
            .and_then(|()| file.writer.get_ref().sync_data())
            .map_err(|source| SinkError::Write {
                path: file.path.clone(),
                source,
            })?;
        trace!(path = %file.path.display(), lines, "committed");
        Ok(())
    }

    /// Pushes buffered lines to the kernel without syncing.
    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(file) = self.current.as_mut() {
            file.writer.flush().map_err(|source| SinkError::Write {
                path: file.path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Flushes and closes the current file. The next line reopens.
    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.current.take() {
            file.writer.flush().map_err(|source| SinkError::Write {
                path: file.path.clone(),
                source,
            })?;
            *self.shared.current_file.lock() = None;
            info!(path = %file.path.display(), lines = self.lines_written, "closed log file");
        }
        Ok(())
    }

    /// Returns the file for the current instant, reopening when the
    /// formatted name changed since the last call.
    fn rotate(&mut self) -> Result<&mut OpenFile, SinkError> {
        let path = self.pattern.format(&self.clock.now())?;

        let reuse = matches!(&self.current, Some(file) if file.path == path);
        if !reuse {
            self.close()?;
            let writer = BufWriter::new(open_append(&path)?);
            if let Some(link) = &self.symlink {
                replace_symlink(link, &path)?;
            }
            info!(path = %path.display(), "opened log file");
            *self.shared.current_file.lock() = Some(path.clone());
            self.current = Some(OpenFile { path, writer });
        }

        self.current.as_mut().ok_or(SinkError::Closed)
    }
}

fn open_append(path: &Path) -> Result<File, SinkError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            return Err(SinkError::IsDirectory {
                path: path.to_path_buf(),
            })
        }
        _ => {}
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Points `link` at `target`, replacing whatever `link` was before. A
/// dangling link at `link` counts as existing.
fn replace_symlink(link: &Path, target: &Path) -> Result<(), SinkError> {
    let err = |source: io::Error| SinkError::Symlink {
        link: link.to_path_buf(),
        target: target.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(link) {
        Ok(_) => fs::remove_file(link).map_err(err)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(err(e)),
    }
    std::os::unix::fs::symlink(target, link).map_err(err)?;
    debug!(link = %link.display(), target = %target.display(), "symlink updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_symlink_over_dangling_link() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("current.log");
        let target = dir.path().join("a.log");
        std::os::unix::fs::symlink(dir.path().join("gone.log"), &link).expect("dangling link");
        fs::write(&target, b"").expect("target");

        replace_symlink(&link, &target).expect("replaced");
        assert_eq!(fs::read_link(&link).expect("link"), target);
    }

    #[test]
    fn test_replace_symlink_creates_missing_link() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("current.log");
        let target = dir.path().join("a.log");

        replace_symlink(&link, &target).expect("created");
        assert_eq!(fs::read_link(&link).expect("link"), target);
    }

    #[test]
    fn test_open_directory_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            open_append(dir.path()),
            Err(SinkError::IsDirectory { .. })
        ));
    }

    #[test]
    fn test_open_appends_to_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.log");
        fs::write(&path, b"first\n").expect("seed");

        let mut file = open_append(&path).expect("opened");
        file.write_all(b"second\n").expect("write");
        drop(file);

        assert_eq!(fs::read_to_string(&path).expect("read"), "first\nsecond\n");
    }
}
