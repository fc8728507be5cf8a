//! JSONL sink for recorded webhook deliveries and platform calls.
//!
//! The file is opened up front so a bad `RECORDING_LOG_PATH` fails at
//! startup. After that, handlers only push onto a channel and a single task
//! owns the file, so lines from concurrent deliveries never interleave.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::RecordedEvent;

#[derive(Clone)]
pub struct RecordingLogger {
    events: mpsc::UnboundedSender<RecordedEvent>,
    path: Arc<PathBuf>,
}

impl RecordingLogger {
    /// Open (creating parents as needed) `path` for appending and start the
    /// writer task. Must be called inside a tokio runtime.
    pub fn new(path: PathBuf) -> Result<Self> {
        let file = open_for_append(&path)?;
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(File::from_std(file), path.clone(), rx));
        Ok(Self {
            events,
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `event`; never blocks the caller.
    pub fn record(&self, event: RecordedEvent) {
        if let Err(mpsc::error::SendError(event)) = self.events.send(event) {
            warn!(
                "Recording writer for {} has stopped, dropping {} event",
                self.path.display(),
                event.operation
            );
        }
    }
}

fn open_for_append(path: &Path) -> Result<fs::File> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create recording directory {}", dir.display()))?,
        _ => {}
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open recording log {}", path.display()))
}

/// One event per line; the line is flushed before the next one is taken.
async fn write_lines(
    mut file: File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<RecordedEvent>,
) {
    while let Some(event) = rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                error!("Cannot encode recorded {} event: {}", event.operation, e);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = file.write_all(&line).await {
            error!("Write to {} failed: {}", path.display(), e);
            continue;
        }
        if let Err(e) = file.flush().await {
            error!("Flush of {} failed: {}", path.display(), e);
        }
    }
    debug!("All recording handles dropped, closing {}", path.display());
}
