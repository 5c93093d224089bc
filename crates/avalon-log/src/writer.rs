//! The single-writer log actor.
//!
//! All appends for one room funnel through an mpsc channel into one
//! writer task, so exactly one write is in flight at a time and entries
//! land in FIFO order — the actor replacement for the legacy
//! boolean-mutex-plus-array queue.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use avalon_protocol::RoomCode;

use crate::{LogError, LogRecord};

/// On-disk shape: a JSON object wrapping the append-only array, the
/// format the replay consumer reads.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LogFile {
    #[serde(default)]
    logs: Vec<LogRecord>,
}

enum LogCommand {
    Append(LogRecord),
    /// Replies once every previously queued append has been written.
    Sync(oneshot::Sender<()>),
}

/// Handle to a room's log writer. Cheap to clone; dropping every handle
/// stops the writer task after it drains its queue.
#[derive(Clone)]
pub struct GameLog {
    tx: mpsc::UnboundedSender<LogCommand>,
    path: PathBuf,
}

impl GameLog {
    /// Opens (or creates) `<dir>/<room>.json` and spawns the writer.
    pub fn open(dir: impl AsRef<Path>, room: &RoomCode) -> Self {
        let path = dir.as_ref().join(format!("{room}.json"));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path.clone(), rx));
        Self { tx, path }
    }

    /// Queues a record for appending. Never blocks; write failures are
    /// logged by the writer task rather than surfaced here, because a
    /// log hiccup must not take the game down with it.
    pub fn append(&self, record: LogRecord) {
        if self.tx.send(LogCommand::Append(record)).is_err() {
            tracing::error!(path = %self.path.display(), "log writer is gone, entry dropped");
        }
    }

    /// Waits until everything queued so far is on disk.
    pub async fn sync(&self) -> Result<(), LogError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LogCommand::Sync(tx))
            .map_err(|_| LogError::WriterGone)?;
        rx.await.map_err(|_| LogError::WriterGone)
    }

    /// The log file this handle appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads the existing log array, appends, and writes the whole file
/// back. One invocation at a time by construction.
async fn append_to_file(path: &Path, record: LogRecord) -> Result<(), LogError> {
    let mut file: LogFile = match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            LogFile::default()
        }
        Err(e) => return Err(e.into()),
    };

    file.logs.push(record);
    let bytes = serde_json::to_vec_pretty(&file)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
    tracing::debug!(path = %path.display(), "log writer started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LogCommand::Append(record) => {
                if let Err(e) = append_to_file(&path, record).await {
                    tracing::error!(path = %path.display(), error = %e, "failed to append log entry");
                }
            }
            LogCommand::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!(path = %path.display(), "log writer stopped");
}
