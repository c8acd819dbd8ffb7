use std::io;
use std::path::{Path, PathBuf};

use listen_common::listen::encode_line;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::batch::Batch;

/// Append-only file collecting batches that could not be written.
///
/// Listens are written in the sorted dump line format, so the file can be fed back to
/// the importer once the underlying problem is fixed.
pub struct DeadLetterFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl DeadLetterFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every listen of the batch, returning how many were written.
    pub async fn write_batch(&self, batch: &Batch) -> io::Result<u64> {
        let mut buffer = String::new();
        let mut written = 0;
        for listen in batch.listens() {
            match encode_line(listen) {
                Ok(line) => {
                    buffer.push_str(&line);
                    buffer.push('\n');
                    written += 1;
                }
                Err(e) => warn!(
                    batch = batch.sequence(),
                    "failed to encode dead letter listen: {}", e
                ),
            }
        }

        // One write per batch keeps lines from concurrent writers apart.
        let mut file = self.file.lock().await;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        Ok(written)
    }
}
