//! Receiver-side file output.
//!
//! Verified chunks are appended to `<name>.part` next to the destination.
//! The part file is renamed over the destination only after the whole-file
//! hash has been confirmed, so a failed or interrupted transfer never leaves
//! a truncated file under the final name.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

pub struct FileSink {
    path: PathBuf,
    part_path: PathBuf,
    file: File,
    hasher: blake3::Hasher,
    written: u64,
}

impl FileSink {
    /// Open `<path>.part` for writing, creating parent directories.
    /// `path` itself is only touched by [`FileSink::commit`].
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = part_path(&path);
        let file = File::create(&part_path)
            .await
            .with_context(|| format!("creating {}", part_path.display()))?;
        debug!("Writing to {}", part_path.display());

        Ok(Self {
            path,
            part_path,
            file,
            hasher: blake3::Hasher::new(),
            written: 0,
        })
    }

    /// Append one verified chunk
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Move the part file into place and return the content hash (hex)
    pub async fn commit(mut self) -> Result<String> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        if let Err(e) = tokio::fs::rename(&self.part_path, &self.path).await {
            error!(
                from = %self.part_path.display(),
                to = %self.path.display(),
                error = %e,
                "Failed to move received file into place"
            );
            let _ = tokio::fs::remove_file(&self.part_path).await;
            return Err(e.into());
        }
        Ok(hex::encode(self.hasher.finalize().as_bytes()))
    }

    /// Drop the part file
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            debug!("Could not remove {}: {}", self.part_path.display(), e);
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}
