//! Byte-range readers for the file being sent

use crate::{Error, FileMeta, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// The file offered by the sender
///
/// Reads are disjoint byte ranges; the source is never written.
#[derive(Debug)]
pub enum FileSource {
    /// Contents already in memory
    Memory { meta: FileMeta, bytes: Bytes },
    /// A file on disk, opened lazily on the first read
    Path {
        meta: FileMeta,
        path: PathBuf,
        file: Option<File>,
    },
}

impl FileSource {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::Memory {
            meta: FileMeta {
                id: 0,
                name: name.into(),
                size: bytes.len() as u64,
                mime_type: mime_type.into(),
            },
            bytes,
        }
    }

    /// Describe a file on disk; the handle is opened on first read
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::Config(format!("{} is not a regular file", path.display())));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self::Path {
            meta: FileMeta {
                id: 0,
                name,
                size: metadata.len(),
                mime_type: detect_mime_type(path).unwrap_or_default(),
            },
            path: path.to_path_buf(),
            file: None,
        })
    }

    pub fn meta(&self) -> &FileMeta {
        match self {
            FileSource::Memory { meta, .. } | FileSource::Path { meta, .. } => meta,
        }
    }

    pub fn size(&self) -> u64 {
        self.meta().size
    }

    /// Read `len` bytes at `offset`, truncated at end of file
    pub async fn read_range(&mut self, offset: u64, len: u64) -> Result<Bytes> {
        let size = self.size();
        if offset > size {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("offset {} beyond file size {}", offset, size),
            )));
        }
        let end = offset.saturating_add(len).min(size);

        match self {
            FileSource::Memory { bytes, .. } => Ok(bytes.slice(offset as usize..end as usize)),
            FileSource::Path { path, file, .. } => {
                if file.is_none() {
                    *file = Some(File::open(&*path).await?);
                }
                let Some(handle) = file.as_mut() else {
                    return Err(Error::Config("file handle unavailable".to_string()));
                };

                handle.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; (end - offset) as usize];
                handle.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Detect MIME type from file extension
fn detect_mime_type(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_ranges() {
        let mut source = FileSource::from_bytes("a.bin", "", vec![0u8, 1, 2, 3, 4, 5]);
        assert_eq!(source.size(), 6);
        assert_eq!(&source.read_range(1, 3).await.unwrap()[..], &[1, 2, 3]);
        assert_eq!(&source.read_range(4, 10).await.unwrap()[..], &[4, 5]);
        assert!(source.read_range(6, 1).await.unwrap().is_empty());
        assert!(source.read_range(7, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_path_source_reads_disjoint_ranges() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"hello sealed world").unwrap();

        let mut source = FileSource::open(file.path()).await.unwrap();
        assert_eq!(source.meta().size, 18);
        assert_eq!(source.meta().mime_type, "text/plain");

        assert_eq!(&source.read_range(6, 6).await.unwrap()[..], b"sealed");
        assert_eq!(&source.read_range(0, 5).await.unwrap()[..], b"hello");
        assert_eq!(&source.read_range(13, 100).await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_open_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path()).await.is_err());
    }

    #[test]
    fn test_detect_mime_type() {
        assert_eq!(detect_mime_type(Path::new("x.PDF")).as_deref(), Some("application/pdf"));
        assert_eq!(detect_mime_type(Path::new("noext")), None);
    }
}
