//! Maps the torrent's flat byte range onto its output files.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::StorageError;
use crate::torrent::TorrentMetadata;

/// One output file and where it sits in the torrent byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: PathBuf,
    /// Offset of the file's first byte in the torrent
    pub start: u64,
    pub length: u64,
}

/// Part of a torrent range that falls inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_index: usize,
    /// Offset within the file
    pub file_offset: u64,
    /// Offset within the caller's buffer
    pub buffer_offset: usize,
    pub length: usize,
}

/// Flat concatenation of the torrent's files in file-list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    files: Vec<FileSpan>,
    total_length: u64,
}

impl FileLayout {
    /// Builds the layout for `metadata` under `download_dir`.
    ///
    /// Single-file torrents land at `<dir>/<name>`, multi-file torrents at
    /// `<dir>/<name>/<path...>`.
    ///
    /// # Errors
    /// - `StorageError::NoFiles` - Metadata lists no files
    pub fn from_metadata(
        metadata: &TorrentMetadata,
        download_dir: &Path,
    ) -> Result<Self, StorageError> {
        if metadata.files.is_empty() {
            return Err(StorageError::NoFiles);
        }

        let mut files = Vec::with_capacity(metadata.files.len());
        let mut start = 0u64;
        for file in &metadata.files {
            let path = if metadata.multi_file {
                file.path
                    .iter()
                    .fold(download_dir.join(&metadata.name), |path, part| path.join(part))
            } else {
                download_dir.join(&metadata.name)
            };
            files.push(FileSpan {
                path,
                start,
                length: file.length,
            });
            start += file.length;
        }

        Ok(Self {
            files,
            total_length: start,
        })
    }

    pub fn files(&self) -> &[FileSpan] {
        &self.files
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Splits `[offset, offset + length)` into per-file segments.
    ///
    /// # Errors
    /// - `StorageError::OutOfBounds` - Range ends past the torrent
    pub fn segments(&self, offset: u64, length: usize) -> Result<Vec<Segment>, StorageError> {
        let end = offset + length as u64;
        if end > self.total_length {
            return Err(StorageError::OutOfBounds {
                offset,
                length,
                total: self.total_length,
            });
        }

        let mut segments = Vec::new();
        for (file_index, file) in self.files.iter().enumerate() {
            let file_end = file.start + file.length;
            if file_end <= offset || file.start >= end {
                continue;
            }

            let from = offset.max(file.start);
            let to = end.min(file_end);
            segments.push(Segment {
                file_index,
                file_offset: from - file.start,
                buffer_offset: (from - offset) as usize,
                length: (to - from) as usize,
            });
        }
        Ok(segments)
    }
}

/// Open handles for every file of a layout.
///
/// Owned by the piece manager writer task; nothing else touches the files.
#[derive(Debug)]
pub struct FileSet {
    layout: FileLayout,
    handles: Vec<File>,
}

impl FileSet {
    /// Creates parent directories and opens or creates every file.
    ///
    /// Existing content is kept.
    ///
    /// # Errors
    /// - `StorageError::Io` - A directory or file could not be created
    pub async fn open(layout: FileLayout) -> Result<Self, StorageError> {
        let mut handles = Vec::with_capacity(layout.files.len());
        for file in &layout.files {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)
                .await?;
            tracing::debug!("Opened {}", file.path.display());
            handles.push(handle);
        }

        Ok(Self { layout, handles })
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Writes `data` at absolute torrent offset `offset`, splitting it across
    /// file boundaries.
    ///
    /// # Errors
    /// - `StorageError::OutOfBounds` - Range ends past the torrent
    /// - `StorageError::Io` - Seek or write failed
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        for segment in self.layout.segments(offset, data.len())? {
            let handle = &mut self.handles[segment.file_index];
            handle.seek(SeekFrom::Start(segment.file_offset)).await?;
            handle
                .write_all(&data[segment.buffer_offset..segment.buffer_offset + segment.length])
                .await?;
        }
        Ok(())
    }

    /// Reads `length` bytes at absolute torrent offset `offset`.
    ///
    /// Bytes past the current end of a file read as zero.
    ///
    /// # Errors
    /// - `StorageError::OutOfBounds` - Range ends past the torrent
    /// - `StorageError::Io` - Seek or read failed
    pub async fn read_at(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0u8; length];
        for segment in self.layout.segments(offset, length)? {
            let handle = &mut self.handles[segment.file_index];
            handle.seek(SeekFrom::Start(segment.file_offset)).await?;

            let target = &mut buf[segment.buffer_offset..segment.buffer_offset + segment.length];
            let mut filled = 0;
            while filled < target.len() {
                let read = handle.read(&mut target[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
        }
        Ok(buf)
    }

    /// Flushes every file to disk.
    ///
    /// # Errors
    /// - `StorageError::Io` - Flush failed
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        for handle in &mut self.handles {
            handle.flush().await?;
        }
        Ok(())
    }

    /// Flushes and syncs every file, then releases the handles.
    ///
    /// # Errors
    /// - `StorageError::Io` - Flush or sync failed
    pub async fn close(mut self) -> Result<(), StorageError> {
        self.flush().await?;
        for handle in &self.handles {
            handle.sync_all().await?;
        }
        Ok(())
    }
}
