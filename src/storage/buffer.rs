//! File-backed result buffer.
//!
//! One buffer backs every result set of a query. Rows are appended by a
//! single writer; the committed length only moves forward when a writer
//! finishes, so readers opening their own handles never see half-written
//! rows.

use super::codec::{decode_row, encode_row, ROW_HEADER_LEN};
use crate::constants::{BUFFER_FILE_PREFIX, BUFFER_FILE_SUFFIX};
use crate::database::SqlValue;
use crate::error::ServerError;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

/// Scratch file holding the rows of one query.
#[derive(Debug)]
pub struct ResultBuffer {
    path: PathBuf,
    file: Mutex<Option<NamedTempFile>>,
    committed_len: AtomicU64,
    writer_active: AtomicBool,
    closed: AtomicBool,
}

impl ResultBuffer {
    /// Allocate a new scratch file in `dir`, or the system temp dir.
    pub fn create(dir: Option<&Path>) -> Result<Arc<Self>, ServerError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(BUFFER_FILE_PREFIX).suffix(BUFFER_FILE_SUFFIX);

        let file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| ServerError::storage(format!("Failed to create result buffer: {}", e)))?;

        let path = file.path().to_path_buf();
        debug!("Allocated result buffer {}", path.display());

        Ok(Arc::new(Self {
            path,
            file: Mutex::new(Some(file)),
            committed_len: AtomicU64::new(0),
            writer_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Path of the scratch file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes readable by readers.
    pub fn committed_len(&self) -> u64 {
        self.committed_len.load(Ordering::Acquire)
    }

    /// Whether the buffer has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start appending rows. Only one writer may be active at a time.
    pub async fn begin_write(self: &Arc<Self>) -> Result<BufferWriter, ServerError> {
        self.ensure_open()?;
        if self
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServerError::storage("Result buffer already has an active writer"));
        }

        // The guard releases the writer flag even if opening fails below
        let guard = WriterGuard(Arc::clone(self));
        let start = self.committed_len();

        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        Ok(BufferWriter {
            guard,
            out: BufWriter::new(file),
            position: start,
        })
    }

    /// Read up to `count` rows starting at byte `offset`.
    ///
    /// Reading stops at the committed length, so a window running past the
    /// end returns fewer rows.
    pub async fn read_rows(
        &self,
        offset: u64,
        count: usize,
    ) -> Result<Vec<Vec<SqlValue>>, ServerError> {
        self.ensure_open()?;
        let end = self.committed_len();
        if count == 0 || offset >= end {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).await?;

        let mut rows = Vec::with_capacity(count.min(1024));
        let mut position = offset;
        let mut header = [0u8; ROW_HEADER_LEN];
        let mut body = Vec::new();

        while rows.len() < count && position < end {
            reader.read_exact(&mut header).await?;
            let len = u32::from_le_bytes(header) as usize;
            body.resize(len, 0);
            reader.read_exact(&mut body).await?;
            rows.push(decode_row(&body)?);
            position += (ROW_HEADER_LEN + len) as u64;
        }

        Ok(rows)
    }

    /// Release the scratch file. Later reads and writes fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(file) = self.file.lock().take() {
            if let Err(e) = file.close() {
                warn!("Failed to delete result buffer {}: {}", self.path.display(), e);
            } else {
                debug!("Released result buffer {}", self.path.display());
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ServerError> {
        if self.is_closed() {
            Err(ServerError::storage("Result buffer has been released"))
        } else {
            Ok(())
        }
    }
}

struct WriterGuard(Arc<ResultBuffer>);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.0.writer_active.store(false, Ordering::Release);
    }
}

/// Exclusive appender for a result buffer.
pub struct BufferWriter {
    guard: WriterGuard,
    out: BufWriter<File>,
    position: u64,
}

impl BufferWriter {
    /// Append one row and return the byte offset it starts at.
    pub async fn write_row(&mut self, row: &[SqlValue]) -> Result<u64, ServerError> {
        let framed = encode_row(row)?;
        let offset = self.position;
        self.out.write_all(&framed).await?;
        self.position += framed.len() as u64;
        Ok(offset)
    }

    /// Flush and publish the written rows to readers.
    pub async fn finish(mut self) -> Result<u64, ServerError> {
        self.out.flush().await?;
        let buffer = &self.guard.0;
        buffer.ensure_open()?;
        buffer.committed_len.store(self.position, Ordering::Release);
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i32, name: &str) -> Vec<SqlValue> {
        vec![SqlValue::I32(id), SqlValue::String(name.to_string()), SqlValue::Null]
    }

    #[tokio::test]
    async fn test_write_then_read_window() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = ResultBuffer::create(Some(dir.path())).unwrap();

        let mut writer = buffer.begin_write().await.unwrap();
        let mut offsets = Vec::new();
        for i in 0..10 {
            offsets.push(writer.write_row(&row(i, &format!("row{}", i))).await.unwrap());
        }
        writer.finish().await.unwrap();

        let rows = buffer.read_rows(offsets[3], 4).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], row(3, "row3"));
        assert_eq!(rows[3], row(6, "row6"));

        // Window past the end is clamped
        let tail = buffer.read_rows(offsets[8], 100).await.unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[tokio::test]
    async fn test_uncommitted_rows_are_invisible() {
        let buffer = ResultBuffer::create(None).unwrap();
        let mut writer = buffer.begin_write().await.unwrap();
        let offset = writer.write_row(&row(1, "a")).await.unwrap();

        assert!(buffer.read_rows(offset, 1).await.unwrap().is_empty());
        writer.finish().await.unwrap();
        assert_eq!(buffer.read_rows(offset, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_single_writer() {
        let buffer = ResultBuffer::create(None).unwrap();
        let writer = buffer.begin_write().await.unwrap();
        assert!(buffer.begin_write().await.is_err());

        // Abandoning a writer frees the slot and commits nothing
        drop(writer);
        let mut second = buffer.begin_write().await.unwrap();
        second.write_row(&row(2, "b")).await.unwrap();
        second.finish().await.unwrap();
        assert_eq!(buffer.read_rows(0, 10).await.unwrap(), vec![row(2, "b")]);
    }

    #[tokio::test]
    async fn test_sequential_writers_append() {
        let buffer = ResultBuffer::create(None).unwrap();

        let mut first = buffer.begin_write().await.unwrap();
        first.write_row(&row(1, "a")).await.unwrap();
        first.finish().await.unwrap();

        let mut second = buffer.begin_write().await.unwrap();
        let offset = second.write_row(&row(2, "b")).await.unwrap();
        second.finish().await.unwrap();

        assert!(offset > 0);
        assert_eq!(buffer.read_rows(0, 10).await.unwrap().len(), 2);
        assert_eq!(buffer.read_rows(offset, 1).await.unwrap(), vec![row(2, "b")]);
    }

    #[tokio::test]
    async fn test_close_deletes_file() {
        let buffer = ResultBuffer::create(None).unwrap();
        let path = buffer.path().to_path_buf();
        assert!(path.exists());

        buffer.close();
        assert!(!path.exists());
        assert!(buffer.is_closed());
        assert!(buffer.read_rows(0, 1).await.is_err());
        assert!(buffer.begin_write().await.is_err());
    }
}
