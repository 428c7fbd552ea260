//! A single result set of a batch.
//!
//! Rows live in the query's result buffer; the result set only keeps the
//! byte offset of every row. The offsets are published once, when the last
//! row has been flushed, and that publication is what marks the result set
//! complete.

use super::events::ResultSetSummary;
use super::settings::QueryOptions;
use crate::constants::{MAX_ADDRESSABLE_ROWS, SHOWPLAN_XML_COLUMN_NAME};
use crate::database::{DbCellValue, DbColumn, SqlValue};
use crate::error::ServerError;
use crate::export::{ResultWriterFactory, SaveOptions};
use crate::storage::codec::truncate_value;
use crate::storage::{BufferWriter, ResultBuffer};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One tabular result produced by a batch.
#[derive(Debug)]
pub struct ResultSet {
    id: usize,
    batch_id: usize,
    columns: Vec<DbColumn>,
    buffer: Arc<ResultBuffer>,
    rows_written: AtomicU64,
    row_offsets: OnceLock<Vec<u64>>,
    active_saves: Mutex<HashSet<PathBuf>>,
}

impl ResultSet {
    pub(crate) fn new(
        id: usize,
        batch_id: usize,
        columns: Vec<DbColumn>,
        buffer: Arc<ResultBuffer>,
    ) -> Self {
        Self {
            id,
            batch_id,
            columns,
            buffer,
            rows_written: AtomicU64::new(0),
            row_offsets: OnceLock::new(),
            active_saves: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn batch_id(&self) -> usize {
        self.batch_id
    }

    pub fn columns(&self) -> &[DbColumn] {
        &self.columns
    }

    /// Rows stored so far; final once the result set is complete.
    pub fn row_count(&self) -> u64 {
        match self.row_offsets.get() {
            Some(offsets) => offsets.len() as u64,
            None => self.rows_written.load(Ordering::Acquire),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.row_offsets.get().is_some()
    }

    /// Whether this result set carries an XML showplan.
    pub fn is_execution_plan(&self) -> bool {
        self.columns.len() == 1 && self.columns[0].column_name == SHOWPLAN_XML_COLUMN_NAME
    }

    pub fn summary(&self) -> ResultSetSummary {
        ResultSetSummary {
            id: self.id,
            batch_id: self.batch_id,
            row_count: self.row_count(),
            column_info: self.columns.clone(),
            complete: self.is_complete(),
        }
    }

    fn offsets(&self) -> Result<&[u64], ServerError> {
        self.row_offsets
            .get()
            .map(Vec::as_slice)
            .ok_or(ServerError::ResultSetNotComplete {
                batch: self.batch_id,
                result_set: self.id,
            })
    }

    /// Read raw rows `start..start + count`, clamped to the row count.
    pub async fn read_rows(&self, start: u64, count: u64) -> Result<Vec<Vec<SqlValue>>, ServerError> {
        let offsets = self.offsets()?;
        let total = offsets.len() as u64;
        if total > MAX_ADDRESSABLE_ROWS {
            return Err(ServerError::ResultTooLarge { rows: total });
        }
        if start >= total || count == 0 {
            return Ok(Vec::new());
        }

        let available = count.min(total - start) as usize;
        self.buffer.read_rows(offsets[start as usize], available).await
    }

    /// Read a window of rows as subset cells.
    pub async fn subset(&self, start: u64, count: u64) -> Result<Vec<Vec<DbCellValue>>, ServerError> {
        let rows = self.read_rows(start, count).await?;
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let row_id = start + i as u64;
                row.into_iter().map(|v| DbCellValue::new(row_id, v)).collect()
            })
            .collect())
    }

    /// The showplan XML held by an execution plan result set.
    pub async fn execution_plan(&self) -> Result<String, ServerError> {
        if !self.is_execution_plan() {
            return Err(ServerError::invalid_input(format!(
                "Result set {} of batch {} is not an execution plan",
                self.id, self.batch_id
            )));
        }
        let rows = self.read_rows(0, 1).await?;
        match rows.into_iter().next().and_then(|r| r.into_iter().next()) {
            Some(SqlValue::String(xml)) => Ok(xml),
            Some(other) => Ok(other.to_display_string()),
            None => Err(ServerError::invalid_input("Execution plan result set is empty")),
        }
    }

    /// Export the result set (or a selected window of it) to a file.
    pub async fn save_as(
        &self,
        options: &SaveOptions,
        writers: &dyn ResultWriterFactory,
        window_rows: usize,
    ) -> Result<(), ServerError> {
        let total = self.offsets()?.len() as u64;
        let _guard = SaveGuard::acquire(self, options.file_path.clone())?;

        let (rows, cols) = match options.selection {
            Some(sel) => {
                if sel.row_start_index > sel.row_end_index
                    || sel.column_start_index > sel.column_end_index
                    || sel.row_end_index >= total.max(1)
                    || sel.column_end_index >= self.columns.len()
                {
                    return Err(ServerError::invalid_input("Save selection is out of range"));
                }
                (
                    sel.row_start_index..sel.row_end_index + 1,
                    sel.column_start_index..sel.column_end_index + 1,
                )
            }
            None => (0..total, 0..self.columns.len()),
        };

        info!(
            "Saving result set {} of batch {} as {} to {}",
            self.id,
            self.batch_id,
            options.format.as_str(),
            options.file_path.display()
        );

        let result = self.write_file(options, writers, window_rows, rows, cols).await;
        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&options.file_path).await {
                debug!("No partial export to remove at {}: {}", options.file_path.display(), e);
            }
        }
        result
    }

    async fn write_file(
        &self,
        options: &SaveOptions,
        writers: &dyn ResultWriterFactory,
        window_rows: usize,
        rows: std::ops::Range<u64>,
        cols: std::ops::Range<usize>,
    ) -> Result<(), ServerError> {
        let columns = &self.columns[cols.clone()];
        let mut writer = writers.create(options)?;
        let mut file = tokio::fs::File::create(&options.file_path)
            .await
            .map_err(|e| ServerError::export(format!("{}: {}", options.file_path.display(), e)))?;

        let mut chunk = Vec::new();
        writer.begin(columns, &mut chunk)?;

        let window = window_rows.max(1) as u64;
        let mut next = rows.start;
        while next < rows.end {
            let count = window.min(rows.end - next);
            let batch = self.read_rows(next, count).await?;
            if batch.is_empty() {
                break;
            }
            for row in &batch {
                writer.write_row(columns, &row[cols.clone()], &mut chunk)?;
            }
            file.write_all(&chunk).await.map_err(export_io)?;
            chunk.clear();
            next += batch.len() as u64;
        }

        writer.end(&mut chunk)?;
        file.write_all(&chunk).await.map_err(export_io)?;
        file.flush().await.map_err(export_io)?;
        Ok(())
    }
}

fn export_io(e: std::io::Error) -> ServerError {
    ServerError::export(e.to_string())
}

/// Rejects concurrent saves of one result set to the same path.
struct SaveGuard<'a> {
    result_set: &'a ResultSet,
    path: PathBuf,
}

impl<'a> SaveGuard<'a> {
    fn acquire(result_set: &'a ResultSet, path: PathBuf) -> Result<Self, ServerError> {
        if !result_set.active_saves.lock().insert(path.clone()) {
            return Err(ServerError::export(format!(
                "A save to {} is already in progress",
                path.display()
            )));
        }
        Ok(Self { result_set, path })
    }
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.result_set.active_saves.lock().remove(&self.path);
    }
}

/// Streams rows of a result set into the buffer.
pub(crate) struct ResultSetWriter {
    result_set: Arc<ResultSet>,
    out: BufferWriter,
    offsets: Vec<u64>,
    limits: Vec<usize>,
}

impl ResultSetWriter {
    pub(crate) async fn begin(
        result_set: Arc<ResultSet>,
        options: &QueryOptions,
    ) -> Result<Self, ServerError> {
        let out = result_set.buffer.begin_write().await?;
        let limits = result_set
            .columns
            .iter()
            .map(|c| options.char_limit(c))
            .collect();
        Ok(Self {
            result_set,
            out,
            offsets: Vec::new(),
            limits,
        })
    }

    pub(crate) async fn add_row(&mut self, row: Vec<SqlValue>) -> Result<(), ServerError> {
        let row: Vec<SqlValue> = row
            .into_iter()
            .enumerate()
            .map(|(i, v)| match self.limits.get(i) {
                Some(&limit) => truncate_value(v, limit),
                None => v,
            })
            .collect();

        let offset = self.out.write_row(&row).await?;
        self.offsets.push(offset);
        self.result_set
            .rows_written
            .store(self.offsets.len() as u64, Ordering::Release);
        Ok(())
    }

    /// Flush the rows and mark the result set complete.
    pub(crate) async fn finish(self) -> Result<Arc<ResultSet>, ServerError> {
        self.out.finish().await?;
        if self.result_set.row_offsets.set(self.offsets).is_err() {
            warn!(
                "Result set {} of batch {} was completed twice",
                self.result_set.id, self.result_set.batch_id
            );
        }
        Ok(self.result_set)
    }
}
