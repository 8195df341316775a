//! Dataset writer
//!
//! Drains a scanner into files under a base directory. Without partition
//! columns every batch goes to one file. With partition columns rows are
//! routed into Hive-style `column=value` directories, one open file per
//! distinct partition, and the partition columns are dropped from the file
//! contents since the directory names already carry them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::compute::take;
use arrow::util::display::array_value_to_string;
use arrow_array::{Array, RecordBatch, UInt32Array};
use arrow_schema::{Schema, SchemaRef};

use crate::error::{DatasetError, Result};
use crate::format::{FileFormat, FormatWriter};
use crate::memory::MemoryReservation;
use crate::scanner::Scanner;

/// Directory name used for null partition values
pub const HIVE_NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Placeholder a basename template must contain
const FILE_INDEX_PLACEHOLDER: &str = "{i}";

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub format: FileFormat,
    pub base_dir: PathBuf,
    pub partition_columns: Vec<String>,
    /// Most partitions a single input batch may be split into. Partitions
    /// seen in earlier batches do not count against a later batch.
    pub max_partitions: usize,
    /// File name pattern; `{i}` is replaced by a running file index
    pub basename_template: String,
}

impl WriteOptions {
    pub fn new(format: FileFormat, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            format,
            base_dir: base_dir.into(),
            partition_columns: Vec::new(),
            max_partitions: 1024,
            basename_template: format!("part-{FILE_INDEX_PLACEHOLDER}.{}", format.extension()),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.basename_template.contains(FILE_INDEX_PLACEHOLDER) {
            return Err(DatasetError::InvalidArgument(format!(
                "basename_template did not contain '{FILE_INDEX_PLACEHOLDER}': {}",
                self.basename_template
            )));
        }
        if self.basename_template.contains('/') {
            return Err(DatasetError::InvalidArgument(format!(
                "basename_template contained '/': {}",
                self.basename_template
            )));
        }
        if self.max_partitions == 0 {
            return Err(DatasetError::InvalidArgument(
                "max_partitions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a finished write produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub files: Vec<PathBuf>,
    pub rows_written: usize,
}

struct OpenFile {
    path: PathBuf,
    writer: FormatWriter,
}

struct PartitionedWriter<'a> {
    options: &'a WriteOptions,
    /// Positions of the partition columns in the input schema
    partition_indices: Vec<usize>,
    /// Positions of the columns written to files
    data_indices: Vec<usize>,
    data_schema: SchemaRef,
    files: HashMap<String, usize>,
    open: Vec<OpenFile>,
    rows_written: usize,
}

impl<'a> PartitionedWriter<'a> {
    fn try_new(options: &'a WriteOptions, schema: &Schema) -> Result<Self> {
        let partition_indices = options
            .partition_columns
            .iter()
            .map(|name| {
                schema.index_of(name).map_err(|_| {
                    DatasetError::InvalidArgument(format!(
                        "partition column '{name}' is not in schema {schema}"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let data_indices: Vec<usize> = (0..schema.fields().len())
            .filter(|i| !partition_indices.contains(i))
            .collect();
        let data_schema = Arc::new(schema.project(&data_indices)?);
        Ok(Self {
            options,
            partition_indices,
            data_indices,
            data_schema,
            files: HashMap::new(),
            open: Vec::new(),
            rows_written: 0,
        })
    }

    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        if self.partition_indices.is_empty() {
            let data = batch.project(&self.data_indices)?;
            return self.write_to(String::new(), &data);
        }

        // Group row positions by partition directory, first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<u32>> = HashMap::new();
        for row in 0..batch.num_rows() {
            let dir = self.partition_dir(batch, row)?;
            groups
                .entry(dir.clone())
                .or_insert_with(|| {
                    order.push(dir);
                    Vec::new()
                })
                .push(row as u32);
        }
        if order.len() > self.options.max_partitions {
            return Err(DatasetError::InvalidArgument(format!(
                "Fragment would be written into {} partitions. This exceeds the maximum of {}",
                order.len(),
                self.options.max_partitions
            )));
        }

        for dir in order {
            let rows = UInt32Array::from(groups.remove(&dir).unwrap_or_default());
            let columns = self
                .data_indices
                .iter()
                .map(|&i| take(batch.column(i).as_ref(), &rows, None))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let data = RecordBatch::try_new_with_options(
                Arc::clone(&self.data_schema),
                columns,
                &arrow_array::RecordBatchOptions::new().with_row_count(Some(rows.len())),
            )?;
            self.write_to(dir, &data)?;
        }
        Ok(())
    }

    fn partition_dir(&self, batch: &RecordBatch, row: usize) -> Result<String> {
        let schema = batch.schema();
        let mut segments = Vec::with_capacity(self.partition_indices.len());
        for &index in &self.partition_indices {
            let column = batch.column(index);
            let value = if column.is_null(row) {
                HIVE_NULL_PARTITION.to_string()
            } else {
                urlencoding::encode(&array_value_to_string(column.as_ref(), row)?).into_owned()
            };
            segments.push(format!("{}={}", schema.field(index).name(), value));
        }
        Ok(segments.join("/"))
    }

    fn write_to(&mut self, dir: String, batch: &RecordBatch) -> Result<()> {
        let slot = match self.files.get(&dir) {
            Some(slot) => *slot,
            None => {
                let slot = self.open_file(&dir)?;
                self.files.insert(dir, slot);
                slot
            }
        };
        self.open[slot].writer.write(batch)?;
        self.rows_written += batch.num_rows();
        Ok(())
    }

    fn open_file(&mut self, dir: &str) -> Result<usize> {
        let directory = if dir.is_empty() {
            self.options.base_dir.clone()
        } else {
            self.options.base_dir.join(dir)
        };
        fs::create_dir_all(&directory)?;
        let index = self.open.len();
        let name = self
            .options
            .basename_template
            .replace(FILE_INDEX_PLACEHOLDER, &index.to_string());
        let path = directory.join(name);
        log::debug!("opening {} output file {}", self.options.format, path.display());
        let writer = self
            .options
            .format
            .create_writer(&path, Arc::clone(&self.data_schema))?;
        self.open.push(OpenFile { path, writer });
        Ok(index)
    }

    fn finish(self) -> Result<WriteSummary> {
        let mut files = Vec::with_capacity(self.open.len());
        for file in self.open {
            file.writer.finish()?;
            files.push(file.path);
        }
        Ok(WriteSummary {
            files,
            rows_written: self.rows_written,
        })
    }
}

/// Write every batch `scanner` produces according to `options`
///
/// # Arguments
/// * `scanner` - Source of the rows; its projected schema is the input schema
/// * `options` - Output format, location and partitioning
///
/// # Returns
/// * `Ok(WriteSummary)` - The files written, in creation order
/// * `Err(DatasetError)` - If the options are invalid, the scan fails or a
///   file cannot be written. Files finished before the failure are left behind.
pub fn write_dataset(scanner: &Scanner, options: &WriteOptions) -> Result<WriteSummary> {
    options.validate()?;
    let schema = scanner.projected_schema();
    let mut writer = PartitionedWriter::try_new(options, &schema)?;
    fs::create_dir_all(&options.base_dir)?;

    for tagged in scanner.scan_batches()? {
        let batch = tagged?.record_batch;
        // The batch being written is held against the scanner's pool
        let _reservation = MemoryReservation::try_new(
            Arc::clone(scanner.pool()),
            batch.get_array_memory_size() as i64,
        )?;
        writer.write(&batch)?;
    }

    let summary = writer.finish()?;
    log::debug!(
        "wrote {} rows into {} file(s) under {}",
        summary.rows_written,
        summary.files.len(),
        options.base_dir.display()
    );
    Ok(summary)
}

/// Directory of `path` relative to `base`, for display and tests
pub fn relative_dir(base: &Path, path: &Path) -> Option<String> {
    let parent = path.parent()?.strip_prefix(base).ok()?;
    Some(parent.to_string_lossy().into_owned())
}
