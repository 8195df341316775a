//! File formats understood by the file system dataset and writer
//!
//! Format ids are part of the host contract: `0` is Parquet, `1` is the Arrow
//! IPC file format.

use std::fmt;
use std::fs::File;
use std::ops::Range;
use std::path::Path;

use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow_array::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::metadata::ParquetMetaData;
use parquet::file::properties::WriterProperties;

use crate::dataset::RecordBatchIter;
use crate::error::{DatasetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Parquet,
    Ipc,
}

impl FileFormat {
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            0 => Ok(FileFormat::Parquet),
            1 => Ok(FileFormat::Ipc),
            other => Err(DatasetError::InvalidArgument(format!(
                "illegal file format id: {other}"
            ))),
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            FileFormat::Parquet => 0,
            FileFormat::Ipc => 1,
        }
    }

    /// Extension given to written files
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Ipc => "arrow",
        }
    }

    /// Read the schema stored in the file at `path`
    pub fn inspect(&self, path: &Path) -> Result<SchemaRef> {
        let file = File::open(path)?;
        match self {
            FileFormat::Parquet => {
                let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
                Ok(builder.schema().clone())
            }
            FileFormat::Ipc => Ok(FileReader::try_new(file, None)?.schema()),
        }
    }

    /// Open a batch reader over the file at `path`
    ///
    /// Only the named `columns` that exist in the file are decoded. A
    /// `byte_range` narrows a Parquet file to the row groups whose midpoint
    /// falls inside it.
    pub fn open_reader(
        &self,
        path: &Path,
        columns: &[String],
        batch_size: usize,
        byte_range: Option<&Range<u64>>,
    ) -> Result<RecordBatchIter> {
        let file = File::open(path)?;
        match self {
            FileFormat::Parquet => {
                let builder =
                    ParquetRecordBatchReaderBuilder::try_new(file)?.with_batch_size(batch_size);
                let indices = column_indices(builder.schema(), columns);
                let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
                let mut builder = builder.with_projection(mask);
                if let Some(range) = byte_range {
                    let row_groups = row_groups_in_range(builder.metadata(), range);
                    log::debug!(
                        "{}: bytes {:?} select row groups {:?}",
                        path.display(),
                        range,
                        row_groups
                    );
                    builder = builder.with_row_groups(row_groups);
                }
                let reader = builder.build()?;
                Ok(Box::new(reader.map(|batch| batch.map_err(DatasetError::from))))
            }
            FileFormat::Ipc => {
                if byte_range.is_some() {
                    return Err(DatasetError::Unsupported(
                        "byte ranges are only supported for parquet files".to_string(),
                    ));
                }
                let schema = FileReader::try_new(File::open(path)?, None)?.schema();
                let indices = column_indices(&schema, columns);
                let reader = FileReader::try_new(file, Some(indices))?;
                Ok(Box::new(reader.map(|batch| batch.map_err(DatasetError::from))))
            }
        }
    }

    pub fn create_writer(&self, path: &Path, schema: SchemaRef) -> Result<FormatWriter> {
        let file = File::create(path)?;
        match self {
            FileFormat::Parquet => {
                let props = WriterProperties::builder()
                    .set_compression(Compression::SNAPPY)
                    .build();
                Ok(FormatWriter::Parquet(ArrowWriter::try_new(
                    file,
                    schema,
                    Some(props),
                )?))
            }
            FileFormat::Ipc => Ok(FormatWriter::Ipc(FileWriter::try_new(file, &schema)?)),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Parquet => write!(f, "parquet"),
            FileFormat::Ipc => write!(f, "ipc"),
        }
    }
}

fn column_indices(schema: &Schema, columns: &[String]) -> Vec<usize> {
    columns
        .iter()
        .filter_map(|name| schema.index_of(name).ok())
        .collect()
}

fn row_groups_in_range(metadata: &ParquetMetaData, range: &Range<u64>) -> Vec<usize> {
    metadata
        .row_groups()
        .iter()
        .enumerate()
        .filter_map(|(index, row_group)| {
            let first = row_group.columns().first()?;
            let start = first
                .dictionary_page_offset()
                .filter(|offset| *offset > 0)
                .unwrap_or_else(|| first.data_page_offset());
            let midpoint = start as u64 + row_group.compressed_size() as u64 / 2;
            range.contains(&midpoint).then_some(index)
        })
        .collect()
}

/// Open output file of one format
pub enum FormatWriter {
    Parquet(ArrowWriter<File>),
    Ipc(FileWriter<File>),
}

impl FormatWriter {
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        match self {
            FormatWriter::Parquet(writer) => writer.write(batch)?,
            FormatWriter::Ipc(writer) => writer.write(batch)?,
        }
        Ok(())
    }

    /// Flush footers and close the file
    pub fn finish(self) -> Result<()> {
        match self {
            FormatWriter::Parquet(writer) => {
                writer.close()?;
            }
            FormatWriter::Ipc(mut writer) => writer.finish()?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int32Array, StringArray};
    use arrow_schema::{DataType, Field};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn batch(start: i32, rows: i32) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let ids: Vec<i32> = (start..start + rows).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("n{i}")).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    fn write(format: FileFormat, path: &Path, batches: &[RecordBatch]) {
        let mut writer = format.create_writer(path, batches[0].schema()).unwrap();
        for b in batches {
            writer.write(b).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_format_ids() {
        assert_eq!(FileFormat::from_id(0).unwrap(), FileFormat::Parquet);
        assert_eq!(FileFormat::from_id(1).unwrap(), FileFormat::Ipc);
        assert_eq!(FileFormat::Ipc.id(), 1);
        match FileFormat::from_id(7) {
            Err(DatasetError::InvalidArgument(msg)) => {
                assert_eq!(msg, "illegal file format id: 7")
            }
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_write_inspect_and_read_back() {
        let dir = TempDir::new().unwrap();
        for format in [FileFormat::Parquet, FileFormat::Ipc] {
            let path = dir.path().join(format!("data.{}", format.extension()));
            write(format, &path, &[batch(0, 10), batch(10, 5)]);

            let schema = format.inspect(&path).unwrap();
            assert_eq!(schema.fields().len(), 2);

            let rows: usize = format
                .open_reader(&path, &["id".to_string(), "name".to_string()], 1024, None)
                .unwrap()
                .map(|b| b.unwrap().num_rows())
                .sum();
            assert_eq!(rows, 15, "format {format}");
        }
    }

    #[test]
    fn test_reader_projects_existing_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.parquet");
        write(FileFormat::Parquet, &path, &[batch(0, 4)]);

        let mut reader = FileFormat::Parquet
            .open_reader(&path, &["name".to_string(), "missing".to_string()], 1024, None)
            .unwrap();
        let first = reader.next().unwrap().unwrap();
        assert_eq!(first.num_columns(), 1);
        assert_eq!(first.schema().field(0).name(), "name");
    }

    #[test]
    fn test_byte_range_selects_row_groups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("groups.parquet");
        let file = File::create(&path).unwrap();
        let props = WriterProperties::builder()
            .set_max_row_group_size(100)
            .build();
        let sample = batch(0, 300);
        let mut writer = ArrowWriter::try_new(file, sample.schema(), Some(props)).unwrap();
        writer.write(&sample).unwrap();
        writer.close().unwrap();

        let columns = ["id".to_string()];
        let read_rows = |range: Range<u64>| -> usize {
            FileFormat::Parquet
                .open_reader(&path, &columns, 1024, Some(&range))
                .unwrap()
                .map(|b| b.unwrap().num_rows())
                .sum()
        };

        assert_eq!(read_rows(0..u64::MAX), 300);
        assert_eq!(read_rows(0..4), 0);
    }

    #[test]
    fn test_ipc_rejects_byte_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.arrow");
        write(FileFormat::Ipc, &path, &[batch(0, 3)]);
        assert!(matches!(
            FileFormat::Ipc.open_reader(&path, &[], 1024, Some(&(0..10))),
            Err(DatasetError::Unsupported(_))
        ));
    }
}
