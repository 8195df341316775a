//! Scans over a dataset
//!
//! A [`Scanner`] fixes what a scan reads: the projected columns, the batch
//! size and the pool that accounts for batches held by a consumer. Fragments
//! are opened one after another and in order; each batch they yield is
//! conformed to the projected schema and sliced to at most `batch_size` rows.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use arrow::compute::{can_cast_types, cast};
use arrow_array::{new_null_array, ArrayRef, RecordBatch, RecordBatchOptions};
use arrow_schema::{Schema, SchemaRef};

use crate::dataset::{Dataset, Fragment, RecordBatchIter};
use crate::error::{DatasetError, Result};
use crate::memory::{default_memory_pool, MemoryPool};

/// Settings shared by every fragment of one scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub dataset_schema: SchemaRef,
    pub projected_schema: SchemaRef,
    pub batch_size: usize,
    pub pool: Arc<dyn MemoryPool>,
}

impl ScanOptions {
    pub fn projected_columns(&self) -> Vec<String> {
        self.projected_schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }
}

pub struct ScannerBuilder {
    dataset: Arc<Dataset>,
    columns: Option<Vec<String>>,
    batch_size: usize,
    pool: Arc<dyn MemoryPool>,
}

impl ScannerBuilder {
    pub fn new(dataset: Arc<Dataset>) -> Self {
        Self {
            dataset,
            columns: None,
            batch_size: crate::runtime::config().default_batch_size,
            pool: default_memory_pool(),
        }
    }

    /// Read only `columns`, in this order
    pub fn project(mut self, columns: &[String]) -> Result<Self> {
        let schema = self.dataset.schema();
        for name in columns {
            if schema.field_with_name(name).is_err() {
                return Err(DatasetError::InvalidArgument(format!(
                    "No match for FieldRef.Name({name}) in {schema}"
                )));
            }
        }
        self.columns = Some(columns.to_vec());
        Ok(self)
    }

    pub fn batch_size(mut self, batch_size: i64) -> Result<Self> {
        if batch_size <= 0 {
            return Err(DatasetError::InvalidArgument(format!(
                "batch size must be positive, got {batch_size}"
            )));
        }
        self.batch_size = batch_size as usize;
        Ok(self)
    }

    pub fn pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn finish(self) -> Result<Scanner> {
        let dataset_schema = Arc::clone(self.dataset.schema());
        let projected_schema = match &self.columns {
            None => Arc::clone(&dataset_schema),
            Some(columns) => project_schema(&dataset_schema, columns)?,
        };
        Ok(Scanner {
            options: Arc::new(ScanOptions {
                dataset_schema,
                projected_schema,
                batch_size: self.batch_size,
                pool: self.pool,
            }),
            fragments: self.dataset.fragments().to_vec(),
        })
    }
}

/// A configured scan over the fragments of a dataset
pub struct Scanner {
    options: Arc<ScanOptions>,
    fragments: Vec<Arc<dyn Fragment>>,
}

impl Scanner {
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn projected_schema(&self) -> SchemaRef {
        Arc::clone(&self.options.projected_schema)
    }

    pub fn pool(&self) -> &Arc<dyn MemoryPool> {
        &self.options.pool
    }

    /// Batches of every fragment in order, each tagged with its fragment
    pub fn scan_batches(&self) -> Result<TaggedRecordBatchIterator> {
        log::debug!(
            "scan started over {} fragment(s), batch size {}",
            self.fragments.len(),
            self.options.batch_size
        );
        Ok(TaggedRecordBatchIterator {
            options: Arc::clone(&self.options),
            fragments: self.fragments.iter().cloned().collect(),
            current: None,
            pending: VecDeque::new(),
        })
    }
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("projected_schema", &self.options.projected_schema)
            .field("batch_size", &self.options.batch_size)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}

pub struct TaggedRecordBatch {
    pub record_batch: RecordBatch,
    pub fragment: Arc<dyn Fragment>,
}

pub struct TaggedRecordBatchIterator {
    options: Arc<ScanOptions>,
    fragments: VecDeque<Arc<dyn Fragment>>,
    current: Option<(Arc<dyn Fragment>, RecordBatchIter)>,
    pending: VecDeque<RecordBatch>,
}

impl TaggedRecordBatchIterator {
    fn tag(&self, record_batch: RecordBatch) -> Option<Result<TaggedRecordBatch>> {
        let (fragment, _) = self.current.as_ref()?;
        Some(Ok(TaggedRecordBatch {
            record_batch,
            fragment: Arc::clone(fragment),
        }))
    }
}

impl Iterator for TaggedRecordBatchIterator {
    type Item = Result<TaggedRecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.pending.pop_front() {
                return self.tag(batch);
            }

            if self.current.is_none() {
                let fragment = self.fragments.pop_front()?;
                match fragment.scan_batches(&self.options) {
                    Ok(batches) => self.current = Some((fragment, batches)),
                    Err(err) => return Some(Err(err)),
                }
            }
            let Some((_, batches)) = self.current.as_mut() else {
                continue;
            };

            match batches.next() {
                Some(Ok(batch)) => {
                    let conformed =
                        match conform_batch(&batch, &self.options.projected_schema) {
                            Ok(conformed) => conformed,
                            Err(err) => return Some(Err(err)),
                        };
                    self.pending
                        .extend(split_batch(&conformed, self.options.batch_size));
                }
                Some(Err(err)) => return Some(Err(err)),
                None => self.current = None,
            }
        }
    }
}

/// Rebuild `batch` with exactly the columns of `schema`
///
/// Columns are matched by name. Type differences are cast where possible and
/// columns the batch lacks are filled with nulls when the field allows it.
pub(crate) fn conform_batch(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema().fields() == schema.fields() {
        return Ok(RecordBatch::try_new_with_options(
            Arc::clone(schema),
            batch.columns().to_vec(),
            &RecordBatchOptions::new().with_row_count(Some(batch.num_rows())),
        )?);
    }
    let rows = batch.num_rows();
    let columns = schema
        .fields()
        .iter()
        .map(|field| -> Result<ArrayRef> {
            match batch.column_by_name(field.name()) {
                Some(column) if column.data_type() == field.data_type() => Ok(Arc::clone(column)),
                Some(column) if can_cast_types(column.data_type(), field.data_type()) => {
                    Ok(cast(column, field.data_type())?)
                }
                Some(column) => Err(DatasetError::InvalidArgument(format!(
                    "column '{}' has type {} which cannot be read as {}",
                    field.name(),
                    column.data_type(),
                    field.data_type()
                ))),
                None if field.is_nullable() => Ok(new_null_array(field.data_type(), rows)),
                None => Err(DatasetError::InvalidArgument(format!(
                    "non-nullable column '{}' is missing from fragment",
                    field.name()
                ))),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(RecordBatch::try_new_with_options(
        Arc::clone(schema),
        columns,
        &RecordBatchOptions::new().with_row_count(Some(rows)),
    )?)
}

fn split_batch(batch: &RecordBatch, batch_size: usize) -> Vec<RecordBatch> {
    let rows = batch.num_rows();
    if rows <= batch_size {
        return vec![batch.clone()];
    }
    (0..rows)
        .step_by(batch_size)
        .map(|offset| batch.slice(offset, batch_size.min(rows - offset)))
        .collect()
}

/// Schema with only the named fields of `schema`, in the given order
pub fn project_schema(schema: &Schema, columns: &[String]) -> Result<SchemaRef> {
    let indices = columns
        .iter()
        .map(|name| schema.index_of(name))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Arc::new(schema.project(&indices)?))
}
