//! Host-fed record batches as a scannable source
//!
//! A [`ForeignIterator`] is a pull iterator living on the host side that hands
//! out addresses of exported arrays. [`ForeignBatchSource`] turns it into a
//! lazy batch iterator, and [`ForeignFragment`] wraps that iterator as the one
//! fragment of a dataset so the regular scanner can consume it. Host data can
//! be read only once: the fragment refuses a second scan.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::dataset::{Dataset, Fragment, RecordBatchIter};
use crate::error::{DatasetError, Result};
use crate::exchange;
use crate::memory::default_memory_pool;
use crate::scanner::{ScanOptions, Scanner, ScannerBuilder};

/// Pull iterator over exported arrays
pub trait ForeignIterator: Send {
    fn has_next(&mut self) -> Result<bool>;

    /// Returns the 8-byte native-endian address of an `FFI_ArrowArray`
    fn next(&mut self) -> Result<Vec<u8>>;
}

/// Batches imported one at a time from a [`ForeignIterator`]
///
/// Nothing is pulled until the first call to `next`. The stream ends the
/// first time the host reports no more elements, or right after an error has
/// been yielded, and stays ended.
pub struct ForeignBatchSource {
    iterator: Box<dyn ForeignIterator>,
    schema: SchemaRef,
    exhausted: bool,
}

impl ForeignBatchSource {
    pub fn new(iterator: Box<dyn ForeignIterator>, schema: SchemaRef) -> Self {
        Self {
            iterator,
            schema,
            exhausted: false,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn pull(&mut self) -> Result<Option<RecordBatch>> {
        if !self.iterator.has_next()? {
            return Ok(None);
        }
        let address = self.iterator.next()?;
        // SAFETY: the iterator contract guarantees a live exported struct array
        let batch = unsafe { exchange::import_record_batch(&self.schema, &address) }?;
        Ok(Some(batch))
    }
}

impl Iterator for ForeignBatchSource {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.pull() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.exhausted = true;
                None
            }
            Err(err) => {
                self.exhausted = true;
                Some(Err(err))
            }
        }
    }
}

impl fmt::Debug for ForeignBatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignBatchSource")
            .field("schema", &self.schema)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Single fragment backed by a [`ForeignBatchSource`]
pub struct ForeignFragment {
    schema: SchemaRef,
    source: Mutex<Option<ForeignBatchSource>>,
}

impl ForeignFragment {
    pub fn new(source: ForeignBatchSource) -> Self {
        Self {
            schema: Arc::clone(source.schema()),
            source: Mutex::new(Some(source)),
        }
    }

    /// Scanner over a dataset made of this fragment alone, on the default pool
    pub fn into_scanner(self) -> Result<Scanner> {
        let schema = Arc::clone(&self.schema);
        let dataset = Dataset::new(schema, vec![Arc::new(self) as Arc<dyn Fragment>]);
        ScannerBuilder::new(Arc::new(dataset))
            .pool(default_memory_pool())
            .finish()
    }
}

impl fmt::Debug for ForeignFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFragment")
            .field("schema", &self.schema)
            .finish()
    }
}

impl Fragment for ForeignFragment {
    fn type_name(&self) -> &'static str {
        "foreign_iterator"
    }

    fn read_physical_schema(&self) -> Result<SchemaRef> {
        Err(DatasetError::Unsupported(
            "No physical schema is readable".to_string(),
        ))
    }

    fn scan_batches(&self, _options: &ScanOptions) -> Result<RecordBatchIter> {
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                DatasetError::InvalidArgument(
                    "foreign iterator fragment can only be scanned once".to_string(),
                )
            })?;
        log::debug!("starting single-pass scan of foreign iterator");
        Ok(Box::new(source))
    }
}
