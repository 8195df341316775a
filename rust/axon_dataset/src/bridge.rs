//! Handle-based API used by the host runtime
//!
//! Every native object the host holds on to lives in the process-wide
//! [`HandleRegistry`](crate::handle::HandleRegistry) and is referred to by a
//! [`NativeHandle`]. Schemas travel as IPC-serialized bytes and record batches
//! through the Arrow C data interface.

use std::sync::{Arc, Mutex, TryLockError};

use arrow::ffi::FFI_ArrowArray;
use arrow_array::RecordBatch;

use crate::dataset::{path_from_uri, Dataset, FileSystemDatasetFactory};
use crate::error::{DatasetError, Result};
use crate::exchange;
use crate::foreign::{ForeignBatchSource, ForeignFragment, ForeignIterator};
use crate::format::FileFormat;
use crate::handle::{registry, NativeHandle};
use crate::host::{HostBatchIterator, HostObject, HostReservationListener};
use crate::memory::{MemoryPool, ReservationListenableMemoryPool, ReservationListener};
use crate::runtime::{self, NativeMemoryPool};
use crate::scanner::Scanner;
use crate::schema::{deserialize_schema, serialize_schema};
use crate::session::ScanSession;
use crate::writer::{write_dataset, WriteOptions, WriteSummary};

/// A scanner together with the one session reading from it
pub struct NativeScanner {
    scanner: Arc<Scanner>,
    session: Mutex<ScanSession>,
}

impl NativeScanner {
    fn create(scanner: Scanner) -> Result<Self> {
        let scanner = Arc::new(scanner);
        let session = ScanSession::create(Arc::clone(&scanner))?;
        Ok(Self {
            scanner,
            session: Mutex::new(session),
        })
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }
}

/// Bytes handed to the host that stay valid until released
#[derive(Debug)]
pub struct ExportedBuffer {
    bytes: Vec<u8>,
}

impl ExportedBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Static entry points of the bridge
pub struct DatasetBridge;

impl DatasetBridge {
    /// Discover the files of a dataset
    ///
    /// # Arguments
    /// * `uri` - A plain path or `file://` URI naming a file or directory
    /// * `format_id` - `0` for Parquet, `1` for Arrow IPC
    /// * `start_offset`, `length` - Optional byte range of a single file
    ///
    /// # Returns
    /// * `Ok(handle)` - Handle of the dataset factory
    /// * `Err(DatasetError)` - If the format id or URI is invalid
    pub fn open_dataset_factory(
        uri: &str,
        format_id: i32,
        start_offset: Option<u64>,
        length: Option<u64>,
    ) -> Result<NativeHandle> {
        let format = FileFormat::from_id(format_id)?;
        let factory = FileSystemDatasetFactory::make(
            uri,
            format,
            start_offset,
            length,
            &runtime::config(),
        )?;
        Ok(registry().create(Arc::new(factory)))
    }

    /// Serialized schema inferred from the factory's files
    pub fn inspect_schema(factory: NativeHandle) -> Result<Vec<u8>> {
        let factory = registry().retrieve::<FileSystemDatasetFactory>(factory)?;
        serialize_schema(factory.inspect()?.as_ref())
    }

    pub fn create_dataset(factory: NativeHandle, schema: &[u8]) -> Result<NativeHandle> {
        let factory = registry().retrieve::<FileSystemDatasetFactory>(factory)?;
        let schema = deserialize_schema(schema)?;
        let dataset = factory.finish(schema)?;
        Ok(registry().create(Arc::new(dataset)))
    }

    pub fn close_dataset_factory(factory: NativeHandle) -> Result<()> {
        registry().release_as::<FileSystemDatasetFactory>(factory)
    }

    pub fn close_dataset(dataset: NativeHandle) -> Result<()> {
        registry().release_as::<Dataset>(dataset)
    }

    /// Create a scanner and start its single pass
    ///
    /// # Arguments
    /// * `dataset` - Dataset handle
    /// * `columns` - Columns to read in this order, or `None` for all
    /// * `batch_size` - Maximum rows per batch, must be positive
    /// * `pool` - Pool that accounts for the batch the host currently holds
    pub fn create_scanner(
        dataset: NativeHandle,
        columns: Option<&[String]>,
        batch_size: i64,
        pool: NativeHandle,
    ) -> Result<NativeHandle> {
        let dataset = registry().retrieve::<Dataset>(dataset)?;
        let pool = Self::memory_pool(pool)?;
        let mut builder = dataset.new_scan().batch_size(batch_size)?.pool(pool);
        if let Some(columns) = columns {
            builder = builder.project(columns)?;
        }
        let native = NativeScanner::create(builder.finish()?)?;
        Ok(registry().create(Arc::new(native)))
    }

    pub fn projected_schema(scanner: NativeHandle) -> Result<Vec<u8>> {
        let native = registry().retrieve::<NativeScanner>(scanner)?;
        serialize_schema(native.scanner().projected_schema().as_ref())
    }

    /// Pull the next batch of a scanner, `None` at end of stream
    pub fn next_batch(scanner: NativeHandle) -> Result<Option<RecordBatch>> {
        let native = registry().retrieve::<NativeScanner>(scanner)?;
        let mut session = match native.session.try_lock() {
            Ok(session) => session,
            Err(TryLockError::WouldBlock) => {
                return Err(DatasetError::InvalidArgument(
                    "scan session is in use by another thread".to_string(),
                ))
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        session.next_batch()
    }

    /// Export the next batch of a scanner into `out`
    ///
    /// Returns `false` at end of stream, leaving `out` untouched.
    ///
    /// # Safety
    /// `out` must be valid for writes of one `FFI_ArrowArray`.
    pub unsafe fn next_record_batch(
        scanner: NativeHandle,
        out: *mut FFI_ArrowArray,
    ) -> Result<bool> {
        if out.is_null() {
            return Err(DatasetError::InvalidArgument(
                "output array pointer is null".to_string(),
            ));
        }
        match Self::next_batch(scanner)? {
            Some(batch) => {
                exchange::export_record_batch(&batch, out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn close_scanner(scanner: NativeHandle) -> Result<()> {
        registry().release_as::<NativeScanner>(scanner)
    }

    /// Park `bytes` in the registry so a caller can read them by handle
    pub fn export_buffer(bytes: Vec<u8>) -> NativeHandle {
        registry().create(Arc::new(ExportedBuffer { bytes }))
    }

    pub fn buffer(buffer: NativeHandle) -> Result<Arc<ExportedBuffer>> {
        registry().retrieve::<ExportedBuffer>(buffer)
    }

    pub fn release_buffer(buffer: NativeHandle) -> Result<()> {
        registry().release_as::<ExportedBuffer>(buffer)
    }

    /// Handle of the process default pool
    pub fn default_memory_pool() -> Result<NativeHandle> {
        let id = runtime::default_memory_pool_id();
        if id == runtime::INVALID_POOL_ID {
            return Err(DatasetError::NotFound(
                "default memory pool is not available before init".to_string(),
            ));
        }
        Ok(id)
    }

    /// Pool that reports every allocation to `listener` before making it
    pub fn create_listenable_memory_pool(
        listener: Arc<dyn ReservationListener>,
    ) -> Result<NativeHandle> {
        let pool = ReservationListenableMemoryPool::with_block_size(
            crate::memory::default_memory_pool(),
            listener,
            runtime::config().reservation_block_size,
        );
        Ok(registry().create(Arc::new(NativeMemoryPool::new(Arc::new(pool)))))
    }

    /// Listenable pool whose listener is a host object
    pub fn create_host_memory_pool(listener: HostObject) -> Result<NativeHandle> {
        let listener = HostReservationListener::new(runtime::host()?, listener)?;
        Self::create_listenable_memory_pool(Arc::new(listener))
    }

    /// Release a pool created by this bridge
    ///
    /// The default pool and handles that are no longer live are ignored. A
    /// live handle to anything other than a pool is an error.
    pub fn release_memory_pool(pool: NativeHandle) -> Result<()> {
        if pool == runtime::default_memory_pool_id() {
            return Ok(());
        }
        match registry().release_as::<NativeMemoryPool>(pool) {
            Ok(()) => Ok(()),
            Err(err) if registry().contains(pool) => Err(err),
            Err(err) => {
                log::debug!("ignoring release of memory pool {}: {}", pool, err);
                Ok(())
            }
        }
    }

    pub fn bytes_allocated(pool: NativeHandle) -> Result<i64> {
        Ok(Self::memory_pool(pool)?.bytes_allocated())
    }

    fn memory_pool(pool: NativeHandle) -> Result<Arc<dyn MemoryPool>> {
        let native = registry().retrieve::<NativeMemoryPool>(pool).map_err(|_| {
            DatasetError::NotFound(format!(
                "Memory pool instance {pool} not found. It may not exist or has been closed"
            ))
        })?;
        Ok(Arc::clone(native.pool()))
    }

    /// Drain a foreign iterator into files
    ///
    /// # Arguments
    /// * `iterator` - Source of exported batches, read exactly once
    /// * `schema` - Serialized schema of the batches
    /// * `format_id` - Output format
    /// * `uri` - Base directory
    /// * `partition_columns` - Columns turned into `column=value` directories
    /// * `max_partitions` - Upper bound on distinct partitions
    /// * `basename_template` - File name pattern containing `{i}`
    #[allow(clippy::too_many_arguments)]
    pub fn write_from_iterator_to_file(
        iterator: Box<dyn ForeignIterator>,
        schema: &[u8],
        format_id: i32,
        uri: &str,
        partition_columns: &[String],
        max_partitions: i64,
        basename_template: &str,
    ) -> Result<WriteSummary> {
        let schema = deserialize_schema(schema)?;
        let format = FileFormat::from_id(format_id)?;
        let max_partitions = usize::try_from(max_partitions)
            .ok()
            .filter(|max| *max > 0)
            .ok_or_else(|| {
                DatasetError::InvalidArgument(format!(
                    "max_partitions must be positive, got {max_partitions}"
                ))
            })?;

        let mut options = WriteOptions::new(format, path_from_uri(uri)?);
        options.partition_columns = partition_columns.to_vec();
        options.max_partitions = max_partitions;
        options.basename_template = basename_template.to_string();

        let scanner =
            ForeignFragment::new(ForeignBatchSource::new(iterator, schema)).into_scanner()?;
        write_dataset(&scanner, &options)
    }

    /// [`write_from_iterator_to_file`](Self::write_from_iterator_to_file)
    /// over an iterator object owned by the host
    #[allow(clippy::too_many_arguments)]
    pub fn write_from_host_iterator_to_file(
        iterator: HostObject,
        schema: &[u8],
        format_id: i32,
        uri: &str,
        partition_columns: &[String],
        max_partitions: i64,
        basename_template: &str,
    ) -> Result<WriteSummary> {
        let iterator = HostBatchIterator::new(runtime::host()?, iterator)?;
        Self::write_from_iterator_to_file(
            Box::new(iterator),
            schema,
            format_id,
            uri,
            partition_columns,
            max_partitions,
            basename_template,
        )
    }
}
