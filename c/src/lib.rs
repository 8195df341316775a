//! Axon Dataset Bridge - C FFI Interface
//!
//! This crate exposes the handle-based dataset API of `axon-dataset` to a
//! host runtime over a C ABI. Record batches cross the boundary through the
//! Arrow C data interface, schemas as IPC-serialized byte buffers.
//!
//! # Usage from C/C++
//!
//! ```c
//! #include <axon/dataset_bridge.h>
//!
//! // Once per process, with the host's callback table
//! if (axon_dataset_init(&host_interface, "batch_size=4096") != AXON_DATASET_SUCCESS) {
//!     const char* error = axon_dataset_get_last_error();
//!     // Handle error
//! }
//!
//! int64_t factory = axon_dataset_make_factory("file:///data/events", 0, -1, -1);
//! int64_t schema = axon_dataset_inspect_schema(factory);
//! int64_t dataset = axon_dataset_create_dataset(factory,
//!     axon_dataset_buffer_data(schema), axon_dataset_buffer_len(schema));
//! axon_dataset_release_buffer(schema);
//!
//! int64_t scanner = axon_dataset_create_scanner(dataset, NULL, 0, 4096,
//!     axon_dataset_default_memory_pool());
//!
//! struct ArrowArray batch;
//! while (axon_dataset_next_record_batch(scanner, &batch) == 1) {
//!     // Consume, then call batch.release(&batch)
//! }
//!
//! axon_dataset_close_scanner(scanner);
//! axon_dataset_close_dataset(dataset);
//! axon_dataset_close_dataset_factory(factory);
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arrow::ffi::FFI_ArrowArray;

use axon_dataset::{
    runtime, BridgeConfig, DatasetBridge, DatasetError, HostObject, HostRuntime, Result,
};

// ============================================================================
// Error code constants for C interface
// ============================================================================

/// Operation completed successfully
pub const AXON_DATASET_SUCCESS: c_int = 0;

/// Handle does not refer to a live object of the expected kind
pub const AXON_DATASET_ERROR_NOT_FOUND: c_int = -1;

/// Malformed argument (null pointer, bad UTF-8, unknown format id, ...)
pub const AXON_DATASET_ERROR_INVALID_ARGUMENT: c_int = -2;

/// The calling thread is not attached to the host runtime
pub const AXON_DATASET_ERROR_RUNTIME_DETACHED: c_int = -3;

/// A host callback reported a failure
pub const AXON_DATASET_ERROR_HOST_REJECTED: c_int = -4;

/// Operation not supported for this object
pub const AXON_DATASET_ERROR_UNSUPPORTED: c_int = -5;

/// Arrow conversion error
pub const AXON_DATASET_ERROR_ARROW: c_int = -6;

/// Parquet decode or encode error
pub const AXON_DATASET_ERROR_PARQUET: c_int = -7;

/// IO error
pub const AXON_DATASET_ERROR_IO: c_int = -8;

/// A panic was caught at the boundary
pub const AXON_DATASET_ERROR_INTERNAL: c_int = -9;

// ============================================================================
// Error handling
// ============================================================================

// Thread-local error message storage
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error_message(msg: String) {
    // Interior NULs would truncate the message on the C side
    let msg = msg.replace('\0', "\\0");
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn set_last_error(err: &DatasetError) {
    set_last_error_message(err.to_string());
}

fn error_code(err: &DatasetError) -> c_int {
    match err {
        DatasetError::NotFound(_) => AXON_DATASET_ERROR_NOT_FOUND,
        DatasetError::InvalidArgument(_) => AXON_DATASET_ERROR_INVALID_ARGUMENT,
        DatasetError::RuntimeDetachment(_) => AXON_DATASET_ERROR_RUNTIME_DETACHED,
        DatasetError::HostRejected(_) => AXON_DATASET_ERROR_HOST_REJECTED,
        DatasetError::Unsupported(_) => AXON_DATASET_ERROR_UNSUPPORTED,
        DatasetError::ArrowError(_) => AXON_DATASET_ERROR_ARROW,
        DatasetError::ParquetError(_) => AXON_DATASET_ERROR_PARQUET,
        DatasetError::IoError(_) => AXON_DATASET_ERROR_IO,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, recording any error or panic as the thread's last error
///
/// `on_error` turns the status code into the function's sentinel value.
fn guard<T>(f: impl FnOnce() -> Result<T>, on_error: impl FnOnce(c_int) -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            log::debug!("bridge call failed: {}", err);
            set_last_error(&err);
            on_error(error_code(&err))
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            log::error!("panic caught at the C boundary: {}", msg);
            set_last_error_message(format!("Internal error: {msg}"));
            on_error(AXON_DATASET_ERROR_INTERNAL)
        }
    }
}

/// Guard for calls returning a handle, 0 on error
fn guard_handle(f: impl FnOnce() -> Result<i64>) -> i64 {
    guard(f, |_| 0)
}

/// Guard for calls returning a status code
fn guard_status(f: impl FnOnce() -> Result<()>) -> c_int {
    guard(|| f().map(|()| AXON_DATASET_SUCCESS), |code| code)
}

/// Get the last error message as a C string
///
/// Returns a pointer to the error message string, or NULL if no error.
/// The returned string is valid until the next error occurs on this thread.
///
/// # Safety
/// The returned pointer is valid until the next call to any Axon function
/// that may set an error on this thread.
#[no_mangle]
pub extern "C" fn axon_dataset_get_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        if let Some(ref err) = *e.borrow() {
            err.as_ptr()
        } else {
            std::ptr::null()
        }
    })
}

// ============================================================================
// Argument conversion
// ============================================================================

unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(DatasetError::InvalidArgument(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| DatasetError::InvalidArgument(format!("Invalid UTF-8 in {what}")))
}

unsafe fn c_bytes<'a>(ptr: *const u8, len: usize, what: &str) -> Result<&'a [u8]> {
    if ptr.is_null() {
        return Err(DatasetError::InvalidArgument(format!("{what} is null")));
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

unsafe fn c_str_array(ptr: *const *const c_char, count: usize, what: &str) -> Result<Vec<String>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if ptr.is_null() {
        return Err(DatasetError::InvalidArgument(format!("{what} is null")));
    }
    std::slice::from_raw_parts(ptr, count)
        .iter()
        .map(|&item| c_str(item, what).map(str::to_string))
        .collect()
}

/// Negative offsets and lengths mean "not given"
fn optional_u64(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

// ============================================================================
// Host runtime
// ============================================================================

/// Callback table through which native code reaches the host runtime
///
/// Every callback receives `context` as its first argument. Status-returning
/// callbacks return 0 on success and any other value on failure.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AxonHostInterface {
    /// Opaque pointer passed back to every callback
    pub context: *mut c_void,
    /// 0 if the calling thread can call into the host
    pub ensure_attached: Option<unsafe extern "C" fn(context: *mut c_void) -> c_int>,
    /// Promote a call-local object reference; NULL on failure
    pub new_global_ref:
        Option<unsafe extern "C" fn(context: *mut c_void, object: *mut c_void) -> *mut c_void>,
    pub delete_global_ref: Option<unsafe extern "C" fn(context: *mut c_void, object: *mut c_void)>,
    /// 0 if the listener accepts the reservation
    pub reserve_memory:
        Option<unsafe extern "C" fn(context: *mut c_void, listener: *mut c_void, size: i64) -> c_int>,
    pub unreserve_memory:
        Option<unsafe extern "C" fn(context: *mut c_void, listener: *mut c_void, size: i64) -> c_int>,
    /// 1 if another batch is available, 0 at the end, negative on failure
    pub iterator_has_next:
        Option<unsafe extern "C" fn(context: *mut c_void, iterator: *mut c_void) -> c_int>,
    /// Store the address of an exported `ArrowArray` in `address`
    pub iterator_next: Option<
        unsafe extern "C" fn(context: *mut c_void, iterator: *mut c_void, address: *mut i64) -> c_int,
    >,
}

fn require<F>(callback: Option<F>, name: &str) -> Result<F> {
    callback.ok_or_else(|| {
        DatasetError::InvalidArgument(format!("host interface is missing {name}"))
    })
}

/// [`HostRuntime`] backed by an [`AxonHostInterface`]
struct CHostRuntime {
    context: *mut c_void,
    ensure_attached: unsafe extern "C" fn(*mut c_void) -> c_int,
    new_global_ref: unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void,
    delete_global_ref: unsafe extern "C" fn(*mut c_void, *mut c_void),
    reserve_memory: unsafe extern "C" fn(*mut c_void, *mut c_void, i64) -> c_int,
    unreserve_memory: unsafe extern "C" fn(*mut c_void, *mut c_void, i64) -> c_int,
    iterator_has_next: unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int,
    iterator_next: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut i64) -> c_int,
}

// SAFETY: the host guarantees that its callbacks and `context` may be used
// from any thread that passes `ensure_attached`.
unsafe impl Send for CHostRuntime {}
unsafe impl Sync for CHostRuntime {}

impl CHostRuntime {
    fn new(table: AxonHostInterface) -> Result<Self> {
        Ok(Self {
            context: table.context,
            ensure_attached: require(table.ensure_attached, "ensure_attached")?,
            new_global_ref: require(table.new_global_ref, "new_global_ref")?,
            delete_global_ref: require(table.delete_global_ref, "delete_global_ref")?,
            reserve_memory: require(table.reserve_memory, "reserve_memory")?,
            unreserve_memory: require(table.unreserve_memory, "unreserve_memory")?,
            iterator_has_next: require(table.iterator_has_next, "iterator_has_next")?,
            iterator_next: require(table.iterator_next, "iterator_next")?,
        })
    }
}

impl HostRuntime for CHostRuntime {
    fn ensure_attached(&self) -> Result<()> {
        match unsafe { (self.ensure_attached)(self.context) } {
            0 => Ok(()),
            status => Err(DatasetError::RuntimeDetachment(format!(
                "current thread is not attached to the host runtime (status {status})"
            ))),
        }
    }

    fn new_global_ref(&self, object: HostObject) -> Result<HostObject> {
        let global = unsafe { (self.new_global_ref)(self.context, object.as_raw()) };
        if global.is_null() {
            return Err(DatasetError::HostRejected(
                "host could not create a global reference".to_string(),
            ));
        }
        Ok(HostObject::from_raw(global))
    }

    fn delete_global_ref(&self, object: HostObject) {
        unsafe { (self.delete_global_ref)(self.context, object.as_raw()) }
    }

    fn reserve_memory(&self, listener: HostObject, size: i64) -> Result<()> {
        match unsafe { (self.reserve_memory)(self.context, listener.as_raw(), size) } {
            0 => Ok(()),
            status => Err(DatasetError::HostRejected(format!(
                "reservation of {size} bytes rejected by host (status {status})"
            ))),
        }
    }

    fn unreserve_memory(&self, listener: HostObject, size: i64) -> Result<()> {
        match unsafe { (self.unreserve_memory)(self.context, listener.as_raw(), size) } {
            0 => Ok(()),
            status => Err(DatasetError::HostRejected(format!(
                "release of {size} bytes failed on host (status {status})"
            ))),
        }
    }

    fn iterator_has_next(&self, iterator: HostObject) -> Result<bool> {
        match unsafe { (self.iterator_has_next)(self.context, iterator.as_raw()) } {
            0 => Ok(false),
            1 => Ok(true),
            status => Err(DatasetError::HostRejected(format!(
                "host iterator failed in has_next (status {status})"
            ))),
        }
    }

    fn iterator_next(&self, iterator: HostObject) -> Result<Vec<u8>> {
        let mut address: i64 = 0;
        match unsafe { (self.iterator_next)(self.context, iterator.as_raw(), &mut address) } {
            0 => Ok(address.to_ne_bytes().to_vec()),
            status => Err(DatasetError::HostRejected(format!(
                "host iterator failed in next (status {status})"
            ))),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Initialize the bridge for this process
///
/// # Arguments
/// * `host_interface` - Host callback table, copied by this call
/// * `config` - Optional `key=value` list separated by `;` or `,`, may be NULL
///
/// # Returns
/// * `AXON_DATASET_SUCCESS` (0) on success
/// * Negative error code on failure, including a second init without shutdown
///
/// # Safety
/// * `host_interface` must point to a valid `AxonHostInterface`
/// * `config` must be NULL or a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn axon_dataset_init(
    host_interface: *const AxonHostInterface,
    config: *const c_char,
) -> c_int {
    guard_status(|| {
        if host_interface.is_null() {
            return Err(DatasetError::InvalidArgument(
                "host interface is null".to_string(),
            ));
        }
        let host = CHostRuntime::new(*host_interface)?;
        let config = if config.is_null() {
            BridgeConfig::default()
        } else {
            BridgeConfig::from_kv(c_str(config, "config")?)?
        };
        runtime::init(Arc::new(host), config)
    })
}

/// Tear the bridge down; the default memory pool id becomes invalid
///
/// Calling this when the bridge is not initialized does nothing.
#[no_mangle]
pub extern "C" fn axon_dataset_shutdown() {
    guard(
        || {
            runtime::shutdown();
            Ok(())
        },
        |_| (),
    )
}

// ============================================================================
// Datasets
// ============================================================================

/// Discover the files of a dataset
///
/// # Arguments
/// * `uri` - Plain path or `file://` URI (null-terminated C string)
/// * `format_id` - `0` for Parquet, `1` for Arrow IPC
/// * `start_offset`, `length` - Byte range of a single file, negative if absent
///
/// # Returns
/// * Positive factory handle on success
/// * 0 on error - call `axon_dataset_get_last_error()` for details
///
/// # Safety
/// * `uri` must be a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn axon_dataset_make_factory(
    uri: *const c_char,
    format_id: c_int,
    start_offset: i64,
    length: i64,
) -> i64 {
    guard_handle(|| {
        DatasetBridge::open_dataset_factory(
            c_str(uri, "uri")?,
            format_id,
            optional_u64(start_offset),
            optional_u64(length),
        )
    })
}

/// Infer the dataset schema from the factory's files
///
/// # Returns
/// * Handle of an exported buffer holding the IPC-serialized schema; read it
///   with `axon_dataset_buffer_data`/`axon_dataset_buffer_len` and free it
///   with `axon_dataset_release_buffer`
/// * 0 on error
#[no_mangle]
pub extern "C" fn axon_dataset_inspect_schema(factory: i64) -> i64 {
    guard_handle(|| DatasetBridge::inspect_schema(factory).map(DatasetBridge::export_buffer))
}

/// Create a dataset from a factory and an IPC-serialized schema
///
/// # Returns
/// * Positive dataset handle on success
/// * 0 on error
///
/// # Safety
/// * `schema` must point to `schema_len` readable bytes
#[no_mangle]
pub unsafe extern "C" fn axon_dataset_create_dataset(
    factory: i64,
    schema: *const u8,
    schema_len: usize,
) -> i64 {
    guard_handle(|| {
        DatasetBridge::create_dataset(factory, c_bytes(schema, schema_len, "schema")?)
    })
}

#[no_mangle]
pub extern "C" fn axon_dataset_close_dataset_factory(factory: i64) -> c_int {
    guard_status(|| DatasetBridge::close_dataset_factory(factory))
}

#[no_mangle]
pub extern "C" fn axon_dataset_close_dataset(dataset: i64) -> c_int {
    guard_status(|| DatasetBridge::close_dataset(dataset))
}

// ============================================================================
// Scanners
// ============================================================================

/// Create a scanner over a dataset
///
/// # Arguments
/// * `dataset` - Dataset handle
/// * `columns` - Array of `num_columns` column names, or NULL to read all
/// * `num_columns` - Length of `columns`
/// * `batch_size` - Maximum rows per batch, must be positive
/// * `memory_pool` - Pool accounting for the batch the host currently holds
///
/// # Returns
/// * Positive scanner handle on success
/// * 0 on error
///
/// # Safety
/// * `columns` must be NULL or point to `num_columns` valid C strings
#[no_mangle]
pub unsafe extern "C" fn axon_dataset_create_scanner(
    dataset: i64,
    columns: *const *const c_char,
    num_columns: usize,
    batch_size: i64,
    memory_pool: i64,
) -> i64 {
    guard_handle(|| {
        let columns = if columns.is_null() {
            None
        } else {
            Some(c_str_array(columns, num_columns, "column name")?)
        };
        DatasetBridge::create_scanner(dataset, columns.as_deref(), batch_size, memory_pool)
    })
}

/// IPC-serialized schema of the batches a scanner produces
///
/// # Returns
/// * Handle of an exported buffer, 0 on error
#[no_mangle]
pub extern "C" fn axon_dataset_get_projected_schema(scanner: i64) -> i64 {
    guard_handle(|| DatasetBridge::projected_schema(scanner).map(DatasetBridge::export_buffer))
}

/// Export the next batch of a scanner
///
/// The batch is exported as a struct array whose children start at offset 0.
/// Ownership moves to the caller, who must call its `release` callback.
///
/// # Returns
/// * 1 if a batch was written to `out`
/// * 0 at end of stream, `out` left untouched
/// * Negative error code on failure
///
/// # Safety
/// * `out` must be valid for writes of one `ArrowArray`
#[no_mangle]
pub unsafe extern "C" fn axon_dataset_next_record_batch(
    scanner: i64,
    out: *mut FFI_ArrowArray,
) -> c_int {
    guard(
        || DatasetBridge::next_record_batch(scanner, out).map(c_int::from),
        |code| code,
    )
}

#[no_mangle]
pub extern "C" fn axon_dataset_close_scanner(scanner: i64) -> c_int {
    guard_status(|| DatasetBridge::close_scanner(scanner))
}

// ============================================================================
// Exported buffers
// ============================================================================

/// Start of an exported buffer, NULL on error
///
/// The pointer stays valid until the buffer is released.
#[no_mangle]
pub extern "C" fn axon_dataset_buffer_data(buffer: i64) -> *const u8 {
    guard(
        || DatasetBridge::buffer(buffer).map(|b| b.as_bytes().as_ptr()),
        |_| std::ptr::null(),
    )
}

/// Length in bytes of an exported buffer, -1 on error
#[no_mangle]
pub extern "C" fn axon_dataset_buffer_len(buffer: i64) -> i64 {
    guard(
        || DatasetBridge::buffer(buffer).map(|b| b.as_bytes().len() as i64),
        |_| -1,
    )
}

#[no_mangle]
pub extern "C" fn axon_dataset_release_buffer(buffer: i64) -> c_int {
    guard_status(|| DatasetBridge::release_buffer(buffer))
}

// ============================================================================
// Memory pools
// ============================================================================

/// Handle of the process default pool, 0 before init
#[no_mangle]
pub extern "C" fn axon_dataset_default_memory_pool() -> i64 {
    guard_handle(DatasetBridge::default_memory_pool)
}

/// Create a pool that asks a host listener before every allocation
///
/// The bridge takes a global reference to `listener` and deletes it when the
/// pool is released.
///
/// # Returns
/// * Positive pool handle on success
/// * 0 on error
#[no_mangle]
pub extern "C" fn axon_dataset_create_listenable_memory_pool(listener: *mut c_void) -> i64 {
    guard_handle(|| DatasetBridge::create_host_memory_pool(HostObject::from_raw(listener)))
}

/// Release a pool; the default pool and stale handles are ignored
#[no_mangle]
pub extern "C" fn axon_dataset_release_memory_pool(memory_pool: i64) -> c_int {
    guard_status(|| DatasetBridge::release_memory_pool(memory_pool))
}

/// Bytes currently allocated from a pool, -1 on error
#[no_mangle]
pub extern "C" fn axon_dataset_bytes_allocated(memory_pool: i64) -> i64 {
    guard(|| DatasetBridge::bytes_allocated(memory_pool), |_| -1)
}

// ============================================================================
// Writing
// ============================================================================

/// Drain a host iterator of exported batches into files
///
/// # Arguments
/// * `iterator` - Host iterator object, pulled through the host interface
/// * `schema`, `schema_len` - IPC-serialized schema of the batches
/// * `format_id` - Output format, `0` for Parquet, `1` for Arrow IPC
/// * `uri` - Base directory (null-terminated C string)
/// * `partition_columns`, `num_partition_columns` - Hive partition columns
/// * `max_partitions` - Upper bound on distinct partitions
/// * `basename_template` - File name pattern containing `{i}`
/// * `rows_written` - Receives the number of rows written, may be NULL
///
/// # Returns
/// * `AXON_DATASET_SUCCESS` (0) on success
/// * Negative error code on failure
///
/// # Safety
/// * `schema` must point to `schema_len` readable bytes
/// * `uri` and `basename_template` must be valid null-terminated C strings
/// * `partition_columns` must be NULL or point to `num_partition_columns`
///   valid C strings
/// * `rows_written` must be NULL or valid for writes of one `int64_t`
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn axon_dataset_write_from_iterator_to_file(
    iterator: *mut c_void,
    schema: *const u8,
    schema_len: usize,
    format_id: c_int,
    uri: *const c_char,
    partition_columns: *const *const c_char,
    num_partition_columns: usize,
    max_partitions: i64,
    basename_template: *const c_char,
    rows_written: *mut i64,
) -> c_int {
    guard_status(|| {
        let summary = DatasetBridge::write_from_host_iterator_to_file(
            HostObject::from_raw(iterator),
            c_bytes(schema, schema_len, "schema")?,
            format_id,
            c_str(uri, "uri")?,
            &c_str_array(partition_columns, num_partition_columns, "partition column")?,
            max_partitions,
            c_str(basename_template, "basename template")?,
        )?;
        if !rows_written.is_null() {
            *rows_written = summary.rows_written as i64;
        }
        Ok(())
    })
}
