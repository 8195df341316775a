//! Record batch exchange through the Arrow C data interface
//!
//! Export hands a batch to the host in a caller-provided `FFI_ArrowArray`.
//! The host consumes exported buffers as if every array started at offset
//! zero, so arrays that still carry an offset (a slice of a larger array, or
//! a null bitmap starting mid-byte) are copied into compact arrays first.
//! Everything already at offset zero is exported without copying.
//!
//! Import takes an `FFI_ArrowArray` address produced by the host and moves
//! the array out of it. From then on the imported buffers belong to native
//! code and the host's struct is left in the released state.

use std::sync::Arc;

use arrow::array::{make_array, Array, ArrayData, ArrayRef, MutableArrayData, StructArray};
use arrow::ffi::{from_ffi, FFI_ArrowArray, FFI_ArrowSchema};
use arrow_array::RecordBatch;
use arrow_schema::{DataType, SchemaRef};

use crate::error::{DatasetError, Result};

/// Whether `data` or any of its children is described with a nonzero offset
pub fn needs_compaction(data: &ArrayData) -> bool {
    data.offset() != 0
        || data.nulls().is_some_and(|nulls| nulls.offset() != 0)
        || data.child_data().iter().any(needs_compaction)
}

/// Copy `array` into a fresh offset-zero array holding only its logical values
///
/// Arrays that need no compaction are returned as they are.
pub fn compact_array(array: &ArrayRef) -> ArrayRef {
    let data = array.to_data();
    if !needs_compaction(&data) {
        return Arc::clone(array);
    }
    log::debug!(
        "compacting {} array of length {} at offset {}",
        data.data_type(),
        data.len(),
        data.offset()
    );
    let mut mutable = MutableArrayData::new(vec![&data], false, data.len());
    mutable.extend(0, 0, data.len());
    make_array(mutable.freeze())
}

/// Replace every column that needs compaction with a compact copy
pub fn offset_zeroed_batch(batch: &RecordBatch) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = batch.columns().iter().map(compact_array).collect();
    let options = arrow_array::RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        batch.schema(),
        columns,
        &options,
    )?)
}

/// Export `batch` as a struct array into `out`
///
/// # Safety
/// `out` must be valid for writes of one `FFI_ArrowArray`. Whatever it held
/// before is overwritten without being released.
pub unsafe fn export_record_batch(batch: &RecordBatch, out: *mut FFI_ArrowArray) -> Result<()> {
    if out.is_null() {
        return Err(DatasetError::InvalidArgument(
            "output array pointer is null".to_string(),
        ));
    }
    let compacted = offset_zeroed_batch(batch)?;
    let data = StructArray::from(compacted).to_data();
    std::ptr::write(out, FFI_ArrowArray::new(&data));
    Ok(())
}

/// Read an `FFI_ArrowArray` address from its 8-byte native-endian encoding
pub fn decode_address(bytes: &[u8]) -> Result<*mut FFI_ArrowArray> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        DatasetError::InvalidArgument(format!(
            "expected an 8-byte array address, got {} bytes",
            bytes.len()
        ))
    })?;
    let address = i64::from_ne_bytes(raw);
    if address == 0 {
        return Err(DatasetError::InvalidArgument(
            "array address is null".to_string(),
        ));
    }
    Ok(address as usize as *mut FFI_ArrowArray)
}

/// Import the host array at the encoded `address` as a batch of `schema`
///
/// # Safety
/// The decoded address must point to a live `FFI_ArrowArray` that exports a
/// struct array. The array is moved out regardless of whether the import
/// succeeds; on failure its release callback has already run.
pub unsafe fn import_record_batch(schema: &SchemaRef, address: &[u8]) -> Result<RecordBatch> {
    let ptr = decode_address(address)?;
    let array = std::ptr::replace(ptr, FFI_ArrowArray::empty());
    import_array(schema, array)
}

/// Check that the child layout of `array` matches `data_type`
///
/// The arrow importer asserts on child counts, so a host array with the
/// wrong shape has to be rejected before it gets there.
fn check_layout(array: &FFI_ArrowArray, data_type: &DataType, path: &str) -> Result<()> {
    let mismatch = |expected: usize| {
        DatasetError::InvalidArgument(format!(
            "imported array {path} has {} children, expected {expected} for {data_type}",
            array.num_children()
        ))
    };
    match data_type {
        DataType::Struct(fields) => {
            if array.num_children() != fields.len() {
                return Err(mismatch(fields.len()));
            }
            for (i, field) in fields.iter().enumerate() {
                let child = array.child(i);
                let required = array.offset().saturating_add(array.len());
                if child.len() < required {
                    return Err(DatasetError::InvalidArgument(format!(
                        "imported column {path}.{} holds {} rows, expected at least {required}",
                        field.name(),
                        child.len()
                    )));
                }
                check_layout(child, field.data_type(), &format!("{path}.{}", field.name()))?;
            }
        }
        DataType::List(field)
        | DataType::LargeList(field)
        | DataType::FixedSizeList(field, _)
        | DataType::Map(field, _) => {
            if array.num_children() != 1 {
                return Err(mismatch(1));
            }
            check_layout(array.child(0), field.data_type(), &format!("{path}.{}", field.name()))?;
        }
        DataType::Union(fields, _) => {
            if array.num_children() != fields.len() {
                return Err(mismatch(fields.len()));
            }
        }
        DataType::RunEndEncoded(_, _) => {
            if array.num_children() != 2 {
                return Err(mismatch(2));
            }
        }
        _ => {}
    }
    Ok(())
}

fn import_array(schema: &SchemaRef, array: FFI_ArrowArray) -> Result<RecordBatch> {
    if array.is_released() {
        return Err(DatasetError::InvalidArgument(
            "imported array is already released".to_string(),
        ));
    }
    // `array` is dropped on the error path, which runs its release callback
    check_layout(
        &array,
        &DataType::Struct(schema.fields().clone()),
        "batch",
    )?;
    let ffi_schema = FFI_ArrowSchema::try_from(schema.as_ref())?;
    // SAFETY: the schema describes the struct layout the host promised to export
    let data = unsafe { from_ffi(array, &ffi_schema) }?;
    data.validate_full()?;
    let struct_array = StructArray::from(data);
    if struct_array.null_count() > 0 {
        return Err(DatasetError::InvalidArgument(
            "imported record batch has top-level nulls".to_string(),
        ));
    }
    Ok(RecordBatch::try_new(
        Arc::clone(schema),
        struct_array.columns().to_vec(),
    )?)
}
