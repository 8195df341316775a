//! Schema serialization
//!
//! Schemas cross the boundary as an Arrow IPC stream that carries the schema
//! message and no batches, which any Arrow implementation can read back.

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow_schema::{Schema, SchemaRef};

use crate::error::{DatasetError, Result};

pub fn serialize_schema(schema: &Schema) -> Result<Vec<u8>> {
    let writer = StreamWriter::try_new(Vec::new(), schema)?;
    Ok(writer.into_inner()?)
}

pub fn deserialize_schema(bytes: &[u8]) -> Result<SchemaRef> {
    if bytes.is_empty() {
        return Err(DatasetError::InvalidArgument(
            "serialized schema is empty".to_string(),
        ));
    }
    let reader = StreamReader::try_new(Cursor::new(bytes), None).map_err(|e| {
        DatasetError::InvalidArgument(format!("failed to decode serialized schema: {e}"))
    })?;
    Ok(reader.schema())
}
