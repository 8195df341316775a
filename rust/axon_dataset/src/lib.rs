//! Axon Dataset - native half of a cross-runtime columnar data bridge
//!
//! A managed host runtime drives the scan engine in this crate through opaque
//! integer handles and swaps record batches with it over the Arrow C data
//! interface. It can be used directly from Rust or through the C FFI layer.
//!
//! # Features
//!
//! - Thread-safe handle registry for every object the host holds
//! - Memory pools whose allocations can be vetoed by host-side policy
//! - Host pull iterators scanned as ordinary single-fragment datasets
//! - Offset-normalizing batch export, zero-copy where possible
//! - Parquet and Arrow IPC datasets, Hive-partitioned writes
//!
//! # Example
//!
//! ```ignore
//! use axon_dataset::{DatasetBridge, runtime, BridgeConfig};
//!
//! runtime::init(host, BridgeConfig::default())?;
//!
//! let factory = DatasetBridge::open_dataset_factory("/data/events", 0, None, None)?;
//! let schema = DatasetBridge::inspect_schema(factory)?;
//! let dataset = DatasetBridge::create_dataset(factory, &schema)?;
//!
//! let pool = DatasetBridge::default_memory_pool()?;
//! let scanner = DatasetBridge::create_scanner(dataset, None, 4096, pool)?;
//! while let Some(batch) = DatasetBridge::next_batch(scanner)? {
//!     println!("{} rows", batch.num_rows());
//! }
//!
//! DatasetBridge::close_scanner(scanner)?;
//! DatasetBridge::close_dataset(dataset)?;
//! DatasetBridge::close_dataset_factory(factory)?;
//! # Ok::<(), axon_dataset::DatasetError>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        Host runtime (through axon_dataset_c)    │
//! └─────────────────────────────────────────────────┘
//!                      │ handles, FFI arrays
//!                      ▼
//! ┌─────────────────────────────────────────────────┐
//! │     DatasetBridge, HandleRegistry, runtime      │
//! ├─────────────────────────────────────────────────┤
//! │  ScanSession │ ForeignBatchSource │ exchange    │
//! ├─────────────────────────────────────────────────┤
//! │   Dataset, Scanner, Writer │ memory pools       │
//! └─────────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────────┐
//! │           arrow-rs / parquet (v56)              │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod dataset;
pub mod error;
pub mod exchange;
pub mod foreign;
pub mod format;
pub mod handle;
pub mod host;
pub mod memory;
pub mod runtime;
pub mod scanner;
pub mod schema;
pub mod session;
pub mod writer;

pub use bridge::{DatasetBridge, ExportedBuffer, NativeScanner};
pub use config::BridgeConfig;
pub use error::{DatasetError, Result};
pub use foreign::{ForeignBatchSource, ForeignFragment, ForeignIterator};
pub use format::FileFormat;
pub use handle::{registry, HandleRegistry, NativeHandle};
pub use host::{HostObject, HostRuntime};
pub use memory::{MemoryPool, ReservationListenableMemoryPool, ReservationListener};
pub use session::ScanSession;
pub use writer::WriteSummary;

// Re-export commonly used Arrow types
pub use arrow::ffi::FFI_ArrowArray;
pub use arrow_array::RecordBatch;
pub use arrow_schema::{DataType, Field, Schema, SchemaRef};
