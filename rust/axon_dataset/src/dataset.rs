//! Datasets and the fragments they are made of
//!
//! A [`FileSystemDatasetFactory`] discovers the files under a URI, can infer
//! their common schema, and finishes into a [`Dataset`] once the caller has
//! settled on a schema. The dataset is only a schema plus a list of
//! [`Fragment`]s; reading happens through a [`Scanner`](crate::scanner::Scanner).

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use url::Url;

use crate::config::BridgeConfig;
use crate::error::{DatasetError, Result};
use crate::format::FileFormat;
use crate::scanner::{ScanOptions, ScannerBuilder};

pub type RecordBatchIter = Box<dyn Iterator<Item = Result<RecordBatch>> + Send>;

/// A unit of data a scan can read independently
pub trait Fragment: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Schema as stored in the fragment itself
    fn read_physical_schema(&self) -> Result<SchemaRef>;

    /// Start reading; batches carry the columns of the projection the
    /// fragment actually holds
    fn scan_batches(&self, options: &ScanOptions) -> Result<RecordBatchIter>;
}

/// Resolve a plain path or a `file://` URI to a local path
pub fn path_from_uri(uri: &str) -> Result<PathBuf> {
    if uri.is_empty() {
        return Err(DatasetError::InvalidArgument("URI is empty".to_string()));
    }
    if !uri.contains("://") {
        return Ok(PathBuf::from(uri));
    }
    let url = Url::parse(uri)
        .map_err(|e| DatasetError::InvalidArgument(format!("invalid URI {uri}: {e}")))?;
    if url.scheme() != "file" {
        return Err(DatasetError::InvalidArgument(format!(
            "unsupported URI scheme '{}' in {uri}",
            url.scheme()
        )));
    }
    url.to_file_path().map_err(|_| {
        DatasetError::InvalidArgument(format!("file URI could not be converted to a path: {uri}"))
    })
}

/// One file of a file system dataset
#[derive(Debug, Clone)]
pub struct FileFragment {
    path: PathBuf,
    format: FileFormat,
    byte_range: Option<Range<u64>>,
}

impl FileFragment {
    pub fn new(path: PathBuf, format: FileFormat) -> Self {
        Self {
            path,
            format,
            byte_range: None,
        }
    }

    pub fn with_byte_range(mut self, range: Range<u64>) -> Self {
        self.byte_range = Some(range);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }
}

impl Fragment for FileFragment {
    fn type_name(&self) -> &'static str {
        match self.format {
            FileFormat::Parquet => "parquet",
            FileFormat::Ipc => "ipc",
        }
    }

    fn read_physical_schema(&self) -> Result<SchemaRef> {
        self.format.inspect(&self.path)
    }

    fn scan_batches(&self, options: &ScanOptions) -> Result<RecordBatchIter> {
        log::debug!("scanning {} fragment {}", self.format, self.path.display());
        self.format.open_reader(
            &self.path,
            &options.projected_columns(),
            options.batch_size,
            self.byte_range.as_ref(),
        )
    }
}

/// Discovers files under a URI
#[derive(Debug)]
pub struct FileSystemDatasetFactory {
    root: PathBuf,
    format: FileFormat,
    fragments: Vec<FileFragment>,
}

impl FileSystemDatasetFactory {
    /// `uri` may name a single file or a directory, which is searched
    /// recursively. `start_offset` and `length` select a byte range of a
    /// single file and are rejected for directories.
    pub fn make(
        uri: &str,
        format: FileFormat,
        start_offset: Option<u64>,
        length: Option<u64>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let root = path_from_uri(uri)?;
        let metadata = fs::metadata(&root).map_err(|e| {
            DatasetError::InvalidArgument(format!("cannot access {}: {e}", root.display()))
        })?;
        let ranged = start_offset.is_some() || length.is_some();

        let fragments = if metadata.is_dir() {
            if ranged {
                return Err(DatasetError::InvalidArgument(
                    "start offset and length require a single file".to_string(),
                ));
            }
            let mut files = Vec::new();
            discover(&root, config, &mut files)?;
            files.sort();
            files
                .into_iter()
                .map(|path| FileFragment::new(path, format))
                .collect()
        } else {
            let fragment = FileFragment::new(root.clone(), format);
            if ranged {
                let start = start_offset.unwrap_or(0);
                let end = length.map_or(u64::MAX, |len| start.saturating_add(len));
                vec![fragment.with_byte_range(start..end)]
            } else {
                vec![fragment]
            }
        };

        log::debug!(
            "discovered {} {} file(s) under {}",
            fragments.len(),
            format,
            root.display()
        );
        Ok(Self {
            root,
            format,
            fragments,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.fragments.iter().map(FileFragment::path)
    }

    /// Merge the schemas of all discovered files
    pub fn inspect(&self) -> Result<SchemaRef> {
        let schemas = self
            .fragments
            .iter()
            .map(|fragment| {
                fragment
                    .read_physical_schema()
                    .map(|schema| schema.as_ref().clone())
            })
            .collect::<Result<Vec<Schema>>>()?;
        let merged = Schema::try_merge(schemas).map_err(|e| {
            DatasetError::InvalidArgument(format!("files have incompatible schemas: {e}"))
        })?;
        Ok(Arc::new(merged))
    }

    pub fn finish(&self, schema: SchemaRef) -> Result<Dataset> {
        let fragments = self
            .fragments
            .iter()
            .cloned()
            .map(|fragment| Arc::new(fragment) as Arc<dyn Fragment>)
            .collect();
        Ok(Dataset::new(schema, fragments))
    }
}

fn discover(dir: &Path, config: &BridgeConfig, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if config.is_ignored(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            discover(&path, config, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// A schema and the fragments holding its data
#[derive(Debug)]
pub struct Dataset {
    schema: SchemaRef,
    fragments: Vec<Arc<dyn Fragment>>,
}

impl Dataset {
    pub fn new(schema: SchemaRef, fragments: Vec<Arc<dyn Fragment>>) -> Self {
        Self { schema, fragments }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn fragments(&self) -> &[Arc<dyn Fragment>] {
        &self.fragments
    }

    pub fn new_scan(self: &Arc<Self>) -> ScannerBuilder {
        ScannerBuilder::new(Arc::clone(self))
    }
}
