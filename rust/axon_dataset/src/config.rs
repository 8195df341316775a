//! Bridge configuration
//!
//! Settings can be given programmatically or as a `key=value` list separated
//! by `,` or `;` (the form the C layer accepts on init).

use crate::error::{DatasetError, Result};

/// Default number of rows per scanned batch
pub const DEFAULT_BATCH_SIZE: usize = 1 << 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Rows per batch when a scanner is created without an explicit size
    pub default_batch_size: usize,
    /// Granularity of listener reservations; 1 reserves exact sizes
    pub reservation_block_size: i64,
    /// File name prefixes skipped during directory discovery
    pub ignore_prefixes: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
            reservation_block_size: 1,
            ignore_prefixes: vec![".".to_string(), "_".to_string()],
        }
    }
}

impl BridgeConfig {
    /// Parse a `key=value` list on top of the defaults
    pub fn from_kv(kv: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply_kv(kv)?;
        Ok(config)
    }

    pub fn apply_kv(&mut self, kv: &str) -> Result<()> {
        for pair in kv
            .split([',', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let Some((k, v)) = pair.split_once('=') else {
                return Err(DatasetError::InvalidArgument(format!(
                    "invalid config pair '{pair}', expected key=value"
                )));
            };
            let key = k.trim().to_ascii_lowercase();
            let value = v.trim();
            match key.as_str() {
                "default_batch_size" | "batch_size" => {
                    let parsed: usize = value.parse().map_err(|e| {
                        DatasetError::InvalidArgument(format!(
                            "invalid default_batch_size '{value}': {e}"
                        ))
                    })?;
                    if parsed == 0 {
                        return Err(DatasetError::InvalidArgument(
                            "default_batch_size must be positive".to_string(),
                        ));
                    }
                    self.default_batch_size = parsed;
                }
                "reservation_block_size" => {
                    let parsed: i64 = value.parse().map_err(|e| {
                        DatasetError::InvalidArgument(format!(
                            "invalid reservation_block_size '{value}': {e}"
                        ))
                    })?;
                    if parsed <= 0 {
                        return Err(DatasetError::InvalidArgument(
                            "reservation_block_size must be positive".to_string(),
                        ));
                    }
                    self.reservation_block_size = parsed;
                }
                "ignore_prefixes" => {
                    self.ignore_prefixes = value
                        .split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                other => {
                    return Err(DatasetError::InvalidArgument(format!(
                        "unknown config key '{other}'"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Whether discovery should skip a file with this name
    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignore_prefixes
            .iter()
            .any(|prefix| file_name.starts_with(prefix.as_str()))
    }
}
