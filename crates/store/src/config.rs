//! Storage configuration.
//!
//! [`StorageConfig`] is built either through its validated builder or from
//! string-keyed `nacre.*` properties, mirroring how embedding applications
//! usually pass tuning knobs through a flat key/value map.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::{
    error::{Error, Result},
    layout::PAGE_SIZE,
};

/// Configuration validation error.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Object cache eviction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Weak map plus a bounded strong LRU list.
    #[default]
    Lru,
    /// Never evicts.
    Strong,
    /// A larger LRU list (four times the configured size).
    Soft,
    /// Weak references only.
    Weak,
}

/// Encoding used for `String` fields inside object records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    /// UTF-8 bytes.
    #[default]
    Utf8,
    /// UTF-16LE code units.
    Utf16,
}

/// Storage configuration.
///
/// # Validation Rules
///
/// - `extension_quantum` must be >= one page (4096 bytes)
/// - `object_index_init_size` must be > 0
/// - `object_cache_init_size` must be > 0
///
/// # Example
///
/// ```no_run
/// # use nacre_store::StorageConfig;
/// let config = StorageConfig::builder()
///     .page_pool_size(16 * 1024 * 1024)
///     .gc_threshold(64 * 1024 * 1024)
///     .build()
///     .expect("valid storage config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Page pool capacity in bytes. Zero means the pool grows without bound.
    #[serde(default = "default_page_pool_size")]
    pub page_pool_size: u64,
    /// Number of strongly held entries in the object cache.
    #[serde(default = "default_object_cache_init_size")]
    pub object_cache_init_size: usize,
    /// Object cache eviction strategy.
    #[serde(default)]
    pub object_cache_kind: CacheKind,
    /// Initial number of object index slots for a new database.
    #[serde(default = "default_object_index_init_size")]
    pub object_index_init_size: u32,
    /// Minimal number of bytes by which the file grows when no hole is found.
    #[serde(default = "default_extension_quantum")]
    pub extension_quantum: u64,
    /// Bytes allocated since the last collection that trigger an implicit GC.
    #[serde(default)]
    pub gc_threshold: Option<u64>,
    /// Open the database in read-only mode.
    #[serde(default)]
    pub read_only: bool,
    /// Skip `fsync` on flush.
    #[serde(default)]
    pub no_flush: bool,
    /// Accepted for compatibility; a single B-tree implementation serves both settings.
    #[serde(default)]
    pub alternative_btree: bool,
    /// Run the collector on a dedicated background thread.
    #[serde(default)]
    pub background_gc: bool,
    /// Encoding of `String` fields.
    #[serde(default)]
    pub string_encoding: StringEncoding,
    /// Take an exclusive OS lock on the database file.
    #[serde(default)]
    pub lock_file: bool,
    /// Accepted for compatibility; replication transport is not provided.
    #[serde(default)]
    pub replication_ack: bool,
    /// Key for the cipher byte filter. `None` stores pages in clear.
    #[serde(default)]
    pub cipher_key: Option<String>,
}

#[bon::bon]
impl StorageConfig {
    /// Creates a new storage configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if:
    /// - `extension_quantum` < 4096
    /// - `object_index_init_size` is zero
    /// - `object_cache_init_size` is zero
    #[builder]
    pub fn new(
        #[builder(default = default_page_pool_size())] page_pool_size: u64,
        #[builder(default = default_object_cache_init_size())] object_cache_init_size: usize,
        #[builder(default)] object_cache_kind: CacheKind,
        #[builder(default = default_object_index_init_size())] object_index_init_size: u32,
        #[builder(default = default_extension_quantum())] extension_quantum: u64,
        gc_threshold: Option<u64>,
        #[builder(default)] read_only: bool,
        #[builder(default)] no_flush: bool,
        #[builder(default)] alternative_btree: bool,
        #[builder(default)] background_gc: bool,
        #[builder(default)] string_encoding: StringEncoding,
        #[builder(default)] lock_file: bool,
        #[builder(default)] replication_ack: bool,
        cipher_key: Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let config = Self {
            page_pool_size,
            object_cache_init_size,
            object_cache_kind,
            object_index_init_size,
            extension_quantum,
            gc_threshold,
            read_only,
            no_flush,
            alternative_btree,
            background_gc,
            string_encoding,
            lock_file,
            replication_ack,
            cipher_key,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StorageConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.extension_quantum < PAGE_SIZE as u64 {
            return Err(ConfigError::Validation {
                message: format!(
                    "extension_quantum must be >= {PAGE_SIZE}, got {}",
                    self.extension_quantum
                ),
            });
        }
        if self.object_index_init_size == 0 {
            return Err(ConfigError::Validation {
                message: "object_index_init_size must be > 0".to_string(),
            });
        }
        if self.object_cache_init_size == 0 {
            return Err(ConfigError::Validation {
                message: "object_cache_init_size must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Builds a configuration from `nacre.*` properties on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPropertyValue`] for malformed values and
    /// [`Error::Config`] if the result does not validate.
    pub fn from_properties<'a, I>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            config.set_property(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Applies one string-keyed property. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadPropertyValue`] if the value cannot be parsed.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "nacre.page.pool.size" => self.page_pool_size = parse_int(key, value)?,
            "nacre.object.cache.init.size" => self.object_cache_init_size = parse_int(key, value)?,
            "nacre.object.cache.kind" => {
                self.object_cache_kind = match value.to_ascii_lowercase().as_str() {
                    "lru" => CacheKind::Lru,
                    "strong" => CacheKind::Strong,
                    "soft" => CacheKind::Soft,
                    "weak" => CacheKind::Weak,
                    _ => return Err(bad_value(key, value)),
                }
            },
            "nacre.object.index.init.size" => {
                self.object_index_init_size = parse_int(key, value)?
            },
            "nacre.extension.quantum" => self.extension_quantum = parse_int(key, value)?,
            "nacre.gc.threshold" => {
                let threshold: i64 = parse_int(key, value)?;
                self.gc_threshold = u64::try_from(threshold).ok();
            },
            "nacre.file.readonly" => self.read_only = parse_bool(key, value)?,
            "nacre.file.noflush" => self.no_flush = parse_bool(key, value)?,
            "nacre.alternative.btree" => self.alternative_btree = parse_bool(key, value)?,
            "nacre.background.gc" => self.background_gc = parse_bool(key, value)?,
            "nacre.string.encoding" => {
                self.string_encoding = match value.to_ascii_lowercase().as_str() {
                    "utf8" | "utf-8" => StringEncoding::Utf8,
                    "utf16" | "utf-16" => StringEncoding::Utf16,
                    _ => return Err(bad_value(key, value)),
                }
            },
            "nacre.lock.file" => self.lock_file = parse_bool(key, value)?,
            "nacre.replication.ack" => self.replication_ack = parse_bool(key, value)?,
            _ => {},
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_pool_size: default_page_pool_size(),
            object_cache_init_size: default_object_cache_init_size(),
            object_cache_kind: CacheKind::default(),
            object_index_init_size: default_object_index_init_size(),
            extension_quantum: default_extension_quantum(),
            gc_threshold: None,
            read_only: false,
            no_flush: false,
            alternative_btree: false,
            background_gc: false,
            string_encoding: StringEncoding::default(),
            lock_file: false,
            replication_ack: false,
            cipher_key: None,
        }
    }
}

fn default_page_pool_size() -> u64 {
    4 * 1024 * 1024 // 4 MB
}

fn default_object_cache_init_size() -> usize {
    1319
}

fn default_object_index_init_size() -> u32 {
    1024
}

fn default_extension_quantum() -> u64 {
    1024 * 1024 // 1 MB
}

fn bad_value(key: &str, value: &str) -> Error {
    Error::BadPropertyValue { key: key.to_string(), value: value.to_string() }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(bad_value(key, value)),
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| bad_value(key, value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // =========================================================================
    // Builder and validation
    // =========================================================================

    #[test]
    fn test_defaults_are_valid() {
        let config = StorageConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config, StorageConfig::default());
        assert_eq!(config.extension_quantum, 1024 * 1024);
        assert_eq!(config.object_index_init_size, 1024);
        assert!(config.gc_threshold.is_none());
    }

    #[test]
    fn test_small_extension_quantum_rejected() {
        let err = StorageConfig::builder().extension_quantum(100).build().unwrap_err();
        assert!(err.to_string().contains("extension_quantum"), "got: {err}");
    }

    #[test]
    fn test_zero_index_size_rejected() {
        assert!(StorageConfig::builder().object_index_init_size(0).build().is_err());
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        assert!(StorageConfig::builder().object_cache_init_size(0).build().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation { message: "test error".to_string() };
        assert_eq!(err.to_string(), "invalid config: test error");
    }

    // =========================================================================
    // String-keyed properties
    // =========================================================================

    #[test]
    fn test_from_properties() {
        let config = StorageConfig::from_properties([
            ("nacre.object.cache.kind", "strong"),
            ("nacre.gc.threshold", "1048576"),
            ("nacre.file.noflush", "T"),
            ("nacre.background.gc", "1"),
            ("nacre.string.encoding", "utf16"),
            ("nacre.object.index.init.size", "4096"),
            ("some.unknown.key", "whatever"),
        ])
        .unwrap();
        assert_eq!(config.object_cache_kind, CacheKind::Strong);
        assert_eq!(config.gc_threshold, Some(1_048_576));
        assert!(config.no_flush);
        assert!(config.background_gc);
        assert_eq!(config.string_encoding, StringEncoding::Utf16);
        assert_eq!(config.object_index_init_size, 4096);
    }

    #[test]
    fn test_negative_gc_threshold_disables_gc() {
        let mut config = StorageConfig::builder().gc_threshold(10).build().unwrap();
        config.set_property("nacre.gc.threshold", "-1").unwrap();
        assert_eq!(config.gc_threshold, None);
    }

    #[test]
    fn test_bad_boolean_rejected() {
        let mut config = StorageConfig::default();
        let err = config.set_property("nacre.file.readonly", "maybe").unwrap_err();
        assert!(matches!(err, Error::BadPropertyValue { .. }));
    }

    #[test]
    fn test_bad_integer_rejected() {
        let mut config = StorageConfig::default();
        let err = config.set_property("nacre.extension.quantum", "lots").unwrap_err();
        assert!(matches!(err, Error::BadPropertyValue { .. }));
    }

    #[test]
    fn test_properties_are_validated() {
        let err = StorageConfig::from_properties([("nacre.extension.quantum", "16")]).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_serde_roundtrip_defaults_missing_fields() {
        let config: StorageConfig = serde_json::from_str(r#"{"no_flush": true}"#).unwrap();
        assert!(config.no_flush);
        assert_eq!(config.page_pool_size, default_page_pool_size());
        let json = serde_json::to_string(&config).unwrap();
        let back: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
