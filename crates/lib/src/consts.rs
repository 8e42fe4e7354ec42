//! Crate-wide constants.

/// Default cache directory name, created next to the pipeline file.
pub const DEFAULT_CACHE_DIR: &str = ".arbor";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "ARBOR_CACHE_DIR";

/// Default pipeline file name.
pub const DEFAULT_PIPELINE_FILE: &str = "arbor.toml";

/// Number of hex characters shown when a fingerprint is abbreviated.
pub const SHORT_FINGERPRINT_LEN: usize = 12;
