//! # rtplayer Diagnostics
//!
//! Statistics sampling, process-wide file logging and version reporting
//! for rtplayer.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod debug_logger;
pub mod stats;
pub mod version;

// Re-export main types
pub use debug_logger::{
    default_log_dir, disable_file_logging, enable_file_logging, enable_file_logging_in, file_layer,
    log_file_path, LogFileWriter,
};
pub use stats::{StatisticsCollector, StatisticsInterval, StatisticsSnapshot};
pub use version::{version_info, VersionInfo, VERSION};
