//! Version reporting

use serde::{Deserialize, Serialize};
use std::fmt;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library version and the codecs compiled into this build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Semantic version
    pub version: String,
    /// Decodable codec names, sorted
    pub codecs: Vec<String>,
}

impl VersionInfo {
    /// Describe this build given the codecs it can decode
    pub fn new<I, S>(codecs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut codecs: Vec<String> = codecs.into_iter().map(Into::into).collect();
        codecs.sort();
        codecs.dedup();
        Self {
            version: VERSION.to_string(),
            codecs,
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtplayer {} (codecs: {})", self.version, self.codecs.join(", "))
    }
}

/// Version string for a build that decodes `codecs`
pub fn version_info<I, S>(codecs: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    VersionInfo::new(codecs).to_string()
}
