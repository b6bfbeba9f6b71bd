//! Protocol revision negotiation.

use crate::config::ProtocolConfig;
use crate::{AppError, Result};

/// Supported revisions and the fallback for peers that declare none.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    supported: Vec<String>,
    default: String,
}

impl VersionPolicy {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            supported: config.supported_versions.clone(),
            default: config.default_version.clone(),
        }
    }

    /// Revision assumed when none is declared.
    #[must_use]
    pub fn default_version(&self) -> &str {
        &self.default
    }

    /// Revisions accepted from peers.
    #[must_use]
    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    /// Validate a declared revision, falling back to the default when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnsupportedVersion` for an unknown revision.
    pub fn resolve(&self, declared: Option<&str>) -> Result<String> {
        let Some(version) = declared.map(str::trim) else {
            return Ok(self.default.clone());
        };
        if self.supported.iter().any(|v| v == version) {
            Ok(version.to_owned())
        } else {
            Err(AppError::UnsupportedVersion(format!(
                "{version} (supported: {})",
                self.supported.join(", ")
            )))
        }
    }
}
