//! `/proc/sys` writer.

use crate::constants::paths;
use machined_shared::{MachinedError, MachinedResult, MultiError};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProperty {
    pub key: String,
    pub value: String,
}

impl SystemProperty {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Relative path of the property under the sysctl root.
    pub fn relative_path(&self) -> PathBuf {
        self.key.split('.').collect()
    }
}

/// Reads and writes kernel parameters under a sysctl root.
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new(paths::PROC_SYS)
    }
}

impl Sysctl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, property: &SystemProperty) -> MachinedResult<()> {
        let path = self.root.join(property.relative_path());
        debug!(key = %property.key, value = %property.value, "Writing sysctl");
        std::fs::write(&path, &property.value).map_err(|e| {
            MachinedError::Internal(format!("failed to set {}: {}", property.key, e))
        })
    }

    pub fn read(&self, key: &str) -> MachinedResult<String> {
        let property = SystemProperty::new(key, "");
        let value = std::fs::read_to_string(self.root.join(property.relative_path()))?;
        Ok(value.trim_end().to_string())
    }

    /// Write every property, reporting all failures together.
    pub fn write_all<'a>(
        &self,
        properties: impl IntoIterator<Item = &'a SystemProperty>,
    ) -> MachinedResult<()> {
        let errors: MultiError = properties
            .into_iter()
            .filter_map(|p| self.write(p).err())
            .collect();

        errors
            .into_result()
            .map_err(|errors| MachinedError::Internal(errors.to_string()))
    }
}
