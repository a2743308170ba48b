//! Location directories: inline list and JSON file.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::{BatchError, LocationRef};
use crate::ports::LocationDirectory;

#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    locations: Vec<LocationRef>,
}

impl StaticDirectory {
    pub fn new(locations: Vec<LocationRef>) -> Self {
        Self { locations }
    }

    /// `code:name,code:name` (name optional).
    pub fn parse_inline(raw: &str) -> Result<Self, BatchError> {
        let mut locations = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (code, name) = item.split_once(':').unwrap_or((item, item));
            let code = code.trim();
            if code.is_empty() {
                return Err(BatchError::Directory(format!("empty location code in '{item}'")));
            }
            locations.push(LocationRef::new(code, name.trim()));
        }
        Ok(Self { locations })
    }
}

#[async_trait]
impl LocationDirectory for StaticDirectory {
    async fn locations(&self) -> Result<Vec<LocationRef>, BatchError> {
        Ok(self.locations.clone())
    }
}

/// `[{"code": "ginza", "name": "銀座"}, ...]` read on every call.
#[derive(Debug, Clone)]
pub struct JsonFileDirectory {
    path: PathBuf,
}

#[derive(Deserialize)]
struct LocationEntry {
    code: String,
    #[serde(default)]
    name: Option<String>,
}

impl JsonFileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LocationDirectory for JsonFileDirectory {
    async fn locations(&self) -> Result<Vec<LocationRef>, BatchError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| BatchError::Directory(format!("{}: {e}", self.path.display())))?;
        let entries: Vec<LocationEntry> = serde_json::from_str(&raw)
            .map_err(|e| BatchError::Directory(format!("{}: {e}", self.path.display())))?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let name = e.name.unwrap_or_else(|| e.code.clone());
                LocationRef::new(e.code, name)
            })
            .collect())
    }
}
