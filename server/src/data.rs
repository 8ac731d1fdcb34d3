//! Server-side game data loaded once when the hub starts.

use crate::error::DataError;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// JSON documents from the data directory, keyed by file stem.
#[derive(Debug, Default, Clone)]
pub struct GameData {
    documents: HashMap<String, Value>,
}

impl GameData {
    /// Reads every `*.json` file directly inside `dir`.
    ///
    /// Other files and subdirectories are ignored. The first unreadable or
    /// malformed document aborts the load.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, DataError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| DataError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut documents: HashMap<String, Value> = HashMap::new();
        for entry in entries {
            let path = entry
                .map_err(|source| DataError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();

            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let name = name.to_string();

            let contents = fs::read_to_string(&path).map_err(|source| DataError::Io {
                path: path.clone(),
                source,
            })?;
            let document: Value = serde_json::from_str(&contents).map_err(|source| DataError::Parse {
                path: path.clone(),
                source,
            })?;

            debug!("Loaded game data '{}' from {}", name, path.display());
            documents.insert(name, document);
        }

        Ok(Self { documents })
    }

    /// Document loaded from `<name>.json`, if there was one.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.documents.get(name)
    }

    /// Document names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.documents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of loaded documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
