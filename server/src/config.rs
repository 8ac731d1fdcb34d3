//! Hub tuning and data directory resolution.

use log::info;
use std::path::{Path, PathBuf};

/// Where the data directory is mounted when the server runs in a container.
pub const DOCKER_MOUNTED_DATA_DIR: &str = "/gameserver/data";

pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Packets a client may have queued before new ones are dropped for it.
    pub outbox_capacity: usize,
}

impl HubConfig {
    /// A capacity of zero is raised to one.
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            outbox_capacity: outbox_capacity.max(1),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

/// Returns the first candidate that exists on disk, logging every miss.
pub fn coalesce_paths<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    for (i, candidate) in candidates.iter().enumerate() {
        let path = candidate.as_ref();
        if path.exists() {
            info!("File/folder found at {}", path.display());
            return Some(path.to_path_buf());
        }

        match candidates.get(i + 1) {
            Some(next) => info!(
                "File/folder not found at {} - going to try {}",
                path.display(),
                next.as_ref().display()
            ),
            None => info!(
                "File/folder not found at {} - no more fallbacks to try",
                path.display()
            ),
        }
    }
    None
}

/// Picks the data directory: the configured path, then the container mount,
/// then the working directory.
pub fn resolve_data_dir(configured: Option<&Path>) -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(configured) = configured.filter(|path| !path.as_os_str().is_empty()) {
        candidates.push(configured.to_path_buf());
    }
    candidates.push(PathBuf::from(DOCKER_MOUNTED_DATA_DIR));
    candidates.push(PathBuf::from("."));

    coalesce_paths(&candidates).unwrap_or_else(|| PathBuf::from("."))
}
