//! Populating the cache from static files.
//!
//! A key such as `/index.html` maps to `<home_dir>/webapps/index.html`. The
//! file is read without holding the manager lock; the item's ext bytes carry
//! the MIME type derived from the file suffix.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::manager::{CacheManager, ItemRef};

/// Suffix to MIME type table.
#[derive(Debug, Clone)]
pub struct MimeTypes {
    types: HashMap<String, String>,
}

const DEFAULT_MIME_TYPES: &[(&str, &str)] = &[
    ("css", "text/css"),
    ("gif", "image/gif"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("ico", "image/x-icon"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("txt", "text/plain"),
    ("xml", "text/xml"),
];

impl Default for MimeTypes {
    fn default() -> Self {
        Self {
            types: DEFAULT_MIME_TYPES
                .iter()
                .map(|&(suffix, mime)| (suffix.to_string(), mime.to_string()))
                .collect(),
        }
    }
}

impl MimeTypes {
    /// Defaults overlaid with `overrides` (suffixes without the dot).
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut types = Self::default();
        for (suffix, mime) in overrides {
            types
                .types
                .insert(suffix.trim_start_matches('.').to_ascii_lowercase(), mime.clone());
        }
        types
    }

    /// MIME type for a path's suffix, case-insensitive.
    pub fn lookup(&self, path: &str) -> Option<&str> {
        let (_, suffix) = path.rsplit_once('.')?;
        if suffix.contains('/') {
            return None;
        }
        self.types
            .get(&suffix.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Loads keys from files under `<home_dir>/webapps`.
#[derive(Debug, Clone)]
pub struct FileLoader {
    root: PathBuf,
    mime_types: MimeTypes,
}

impl FileLoader {
    /// Create a loader rooted at `<home_dir>/webapps`.
    pub fn new(home_dir: impl AsRef<Path>, mime_types: MimeTypes) -> Self {
        Self {
            root: home_dir.as_ref().join("webapps"),
            mime_types,
        }
    }

    /// Create a loader from the `[cache]` configuration section.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.home_dir, MimeTypes::with_overrides(&config.mime_types))
    }

    /// Directory files are served from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a file path. Keys that are not UTF-8 or that would
    /// escape the root resolve to nothing.
    pub fn resolve(&self, key: &[u8]) -> Option<PathBuf> {
        let key = std::str::from_utf8(key).ok()?;
        let relative = Path::new(key.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    /// Load `key` from disk into `manager`, unless another caller stored the
    /// key first, in which case that item is returned instead.
    ///
    /// A missing or unreadable file is `NotFound`. When allocation fails the
    /// error is `TooLarge` if no class can hold the file, otherwise
    /// `OutOfMemory`.
    pub fn load<'a>(
        &self,
        manager: &'a CacheManager,
        group_id: u32,
        key: &[u8],
        watch_id: u32,
        expiration: u32,
    ) -> CacheResult<ItemRef<'a>> {
        let path = self.resolve(key).ok_or(CacheError::NotFound)?;
        debug!(path = %path.display(), "load from file");

        let mut file = File::open(&path).map_err(|_| CacheError::NotFound)?;
        let file_size = file
            .metadata()
            .map_err(|_| CacheError::NotFound)?
            .len() as usize;
        let mime = std::str::from_utf8(key)
            .ok()
            .and_then(|key| self.mime_types.lookup(key))
            .unwrap_or("");

        let mut item = manager
            .alloc_item(group_id, key, 0, expiration, file_size, mime.len())
            .map_err(|err| match err {
                CacheError::KeyTooLong => err,
                _ if manager.item_size_ok(key.len(), file_size, mime.len()) => {
                    CacheError::OutOfMemory
                }
                _ => CacheError::TooLarge,
            })?;

        file.read_exact(item.data_mut())
            .map_err(|_| CacheError::NotFound)?;
        item.ext_mut().copy_from_slice(mime.as_bytes());
        debug!(path = %path.display(), size = file_size, "loaded file");

        manager.install(item, watch_id)
    }
}
