//! On-disk form of the endpoint registry.
//!
//! Files are written atomically (temp file + rename). A file that cannot be
//! parsed is moved aside to `<file>.corrupt-<unix-seconds>` and the caller
//! continues with an empty table; it is never overwritten in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::registry::{EndpointRecord, EndpointRegistry, RegistryError};

pub const REGISTRY_FILE_NAME: &str = "portal_registry.json";
pub const REGISTRY_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported file version {found} in {path}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("inconsistent registry in {path}: {source}")]
    Registry {
        path: PathBuf,
        #[source]
        source: RegistryError,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Serializes `value` as pretty JSON and swaps it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))?;
    Ok(())
}

/// Reads a JSON file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path)(err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Moves an unreadable file out of the way and returns its new location.
pub fn quarantine(path: &Path) -> Result<PathBuf, PersistError> {
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".corrupt-{}", unix_now()));
    let target = PathBuf::from(target);
    fs::rename(path, &target).map_err(io_error(path))?;
    Ok(target)
}

/// Logs a load failure and quarantines the offending file.
pub fn recover_from_load_failure(path: &Path, err: &PersistError) {
    error!(path = %path.display(), error = %err, "failed to load; continuing with empty state");
    if !path.exists() {
        return;
    }
    match quarantine(path) {
        Ok(moved) => warn!(path = %path.display(), moved_to = %moved.display(), "quarantined unreadable file"),
        Err(qerr) => error!(path = %path.display(), error = %qerr, "failed to quarantine unreadable file"),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    saved_at: i64,
    endpoints: Vec<EndpointRecord>,
}

/// Load/save point for one world's registry.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn in_dir(world_dir: &Path) -> Self {
        Self {
            path: world_dir.join(REGISTRY_FILE_NAME),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_load(&self) -> Result<Option<EndpointRegistry>, PersistError> {
        let Some(file) = read_json::<RegistryFile>(&self.path)? else {
            return Ok(None);
        };
        if file.version != REGISTRY_FILE_VERSION {
            return Err(PersistError::UnsupportedVersion {
                path: self.path.clone(),
                found: file.version,
            });
        }
        EndpointRegistry::from_records(file.endpoints)
            .map(Some)
            .map_err(|source| PersistError::Registry {
                path: self.path.clone(),
                source,
            })
    }

    /// Loads the registry, falling back to an empty table on any failure.
    pub fn load(&self) -> EndpointRegistry {
        match self.try_load() {
            Ok(Some(registry)) => {
                info!(path = %self.path.display(), endpoints = registry.len(), "loaded endpoint registry");
                registry
            }
            Ok(None) => EndpointRegistry::new(),
            Err(err) => {
                recover_from_load_failure(&self.path, &err);
                EndpointRegistry::new()
            }
        }
    }

    pub fn save(&self, registry: &mut EndpointRegistry) -> Result<(), PersistError> {
        let file = RegistryFile {
            version: REGISTRY_FILE_VERSION,
            saved_at: unix_now(),
            endpoints: registry.iter().cloned().collect(),
        };
        write_json_atomic(&self.path, &file)?;
        registry.mark_clean();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BlockPos, ResourceId};
    use crate::registry::NewEndpoint;
    use uuid::Uuid;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("portal-persist-{}", Uuid::new_v4()));
            fs::create_dir_all(&dir).expect("create temp dir");
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test_timeout::timeout]
    fn registry_survives_save_and_reload() {
        let dir = TempDir::new();
        let store = RegistryStore::in_dir(&dir.0);
        let mut registry = EndpointRegistry::new();
        registry
            .register(NewEndpoint::new(ResourceId::overworld(), BlockPos::new(10, 64, 10), 50).named("home"))
            .unwrap();
        registry
            .register(NewEndpoint::new(ResourceId::nether(), BlockPos::new(5, 32, 5), 0))
            .unwrap();
        store.save(&mut registry).expect("save");
        assert!(!registry.is_dirty());

        let reloaded = store.try_load().expect("load").expect("present");
        let before: Vec<_> = registry.iter().cloned().collect();
        let after: Vec<_> = reloaded.iter().cloned().collect();
        assert_eq!(before, after);
    }

    #[test_timeout::timeout]
    fn missing_file_loads_empty() {
        let dir = TempDir::new();
        let store = RegistryStore::in_dir(&dir.0);
        assert!(store.try_load().expect("load").is_none());
        assert!(store.load().is_empty());
    }

    #[test_timeout::timeout]
    fn corrupt_file_is_quarantined() {
        let dir = TempDir::new();
        let store = RegistryStore::in_dir(&dir.0);
        fs::write(store.path(), b"{ not json").unwrap();

        let registry = store.load();
        assert!(registry.is_empty());
        assert!(!store.path().exists());

        let quarantined: Vec<_> = fs::read_dir(&dir.0)
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("portal_registry.json.corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test_timeout::timeout]
    fn atomic_write_creates_missing_directories() {
        let dir = TempDir::new();
        let path = dir.0.join("nested").join("deeper").join("state.json");
        write_json_atomic(&path, &vec![1, 2, 3]).expect("write");
        let back: Option<Vec<i32>> = read_json(&path).expect("read");
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test_timeout::timeout]
    fn unserializable_value_is_not_reported_as_corrupt() {
        let dir = TempDir::new();
        let path = dir.0.join("state.json");
        let mut keyed = std::collections::HashMap::new();
        keyed.insert((1, 2), 3);
        let err = write_json_atomic(&path, &keyed).unwrap_err();
        assert!(matches!(err, PersistError::Serialize { .. }), "{err:?}");
        assert!(err.to_string().starts_with("failed to serialize"));
        assert!(!path.exists());
    }

    #[test_timeout::timeout]
    fn unknown_version_is_rejected() {
        let dir = TempDir::new();
        let store = RegistryStore::in_dir(&dir.0);
        fs::write(
            store.path(),
            br#"{"version": 99, "saved_at": 0, "endpoints": []}"#,
        )
        .unwrap();
        assert!(matches!(
            store.try_load(),
            Err(PersistError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
