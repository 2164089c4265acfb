//! Store lifecycle: locate, validate, (re)create and tear down the
//! SQLite file behind a cache.
//!
//! A disk store lives at `<dir>/<source file name>-hierarchies`. An
//! existing file is reused only when its schema major version matches
//! and its recorded source modification marker agrees with the live
//! source; otherwise (or when it cannot be opened at all) it is deleted
//! and recreated. When the stale file cannot be deleted, or the store
//! cannot be created, a temporary store with a `-<uuid>` suffix is used
//! for this session and removed on teardown.

use crate::config::{CacheConfig, StoreKind};
use crate::error::CacheError;
use crate::source::SourceConnection;
use crate::{functions, maintenance, schema};
use rusqlite::Connection;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const STORE_SUFFIX: &str = "-hierarchies";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    Disk { path: PathBuf, temporary: bool },
}

/// Owns the store's location and runs teardown when dropped.
///
/// Drop the connections opened through it first.
#[derive(Debug)]
pub struct StoreFactory {
    location: StoreLocation,
    config: CacheConfig,
    source_marker: Option<String>,
}

/// Where the disk store for `source` goes.
pub fn store_path(source: &dyn SourceConnection, config: &CacheConfig) -> PathBuf {
    let directory = config
        .directory
        .clone()
        .or_else(|| {
            source
                .file_path()
                .and_then(Path::parent)
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(std::env::temp_dir);
    let mut name: OsString = source
        .file_path()
        .and_then(Path::file_name)
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from(source.id()));
    name.push(STORE_SUFFIX);
    directory.join(name)
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_store_files(path: &Path) -> Result<(), CacheError> {
    for candidate in [path.to_path_buf(), sidecar(path, "-wal"), sidecar(path, "-shm")] {
        match fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::io(&candidate, err)),
        }
    }
    Ok(())
}

enum Compatibility<T = ()> {
    Compatible(T),
    Incompatible(&'static str),
}

fn check_compatibility(
    conn: &Connection,
    source_marker: Option<&str>,
) -> Result<Compatibility, CacheError> {
    if !schema::has_schema(conn)? {
        return Ok(Compatibility::Compatible(()));
    }
    if let Some((major, _)) = schema::read_version(conn)?
        && major != schema::SCHEMA_VERSION_MAJOR
    {
        return Ok(Compatibility::Incompatible("schema version changed"));
    }
    let stored = schema::read_property(conn, schema::PROPERTY_SOURCE_LAST_MODIFIED)?;
    if let (Some(stored), Some(live)) = (stored.as_deref(), source_marker)
        && stored != live
    {
        return Ok(Compatibility::Incompatible("source modified outside of cache"));
    }
    Ok(Compatibility::Compatible(()))
}

impl StoreFactory {
    /// Open (creating or recreating as needed) the store for `source` and
    /// return the factory together with the primary connection.
    pub fn open(
        source: &dyn SourceConnection,
        config: &CacheConfig,
    ) -> Result<(Self, Connection), CacheError> {
        let source_marker = source.last_modified_marker();
        match config.kind {
            StoreKind::Memory => {
                let factory = Self {
                    location: StoreLocation::Memory,
                    config: config.clone(),
                    source_marker,
                };
                let conn = Connection::open_in_memory()?;
                factory.prepare(&conn)?;
                tracing::debug!(connection = source.id(), "opened in-memory hierarchy cache");
                Ok((factory, conn))
            }
            StoreKind::Disk => {
                let path = store_path(source, config);
                Self::open_disk(path, config, source_marker)
            }
        }
    }

    fn open_disk(
        path: PathBuf,
        config: &CacheConfig,
        source_marker: Option<String>,
    ) -> Result<(Self, Connection), CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        let factory = Self {
            location: StoreLocation::Disk {
                path: path.clone(),
                temporary: false,
            },
            config: config.clone(),
            source_marker,
        };

        if path.exists() {
            let reason = match factory.open_existing(&path) {
                Ok(Compatibility::Compatible(conn)) => {
                    tracing::debug!(path = %path.display(), "reusing hierarchy cache");
                    return Ok((factory, conn));
                }
                Ok(Compatibility::Incompatible(reason)) => reason.to_string(),
                Err(err) => format!("unreadable store: {err}"),
            };
            tracing::info!(path = %path.display(), reason = %reason, "recreating hierarchy cache");
            if let Err(err) = remove_store_files(&path) {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "stale hierarchy cache is in use"
                );
                return factory.create_temporary(&path);
            }
        }

        match factory.create(&path) {
            Ok(conn) => Ok((factory, conn)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to create hierarchy cache");
                // Drop whatever the failed attempt left behind.
                if let Err(err) = remove_store_files(&path) {
                    tracing::debug!(path = %path.display(), error = %err, "could not clean failed store");
                }
                factory.create_temporary(&path)
            }
        }
    }

    /// Connect to an existing store and vet it. Any error means the file
    /// cannot be used as it is.
    fn open_existing(&self, path: &Path) -> Result<Compatibility<Connection>, CacheError> {
        let conn = self.connect(path)?;
        match check_compatibility(&conn, self.source_marker.as_deref())? {
            Compatibility::Compatible(()) => {
                self.prepare(&conn)?;
                Ok(Compatibility::Compatible(conn))
            }
            Compatibility::Incompatible(reason) => Ok(Compatibility::Incompatible(reason)),
        }
    }

    fn create(&self, path: &Path) -> Result<Connection, CacheError> {
        let conn = self.connect(path)?;
        self.prepare(&conn)?;
        tracing::info!(path = %path.display(), "created hierarchy cache");
        Ok(conn)
    }

    /// Fall back to a `-<uuid>` store next to `path` for this session.
    fn create_temporary(mut self, path: &Path) -> Result<(Self, Connection), CacheError> {
        let temp = sidecar(path, &format!("-{}", Uuid::new_v4()));
        tracing::warn!(fallback = %temp.display(), "using a temporary hierarchy cache");
        self.location = StoreLocation::Disk {
            path: temp.clone(),
            temporary: true,
        };
        let conn = self.create(&temp)?;
        Ok((self, conn))
    }

    fn connect(&self, path: &Path) -> Result<Connection, CacheError> {
        let conn = Connection::open(path)?;
        schema::configure_connection(&conn, false, self.config.memory_cache_limit)?;
        Ok(conn)
    }

    /// Register functions, create missing tables and stamp version data.
    fn prepare(&self, conn: &Connection) -> Result<(), CacheError> {
        if matches!(self.location, StoreLocation::Memory) {
            schema::configure_connection(conn, true, self.config.memory_cache_limit)?;
        }
        functions::register(conn)?;
        schema::create_tables(conn)?;
        if schema::read_version(conn)?.is_none() {
            schema::write_version(conn)?;
            if let Some(marker) = &self.source_marker {
                schema::write_property(conn, schema::PROPERTY_SOURCE_LAST_MODIFIED, marker)?;
            }
        }
        Ok(())
    }

    /// A further connection to the same disk store.
    pub fn open_connection(&self) -> Result<Connection, CacheError> {
        match &self.location {
            StoreLocation::Memory => Err(CacheError::Schema(
                "in-memory stores cannot be shared across connections".into(),
            )),
            StoreLocation::Disk { path, .. } => {
                let conn = self.connect(path)?;
                self.prepare(&conn)?;
                Ok(conn)
            }
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            StoreLocation::Memory => None,
            StoreLocation::Disk { path, .. } => Some(path),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(
            self.location,
            StoreLocation::Disk {
                temporary: true,
                ..
            }
        )
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Replace the marker written at teardown, after this process itself
    /// modified the source.
    pub fn set_source_marker(&mut self, marker: Option<String>) {
        self.source_marker = marker;
    }

    /// Record the source marker and enforce the size budget, but only if
    /// no other connection has the store open.
    fn teardown(&self, path: &Path) -> Result<(), CacheError> {
        let conn = self.connect(path)?;
        conn.busy_handler(None)?;
        if conn.execute_batch("BEGIN EXCLUSIVE").is_err() {
            tracing::debug!(path = %path.display(), "store still in use, skipping teardown");
            return Ok(());
        }
        if let Some(marker) = &self.source_marker {
            schema::write_property(&conn, schema::PROPERTY_SOURCE_LAST_MODIFIED, marker)?;
        }
        let evicted = maintenance::limit_cache_size(&conn, self.config.size_limit)?;
        conn.execute_batch("COMMIT")?;
        if evicted > 0 {
            conn.execute_batch("VACUUM")?;
        }
        Ok(())
    }
}

impl Drop for StoreFactory {
    fn drop(&mut self) {
        match &self.location {
            StoreLocation::Memory => {}
            StoreLocation::Disk {
                path,
                temporary: true,
            } => {
                if let Err(err) = remove_store_files(path) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove temporary store");
                }
            }
            StoreLocation::Disk {
                path,
                temporary: false,
            } => {
                if let Err(err) = self.teardown(path) {
                    tracing::warn!(path = %path.display(), error = %err, "hierarchy cache teardown failed");
                }
            }
        }
    }
}
