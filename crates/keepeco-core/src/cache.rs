//! Encrypted on-disk cache of candidate lists.
//!
//! One record per database path, sealed under a key derived from the path,
//! the secret and the file's modification time. A record that does not
//! authenticate is indistinguishable from a missing one: both mean the
//! candidates have to be recomputed from a full decode.

use crate::crypto::{self, derive_cache_key, unix_nanos};
use crate::paths::{cache_file_name, user_cache_dir};
use crate::secret::Secret;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache is not available")]
    Unavailable,
    #[error("prepare cache directory {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read cache record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write cache record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("seal cache record: {0}")]
    Crypto(#[from] crypto::CryptoError),
}

impl CacheError {
    /// Failures that only cost the next run its fast path.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CacheError::Unavailable | CacheError::Write { .. } | CacheError::Crypto(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_current_user() -> Self {
        Self::new(user_cache_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, db_path: &str) -> PathBuf {
        self.dir.join(cache_file_name(db_path))
    }

    pub fn load(
        &self,
        db_path: &str,
        secret: &Secret,
        modified: SystemTime,
    ) -> Result<Vec<String>, CacheError> {
        if !self.private_dir_exists()? {
            return Err(CacheError::Unavailable);
        }

        let path = self.record_path(db_path);
        let sealed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::Unavailable),
            Err(source) => return Err(CacheError::Read { path, source }),
        };

        let key = derive_cache_key(db_path, secret.expose(), unix_nanos(modified));
        let plaintext = match crypto::open(&key, &sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(record = %path.display(), error = %e, "cache record rejected");
                return Err(CacheError::Unavailable);
            }
        };
        let text = String::from_utf8(plaintext).map_err(|_| CacheError::Unavailable)?;
        Ok(split_candidates(&text))
    }

    /// Replace the record for `db_path`.
    ///
    /// The sealed bytes go to a temporary file beside the record and are
    /// renamed over it, so a previous record is either intact or replaced.
    pub fn save(
        &self,
        db_path: &str,
        secret: &Secret,
        modified: SystemTime,
        candidates: &[String],
    ) -> Result<(), CacheError> {
        self.ensure_dir()?;

        let key = derive_cache_key(db_path, secret.expose(), unix_nanos(modified));
        let sealed = crypto::seal(&key, candidates.join("\n").as_bytes())?;

        let path = self.record_path(db_path);
        let write_err = |source: io::Error| CacheError::Write {
            path: path.clone(),
            source,
        };
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        restrict_file(staged.path()).map_err(write_err)?;
        staged.write_all(&sealed).map_err(write_err)?;
        staged.as_file().sync_all().map_err(write_err)?;
        staged.persist(&path).map_err(|e| write_err(e.error))?;
        debug!(record = %path.display(), count = candidates.len(), "cache record written");
        Ok(())
    }

    fn ensure_dir(&self) -> Result<(), CacheError> {
        if self.private_dir_exists()? {
            return Ok(());
        }
        create_private_dir(&self.dir).map_err(|source| CacheError::Setup {
            path: self.dir.clone(),
            source,
        })
    }

    /// `Ok(false)` when the directory is missing. An existing one must be a
    /// real directory owned by the current user; group or world access is
    /// stripped.
    fn private_dir_exists(&self) -> Result<bool, CacheError> {
        let setup = |source: io::Error| CacheError::Setup {
            path: self.dir.clone(),
            source,
        };
        match fs::symlink_metadata(&self.dir) {
            Ok(meta) => {
                secure_existing_dir(&self.dir, &meta).map_err(setup)?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(setup(source)),
        }
    }
}

fn split_candidates(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n').map(str::to_string).collect()
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir(dir)
}

#[cfg(unix)]
fn secure_existing_dir(dir: &Path, meta: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    if !meta.is_dir() {
        return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
    }
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    if meta.uid() != uid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "owned by another user",
        ));
    }
    if meta.mode() & 0o077 != 0 {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn secure_existing_dir(_dir: &Path, meta: &fs::Metadata) -> io::Result<()> {
    if meta.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, "not a directory"))
    }
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::tempdir;

    const DB: &str = "/home/u/db.kdbx";

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn save_then_load_returns_candidates() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        let secret = Secret::new("secret123");
        let candidates = list(&["/A/Login", "/B/Site"]);

        store.save(DB, &secret, t(1), &candidates).unwrap();
        assert_eq!(store.load(DB, &secret, t(1)).unwrap(), candidates);
    }

    #[test]
    fn touched_file_invalidates_record() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        let secret = Secret::new("secret123");
        store
            .save(DB, &secret, t(1), &list(&["/A/Login", "/B/Site"]))
            .unwrap();

        assert!(matches!(
            store.load(DB, &secret, t(2)),
            Err(CacheError::Unavailable)
        ));
    }

    #[test]
    fn wrong_secret_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        store
            .save(DB, &Secret::new("right"), t(1), &list(&["/A/Login"]))
            .unwrap();
        assert!(matches!(
            store.load(DB, &Secret::new("wrong"), t(1)),
            Err(CacheError::Unavailable)
        ));
    }

    #[test]
    fn missing_directory_and_record_are_unavailable() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("absent"));
        let secret = Secret::new("pw");
        assert!(matches!(store.load(DB, &secret, t(1)), Err(CacheError::Unavailable)));

        fs::create_dir(store.dir()).unwrap();
        assert!(matches!(store.load(DB, &secret, t(1)), Err(CacheError::Unavailable)));
    }

    #[test]
    fn corrupted_record_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        let secret = Secret::new("pw");
        store.save(DB, &secret, t(1), &list(&["/A/Login"])).unwrap();

        let path = store.record_path(DB);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(store.load(DB, &secret, t(1)), Err(CacheError::Unavailable)));

        fs::write(&path, b"short").unwrap();
        assert!(matches!(store.load(DB, &secret, t(1)), Err(CacheError::Unavailable)));
    }

    #[test]
    fn empty_list_round_trips_as_empty() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        let secret = Secret::new("pw");
        store.save(DB, &secret, t(1), &[]).unwrap();
        assert!(store.load(DB, &secret, t(1)).unwrap().is_empty());
    }

    #[test]
    fn save_overwrites_previous_record() {
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        let secret = Secret::new("pw");
        store.save(DB, &secret, t(1), &list(&["/old"])).unwrap();
        store.save(DB, &secret, t(2), &list(&["/new", "/newer"])).unwrap();

        assert!(matches!(store.load(DB, &secret, t(1)), Err(CacheError::Unavailable)));
        assert_eq!(store.load(DB, &secret, t(2)).unwrap(), list(&["/new", "/newer"]));
        let leftovers = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[cfg(unix)]
    #[test]
    fn directory_and_record_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("keepeco.test"));
        store
            .save(DB, &Secret::new("pw"), t(1), &list(&["/A/Login"]))
            .unwrap();

        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(store.record_path(DB))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn setup_failure_is_not_recoverable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let store = CacheStore::new(blocker.join("nested"));
        let err = store
            .save(DB, &Secret::new("pw"), t(1), &list(&["/A"]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Setup { .. }));
        assert!(!err.is_recoverable());
    }

    #[cfg(unix)]
    #[test]
    fn loose_existing_directory_is_tightened() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let cache_dir = dir.path().join("keepeco.test");
        fs::create_dir(&cache_dir).unwrap();
        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(0o777)).unwrap();

        let store = CacheStore::new(&cache_dir);
        store
            .save(DB, &Secret::new("pw"), t(1), &list(&["/A/Login"]))
            .unwrap();

        let mode = fs::metadata(&cache_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        assert_eq!(
            store.load(DB, &Secret::new("pw"), t(1)).unwrap(),
            list(&["/A/Login"])
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_is_refused() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("elsewhere");
        fs::create_dir(&target).unwrap();
        let link = dir.path().join("keepeco.test");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let store = CacheStore::new(&link);
        let err = store
            .save(DB, &Secret::new("pw"), t(1), &list(&["/A"]))
            .unwrap_err();
        assert!(matches!(err, CacheError::Setup { .. }));
        assert!(matches!(
            store.load(DB, &Secret::new("pw"), t(1)),
            Err(CacheError::Setup { .. })
        ));
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }
}
