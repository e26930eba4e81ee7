//! Key store: filesystem abstraction, filename encoding and primary/backup
//! redundancy.
//!
//! Files for an identity live under
//! `root/<user id>/<process name>/<storage type>/<alias>`, with every
//! component passed through [`encode_file_name`]. The user id segment is
//! omitted for the system user `"0"`. Backups mirror the same layout under a
//! separate `backup_root` with a `.bak` suffix.

use crate::{Error, ProcessIdentity, Result, MAX_KEY_ALIAS_LEN};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Suffix of backup copies
pub const BACKUP_SUFFIX: &str = ".bak";

const ESCAPE_BASE: u8 = b'+';
const LITERAL_MIN: u8 = b'0';
const LITERAL_MAX: u8 = b'~';
const RESERVED: [(char, char); 6] = [
    (':', '#'),
    ('<', '$'),
    ('>', '%'),
    ('?', '&'),
    ('\\', '('),
    ('|', ')'),
];

/// Kind of object stored for an identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    /// Key blobs
    Key,
    /// Certificate chains
    CertChain,
    /// Root key material
    RootKey,
}

impl StorageType {
    /// Directory name for this type
    pub const fn dir_name(&self) -> &'static str {
        match self {
            StorageType::Key => "key",
            StorageType::CertChain => "certchain",
            StorageType::RootKey => "root_key",
        }
    }
}

/// Configuration for file-based storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the primary tree
    pub root: PathBuf,
    /// Root of the backup tree
    pub backup_root: PathBuf,
    /// Mirror every write to the backup tree
    pub backup_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("keystore/maindata"),
            backup_root: PathBuf::from("keystore/bakdata"),
            backup_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Storage rooted at `base`, with `maindata` and `bakdata` subtrees
    pub fn under<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            root: base.join("maindata"),
            backup_root: base.join("bakdata"),
            backup_enabled: true,
        }
    }

    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::ConfigurationError {
                message: "storage root is empty".into(),
            });
        }
        if self.backup_enabled && self.backup_root == self.root {
            return Err(Error::ConfigurationError {
                message: "backup_root must differ from root".into(),
            });
        }
        Ok(())
    }
}

/// Byte-level file access on a directory tree.
///
/// `write` creates missing parent directories. `read` and `remove` report a
/// missing file as [`Error::NotExist`]. `list` on a missing directory is empty.
pub trait FileSystem: Send + Sync {
    /// Whole-file read
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    /// Whole-file write, replacing any previous content
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;
    /// Delete a file
    fn remove(&self, path: &Path) -> Result<()>;
    /// Whether a file exists
    fn exists(&self, path: &Path) -> Result<bool>;
    /// File size in bytes
    fn size(&self, path: &Path) -> Result<u64>;
    /// Names of the files directly inside `dir`
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
}

fn map_io(operation: &str, path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::not_exist(path.display().to_string())
    } else {
        Error::io(operation, e)
    }
}

/// [`FileSystem`] over `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| map_io("read", path, e))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| map_io("create_dir", parent, e))?;
            }
        }
        fs::write(path, data).map_err(|e| map_io("write", path, e))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| map_io("remove", path, e))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        path.try_exists().map_err(|e| map_io("exists", path, e))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| map_io("metadata", path, e))
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io("read_dir", dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| map_io("read_dir", dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| map_io("file_type", dir, e))?
                .is_file();
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_owned());
            }
        }
        Ok(names)
    }
}

/// In-memory [`FileSystem`] (for testing/development)
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryFileSystem {
    /// Empty filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files
    pub fn file_count(&self) -> usize {
        self.files.read().map(|f| f.len()).unwrap_or(0)
    }
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let files = self
            .files
            .read()
            .map_err(|_| Error::storage("read", "lock poisoned"))?;
        files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_exist(path.display().to_string()))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut files = self
            .files
            .write()
            .map_err(|_| Error::storage("write", "lock poisoned"))?;
        files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut files = self
            .files
            .write()
            .map_err(|_| Error::storage("remove", "lock poisoned"))?;
        files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::not_exist(path.display().to_string()))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let files = self
            .files
            .read()
            .map_err(|_| Error::storage("exists", "lock poisoned"))?;
        Ok(files.contains_key(path))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        self.read(path).map(|data| data.len() as u64)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let files = self
            .files
            .read()
            .map_err(|_| Error::storage("list", "lock poisoned"))?;
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_owned))
            .collect())
    }
}

/// Encode arbitrary bytes as a filesystem-safe file name.
///
/// Bytes outside `'0'..='~'` become two characters, `'+' + (b >> 6)` and
/// `'0' + (b & 0x3f)`. Afterwards the characters `: < > ? \ |` are replaced
/// by `# $ % & ( )`. The mapping is injective and reversed by
/// [`decode_file_name`].
///
/// ```
/// use rust_keyblob::storage::{decode_file_name, encode_file_name};
///
/// let name = encode_file_name(b"a/b:c");
/// assert_eq!(name, "a+_b#c");
/// assert_eq!(decode_file_name(&name).unwrap(), b"a/b:c");
/// ```
pub fn encode_file_name(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        if (LITERAL_MIN..=LITERAL_MAX).contains(&b) {
            out.push(b as char);
        } else {
            out.push((ESCAPE_BASE + (b >> 6)) as char);
            out.push((LITERAL_MIN + (b & 0x3f)) as char);
        }
    }
    out.chars()
        .map(|c| {
            RESERVED
                .iter()
                .find(|(from, _)| *from == c)
                .map_or(c, |(_, to)| *to)
        })
        .collect()
}

/// Reverse [`encode_file_name`].
///
/// # Errors
///
/// [`Error::InvalidKeyFile`] for any name `encode_file_name` cannot produce.
pub fn decode_file_name(name: &str) -> Result<Vec<u8>> {
    let restored: Vec<u8> = name
        .chars()
        .map(|c| {
            RESERVED
                .iter()
                .find(|(_, to)| *to == c)
                .map_or(c, |(from, _)| *from)
        })
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(0))
        .collect();

    let mut out = Vec::with_capacity(restored.len());
    let mut iter = restored.iter().copied();
    while let Some(c) = iter.next() {
        if (LITERAL_MIN..=LITERAL_MAX).contains(&c) {
            out.push(c);
        } else if (ESCAPE_BASE..ESCAPE_BASE + 4).contains(&c) {
            let low = iter
                .next()
                .filter(|l| (LITERAL_MIN..LITERAL_MIN + 64).contains(l))
                .ok_or_else(|| Error::invalid_key_file(format!("dangling escape in {name:?}")))?;
            let b = ((c - ESCAPE_BASE) << 6) | (low - LITERAL_MIN);
            if (LITERAL_MIN..=LITERAL_MAX).contains(&b) {
                return Err(Error::invalid_key_file(format!(
                    "non-canonical escape in {name:?}"
                )));
            }
            out.push(b);
        } else {
            return Err(Error::invalid_key_file(format!(
                "unexpected character in {name:?}"
            )));
        }
    }
    Ok(out)
}

/// Resolved location of one stored object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyPath {
    /// Canonical copy
    pub primary: PathBuf,
    /// Mirror copy, when backups are enabled
    pub backup: Option<PathBuf>,
}

/// Primary/backup file pair with per-path reader/writer locking.
///
/// Reads heal a missing or empty primary from the backup. The backup is never
/// rewritten from the primary on read. A path's lock lives in the map only
/// while some operation holds it.
pub struct RedundantStore {
    fs: Arc<dyn FileSystem>,
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

/// Shared handle on one path's lock, released from the map on drop
struct PathLock<'a> {
    locks: &'a Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
    key: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl PathLock<'_> {
    fn read(&self, operation: &str) -> Result<RwLockReadGuard<'_, ()>> {
        self.lock
            .read()
            .map_err(|_| Error::storage(operation, "lock poisoned"))
    }

    fn write(&self, operation: &str) -> Result<RwLockWriteGuard<'_, ()>> {
        self.lock
            .write()
            .map_err(|_| Error::storage(operation, "lock poisoned"))
    }
}

impl Drop for PathLock<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // Handles are only cloned under the map mutex, so two owners means
        // the map and this handle
        let last = locks
            .get(&self.key)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2);
        if last {
            locks.remove(&self.key);
        }
    }
}

impl RedundantStore {
    /// Store over `fs`
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, path: &KeyPath) -> Result<PathLock<'_>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::storage("lock_for", "lock poisoned"))?;
        let lock = locks.entry(path.primary.clone()).or_default().clone();
        Ok(PathLock {
            locks: &self.locks,
            key: path.primary.clone(),
            lock,
        })
    }

    /// Number of paths currently holding a lock entry
    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    fn has_content(&self, path: &Path) -> Result<bool> {
        Ok(self.fs.exists(path)? && self.fs.size(path)? > 0)
    }

    fn write_both(&self, path: &KeyPath, data: &[u8]) -> Result<()> {
        self.fs.write(&path.primary, data)?;
        if let Some(backup) = &path.backup {
            self.fs.write(backup, data)?;
        }
        Ok(())
    }

    fn exists_unlocked(&self, path: &KeyPath) -> Result<bool> {
        if self.fs.exists(&path.primary)? {
            return Ok(true);
        }
        match &path.backup {
            Some(backup) => self.fs.exists(backup),
            None => Ok(false),
        }
    }

    /// Write the primary copy, then the backup copy
    pub fn write(&self, path: &KeyPath, data: &[u8]) -> Result<()> {
        let lock = self.lock_for(path)?;
        let _guard = lock.write("write")?;
        self.write_both(path, data)
    }

    /// Write both copies unless either already exists.
    ///
    /// The check and the write happen under one write lock, so of several
    /// racing callers exactly one succeeds.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the primary or backup copy is present.
    pub fn write_new(&self, path: &KeyPath, data: &[u8]) -> Result<()> {
        let lock = self.lock_for(path)?;
        let _guard = lock.write("write_new")?;
        if self.exists_unlocked(path)? {
            return Err(Error::AlreadyExists {
                what: path.primary.display().to_string(),
            });
        }
        self.write_both(path, data)
    }

    /// Read the primary copy, healing it from the backup when it is missing
    /// or empty
    pub fn read(&self, path: &KeyPath) -> Result<Vec<u8>> {
        let lock = self.lock_for(path)?;
        {
            let _guard = lock.read("read")?;
            if self.has_content(&path.primary)? {
                return self.fs.read(&path.primary);
            }
        }

        let backup = match &path.backup {
            Some(backup) => backup,
            None => return Err(Error::not_exist(path.primary.display().to_string())),
        };
        let _guard = lock.write("read")?;
        if self.has_content(&path.primary)? {
            return self.fs.read(&path.primary);
        }
        if !self.has_content(backup)? {
            return Err(Error::not_exist(path.primary.display().to_string()));
        }
        let data = self.fs.read(backup)?;
        match self.fs.write(&path.primary, &data) {
            Ok(()) => tracing::warn!(path = %path.primary.display(), "primary copy restored from backup"),
            Err(e) => tracing::error!(path = %path.primary.display(), error = %e, "failed to restore primary copy"),
        }
        Ok(data)
    }

    /// Read only the backup copy
    pub fn read_backup(&self, path: &KeyPath) -> Result<Option<Vec<u8>>> {
        let backup = match &path.backup {
            Some(backup) => backup,
            None => return Ok(None),
        };
        let lock = self.lock_for(path)?;
        let _guard = lock.read("read_backup")?;
        if !self.has_content(backup)? {
            return Ok(None);
        }
        self.fs.read(backup).map(Some)
    }

    /// Overwrite the primary copy only
    pub fn repair_primary(&self, path: &KeyPath, data: &[u8]) -> Result<()> {
        let lock = self.lock_for(path)?;
        let _guard = lock.write("repair_primary")?;
        self.fs.write(&path.primary, data)?;
        tracing::warn!(path = %path.primary.display(), "primary copy repaired");
        Ok(())
    }

    /// Delete both copies. Fails only when neither exists.
    pub fn delete(&self, path: &KeyPath) -> Result<()> {
        let lock = self.lock_for(path)?;
        let _guard = lock.write("delete")?;
        let mut removed = false;
        if self.fs.exists(&path.primary)? {
            self.fs.remove(&path.primary)?;
            removed = true;
        }
        if let Some(backup) = &path.backup {
            if self.fs.exists(backup)? {
                self.fs.remove(backup)?;
                removed = true;
            }
        }
        if removed {
            Ok(())
        } else {
            Err(Error::not_exist(path.primary.display().to_string()))
        }
    }

    /// Whether either copy exists
    pub fn exists(&self, path: &KeyPath) -> Result<bool> {
        let lock = self.lock_for(path)?;
        let _guard = lock.read("exists")?;
        self.exists_unlocked(path)
    }
}

/// Identity-scoped key store
pub struct KeyStore {
    fs: Arc<dyn FileSystem>,
    config: StorageConfig,
    store: RedundantStore,
}

impl KeyStore {
    /// Store over `fs` using `config`
    pub fn new(fs: Arc<dyn FileSystem>, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: RedundantStore::new(fs.clone()),
            fs,
            config,
        })
    }

    /// Store settings
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn relative_dir(identity: &ProcessIdentity, storage_type: StorageType) -> PathBuf {
        let mut dir = PathBuf::new();
        if identity.user_id() != b"0" {
            dir.push(encode_file_name(identity.user_id()));
        }
        dir.push(encode_file_name(identity.process_name()));
        dir.push(storage_type.dir_name());
        dir
    }

    /// Resolve the primary and backup locations of `alias`
    pub fn path_for(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
    ) -> Result<KeyPath> {
        if alias.is_empty() || alias.len() > MAX_KEY_ALIAS_LEN {
            return Err(Error::invalid_argument(
                "path_for",
                format!("alias length {} out of range", alias.len()),
            ));
        }
        let dir = Self::relative_dir(identity, storage_type);
        let name = encode_file_name(alias);
        let backup = self.config.backup_enabled.then(|| {
            self.config
                .backup_root
                .join(&dir)
                .join(format!("{name}{BACKUP_SUFFIX}"))
        });
        Ok(KeyPath {
            primary: self.config.root.join(&dir).join(name),
            backup,
        })
    }

    /// Persist `data` for `alias`
    pub fn write(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
        data: &[u8],
    ) -> Result<()> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.write(&path, data)?;
        tracing::debug!(alias = %hex::encode(alias), kind = storage_type.dir_name(), "stored");
        Ok(())
    }

    /// Persist `data` for a new `alias`, failing with
    /// [`Error::AlreadyExists`] if either copy is already present
    pub fn write_new(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
        data: &[u8],
    ) -> Result<()> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.write_new(&path, data)?;
        tracing::debug!(alias = %hex::encode(alias), kind = storage_type.dir_name(), "created");
        Ok(())
    }

    /// Paths with a live lock entry
    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.store.lock_count()
    }

    /// Read `alias`, self-healing the primary copy from the backup
    pub fn read(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
    ) -> Result<Vec<u8>> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.read(&path)
    }

    /// Backup copy of `alias`, if any
    pub fn read_backup(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
    ) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.read_backup(&path)
    }

    /// Overwrite the primary copy of `alias`
    pub fn repair_primary(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
        data: &[u8],
    ) -> Result<()> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.repair_primary(&path, data)
    }

    /// Delete both copies of `alias`
    pub fn delete(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
    ) -> Result<()> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.delete(&path)?;
        tracing::debug!(alias = %hex::encode(alias), kind = storage_type.dir_name(), "deleted");
        Ok(())
    }

    /// Whether either copy of `alias` exists
    pub fn exists(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        storage_type: StorageType,
    ) -> Result<bool> {
        let path = self.path_for(identity, alias, storage_type)?;
        self.store.exists(&path)
    }

    /// Aliases stored for `identity`, primary and backup trees merged
    pub fn list(&self, identity: &ProcessIdentity, storage_type: StorageType) -> Result<Vec<Vec<u8>>> {
        let dir = Self::relative_dir(identity, storage_type);
        let mut aliases = BTreeSet::new();
        for name in self.fs.list(&self.config.root.join(&dir))? {
            match decode_file_name(&name) {
                Ok(alias) => {
                    aliases.insert(alias);
                }
                Err(e) => tracing::debug!(file = %name, error = %e, "skipping foreign file"),
            }
        }
        if self.config.backup_enabled {
            for name in self.fs.list(&self.config.backup_root.join(&dir))? {
                let decoded = name
                    .strip_suffix(BACKUP_SUFFIX)
                    .ok_or_else(|| Error::invalid_key_file("backup without suffix"))
                    .and_then(decode_file_name);
                match decoded {
                    Ok(alias) => {
                        aliases.insert(alias);
                    }
                    Err(e) => tracing::debug!(file = %name, error = %e, "skipping foreign file"),
                }
            }
        }
        Ok(aliases.into_iter().collect())
    }
}
