//! Root key hierarchy.
//!
//! The root key component file (KSF) holds two halves of the root key
//! material, the parameters of the root master key derivation, and the main
//! key encrypted under that root master key. Every per-blob key is derived
//! from the main key; the main key never encrypts key material directly.
//!
//! Two copies of the KSF are kept. A copy whose hash does not verify is never
//! patched in place; it is only overwritten from a copy that does verify.

use crate::crypto::{CryptoProvider, AES_GCM_NONCE_SIZE, AES_GCM_TAG_SIZE};
use crate::storage::FileSystem;
use crate::{Error, KeyAlg, KeyDigest, ProcessIdentity, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Magic bytes at the start of every KSF (not covered by the hash)
pub const KSF_FLAG: [u8; 8] = [0x5F, 0x64, 0x97, 0x8D, 0x19, 0x4F, 0x89, 0xCF];
/// Serialized KSF size
pub const KSF_DATA_LEN: usize = 258;
/// Current KSF format version
pub const KSF_VERSION: u16 = 1;
/// File names of the two KSF copies
pub const KSF_FILE_NAMES: [&str; 2] = ["info1.data", "info2.data"];
/// Size of each root key material half
pub const RK_MATERIAL_LEN: usize = 32;
/// Root master key salt size
pub const RMK_SALT_LEN: usize = 16;
/// Main key IV field size
pub const MK_IV_LEN: usize = 16;
/// Main key size
pub const MAIN_KEY_LEN: usize = 32;
/// Reserved field size
pub const KSF_RESERVED_LEN: usize = 24;
/// Minimum iteration count for both the root master key and blob keys
pub const MIN_KDF_ITERATIONS: u32 = 10_000;

const KSF_HASH_LEN: usize = 32;
const KSF_HASH_START: usize = KSF_FLAG.len();
const KSF_HASH_END: usize = KSF_DATA_LEN - KSF_HASH_LEN;
const RKC_TIME_LEN: usize = 7;

/// Calendar timestamp as stored in the KSF (`year u16le`, then one byte
/// each for month, day, hour, minute, second). All zero means unset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroize)]
pub struct RkcTime {
    /// Year
    pub year: u16,
    /// Month (1-12)
    pub month: u8,
    /// Day of month
    pub day: u8,
    /// Hour
    pub hour: u8,
    /// Minute
    pub min: u8,
    /// Second
    pub sec: u8,
}

impl RkcTime {
    /// Current UTC time
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    fn to_bytes(self) -> [u8; RKC_TIME_LEN] {
        let y = self.year.to_le_bytes();
        [y[0], y[1], self.month, self.day, self.hour, self.min, self.sec]
    }

    fn from_bytes(b: [u8; RKC_TIME_LEN]) -> Self {
        Self {
            year: u16::from_le_bytes([b[0], b[1]]),
            month: b[2],
            day: b[3],
            hour: b[4],
            min: b[5],
            sec: b[6],
        }
    }
}

impl From<DateTime<Utc>> for RkcTime {
    fn from(t: DateTime<Utc>) -> Self {
        Self {
            year: u16::try_from(t.year()).unwrap_or(0),
            month: t.month() as u8,
            day: t.day() as u8,
            hour: t.hour() as u8,
            min: t.minute() as u8,
            sec: t.second() as u8,
        }
    }
}

/// Decoded root key component file
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KsfData {
    /// Format version
    pub version: u16,
    /// Root key creation time
    pub rk_created: RkcTime,
    /// Root key expiry time
    pub rk_expired: RkcTime,
    /// First root key material half
    pub rk_material1: [u8; RK_MATERIAL_LEN],
    /// Second root key material half
    pub rk_material2: [u8; RK_MATERIAL_LEN],
    /// Root master key PBKDF2 iteration count
    pub rmk_iterations: u32,
    /// Root master key PBKDF2 salt
    pub rmk_salt: [u8; RMK_SALT_LEN],
    /// Root master key hash algorithm ([`KeyDigest`] value)
    pub rmk_hash_alg: u32,
    /// Reserved
    pub rk_reserved: [u8; KSF_RESERVED_LEN],
    /// Main key creation time
    pub mk_created: RkcTime,
    /// Main key expiry time
    pub mk_expired: RkcTime,
    /// Main key encryption algorithm ([`KeyAlg`] value)
    pub mk_enc_alg: u32,
    /// Main key IV; the first 12 bytes are the GCM nonce
    pub mk_iv: [u8; MK_IV_LEN],
    /// Encrypted main key
    pub mk_ciphertext: [u8; MAIN_KEY_LEN],
    /// Reserved; the first 16 bytes carry the main key GCM tag
    pub mk_reserved: [u8; KSF_RESERVED_LEN],
}

impl std::fmt::Debug for KsfData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KsfData")
            .field("version", &self.version)
            .field("rk_created", &self.rk_created)
            .field("rmk_iterations", &self.rmk_iterations)
            .field("mk_created", &self.mk_created)
            .field("mk_enc_alg", &self.mk_enc_alg)
            .finish_non_exhaustive()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.array())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.array())
    }

    fn time(&mut self) -> RkcTime {
        RkcTime::from_bytes(self.array())
    }
}

impl KsfData {
    /// Serialize, stamping a fresh hash over `version..=mk_reserved`
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(KSF_DATA_LEN));
        out.extend_from_slice(&KSF_FLAG);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.rk_created.to_bytes());
        out.extend_from_slice(&self.rk_expired.to_bytes());
        out.extend_from_slice(&self.rk_material1);
        out.extend_from_slice(&self.rk_material2);
        out.extend_from_slice(&self.rmk_iterations.to_le_bytes());
        out.extend_from_slice(&self.rmk_salt);
        out.extend_from_slice(&self.rmk_hash_alg.to_le_bytes());
        out.extend_from_slice(&self.rk_reserved);
        out.extend_from_slice(&self.mk_created.to_bytes());
        out.extend_from_slice(&self.mk_expired.to_bytes());
        out.extend_from_slice(&self.mk_enc_alg.to_le_bytes());
        out.extend_from_slice(&self.mk_iv);
        out.extend_from_slice(&self.mk_ciphertext);
        out.extend_from_slice(&self.mk_reserved);
        let hash = Sha256::digest(&out[KSF_HASH_START..]);
        out.extend_from_slice(&hash);
        debug_assert_eq!(out.len(), KSF_DATA_LEN);
        out
    }

    /// Parse and verify a KSF.
    ///
    /// # Errors
    ///
    /// - [`Error::StorageError`] if the magic flag is wrong
    /// - [`Error::InvalidKeyFile`] on a size, version or hash mismatch
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KSF_DATA_LEN {
            return Err(Error::invalid_key_file(format!(
                "KSF must be {KSF_DATA_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..KSF_FLAG.len()] != KSF_FLAG {
            return Err(Error::storage("ksf_read", "KSF flag mismatch"));
        }
        let expected = Sha256::digest(&bytes[KSF_HASH_START..KSF_HASH_END]);
        if !bool::from(subtle::ConstantTimeEq::ct_eq(&expected[..], &bytes[KSF_HASH_END..])) {
            return Err(Error::invalid_key_file("KSF hash mismatch"));
        }

        let mut c = Cursor {
            buf: bytes,
            pos: KSF_HASH_START,
        };
        let data = Self {
            version: c.u16(),
            rk_created: c.time(),
            rk_expired: c.time(),
            rk_material1: c.array(),
            rk_material2: c.array(),
            rmk_iterations: c.u32(),
            rmk_salt: c.array(),
            rmk_hash_alg: c.u32(),
            rk_reserved: c.array(),
            mk_created: c.time(),
            mk_expired: c.time(),
            mk_enc_alg: c.u32(),
            mk_iv: c.array(),
            mk_ciphertext: c.array(),
            mk_reserved: c.array(),
        };
        debug_assert_eq!(c.pos, KSF_HASH_END);

        if data.version != KSF_VERSION {
            return Err(Error::invalid_key_file(format!(
                "unsupported KSF version {}",
                data.version
            )));
        }
        if data.rmk_iterations == 0 {
            return Err(Error::invalid_key_file("KSF iteration count is zero"));
        }
        Ok(data)
    }
}

/// Root key hierarchy settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RkcConfig {
    /// PBKDF2 iterations for a newly created root master key
    pub rmk_iterations: u32,
    /// Device-bound component mixed into the root master key (at most 32
    /// bytes; shorter values are zero-padded)
    pub device_component: Vec<u8>,
}

impl Default for RkcConfig {
    fn default() -> Self {
        Self {
            rmk_iterations: MIN_KDF_ITERATIONS,
            device_component: Vec::new(),
        }
    }
}

impl RkcConfig {
    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if self.rmk_iterations == 0 {
            return Err(Error::ConfigurationError {
                message: "rmk_iterations must be non-zero".into(),
            });
        }
        if self.device_component.len() > RK_MATERIAL_LEN {
            return Err(Error::ConfigurationError {
                message: format!("device_component longer than {RK_MATERIAL_LEN} bytes"),
            });
        }
        Ok(())
    }
}

/// Lifecycle of the root key component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RkcState {
    /// Nothing loaded yet
    Uninitialized,
    /// A verified KSF is loaded and the main key is unwrapped
    Loaded,
    /// No verifiable KSF is available; needs out-of-band recovery
    Invalid,
}

/// Source of the main key that every blob key is derived from
pub trait MainKeySource: Send + Sync {
    /// The 32-byte main key
    fn main_key(&self) -> Result<Zeroizing<Vec<u8>>>;
}

/// A fixed main key, as handed over by a trusted execution environment
pub struct StaticMainKey {
    key: Zeroizing<Vec<u8>>,
}

impl StaticMainKey {
    /// Wrap a 32-byte main key
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = Zeroizing::new(key.into());
        if key.len() != MAIN_KEY_LEN {
            return Err(Error::invalid_argument(
                "static_main_key",
                format!("main key must be {MAIN_KEY_LEN} bytes, got {}", key.len()),
            ));
        }
        Ok(Self { key })
    }
}

impl MainKeySource for StaticMainKey {
    fn main_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.key.clone())
    }
}

struct RkcInner {
    state: RkcState,
    main_key: Option<Zeroizing<Vec<u8>>>,
}

enum KsfCopy {
    Missing,
    Valid(KsfData),
    Corrupt(Error),
}

/// KSF-backed main key provider
pub struct RootKeyHierarchy {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    config: RkcConfig,
    crypto: Arc<dyn CryptoProvider>,
    inner: RwLock<RkcInner>,
}

impl RootKeyHierarchy {
    /// Hierarchy whose KSF copies live in `dir`. Nothing is read until first use.
    pub fn new<P: AsRef<Path>>(
        fs: Arc<dyn FileSystem>,
        dir: P,
        config: RkcConfig,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self {
            fs,
            dir: dir.as_ref().to_path_buf(),
            config,
            crypto,
            inner: RwLock::new(RkcInner {
                state: RkcState::Uninitialized,
                main_key: None,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> RkcState {
        self.inner
            .read()
            .map(|inner| inner.state)
            .unwrap_or(RkcState::Invalid)
    }

    /// Path of KSF copy `index` (0 or 1)
    pub fn ksf_path(&self, index: usize) -> PathBuf {
        self.dir.join(KSF_FILE_NAMES[index % KSF_FILE_NAMES.len()])
    }

    /// Load the KSF copies and unwrap the main key.
    ///
    /// Creates a fresh hierarchy when neither copy exists, and rewrites a
    /// missing or corrupt copy from a verified one. Once the hierarchy is
    /// [`RkcState::Invalid`] every call fails until [`Self::reset`].
    pub fn load(&self) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Error::storage("rkc_load", "lock poisoned"))?;
        match inner.state {
            RkcState::Loaded => return Ok(()),
            RkcState::Invalid => {
                return Err(Error::invalid_key_file("root key component is invalid"))
            }
            RkcState::Uninitialized => {}
        }

        let first = self.read_copy(0);
        let second = self.read_copy(1);
        let (ksf, repair) = match (first, second) {
            (KsfCopy::Valid(a), KsfCopy::Valid(_)) => (a, None),
            (KsfCopy::Valid(a), _) => (a, Some(1)),
            (_, KsfCopy::Valid(b)) => (b, Some(0)),
            (KsfCopy::Missing, KsfCopy::Missing) => {
                let (ksf, main_key) = self.create()?;
                self.write_copy(0, &ksf)?;
                self.write_copy(1, &ksf)?;
                tracing::info!(dir = %self.dir.display(), "created root key component");
                inner.state = RkcState::Loaded;
                inner.main_key = Some(main_key);
                return Ok(());
            }
            (a, b) => {
                for copy in [a, b] {
                    if let KsfCopy::Corrupt(e) = copy {
                        tracing::error!(error = %e, "root key component copy rejected");
                    }
                }
                inner.state = RkcState::Invalid;
                return Err(Error::invalid_key_file("no valid root key component copy"));
            }
        };

        let main_key = match self.unwrap_main_key(&ksf) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(error = %e, "main key unwrap failed");
                inner.state = RkcState::Invalid;
                return Err(Error::invalid_key_file("main key unwrap failed"));
            }
        };
        if let Some(index) = repair {
            tracing::warn!(copy = index, "repairing root key component copy");
            self.write_copy(index, &ksf)?;
        }
        tracing::debug!("root key component loaded");
        inner.state = RkcState::Loaded;
        inner.main_key = Some(main_key);
        Ok(())
    }

    /// Discard both KSF copies and create a new hierarchy.
    ///
    /// Every blob sealed under the previous main key becomes unreadable.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Error::storage("rkc_reset", "lock poisoned"))?;
        let (ksf, main_key) = self.create()?;
        self.write_copy(0, &ksf)?;
        self.write_copy(1, &ksf)?;
        tracing::warn!(dir = %self.dir.display(), "root key component reset");
        inner.state = RkcState::Loaded;
        inner.main_key = Some(main_key);
        Ok(())
    }

    fn read_copy(&self, index: usize) -> KsfCopy {
        let path = self.ksf_path(index);
        match self.fs.exists(&path) {
            Ok(false) => return KsfCopy::Missing,
            Ok(true) => {}
            Err(e) => return KsfCopy::Corrupt(e),
        }
        match self.fs.read(&path).and_then(|bytes| KsfData::from_bytes(&bytes)) {
            Ok(ksf) => KsfCopy::Valid(ksf),
            Err(e) => KsfCopy::Corrupt(e),
        }
    }

    fn write_copy(&self, index: usize, ksf: &KsfData) -> Result<()> {
        let bytes = ksf.to_bytes();
        self.fs.write(&self.ksf_path(index), &bytes)
    }

    fn root_master_key(&self, ksf: &KsfData) -> Result<Zeroizing<Vec<u8>>> {
        let mut material = Zeroizing::new([0u8; RK_MATERIAL_LEN]);
        for (i, byte) in material.iter_mut().enumerate() {
            let device = self.config.device_component.get(i).copied().unwrap_or(0);
            *byte = ksf.rk_material1[i] ^ ksf.rk_material2[i] ^ device;
        }
        let digest = KeyDigest::from_u32(ksf.rmk_hash_alg)?;
        self.crypto.kdf(
            &material[..],
            &ksf.rmk_salt,
            ksf.rmk_iterations,
            digest,
            MAIN_KEY_LEN,
        )
    }

    fn unwrap_main_key(&self, ksf: &KsfData) -> Result<Zeroizing<Vec<u8>>> {
        if ksf.mk_enc_alg != KeyAlg::Aes.as_u32() {
            return Err(Error::not_supported(format!(
                "main key encryption algorithm {}",
                ksf.mk_enc_alg
            )));
        }
        let rmk = self.root_master_key(ksf)?;
        let mut sealed = Vec::with_capacity(MAIN_KEY_LEN + AES_GCM_TAG_SIZE);
        sealed.extend_from_slice(&ksf.mk_ciphertext);
        sealed.extend_from_slice(&ksf.mk_reserved[..AES_GCM_TAG_SIZE]);
        self.crypto
            .aead_decrypt(&rmk, &ksf.mk_iv[..AES_GCM_NONCE_SIZE], &[], &sealed)
    }

    fn create(&self) -> Result<(KsfData, Zeroizing<Vec<u8>>)> {
        self.config.validate()?;
        let now = RkcTime::now();
        let mut ksf = KsfData {
            version: KSF_VERSION,
            rk_created: now,
            rk_expired: RkcTime::default(),
            rk_material1: [0u8; RK_MATERIAL_LEN],
            rk_material2: [0u8; RK_MATERIAL_LEN],
            rmk_iterations: self.config.rmk_iterations,
            rmk_salt: [0u8; RMK_SALT_LEN],
            rmk_hash_alg: KeyDigest::Sha256.as_u32(),
            rk_reserved: [0u8; KSF_RESERVED_LEN],
            mk_created: now,
            mk_expired: RkcTime::default(),
            mk_enc_alg: KeyAlg::Aes.as_u32(),
            mk_iv: [0u8; MK_IV_LEN],
            mk_ciphertext: [0u8; MAIN_KEY_LEN],
            mk_reserved: [0u8; KSF_RESERVED_LEN],
        };
        self.crypto.fill_random(&mut ksf.rk_material1)?;
        self.crypto.fill_random(&mut ksf.rk_material2)?;
        self.crypto.fill_random(&mut ksf.rmk_salt)?;
        self.crypto.fill_random(&mut ksf.mk_iv[..AES_GCM_NONCE_SIZE])?;

        let mut main_key = Zeroizing::new(vec![0u8; MAIN_KEY_LEN]);
        self.crypto.fill_random(&mut main_key)?;

        let rmk = self.root_master_key(&ksf)?;
        let sealed = self
            .crypto
            .aead_encrypt(&rmk, &ksf.mk_iv[..AES_GCM_NONCE_SIZE], &[], &main_key)?;
        if sealed.len() != MAIN_KEY_LEN + AES_GCM_TAG_SIZE {
            return Err(Error::crypto("rkc_create", "unexpected sealed main key length"));
        }
        ksf.mk_ciphertext.copy_from_slice(&sealed[..MAIN_KEY_LEN]);
        ksf.mk_reserved[..AES_GCM_TAG_SIZE].copy_from_slice(&sealed[MAIN_KEY_LEN..]);
        Ok((ksf, main_key))
    }
}

impl MainKeySource for RootKeyHierarchy {
    fn main_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        {
            let inner = self
                .inner
                .read()
                .map_err(|_| Error::storage("rkc_main_key", "lock poisoned"))?;
            if let Some(key) = inner.main_key.as_ref() {
                return Ok(key.clone());
            }
        }
        self.load()?;
        let inner = self
            .inner
            .read()
            .map_err(|_| Error::storage("rkc_main_key", "lock poisoned"))?;
        inner
            .main_key
            .clone()
            .ok_or_else(|| Error::BadState {
                operation: "rkc_main_key".into(),
                message: "main key not available".into(),
            })
    }
}

/// Derive the per-blob encryption key.
///
/// The salt is `identity.salt_material() ‖ blob_salt`, so the same blob salt
/// yields unrelated keys for different identities.
pub fn derive_blob_key(
    crypto: &dyn CryptoProvider,
    main_key: &[u8],
    identity: &ProcessIdentity,
    blob_salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut salt = Zeroizing::new(identity.salt_material());
    salt.extend_from_slice(blob_salt);
    crypto.kdf(main_key, &salt, iterations, KeyDigest::Sha256, MAIN_KEY_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;
    use crate::storage::MemoryFileSystem;

    fn hierarchy(fs: Arc<MemoryFileSystem>) -> RootKeyHierarchy {
        let config = RkcConfig {
            rmk_iterations: 1000,
            device_component: b"device".to_vec(),
        };
        RootKeyHierarchy::new(fs, "/rkc", config, Arc::new(SoftwareCrypto::from_seed(1)))
    }

    #[test]
    fn test_ksf_layout() {
        let fs = Arc::new(MemoryFileSystem::new());
        let rkc = hierarchy(fs.clone());
        rkc.load().unwrap();
        let bytes = fs.read(&rkc.ksf_path(0)).unwrap();
        assert_eq!(bytes.len(), KSF_DATA_LEN);
        assert_eq!(&bytes[..8], &KSF_FLAG);
        let parsed = KsfData::from_bytes(&bytes).unwrap();
        assert_eq!(&parsed.to_bytes()[..], &bytes[..]);
        assert_eq!(parsed.rmk_iterations, 1000);
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let fs = Arc::new(MemoryFileSystem::new());
        let rkc = hierarchy(fs.clone());
        rkc.load().unwrap();
        let mut bytes = fs.read(&rkc.ksf_path(0)).unwrap();
        bytes[40] ^= 0x01;
        assert!(matches!(
            KsfData::from_bytes(&bytes),
            Err(Error::InvalidKeyFile { .. })
        ));

        let mut bytes = fs.read(&rkc.ksf_path(0)).unwrap();
        bytes[0] ^= 0x01;
        assert!(matches!(
            KsfData::from_bytes(&bytes),
            Err(Error::StorageError { .. })
        ));
    }

    #[test]
    fn test_main_key_is_stable_across_reloads() {
        let fs = Arc::new(MemoryFileSystem::new());
        let first = hierarchy(fs.clone()).main_key().unwrap();
        let second = hierarchy(fs).main_key().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), MAIN_KEY_LEN);
    }

    #[test]
    fn test_corrupt_copy_is_repaired_from_valid_one() {
        let fs = Arc::new(MemoryFileSystem::new());
        let rkc = hierarchy(fs.clone());
        let key = rkc.main_key().unwrap();
        let good = fs.read(&rkc.ksf_path(0)).unwrap();

        let mut bad = good.clone();
        bad[100] ^= 0xFF;
        fs.write(&rkc.ksf_path(1), &bad).unwrap();

        let reloaded = hierarchy(fs.clone());
        assert_eq!(reloaded.main_key().unwrap(), key);
        assert_eq!(fs.read(&reloaded.ksf_path(1)).unwrap(), good);

        fs.remove(&reloaded.ksf_path(0)).unwrap();
        let third = hierarchy(fs.clone());
        assert_eq!(third.main_key().unwrap(), key);
        assert!(fs.exists(&third.ksf_path(0)).unwrap());
    }

    #[test]
    fn test_both_copies_corrupt_is_terminal() {
        let fs = Arc::new(MemoryFileSystem::new());
        let rkc = hierarchy(fs.clone());
        rkc.load().unwrap();
        for i in 0..2 {
            let mut bytes = fs.read(&rkc.ksf_path(i)).unwrap();
            bytes[60] ^= 0x10;
            fs.write(&rkc.ksf_path(i), &bytes).unwrap();
        }

        let broken = hierarchy(fs.clone());
        assert!(matches!(broken.load(), Err(Error::InvalidKeyFile { .. })));
        assert_eq!(broken.state(), RkcState::Invalid);
        assert!(broken.main_key().is_err());

        broken.reset().unwrap();
        assert_eq!(broken.state(), RkcState::Loaded);
    }

    #[test]
    fn test_device_component_binds_main_key() {
        let fs = Arc::new(MemoryFileSystem::new());
        hierarchy(fs.clone()).load().unwrap();
        let other = RootKeyHierarchy::new(
            fs,
            "/rkc",
            RkcConfig {
                rmk_iterations: 1000,
                device_component: b"another device".to_vec(),
            },
            Arc::new(SoftwareCrypto::new()),
        );
        assert!(other.load().is_err());
        assert_eq!(other.state(), RkcState::Invalid);
    }

    #[test]
    fn test_blob_key_depends_on_identity_and_salt() {
        let crypto = SoftwareCrypto::new();
        let main_key = [9u8; 32];
        let a = ProcessIdentity::new("0", "proc_a").unwrap();
        let b = ProcessIdentity::new("0", "proc_b").unwrap();
        let k1 = derive_blob_key(&crypto, &main_key, &a, &[1u8; 16], 1000).unwrap();
        let k2 = derive_blob_key(&crypto, &main_key, &a, &[1u8; 16], 1000).unwrap();
        let k3 = derive_blob_key(&crypto, &main_key, &b, &[1u8; 16], 1000).unwrap();
        let k4 = derive_blob_key(&crypto, &main_key, &a, &[2u8; 16], 1000).unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);
    }

    #[test]
    fn test_static_main_key_length() {
        assert!(StaticMainKey::new(vec![0u8; 16]).is_err());
        let source = StaticMainKey::new(vec![5u8; 32]).unwrap();
        assert_eq!(&source.main_key().unwrap()[..], &[5u8; 32]);
    }
}
