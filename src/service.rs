//! In-process keystore: key lifecycle and `init → update* → finish | abort`
//! sessions on top of the blob engine.
//!
//! Every cryptographic use of a stored key goes through [`Keystore::init`],
//! which runs the authorization matcher and the user auth check before a
//! session handle is handed out.

use crate::auth;
use crate::auth_token::AuthTokenKeyCache;
use crate::crypto::{CryptoProvider, SoftwareCrypto};
use crate::keyblob::{EngineConfig, KeyBlobEngine};
use crate::keynode::{KeyNode, Operation, Session, SessionManager, MAX_KEY_NODE_COUNT};
use crate::material::{self, ED25519_COMPACT_SIZE};
use crate::param::{Param, ParamSet, Tag};
use crate::rkc::{MainKeySource, RkcConfig, RootKeyHierarchy};
use crate::storage::{FileSystem, KeyStore, LocalFileSystem, StorageConfig, StorageType};
use crate::{
    BlockMode, Error, KeyAlg, KeyDigest, KeyFlag, KeyPurpose, ProcessIdentity, Result,
    MAX_KEY_ALIAS_LEN,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Output size of a derivation when the request does not say
pub const DEFAULT_DERIVE_KEY_SIZE: u32 = 32;

/// Complete keystore configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystoreConfig {
    /// Key store layout
    pub storage: StorageConfig,
    /// Blob engine settings
    pub engine: EngineConfig,
    /// Root key hierarchy settings
    pub rkc: RkcConfig,
    /// Maximum number of open sessions
    pub max_sessions: usize,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            rkc: RkcConfig::default(),
            max_sessions: MAX_KEY_NODE_COUNT,
        }
    }
}

impl KeystoreConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::ConfigurationError {
            message: format!("invalid keystore config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::io("read_config", e))?;
        Self::from_json_str(&json)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.engine.validate()?;
        self.rkc.validate()?;
        if self.max_sessions == 0 || self.max_sessions > MAX_KEY_NODE_COUNT {
            return Err(Error::ConfigurationError {
                message: format!("max_sessions must be within 1..={MAX_KEY_NODE_COUNT}"),
            });
        }
        Ok(())
    }
}

/// The keystore facade
pub struct Keystore {
    crypto: Arc<dyn CryptoProvider>,
    store: KeyStore,
    engine: KeyBlobEngine,
    sessions: SessionManager,
    auth_tokens: AuthTokenKeyCache,
    rkc: Option<Arc<RootKeyHierarchy>>,
}

impl Keystore {
    /// Keystore whose main key comes from the root key component files kept
    /// in the storage root
    pub fn open(
        config: KeystoreConfig,
        fs: Arc<dyn FileSystem>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let rkc = Arc::new(RootKeyHierarchy::new(
            fs.clone(),
            &config.storage.root,
            config.rkc.clone(),
            crypto.clone(),
        ));
        rkc.load()?;
        let mut keystore = Self::with_main_key(config, fs, crypto, rkc.clone())?;
        keystore.rkc = Some(rkc);
        Ok(keystore)
    }

    /// Keystore on the local filesystem with the software provider
    pub fn open_local(config: KeystoreConfig) -> Result<Self> {
        Self::open(config, Arc::new(LocalFileSystem), Arc::new(SoftwareCrypto::new()))
    }

    /// Keystore whose main key is supplied by `main_key`
    pub fn with_main_key(
        config: KeystoreConfig,
        fs: Arc<dyn FileSystem>,
        crypto: Arc<dyn CryptoProvider>,
        main_key: Arc<dyn MainKeySource>,
    ) -> Result<Self> {
        config.validate()?;
        let store = KeyStore::new(fs, config.storage.clone())?;
        let engine = KeyBlobEngine::new(crypto.clone(), main_key, config.engine.clone())?;
        let sessions = SessionManager::with_limit(crypto.clone(), config.max_sessions);
        let auth_tokens = AuthTokenKeyCache::new(crypto.clone());
        auth_tokens.init();
        tracing::info!(root = %config.storage.root.display(), "keystore opened");
        Ok(Self {
            crypto,
            store,
            engine,
            sessions,
            auth_tokens,
            rkc: None,
        })
    }

    /// Auth token key cache
    pub fn auth_tokens(&self) -> &AuthTokenKeyCache {
        &self.auth_tokens
    }

    /// Root key hierarchy, when the keystore was opened with one
    pub fn root_key_hierarchy(&self) -> Option<&RootKeyHierarchy> {
        self.rkc.as_deref()
    }

    /// Underlying key store
    pub fn key_store(&self) -> &KeyStore {
        &self.store
    }

    /// Blob engine
    pub fn engine(&self) -> &KeyBlobEngine {
        &self.engine
    }

    /// Number of open sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Generate a key for `alias` from `params`.
    ///
    /// `params` needs `ALGORITHM` and a non-zero `PURPOSE`. `KEY_SIZE`
    /// defaults per algorithm. The owning process name and the creation time
    /// are stamped by the keystore.
    pub fn generate_key(&self, identity: &ProcessIdentity, alias: &[u8], params: &ParamSet) -> Result<()> {
        let (alg, key_size) = self.check_new_key(identity, alias, params)?;
        let key = self.crypto.generate_key(alg, key_size)?;
        self.store_key(identity, alias, params, key_size, KeyFlag::Generate, &key)?;
        tracing::info!(alias = %hex::encode(alias), ?alg, key_size, "key generated");
        Ok(())
    }

    /// Import existing key material for `alias`.
    ///
    /// Symmetric keys are raw bytes. Asymmetric keys use the material layout
    /// of [`crate::material`]; Ed25519 also accepts the 64-byte compact form.
    pub fn import_key(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        params: &ParamSet,
        key: &[u8],
    ) -> Result<()> {
        let (alg, key_size) = self.check_new_key(identity, alias, params)?;
        let key = normalize_import(alg, key_size, key)?;
        self.store_key(identity, alias, params, key_size, KeyFlag::Import, &key)?;
        tracing::info!(alias = %hex::encode(alias), ?alg, key_size, "key imported");
        Ok(())
    }

    fn check_new_key(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        params: &ParamSet,
    ) -> Result<(KeyAlg, u32)> {
        check_alias(alias)?;
        for tag in [Tag::PROCESS_NAME, Tag::CREATION_DATETIME, Tag::KEY] {
            if params.contains(tag) {
                return Err(Error::invalid_argument(
                    "check_key_params",
                    format!("{tag:?} is set by the keystore"),
                ));
            }
        }
        let alg = KeyAlg::from_u32(params.get_uint(Tag::ALGORITHM).map_err(|_| {
            Error::MissingRequired {
                tag: Tag::ALGORITHM.raw(),
                location: "request".into(),
            }
        })?)?;
        let purpose = KeyPurpose::from_bits(params.get_uint(Tag::PURPOSE).map_err(|_| {
            Error::MissingRequired {
                tag: Tag::PURPOSE.raw(),
                location: "request".into(),
            }
        })?)?;
        if purpose.is_empty() {
            return Err(Error::invalid_argument("check_key_params", "empty purpose"));
        }
        let key_size = match params.get_uint(Tag::KEY_SIZE) {
            Ok(size) => size,
            Err(_) => default_key_size(alg).ok_or(Error::MissingRequired {
                tag: Tag::KEY_SIZE.raw(),
                location: "request".into(),
            })?,
        };
        if self.store.exists(identity, alias, StorageType::Key)? {
            return Err(Error::AlreadyExists {
                what: format!("key {}", hex::encode(alias)),
            });
        }
        Ok((alg, key_size))
    }

    fn store_key(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        params: &ParamSet,
        key_size: u32,
        flag: KeyFlag,
        key: &[u8],
    ) -> Result<()> {
        let mut gen = ParamSet::new();
        for p in params.iter() {
            gen.push(p.clone())?;
        }
        if !gen.contains(Tag::KEY_SIZE) {
            gen.push(Param::uint(Tag::KEY_SIZE, key_size))?;
        }
        gen.add(&[
            Param::bytes(Tag::PROCESS_NAME, identity.process_name()),
            Param::ulong(Tag::CREATION_DATETIME, now_millis()),
        ])?;
        let blob = self.engine.build_key_blob(alias, flag, key, &gen, identity)?;
        self.store
            .write_new(identity, alias, StorageType::Key, &blob)
    }

    /// Public half of an asymmetric key
    pub fn export_public_key(&self, identity: &ProcessIdentity, alias: &[u8]) -> Result<Vec<u8>> {
        let node = self.load_node(identity, alias)?;
        let alg = node.alg()?;
        if alg.is_symmetric() {
            return Err(Error::invalid_argument(
                "export_public_key",
                format!("{alg:?} keys have no public part"),
            ));
        }
        let key = node.raw_key()?;
        self.crypto.public_key(alg, &key)
    }

    /// Delete both stored copies of `alias`
    pub fn delete_key(&self, identity: &ProcessIdentity, alias: &[u8]) -> Result<()> {
        check_alias(alias)?;
        self.store.delete(identity, alias, StorageType::Key)?;
        tracing::info!(alias = %hex::encode(alias), "key deleted");
        Ok(())
    }

    /// Whether `alias` is stored
    pub fn key_exists(&self, identity: &ProcessIdentity, alias: &[u8]) -> Result<bool> {
        check_alias(alias)?;
        self.store.exists(identity, alias, StorageType::Key)
    }

    /// Aliases stored for `identity`
    pub fn list_aliases(&self, identity: &ProcessIdentity) -> Result<Vec<Vec<u8>>> {
        self.store.list(identity, StorageType::Key)
    }

    /// Stored parameters of `alias`, without the key material
    pub fn get_key_params(&self, identity: &ProcessIdentity, alias: &[u8]) -> Result<ParamSet> {
        self.load_node(identity, alias)?.params().without(Tag::KEY)
    }

    /// Read and decrypt `alias`. A primary copy that fails to parse is
    /// replaced by a backup copy that does.
    fn load_node(&self, identity: &ProcessIdentity, alias: &[u8]) -> Result<KeyNode> {
        check_alias(alias)?;
        let bytes = self.store.read(identity, alias, StorageType::Key)?;
        let err = match self.engine.parse_key_blob(&bytes, identity) {
            Ok(node) => return Ok(node),
            Err(e) if e.is_corrupt_blob() => e,
            Err(e) => return Err(e),
        };
        let backup = match self.store.read_backup(identity, alias, StorageType::Key)? {
            Some(backup) if backup != bytes => backup,
            _ => return Err(err),
        };
        match self.engine.parse_key_blob(&backup, identity) {
            Ok(node) => {
                tracing::warn!(alias = %hex::encode(alias), error = %err, "primary key blob unusable, using backup");
                if let Err(e) = self
                    .store
                    .repair_primary(identity, alias, StorageType::Key, &backup)
                {
                    tracing::error!(alias = %hex::encode(alias), error = %e, "failed to repair primary key blob");
                }
                Ok(node)
            }
            Err(_) => Err(err),
        }
    }

    /// Open a session using `alias` for the single purpose named in `request`.
    ///
    /// # Errors
    ///
    /// - [`Error::MismatchedTag`] / [`Error::MissingRequired`] when the request
    ///   is outside the key's policy
    /// - [`Error::KeyAuthVerifyFailed`] when the key needs user authentication
    ///   and the request carries no valid auth token
    /// - [`Error::SessionReachedLimit`] when too many sessions are open
    pub fn init(&self, identity: &ProcessIdentity, alias: &[u8], request: &ParamSet) -> Result<u64> {
        let node = self.load_node(identity, alias)?;
        let alg = node.alg()?;
        let purpose = KeyPurpose::from_bits(request.get_uint(Tag::PURPOSE).map_err(|_| {
            Error::MissingRequired {
                tag: Tag::PURPOSE.raw(),
                location: "request".into(),
            }
        })?)?;
        if !purpose.is_single() {
            return Err(Error::invalid_argument(
                "init",
                format!("a session needs exactly one purpose, got {:#x}", purpose.bits()),
            ));
        }
        let auth_id = auth::auth_id_for(alg, purpose)?;
        if let Err(e) = auth::authorize(auth_id, node.params(), request) {
            tracing::debug!(alias = %hex::encode(alias), ?auth_id, error = %e, "authorization refused");
            return Err(e);
        }
        self.check_user_auth(node.params(), request)?;
        let operation = Operation {
            alg,
            purpose,
            request: request.clone(),
        };
        self.sessions.create(node, operation, alias)
    }

    fn check_user_auth(&self, stored: &ParamSet, request: &ParamSet) -> Result<()> {
        if stored.get_bool(Tag::NO_AUTH_REQUIRED).unwrap_or(false) {
            return Ok(());
        }
        let accepted = match stored.get_uint(Tag::USER_AUTH_TYPE) {
            Ok(types) => types,
            Err(_) => return Ok(()),
        };
        let token = request.get_bytes(Tag::AUTH_TOKEN).map_err(|_| Error::MissingRequired {
            tag: Tag::AUTH_TOKEN.raw(),
            location: "request".into(),
        })?;
        let token = self.auth_tokens.verify_auth_token_sign(token)?;
        if token.auth_type & accepted == 0 {
            tracing::debug!(auth_type = token.auth_type, accepted, "auth type not accepted");
            return Err(Error::KeyAuthVerifyFailed);
        }
        if let Ok(timeout) = stored.get_uint(Tag::AUTH_TIMEOUT) {
            let age = now_millis().saturating_sub(token.time);
            if age > u64::from(timeout) * 1000 {
                tracing::debug!(age, timeout, "auth token expired");
                return Err(Error::KeyAuthVerifyFailed);
            }
        }
        Ok(())
    }

    /// Buffer input for an open session
    pub fn update(&self, handle: u64, data: &[u8]) -> Result<()> {
        self.sessions.get(handle)?.append(data)
    }

    /// Run the operation and close the session.
    ///
    /// For verification the buffered input is the message and `data` is the
    /// signature; success returns an empty vector. For agreement `data` is the
    /// peer public key. Otherwise `data` is appended to the buffered input.
    pub fn finish(&self, handle: u64, data: &[u8]) -> Result<Vec<u8>> {
        let session = self.sessions.remove(handle)?;
        let result = self.run(&session, data);
        if let Err(e) = &result {
            tracing::debug!(handle, error = %e, "session finished with error");
        }
        result
    }

    /// Close a session without running it
    pub fn abort(&self, handle: u64) -> Result<()> {
        self.sessions.remove(handle).map(|_| ())
    }

    /// `init` followed by `finish(input)`
    pub fn process(
        &self,
        identity: &ProcessIdentity,
        alias: &[u8],
        request: &ParamSet,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        let handle = self.init(identity, alias, request)?;
        self.finish(handle, input)
    }

    fn run(&self, session: &Session, data: &[u8]) -> Result<Vec<u8>> {
        let op = session.operation();
        let node = session.node();
        let stored = node.params();
        let key = node.raw_key()?;
        let digest = effective_digest(&op.request, stored)?;

        match op.purpose {
            KeyPurpose::VERIFY => {
                let message = session.take_data()?;
                let public = self.crypto.public_key(op.alg, &key)?;
                self.crypto.verify(op.alg, &public, digest, &message, data)?;
                Ok(Vec::new())
            }
            KeyPurpose::AGREE => {
                let shared = self.crypto.agree(op.alg, &key, data)?;
                Ok(shared.to_vec())
            }
            _ => {
                session.append(data)?;
                let input = session.take_data()?;
                self.run_buffered(op, stored, &key, digest, &input)
            }
        }
    }

    fn run_buffered(
        &self,
        op: &Operation,
        stored: &ParamSet,
        key: &[u8],
        digest: KeyDigest,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        match op.purpose {
            KeyPurpose::SIGN => self.crypto.sign(op.alg, key, digest, input),
            KeyPurpose::ENCRYPT | KeyPurpose::DECRYPT => {
                let mode = effective_uint(Tag::BLOCK_MODE, &op.request, stored)
                    .map(BlockMode::from_u32)
                    .transpose()?;
                if op.alg != KeyAlg::Aes || mode != Some(BlockMode::Gcm) {
                    return Err(Error::not_supported(format!(
                        "{:?} cipher with block mode {mode:?}",
                        op.alg
                    )));
                }
                let nonce = op.request.get_bytes(Tag::NONCE).map_err(|_| Error::MissingRequired {
                    tag: Tag::NONCE.raw(),
                    location: "request".into(),
                })?;
                let aad = op.request.get_bytes(Tag::ASSOCIATED_DATA).unwrap_or(&[]);
                if op.purpose == KeyPurpose::ENCRYPT {
                    self.crypto.aead_encrypt(key, nonce, aad, input)
                } else {
                    Ok(self.crypto.aead_decrypt(key, nonce, aad, input)?.to_vec())
                }
            }
            KeyPurpose::MAC => self.crypto.hmac(digest, key, input),
            KeyPurpose::DERIVE => {
                let salt = op.request.get_bytes(Tag::SALT).unwrap_or(&[]);
                let info = op.request.get_bytes(Tag::INFO).unwrap_or(&[]);
                let out_len = op
                    .request
                    .get_uint(Tag::DERIVE_KEY_SIZE)
                    .unwrap_or(DEFAULT_DERIVE_KEY_SIZE);
                let ikm = Zeroizing::new([key, input].concat());
                Ok(self
                    .crypto
                    .hkdf(digest, &ikm, salt, info, out_len as usize)?
                    .to_vec())
            }
            other => Err(Error::not_supported(format!(
                "purpose {:#x}",
                other.bits()
            ))),
        }
    }
}

fn check_alias(alias: &[u8]) -> Result<()> {
    if alias.is_empty() || alias.len() > MAX_KEY_ALIAS_LEN {
        return Err(Error::invalid_argument(
            "check_alias",
            format!("alias length {} out of range", alias.len()),
        ));
    }
    Ok(())
}

fn default_key_size(alg: KeyAlg) -> Option<u32> {
    match alg {
        KeyAlg::Ed25519 | KeyAlg::X25519 | KeyAlg::Ecc | KeyAlg::Aes | KeyAlg::Hmac => Some(256),
        _ => None,
    }
}

fn normalize_import(alg: KeyAlg, key_size: u32, key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if alg.is_symmetric() {
        if key.len() as u64 * 8 != u64::from(key_size) {
            return Err(Error::invalid_argument(
                "import_key",
                format!("{} key bytes do not match KEY_SIZE {key_size}", key.len()),
            ));
        }
        return Ok(Zeroizing::new(key.to_vec()));
    }
    let key = if alg == KeyAlg::Ed25519 && key.len() == ED25519_COMPACT_SIZE {
        material::ed25519_from_compact(key)?
    } else {
        Zeroizing::new(key.to_vec())
    };
    material::material_to_raw(&key, alg)?;
    let header = material::read_header(&key)?;
    if header.key_size != key_size {
        return Err(Error::invalid_argument(
            "import_key",
            format!("material key size {} does not match KEY_SIZE {key_size}", header.key_size),
        ));
    }
    Ok(key)
}

fn effective_uint(tag: Tag, request: &ParamSet, stored: &ParamSet) -> Option<u32> {
    request.get_uint(tag).or_else(|_| stored.get_uint(tag)).ok()
}

fn effective_digest(request: &ParamSet, stored: &ParamSet) -> Result<KeyDigest> {
    effective_uint(Tag::DIGEST, request, stored)
        .map(KeyDigest::from_u32)
        .transpose()
        .map(|d| d.unwrap_or(KeyDigest::None))
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
