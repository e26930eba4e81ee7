//! Key blob engine: seals key material into a self-describing parameter set
//! and opens it again.
//!
//! # Blob layout
//!
//! A key blob is a serialized [`ParamSet`] whose last entry is `KEY`. The
//! `KEY` payload is a [`KeyBlobInfo`] header followed by the AES-256-GCM
//! ciphertext of the key material:
//!
//! ```text
//! ┌──────────────┬──────────────────┬────────────┬─────────────────────────┐
//! │ header (8 B) │ params ...       │ KEY tag,len│ info (48 B) │ ciphertext│
//! └──────────────┴──────────────────┴────────────┴─────────────────────────┘
//!  ◄──────────────────── AAD ───────────────────► ◄──── KEY payload ──────►
//! ```
//!
//! Everything in front of the `KEY` payload is the associated data, so any
//! change to the policy parameters breaks the tag. The blob key is derived
//! per blob from the main key, a fresh random salt and the caller's
//! [`ProcessIdentity`].

use crate::crypto::{CryptoProvider, AES_GCM_NONCE_SIZE, AES_GCM_TAG_SIZE};
use crate::keynode::KeyNode;
use crate::param::{Param, ParamSet, Tag};
use crate::rkc::{self, MainKeySource, MIN_KDF_ITERATIONS};
use crate::{Error, KeyFlag, ProcessIdentity, Result, MAX_KEY_ALIAS_LEN};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

/// Per-blob KDF salt size
pub const KEY_BLOB_SALT_LEN: usize = 16;
/// Serialized [`KeyBlobInfo`] size
pub const KEY_BLOB_INFO_LEN: usize = KEY_BLOB_SALT_LEN + AES_GCM_NONCE_SIZE + AES_GCM_TAG_SIZE + 4;

/// Per-blob randomness and tag stored in front of the key ciphertext
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyBlobInfo {
    /// KDF salt
    pub salt: [u8; KEY_BLOB_SALT_LEN],
    /// AEAD nonce
    pub nonce: [u8; AES_GCM_NONCE_SIZE],
    /// AEAD tag
    pub tag: [u8; AES_GCM_TAG_SIZE],
    /// Length of the key material that follows
    pub key_size: u32,
}

impl KeyBlobInfo {
    /// Encode as `salt ‖ nonce ‖ tag ‖ key_size u32le`
    pub fn to_bytes(&self) -> [u8; KEY_BLOB_INFO_LEN] {
        let mut out = [0u8; KEY_BLOB_INFO_LEN];
        let (salt, rest) = out.split_at_mut(KEY_BLOB_SALT_LEN);
        let (nonce, rest) = rest.split_at_mut(AES_GCM_NONCE_SIZE);
        let (tag, size) = rest.split_at_mut(AES_GCM_TAG_SIZE);
        salt.copy_from_slice(&self.salt);
        nonce.copy_from_slice(&self.nonce);
        tag.copy_from_slice(&self.tag);
        size.copy_from_slice(&self.key_size.to_le_bytes());
        out
    }

    /// Decode the first [`KEY_BLOB_INFO_LEN`] bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < KEY_BLOB_INFO_LEN {
            return Err(Error::invalid_key_info(format!(
                "key blob info needs {KEY_BLOB_INFO_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut info = Self::default();
        let (salt, rest) = bytes.split_at(KEY_BLOB_SALT_LEN);
        let (nonce, rest) = rest.split_at(AES_GCM_NONCE_SIZE);
        let (tag, rest) = rest.split_at(AES_GCM_TAG_SIZE);
        info.salt.copy_from_slice(salt);
        info.nonce.copy_from_slice(nonce);
        info.tag.copy_from_slice(tag);
        let mut size = [0u8; 4];
        size.copy_from_slice(&rest[..4]);
        info.key_size = u32::from_le_bytes(size);
        Ok(info)
    }
}

/// Engine settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PBKDF2 iterations for blob key derivation
    pub kdf_iterations: u32,
    /// Accept fewer than 10 000 iterations (tests only)
    pub allow_weak_kdf: bool,
    /// Stamped as `KEY_VERSION`
    pub key_version: u32,
    /// Stamped as `OS_VERSION`
    pub os_version: u32,
    /// Stamped as `OS_PATCHLEVEL`
    pub os_patchlevel: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            allow_weak_kdf: false,
            key_version: 1,
            os_version: 1,
            os_patchlevel: 1,
        }
    }
}

impl EngineConfig {
    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            return Err(Error::ConfigurationError {
                message: "kdf_iterations must be non-zero".into(),
            });
        }
        if self.kdf_iterations < MIN_KDF_ITERATIONS && !self.allow_weak_kdf {
            return Err(Error::ConfigurationError {
                message: format!(
                    "kdf_iterations {} below minimum {MIN_KDF_ITERATIONS}",
                    self.kdf_iterations
                ),
            });
        }
        Ok(())
    }
}

/// A serialized blob whose key material is still in the clear.
///
/// Produced by [`KeyBlobEngine::stage_clear_blob`] and turned into a sealed
/// blob by [`KeyBlobEngine::seal`]. The buffer is wiped on drop.
pub struct StagedKeyBlob {
    bytes: Zeroizing<Vec<u8>>,
    info: KeyBlobInfo,
    payload_start: usize,
    sealed: bool,
}

impl StagedKeyBlob {
    /// Current bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Range of the key material (clear before sealing, ciphertext after)
    pub fn material_range(&self) -> Range<usize> {
        self.payload_start + KEY_BLOB_INFO_LEN..self.bytes.len()
    }

    /// Whether [`KeyBlobEngine::seal`] succeeded
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The sealed blob
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.sealed {
            return Err(Error::BadState {
                operation: "key_blob_into_bytes".into(),
                message: "key blob is not sealed".into(),
            });
        }
        Ok(self.bytes.to_vec())
    }

    fn wipe_material(&mut self) {
        let range = self.material_range();
        self.bytes[range].zeroize();
    }
}

/// Builds and parses key blobs
pub struct KeyBlobEngine {
    crypto: Arc<dyn CryptoProvider>,
    main_key: Arc<dyn MainKeySource>,
    config: EngineConfig,
}

impl KeyBlobEngine {
    /// Engine over `crypto`, deriving blob keys from `main_key`
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        main_key: Arc<dyn MainKeySource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            crypto,
            main_key,
            config,
        })
    }

    /// Engine settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Serialize `gen_params` plus the system parameters and a clear `KEY`
    /// payload, with a fresh salt and nonce
    pub fn stage_clear_blob(
        &self,
        flag: KeyFlag,
        raw_key: &[u8],
        gen_params: &ParamSet,
    ) -> Result<StagedKeyBlob> {
        if raw_key.is_empty() {
            return Err(Error::invalid_argument("build_key_blob", "empty key material"));
        }
        if gen_params.contains(Tag::KEY) {
            return Err(Error::invalid_argument(
                "build_key_blob",
                "generation parameters must not carry KEY",
            ));
        }
        let key_size = u32::try_from(raw_key.len())
            .map_err(|_| Error::invalid_argument("build_key_blob", "key material too large"))?;

        let mut info = KeyBlobInfo {
            key_size,
            ..KeyBlobInfo::default()
        };
        self.crypto.fill_random(&mut info.salt)?;
        self.crypto.fill_random(&mut info.nonce)?;

        let mut params = ParamSet::new();
        for p in gen_params.iter() {
            params.push(p.clone())?;
        }
        params.add(&[
            Param::uint(Tag::KEY_VERSION, self.config.key_version),
            Param::uint(Tag::OS_VERSION, self.config.os_version),
            Param::uint(Tag::OS_PATCHLEVEL, self.config.os_patchlevel),
            Param::uint(Tag::KEY_FLAG, flag.as_u32()),
        ])?;

        // Clear material only exists from here on; every copy is wiped on drop
        let mut payload = Zeroizing::new(Vec::with_capacity(KEY_BLOB_INFO_LEN + raw_key.len()));
        payload.extend_from_slice(&info.to_bytes());
        payload.extend_from_slice(raw_key);
        params.push(Param::bytes(Tag::KEY, std::mem::take(&mut *payload)))?;
        params.build()?;

        let bytes = Zeroizing::new(params.to_bytes()?);
        let key = locate_key(&bytes)?;
        Ok(StagedKeyBlob {
            bytes,
            info,
            payload_start: key.start,
            sealed: false,
        })
    }

    /// Encrypt the staged key material in place of the clear bytes.
    ///
    /// On any failure the clear material region is zeroed before the error
    /// is returned.
    pub fn seal(&self, staged: &mut StagedKeyBlob, identity: &ProcessIdentity) -> Result<()> {
        if staged.sealed {
            return Err(Error::BadState {
                operation: "key_blob_seal".into(),
                message: "key blob is already sealed".into(),
            });
        }
        match self.encrypt_material(staged, identity) {
            Ok(ciphertext) => {
                let range = staged.material_range();
                staged.info.tag.copy_from_slice(&ciphertext[range.len()..]);
                staged.bytes[range].copy_from_slice(&ciphertext[..ciphertext.len() - AES_GCM_TAG_SIZE]);
                let info_range = staged.payload_start..staged.payload_start + KEY_BLOB_INFO_LEN;
                staged.bytes[info_range].copy_from_slice(&staged.info.to_bytes());
                staged.sealed = true;
                Ok(())
            }
            Err(e) => {
                staged.wipe_material();
                tracing::error!(error = %e, "key blob encryption failed, clear material wiped");
                Err(e)
            }
        }
    }

    fn encrypt_material(&self, staged: &StagedKeyBlob, identity: &ProcessIdentity) -> Result<Vec<u8>> {
        let main_key = self.main_key.main_key()?;
        let blob_key = rkc::derive_blob_key(
            self.crypto.as_ref(),
            &main_key,
            identity,
            &staged.info.salt,
            self.config.kdf_iterations,
        )?;
        let range = staged.material_range();
        let aad = &staged.bytes[..staged.payload_start];
        let ciphertext =
            self.crypto
                .aead_encrypt(&blob_key, &staged.info.nonce, aad, &staged.bytes[range.clone()])?;
        if ciphertext.len() != range.len() + AES_GCM_TAG_SIZE {
            return Err(Error::crypto(
                "key_blob_seal",
                format!("unexpected ciphertext length {}", ciphertext.len()),
            ));
        }
        Ok(ciphertext)
    }

    /// Build a sealed key blob for `raw_key` under `identity`
    pub fn build_key_blob(
        &self,
        alias: &[u8],
        flag: KeyFlag,
        raw_key: &[u8],
        gen_params: &ParamSet,
        identity: &ProcessIdentity,
    ) -> Result<Vec<u8>> {
        if alias.is_empty() || alias.len() > MAX_KEY_ALIAS_LEN {
            return Err(Error::invalid_argument(
                "build_key_blob",
                format!("alias length {} out of range", alias.len()),
            ));
        }
        let mut staged = self.stage_clear_blob(flag, raw_key, gen_params)?;
        self.seal(&mut staged, identity)?;
        tracing::debug!(alias = %hex::encode(alias), size = staged.bytes.len(), "key blob built");
        staged.into_bytes()
    }

    /// Verify and decrypt a key blob into a [`KeyNode`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidKeyFile`] if the blob is structurally malformed
    /// - [`Error::InvalidKeyInfo`] if the `KEY` payload sizes disagree
    /// - [`Error::KeyAuthVerifyFailed`] if decryption fails, including when
    ///   `identity` is not the identity the blob was built for
    pub fn parse_key_blob(&self, bytes: &[u8], identity: &ProcessIdentity) -> Result<KeyNode> {
        let key = locate_key(bytes)?;
        let payload = &bytes[key.clone()];
        if payload.len() <= KEY_BLOB_INFO_LEN {
            return Err(Error::invalid_key_info(format!(
                "KEY payload of {} bytes holds no key material",
                payload.len()
            )));
        }
        let info = KeyBlobInfo::from_bytes(payload)?;
        let material_len = payload.len() - KEY_BLOB_INFO_LEN;
        if info.key_size as usize != material_len {
            return Err(Error::invalid_key_info(format!(
                "key size {} does not match {material_len} stored bytes",
                info.key_size
            )));
        }

        let mut params = ParamSet::from_bytes(bytes).map_err(corrupt)?;
        let main_key = self.main_key.main_key()?;
        let blob_key = rkc::derive_blob_key(
            self.crypto.as_ref(),
            &main_key,
            identity,
            &info.salt,
            self.config.kdf_iterations,
        )?;
        let mut sealed = Vec::with_capacity(material_len + AES_GCM_TAG_SIZE);
        sealed.extend_from_slice(&payload[KEY_BLOB_INFO_LEN..]);
        sealed.extend_from_slice(&info.tag);
        let clear = self
            .crypto
            .aead_decrypt(&blob_key, &info.nonce, &bytes[..key.start], &sealed)
            .map_err(|e| match e {
                Error::KeyAuthVerifyFailed => {
                    tracing::debug!("key blob failed authentication");
                    Error::KeyAuthVerifyFailed
                }
                other => other,
            })?;

        let mut payload = Zeroizing::new(Vec::with_capacity(KEY_BLOB_INFO_LEN + clear.len()));
        payload.extend_from_slice(&info.to_bytes());
        payload.extend_from_slice(&clear);
        params.replace_bytes(Tag::KEY, std::mem::take(&mut *payload))?;
        Ok(KeyNode::new(params))
    }
}

fn corrupt(e: Error) -> Error {
    match e {
        e @ Error::InvalidKeyFile { .. } => e,
        other => Error::invalid_key_file(other.to_string()),
    }
}

/// Locate the `KEY` payload and check it is the physically last bytes of the
/// set
fn locate_key(bytes: &[u8]) -> Result<Range<usize>> {
    let entries = ParamSet::scan(bytes).map_err(corrupt)?;
    let last = entries
        .last()
        .ok_or_else(|| Error::invalid_key_file("empty parameter set"))?;
    if last.tag != Tag::KEY || entries[..entries.len() - 1].iter().any(|e| e.tag == Tag::KEY) {
        return Err(Error::invalid_key_file("KEY is not the last parameter"));
    }
    if last.value_range.end != bytes.len() {
        return Err(Error::invalid_key_file("KEY payload does not end the blob"));
    }
    Ok(last.value_range.clone())
}

/// Clear key material of a decrypted parameter set
pub fn get_raw_key(params: &ParamSet) -> Result<Zeroizing<Vec<u8>>> {
    let payload = params.get_bytes(Tag::KEY)?;
    let info = KeyBlobInfo::from_bytes(payload)?;
    let material = &payload[KEY_BLOB_INFO_LEN..];
    if info.key_size as usize != material.len() {
        return Err(Error::invalid_key_info(format!(
            "key size {} does not match {} stored bytes",
            info.key_size,
            material.len()
        )));
    }
    Ok(Zeroizing::new(material.to_vec()))
}
