//! rust-keyblob: key-blob lifecycle engine for a hardware-backed keystore
//!
//! This crate turns in-memory cryptographic keys into confidentiality- and
//! integrity-protected blobs and back again, under a root key hierarchy:
//!
//! - [`param`]: tag-keyed parameter sets with a bounds-checked binary layout
//! - [`material`]: algorithm-specific key material codec
//! - [`rkc`]: root key component file, main key and per-blob key derivation
//! - [`keyblob`]: AEAD sealing and opening of key blobs
//! - [`auth`]: authorization matcher between a key's policy and a request
//! - [`storage`]: alias-to-path mapping and primary/backup file redundancy
//! - [`service`]: an in-process keystore wiring everything together

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

pub mod auth;
pub mod auth_token;
pub mod crypto;
pub mod error;
pub mod keyblob;
pub mod keynode;
pub mod material;
pub mod param;
pub mod rkc;
pub mod service;
pub mod storage;

pub use error::{Error, ErrorCode, Result};
pub use service::{Keystore, KeystoreConfig};

/// Maximum length of a key alias in bytes
pub const MAX_KEY_ALIAS_LEN: usize = 64;
/// Maximum length of a process name in bytes
pub const MAX_PROCESS_NAME_LEN: usize = 50;
/// Maximum length of a user id in bytes
pub const MAX_USER_ID_LEN: usize = 64;

/// Key algorithms known to the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlg {
    /// RSA
    Rsa,
    /// Elliptic curve (NIST P-256 in the software provider)
    Ecc,
    /// DSA
    Dsa,
    /// AES
    Aes,
    /// HMAC
    Hmac,
    /// HKDF
    Hkdf,
    /// PBKDF2
    Pbkdf2,
    /// ECDH agreement
    Ecdh,
    /// X25519 agreement
    X25519,
    /// Ed25519 signature
    Ed25519,
    /// Finite-field Diffie-Hellman
    Dh,
    /// SM2
    Sm2,
    /// SM3
    Sm3,
    /// SM4
    Sm4,
}

impl KeyAlg {
    /// Wire value stored in the `ALGORITHM` tag
    pub const fn as_u32(&self) -> u32 {
        match self {
            Self::Rsa => 1,
            Self::Ecc => 2,
            Self::Dsa => 3,
            Self::Aes => 20,
            Self::Hmac => 50,
            Self::Hkdf => 51,
            Self::Pbkdf2 => 52,
            Self::Ecdh => 100,
            Self::X25519 => 101,
            Self::Ed25519 => 102,
            Self::Dh => 103,
            Self::Sm2 => 150,
            Self::Sm3 => 151,
            Self::Sm4 => 152,
        }
    }

    /// Parse a wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            1 => Self::Rsa,
            2 => Self::Ecc,
            3 => Self::Dsa,
            20 => Self::Aes,
            50 => Self::Hmac,
            51 => Self::Hkdf,
            52 => Self::Pbkdf2,
            100 => Self::Ecdh,
            101 => Self::X25519,
            102 => Self::Ed25519,
            103 => Self::Dh,
            150 => Self::Sm2,
            151 => Self::Sm3,
            152 => Self::Sm4,
            other => return Err(Error::not_supported(format!("key algorithm {other}"))),
        })
    }

    /// Whether keys of this algorithm are a single secret byte string
    pub const fn is_symmetric(&self) -> bool {
        matches!(
            self,
            Self::Aes | Self::Hmac | Self::Hkdf | Self::Pbkdf2 | Self::Sm3 | Self::Sm4
        )
    }
}

/// Bitmask of permitted key purposes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyPurpose(u32);

impl KeyPurpose {
    /// Encrypt
    pub const ENCRYPT: Self = Self(1);
    /// Decrypt
    pub const DECRYPT: Self = Self(2);
    /// Sign
    pub const SIGN: Self = Self(4);
    /// Verify
    pub const VERIFY: Self = Self(8);
    /// Derive
    pub const DERIVE: Self = Self(16);
    /// Wrap
    pub const WRAP: Self = Self(32);
    /// Unwrap
    pub const UNWRAP: Self = Self(64);
    /// MAC
    pub const MAC: Self = Self(128);
    /// Agree
    pub const AGREE: Self = Self(256);

    const ALL: u32 = 0x1FF;

    /// Build from raw bits, rejecting unknown bits
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::invalid_argument(
                "key_purpose",
                format!("unknown purpose bits {bits:#x}"),
            ));
        }
        Ok(Self(bits))
    }

    /// Raw bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set in `self`
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no bit is set
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if exactly one purpose bit is set
    pub const fn is_single(&self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }
}

impl BitOr for KeyPurpose {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Digest algorithms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyDigest {
    /// No digest
    None,
    /// MD5
    Md5,
    /// SM3
    Sm3,
    /// SHA-1
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl KeyDigest {
    /// Wire value stored in the `DIGEST` tag
    pub const fn as_u32(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Md5 => 1,
            Self::Sm3 => 2,
            Self::Sha1 => 10,
            Self::Sha224 => 11,
            Self::Sha256 => 12,
            Self::Sha384 => 13,
            Self::Sha512 => 14,
        }
    }

    /// Parse a wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Md5,
            2 => Self::Sm3,
            10 => Self::Sha1,
            11 => Self::Sha224,
            12 => Self::Sha256,
            13 => Self::Sha384,
            14 => Self::Sha512,
            other => return Err(Error::not_supported(format!("digest {other}"))),
        })
    }
}

/// Padding schemes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyPadding {
    /// No padding
    None,
    /// RSA-OAEP
    Oaep,
    /// RSA-PSS
    Pss,
    /// PKCS#1 v1.5
    Pkcs1V15,
    /// PKCS#5
    Pkcs5,
    /// PKCS#7
    Pkcs7,
}

impl KeyPadding {
    /// Wire value stored in the `PADDING` tag
    pub const fn as_u32(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Oaep => 1,
            Self::Pss => 2,
            Self::Pkcs1V15 => 3,
            Self::Pkcs5 => 4,
            Self::Pkcs7 => 5,
        }
    }

    /// Parse a wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::None,
            1 => Self::Oaep,
            2 => Self::Pss,
            3 => Self::Pkcs1V15,
            4 => Self::Pkcs5,
            5 => Self::Pkcs7,
            other => return Err(Error::not_supported(format!("padding {other}"))),
        })
    }
}

/// Symmetric cipher block modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockMode {
    /// ECB
    Ecb,
    /// CBC
    Cbc,
    /// CTR
    Ctr,
    /// OFB
    Ofb,
    /// CCM
    Ccm,
    /// GCM
    Gcm,
}

impl BlockMode {
    /// Wire value stored in the `BLOCK_MODE` tag
    pub const fn as_u32(&self) -> u32 {
        match self {
            Self::Ecb => 1,
            Self::Cbc => 2,
            Self::Ctr => 3,
            Self::Ofb => 4,
            Self::Ccm => 31,
            Self::Gcm => 32,
        }
    }

    /// Parse a wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            1 => Self::Ecb,
            2 => Self::Cbc,
            3 => Self::Ctr,
            4 => Self::Ofb,
            31 => Self::Ccm,
            32 => Self::Gcm,
            other => return Err(Error::not_supported(format!("block mode {other}"))),
        })
    }
}

/// How a key came into existence, stamped into every blob
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFlag {
    /// Imported by the caller
    Import,
    /// Generated inside the engine
    Generate,
    /// Result of a key agreement
    Agree,
    /// Result of a key derivation
    Derive,
}

impl KeyFlag {
    /// Wire value stored in the `KEY_FLAG` tag
    pub const fn as_u32(&self) -> u32 {
        match self {
            Self::Import => 1,
            Self::Generate => 2,
            Self::Agree => 3,
            Self::Derive => 4,
        }
    }

    /// Parse a wire value
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            1 => Self::Import,
            2 => Self::Generate,
            3 => Self::Agree,
            4 => Self::Derive,
            other => {
                return Err(Error::invalid_argument(
                    "key_flag",
                    format!("unknown key flag {other}"),
                ))
            }
        })
    }
}

/// The calling process as resolved by the OS integration layer.
///
/// Treated as untrusted: lengths are validated on construction. The identity
/// is mixed into every blob key derivation, so a blob only opens for the
/// identity that created it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    user_id: Vec<u8>,
    process_name: Vec<u8>,
}

impl ProcessIdentity {
    /// Validate and build an identity
    pub fn new(user_id: impl Into<Vec<u8>>, process_name: impl Into<Vec<u8>>) -> Result<Self> {
        let user_id = user_id.into();
        let process_name = process_name.into();
        if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
            return Err(Error::invalid_argument(
                "process_identity",
                format!("user id length {} out of range", user_id.len()),
            ));
        }
        if process_name.is_empty() || process_name.len() > MAX_PROCESS_NAME_LEN {
            return Err(Error::invalid_argument(
                "process_identity",
                format!("process name length {} out of range", process_name.len()),
            ));
        }
        Ok(Self {
            user_id,
            process_name,
        })
    }

    /// User id bytes
    pub fn user_id(&self) -> &[u8] {
        &self.user_id
    }

    /// Process name bytes
    pub fn process_name(&self) -> &[u8] {
        &self.process_name
    }

    /// Unambiguous byte encoding used as the identity prefix of a KDF salt:
    /// `len(user) u32le ‖ user ‖ len(process) u32le ‖ process`.
    pub fn salt_material(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.user_id.len() + self.process_name.len());
        out.extend_from_slice(&(self.user_id.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.user_id);
        out.extend_from_slice(&(self.process_name.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.process_name);
        out
    }
}

impl fmt::Debug for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIdentity")
            .field("user_id", &String::from_utf8_lossy(&self.user_id))
            .field("process_name", &String::from_utf8_lossy(&self.process_name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_wire_values() {
        for alg in [KeyAlg::Rsa, KeyAlg::Ecc, KeyAlg::Aes, KeyAlg::Ed25519, KeyAlg::X25519, KeyAlg::Sm4] {
            assert_eq!(KeyAlg::from_u32(alg.as_u32()).unwrap(), alg);
        }
        assert_eq!(KeyAlg::Ed25519.as_u32(), 102);
        assert!(KeyAlg::Aes.is_symmetric());
        assert!(!KeyAlg::Ed25519.is_symmetric());
        assert!(KeyAlg::from_u32(7).is_err());
    }

    #[test]
    fn test_purpose_bitmask() {
        let sv = KeyPurpose::SIGN | KeyPurpose::VERIFY;
        assert_eq!(sv.bits(), 12);
        assert!(sv.contains(KeyPurpose::SIGN));
        assert!(!KeyPurpose::SIGN.contains(sv));
        assert!(KeyPurpose::SIGN.is_single());
        assert!(!sv.is_single());
        assert!(KeyPurpose::from_bits(0x200).is_err());
    }

    #[test]
    fn test_process_identity_validation() {
        assert!(ProcessIdentity::new("0", "").is_err());
        assert!(ProcessIdentity::new("", "app").is_err());
        assert!(ProcessIdentity::new("0", vec![b'a'; MAX_PROCESS_NAME_LEN + 1]).is_err());

        let a = ProcessIdentity::new("1", "23").unwrap();
        let b = ProcessIdentity::new("12", "3").unwrap();
        assert_ne!(a.salt_material(), b.salt_material());
    }
}
