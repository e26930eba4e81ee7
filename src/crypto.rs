//! Cryptographic primitives behind a provider trait.
//!
//! The engine never calls a cipher directly; everything goes through
//! [`CryptoProvider`] so that a hardware-backed implementation can be slotted
//! in. [`SoftwareCrypto`] is the RustCrypto-backed implementation.
//!
//! # Supported primitives in [`SoftwareCrypto`]
//!
//! - AEAD: AES-128-GCM and AES-256-GCM with 12-byte nonces and 16-byte tags
//! - Hash / HMAC: SHA-224 (hash only), SHA-256, SHA-384, SHA-512
//! - KDF: PBKDF2-HMAC and HKDF over SHA-256/384/512
//! - Signatures: Ed25519, ECDSA P-256 with SHA-256
//! - Agreement: X25519
//!
//! RSA keys pass through the material codec but have no primitives here.
//!
//! # Examples
//!
//! ```
//! use rust_keyblob::crypto::{CryptoProvider, SoftwareCrypto};
//!
//! # fn main() -> rust_keyblob::Result<()> {
//! let crypto = SoftwareCrypto::new();
//! let mut key = [0u8; 32];
//! crypto.fill_random(&mut key)?;
//! let nonce = [7u8; 12];
//!
//! let sealed = crypto.aead_encrypt(&key, &nonce, b"header", b"secret")?;
//! let opened = crypto.aead_decrypt(&key, &nonce, b"header", &sealed)?;
//! assert_eq!(&opened[..], b"secret");
//! assert!(crypto.aead_decrypt(&key, &nonce, b"other", &sealed).is_err());
//! # Ok(())
//! # }
//! ```

use crate::material::{self, RawKey, CURVE25519_KEY_BYTES};
use crate::{Error, KeyAlg, KeyDigest, Result};
use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use hmac::{Hmac, Mac};
use rand_chacha::ChaCha20Rng;
use rand_core::{CryptoRng, RngCore, SeedableRng};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::sync::Mutex;
use zeroize::Zeroizing;

/// AES-GCM nonce size
pub const AES_GCM_NONCE_SIZE: usize = 12;
/// AES-GCM tag size
pub const AES_GCM_TAG_SIZE: usize = 16;

/// Trait for cryptographically secure random number generators.
///
/// Extends [`RngCore`] and [`CryptoRng`] with a fallible fill that reports
/// through the crate error type.
pub trait SecureRandom: RngCore + CryptoRng {
    /// Fill a buffer with cryptographically secure random bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the RNG fails to generate randomness.
    fn fill_secure_bytes(&mut self, dest: &mut [u8]) -> Result<()> {
        self.try_fill_bytes(dest)
            .map_err(|e| Error::crypto("fill_bytes", format!("failed to fill secure bytes: {e}")))
    }
}

/// Blanket implementation for any crypto RNG
impl<T> SecureRandom for T where T: RngCore + CryptoRng {}

/// Capability set the key-blob engine consumes.
///
/// Key material arguments use the layout of [`crate::material`]. Secret
/// outputs come back in self-wiping buffers.
pub trait CryptoProvider: Send + Sync {
    /// Fill `buf` from a CSPRNG
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;

    /// AEAD-encrypt; returns `ciphertext ‖ tag`
    fn aead_encrypt(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// AEAD-decrypt `ciphertext ‖ tag`.
    ///
    /// # Errors
    ///
    /// [`Error::KeyAuthVerifyFailed`] when the tag does not verify.
    fn aead_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Message digest
    fn hash(&self, digest: KeyDigest, data: &[u8]) -> Result<Vec<u8>>;

    /// HMAC
    fn hmac(&self, digest: KeyDigest, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    /// Password-based KDF (PBKDF2-HMAC) producing `out_len` bytes
    fn kdf(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        digest: KeyDigest,
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// HKDF extract-and-expand producing `out_len` bytes
    fn hkdf(
        &self,
        digest: KeyDigest,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Generate a fresh key and return it as key material
    fn generate_key(&self, alg: KeyAlg, key_size: u32) -> Result<Zeroizing<Vec<u8>>>;

    /// Public key bytes for asymmetric material
    fn public_key(&self, alg: KeyAlg, material: &[u8]) -> Result<Vec<u8>>;

    /// Sign `message` with private material
    fn sign(&self, alg: KeyAlg, material: &[u8], digest: KeyDigest, message: &[u8]) -> Result<Vec<u8>>;

    /// Verify `signature` over `message` against public key bytes.
    ///
    /// # Errors
    ///
    /// [`Error::VerificationFailed`] when the signature does not verify.
    fn verify(
        &self,
        alg: KeyAlg,
        public_key: &[u8],
        digest: KeyDigest,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()>;

    /// Key agreement between private material and a peer public key
    fn agree(&self, alg: KeyAlg, material: &[u8], peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// RustCrypto-backed [`CryptoProvider`]
pub struct SoftwareCrypto {
    rng: Mutex<ChaCha20Rng>,
}

impl Default for SoftwareCrypto {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareCrypto {
    /// Provider with a ChaCha20 RNG seeded from system entropy
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    /// Provider with a deterministic RNG, for tests
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha20Rng) -> Result<T>) -> Result<T> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::crypto("rng", "rng lock poisoned"))?;
        f(&mut rng)
    }

    fn check_nonce(nonce: &[u8]) -> Result<()> {
        if nonce.len() != AES_GCM_NONCE_SIZE {
            return Err(Error::invalid_argument(
                "aead_nonce",
                format!("AES-GCM requires a 12-byte nonce, got {}", nonce.len()),
            ));
        }
        Ok(())
    }
}

fn to_array<const N: usize>(bytes: &[u8], what: &str) -> Result<Zeroizing<[u8; N]>> {
    if bytes.len() != N {
        return Err(Error::invalid_key_info(format!(
            "{what} must be {N} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; N]);
    out.copy_from_slice(bytes);
    Ok(out)
}

fn mac_with<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|e| Error::crypto("hmac", format!("invalid HMAC key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn curve25519_parts(material: &[u8], alg: KeyAlg) -> Result<(&[u8], &[u8])> {
    match material::material_to_raw(material, alg)? {
        RawKey::Curve25519 { public, private } => Ok((public, private)),
        _ => Err(Error::invalid_key_info("expected curve25519 material")),
    }
}

fn ecc_parts(material: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    match material::material_to_raw(material, KeyAlg::Ecc)? {
        RawKey::Ecc { x, y, z } => Ok((x, y, z)),
        _ => Err(Error::invalid_key_info("expected ECC material")),
    }
}

impl CryptoProvider for SoftwareCrypto {
    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        self.with_rng(|rng| rng.fill_secure_bytes(buf))
    }

    fn aead_encrypt(&self, key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        Self::check_nonce(nonce)?;
        let payload = Payload { msg: plaintext, aad };
        let nonce = aes_gcm::Nonce::from_slice(nonce);
        let sealed = match key.len() {
            16 => Aes128Gcm::new(aes_gcm::Key::<Aes128Gcm>::from_slice(key)).encrypt(nonce, payload),
            32 => Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key)).encrypt(nonce, payload),
            other => {
                return Err(Error::invalid_argument(
                    "aead_encrypt",
                    format!("AES-GCM key must be 16 or 32 bytes, got {other}"),
                ))
            }
        };
        sealed.map_err(|e| Error::crypto("aead_encrypt", format!("AES-GCM encryption failed: {e}")))
    }

    fn aead_decrypt(
        &self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        Self::check_nonce(nonce)?;
        if ciphertext.len() < AES_GCM_TAG_SIZE {
            return Err(Error::invalid_argument(
                "aead_decrypt",
                "ciphertext shorter than the tag",
            ));
        }
        let payload = Payload { msg: ciphertext, aad };
        let nonce = aes_gcm::Nonce::from_slice(nonce);
        let opened = match key.len() {
            16 => Aes128Gcm::new(aes_gcm::Key::<Aes128Gcm>::from_slice(key)).decrypt(nonce, payload),
            32 => Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key)).decrypt(nonce, payload),
            other => {
                return Err(Error::invalid_argument(
                    "aead_decrypt",
                    format!("AES-GCM key must be 16 or 32 bytes, got {other}"),
                ))
            }
        };
        opened.map(Zeroizing::new).map_err(|_| {
            tracing::debug!("AES-GCM tag verification failed");
            Error::KeyAuthVerifyFailed
        })
    }

    fn hash(&self, digest: KeyDigest, data: &[u8]) -> Result<Vec<u8>> {
        Ok(match digest {
            KeyDigest::Sha224 => Sha224::digest(data).to_vec(),
            KeyDigest::Sha256 => Sha256::digest(data).to_vec(),
            KeyDigest::Sha384 => Sha384::digest(data).to_vec(),
            KeyDigest::Sha512 => Sha512::digest(data).to_vec(),
            other => return Err(Error::not_supported(format!("hash {other:?}"))),
        })
    }

    fn hmac(&self, digest: KeyDigest, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match digest {
            KeyDigest::Sha256 => mac_with::<Hmac<Sha256>>(key, data),
            KeyDigest::Sha384 => mac_with::<Hmac<Sha384>>(key, data),
            KeyDigest::Sha512 => mac_with::<Hmac<Sha512>>(key, data),
            other => Err(Error::not_supported(format!("HMAC with {other:?}"))),
        }
    }

    fn kdf(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        digest: KeyDigest,
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if iterations == 0 || out_len == 0 {
            return Err(Error::invalid_argument(
                "pbkdf2",
                "iterations and output length must be non-zero",
            ));
        }
        let mut out = Zeroizing::new(vec![0u8; out_len]);
        match digest {
            KeyDigest::Sha256 => pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
            KeyDigest::Sha384 => pbkdf2::pbkdf2_hmac::<Sha384>(password, salt, iterations, &mut out),
            KeyDigest::Sha512 => pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out),
            other => return Err(Error::not_supported(format!("PBKDF2 with {other:?}"))),
        }
        Ok(out)
    }

    fn hkdf(
        &self,
        digest: KeyDigest,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        use hkdf::Hkdf;

        let mut okm = Zeroizing::new(vec![0u8; out_len]);
        let expanded = match digest {
            KeyDigest::Sha256 => Hkdf::<Sha256>::new(Some(salt), ikm).expand(info, &mut okm),
            KeyDigest::Sha384 => Hkdf::<Sha384>::new(Some(salt), ikm).expand(info, &mut okm),
            KeyDigest::Sha512 => Hkdf::<Sha512>::new(Some(salt), ikm).expand(info, &mut okm),
            other => return Err(Error::not_supported(format!("HKDF with {other:?}"))),
        };
        expanded.map_err(|e| Error::crypto("hkdf_expand", format!("HKDF expansion failed: {e}")))?;
        Ok(okm)
    }

    fn generate_key(&self, alg: KeyAlg, key_size: u32) -> Result<Zeroizing<Vec<u8>>> {
        match alg {
            KeyAlg::Aes => {
                if key_size != 128 && key_size != 256 {
                    return Err(Error::not_supported(format!("AES-{key_size}")));
                }
                let mut key = Zeroizing::new(vec![0u8; key_size as usize / 8]);
                self.fill_random(&mut key)?;
                Ok(key)
            }
            KeyAlg::Hmac | KeyAlg::Hkdf | KeyAlg::Pbkdf2 => {
                if key_size == 0 || key_size % 8 != 0 || key_size > 8192 {
                    return Err(Error::invalid_argument(
                        "generate_key",
                        format!("invalid {alg:?} key size {key_size}"),
                    ));
                }
                let mut key = Zeroizing::new(vec![0u8; key_size as usize / 8]);
                self.fill_random(&mut key)?;
                Ok(key)
            }
            KeyAlg::Ed25519 => {
                if key_size != 256 {
                    return Err(Error::not_supported(format!("Ed25519 key size {key_size}")));
                }
                let signing = self.with_rng(|rng| Ok(ed25519_dalek::SigningKey::generate(rng)))?;
                let public = signing.verifying_key().to_bytes();
                let private = Zeroizing::new(signing.to_bytes());
                material::raw_to_material(
                    &RawKey::Curve25519 {
                        public: &public,
                        private: &private[..],
                    },
                    alg,
                    key_size,
                )
            }
            KeyAlg::X25519 => {
                if key_size != 256 {
                    return Err(Error::not_supported(format!("X25519 key size {key_size}")));
                }
                let mut seed = Zeroizing::new([0u8; CURVE25519_KEY_BYTES]);
                self.fill_random(&mut seed[..])?;
                let secret = x25519_dalek::StaticSecret::from(*seed);
                let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
                let private = Zeroizing::new(secret.to_bytes());
                material::raw_to_material(
                    &RawKey::Curve25519 {
                        public: &public,
                        private: &private[..],
                    },
                    alg,
                    key_size,
                )
            }
            KeyAlg::Ecc => {
                if key_size != 256 {
                    return Err(Error::not_supported(format!("ECC key size {key_size}")));
                }
                let signing = self.with_rng(|rng| Ok(p256::ecdsa::SigningKey::random(rng)))?;
                let point = signing.verifying_key().to_encoded_point(false);
                let (x, y) = match (point.x(), point.y()) {
                    (Some(x), Some(y)) => (x.to_vec(), y.to_vec()),
                    _ => return Err(Error::crypto("generate_key", "ECC point at infinity")),
                };
                let z = Zeroizing::new(signing.to_bytes().to_vec());
                material::raw_to_material(&RawKey::Ecc { x: &x, y: &y, z: &z }, alg, key_size)
            }
            other => Err(Error::not_supported(format!("key generation for {other:?}"))),
        }
    }

    fn public_key(&self, alg: KeyAlg, material: &[u8]) -> Result<Vec<u8>> {
        match alg {
            KeyAlg::Ed25519 | KeyAlg::X25519 => {
                let (public, _) = curve25519_parts(material, alg)?;
                if public.len() != CURVE25519_KEY_BYTES {
                    return Err(Error::invalid_key_info("curve25519 public key must be 32 bytes"));
                }
                Ok(public.to_vec())
            }
            KeyAlg::Ecc => {
                let (x, y, _) = ecc_parts(material)?;
                let mut out = Vec::with_capacity(1 + x.len() + y.len());
                out.push(0x04);
                out.extend_from_slice(x);
                out.extend_from_slice(y);
                Ok(out)
            }
            KeyAlg::Rsa => match material::material_to_raw(material, alg)? {
                RawKey::Rsa { n, e, .. } => {
                    let header = material::read_header(material)?;
                    Ok(material::raw_to_material(&RawKey::Rsa { n, e, d: &[] }, alg, header.key_size)?.to_vec())
                }
                _ => Err(Error::invalid_key_info("expected RSA material")),
            },
            other => Err(Error::not_supported(format!("public key of {other:?}"))),
        }
    }

    fn sign(&self, alg: KeyAlg, material: &[u8], digest: KeyDigest, message: &[u8]) -> Result<Vec<u8>> {
        match alg {
            KeyAlg::Ed25519 => {
                use ed25519_dalek::Signer;

                let (_, private) = curve25519_parts(material, alg)?;
                let seed = to_array::<32>(private, "Ed25519 private key")?;
                let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
                Ok(signing.sign(message).to_bytes().to_vec())
            }
            KeyAlg::Ecc => {
                use p256::ecdsa::signature::Signer;

                if digest != KeyDigest::Sha256 {
                    return Err(Error::not_supported(format!("ECDSA P-256 with {digest:?}")));
                }
                let (_, _, z) = ecc_parts(material)?;
                let signing = p256::ecdsa::SigningKey::from_slice(z)
                    .map_err(|e| Error::invalid_key_info(format!("invalid P-256 scalar: {e}")))?;
                let signature: p256::ecdsa::Signature = signing
                    .try_sign(message)
                    .map_err(|e| Error::crypto("ecdsa_sign", e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
            other => Err(Error::not_supported(format!("signing with {other:?}"))),
        }
    }

    fn verify(
        &self,
        alg: KeyAlg,
        public_key: &[u8],
        digest: KeyDigest,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        match alg {
            KeyAlg::Ed25519 => {
                use ed25519_dalek::Verifier;

                let public = to_array::<32>(public_key, "Ed25519 public key")?;
                let verifying = ed25519_dalek::VerifyingKey::from_bytes(&public)
                    .map_err(|e| Error::invalid_argument("ed25519_verify", e.to_string()))?;
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| Error::VerificationFailed)?;
                verifying
                    .verify(message, &signature)
                    .map_err(|_| Error::VerificationFailed)
            }
            KeyAlg::Ecc => {
                use p256::ecdsa::signature::Verifier;

                if digest != KeyDigest::Sha256 {
                    return Err(Error::not_supported(format!("ECDSA P-256 with {digest:?}")));
                }
                let verifying = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                    .map_err(|e| Error::invalid_argument("ecdsa_verify", e.to_string()))?;
                let signature = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| Error::VerificationFailed)?;
                verifying
                    .verify(message, &signature)
                    .map_err(|_| Error::VerificationFailed)
            }
            other => Err(Error::not_supported(format!("verification with {other:?}"))),
        }
    }

    fn agree(&self, alg: KeyAlg, material: &[u8], peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match alg {
            KeyAlg::X25519 => {
                let (_, private) = curve25519_parts(material, alg)?;
                let secret = x25519_dalek::StaticSecret::from(*to_array::<32>(private, "X25519 private key")?);
                let peer = x25519_dalek::PublicKey::from(*to_array::<32>(peer_public, "X25519 peer key")?);
                let shared = secret.diffie_hellman(&peer);
                if !shared.was_contributory() {
                    return Err(Error::crypto("x25519_agree", "non-contributory peer key"));
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            other => Err(Error::not_supported(format!("agreement with {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aead_round_trip_and_tamper() {
        let crypto = SoftwareCrypto::from_seed(42);
        let key = [0x11u8; 32];
        let nonce = [0x22u8; 12];
        let sealed = crypto.aead_encrypt(&key, &nonce, b"aad", b"plaintext").unwrap();
        assert_eq!(sealed.len(), 9 + AES_GCM_TAG_SIZE);

        let opened = crypto.aead_decrypt(&key, &nonce, b"aad", &sealed).unwrap();
        assert_eq!(&opened[..], b"plaintext");

        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert!(matches!(
            crypto.aead_decrypt(&key, &nonce, b"aad", &tampered),
            Err(Error::KeyAuthVerifyFailed)
        ));
        assert!(matches!(
            crypto.aead_decrypt(&key, &nonce, b"other", &sealed),
            Err(Error::KeyAuthVerifyFailed)
        ));
        assert!(crypto.aead_encrypt(&key, &[0u8; 16], b"", b"x").is_err());
        assert!(crypto.aead_encrypt(&[0u8; 24], &nonce, b"", b"x").is_err());
    }

    #[test]
    fn test_aes128_gcm() {
        let crypto = SoftwareCrypto::new();
        let key = [0x33u8; 16];
        let nonce = [0u8; 12];
        let sealed = crypto.aead_encrypt(&key, &nonce, b"", b"short key").unwrap();
        assert_eq!(&crypto.aead_decrypt(&key, &nonce, b"", &sealed).unwrap()[..], b"short key");
    }

    #[test]
    fn test_pbkdf2_is_deterministic() {
        let crypto = SoftwareCrypto::new();
        let a = crypto.kdf(b"main key", b"salt", 1000, KeyDigest::Sha256, 32).unwrap();
        let b = crypto.kdf(b"main key", b"salt", 1000, KeyDigest::Sha256, 32).unwrap();
        let c = crypto.kdf(b"main key", b"salt2", 1000, KeyDigest::Sha256, 32).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(crypto.kdf(b"k", b"s", 0, KeyDigest::Sha256, 32).is_err());
        assert!(crypto.kdf(b"k", b"s", 1, KeyDigest::Md5, 32).is_err());
    }

    #[test]
    fn test_hash_and_hmac_lengths() {
        let crypto = SoftwareCrypto::new();
        assert_eq!(crypto.hash(KeyDigest::Sha256, b"abc").unwrap().len(), 32);
        assert_eq!(crypto.hash(KeyDigest::Sha512, b"abc").unwrap().len(), 64);
        assert_eq!(crypto.hmac(KeyDigest::Sha384, b"key", b"abc").unwrap().len(), 48);
        assert!(crypto.hash(KeyDigest::Md5, b"abc").is_err());
    }

    #[test]
    fn test_ed25519_generate_sign_verify() {
        let crypto = SoftwareCrypto::from_seed(7);
        let material = crypto.generate_key(KeyAlg::Ed25519, 256).unwrap();
        let public = crypto.public_key(KeyAlg::Ed25519, &material).unwrap();
        let sig = crypto
            .sign(KeyAlg::Ed25519, &material, KeyDigest::None, b"message")
            .unwrap();
        crypto
            .verify(KeyAlg::Ed25519, &public, KeyDigest::None, b"message", &sig)
            .unwrap();
        assert!(matches!(
            crypto.verify(KeyAlg::Ed25519, &public, KeyDigest::None, b"messagf", &sig),
            Err(Error::VerificationFailed)
        ));
    }

    #[test]
    fn test_ecc_generate_sign_verify() {
        let crypto = SoftwareCrypto::from_seed(9);
        let material = crypto.generate_key(KeyAlg::Ecc, 256).unwrap();
        let public = crypto.public_key(KeyAlg::Ecc, &material).unwrap();
        assert_eq!(public.len(), 65);
        let sig = crypto
            .sign(KeyAlg::Ecc, &material, KeyDigest::Sha256, b"payload")
            .unwrap();
        crypto
            .verify(KeyAlg::Ecc, &public, KeyDigest::Sha256, b"payload", &sig)
            .unwrap();
        let mut bad = sig.clone();
        bad[10] ^= 0xFF;
        assert!(crypto
            .verify(KeyAlg::Ecc, &public, KeyDigest::Sha256, b"payload", &bad)
            .is_err());
        assert!(crypto
            .sign(KeyAlg::Ecc, &material, KeyDigest::Sha512, b"payload")
            .is_err());
    }

    #[test]
    fn test_x25519_agreement_is_symmetric() {
        let crypto = SoftwareCrypto::from_seed(3);
        let a = crypto.generate_key(KeyAlg::X25519, 256).unwrap();
        let b = crypto.generate_key(KeyAlg::X25519, 256).unwrap();
        let a_pub = crypto.public_key(KeyAlg::X25519, &a).unwrap();
        let b_pub = crypto.public_key(KeyAlg::X25519, &b).unwrap();
        let ab = crypto.agree(KeyAlg::X25519, &a, &b_pub).unwrap();
        let ba = crypto.agree(KeyAlg::X25519, &b, &a_pub).unwrap();
        assert_eq!(ab, ba);
        assert!(crypto.agree(KeyAlg::X25519, &a, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_symmetric_generation_sizes() {
        let crypto = SoftwareCrypto::new();
        assert_eq!(crypto.generate_key(KeyAlg::Aes, 256).unwrap().len(), 32);
        assert_eq!(crypto.generate_key(KeyAlg::Hmac, 512).unwrap().len(), 64);
        assert!(crypto.generate_key(KeyAlg::Aes, 100).is_err());
        assert!(crypto.generate_key(KeyAlg::Rsa, 2048).is_err());
    }
}
