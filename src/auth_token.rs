//! User auth tokens and the lazily generated key that signs them.

use crate::crypto::CryptoProvider;
use crate::{Error, KeyDigest, Result};
use std::sync::{Arc, Mutex, OnceLock};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Auth token HMAC key size
pub const AUTH_TOKEN_KEY_LEN: usize = 32;
/// Serialized [`UserAuthToken`] size
pub const USER_AUTH_TOKEN_LEN: usize = 116;
/// Trailing signature size
pub const AUTH_TOKEN_SIGN_LEN: usize = 32;
/// Auth token challenge size
pub const AUTH_TOKEN_CHALLENGE_LEN: usize = 32;

/// Proof of a recent user authentication, issued by the user auth service
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAuthToken {
    /// Token format version
    pub version: u32,
    /// Challenge the authentication answered
    pub challenge: [u8; AUTH_TOKEN_CHALLENGE_LEN],
    /// Secure user id
    pub secure_uid: u64,
    /// Enrolled credential set id
    pub enrolled_id: u64,
    /// Credential id
    pub credential_id: u64,
    /// Authentication time (ms)
    pub time: u64,
    /// Trust level of the authentication
    pub auth_trust_level: u32,
    /// Authenticator type (PIN, face, fingerprint...)
    pub auth_type: u32,
    /// Authentication mode
    pub auth_mode: u32,
    /// Security level of the authenticator
    pub security_level: u32,
    /// HMAC-SHA256 over all preceding fields
    pub sign: [u8; AUTH_TOKEN_SIGN_LEN],
}

impl UserAuthToken {
    /// Little-endian encoding, [`USER_AUTH_TOKEN_LEN`] bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(USER_AUTH_TOKEN_LEN);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&self.secure_uid.to_le_bytes());
        out.extend_from_slice(&self.enrolled_id.to_le_bytes());
        out.extend_from_slice(&self.credential_id.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.auth_trust_level.to_le_bytes());
        out.extend_from_slice(&self.auth_type.to_le_bytes());
        out.extend_from_slice(&self.auth_mode.to_le_bytes());
        out.extend_from_slice(&self.security_level.to_le_bytes());
        out.extend_from_slice(&self.sign);
        out
    }

    /// Decode from exactly [`USER_AUTH_TOKEN_LEN`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != USER_AUTH_TOKEN_LEN {
            return Err(Error::invalid_argument(
                "auth_token_parse",
                format!("auth token must be {USER_AUTH_TOKEN_LEN} bytes, got {}", bytes.len()),
            ));
        }
        let mut rest = bytes;
        let mut take = |n: usize| split(&mut rest, n);
        let u32_at = |s: &[u8]| u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
        let u64_at = |s: &[u8]| {
            let mut b = [0u8; 8];
            b.copy_from_slice(s);
            u64::from_le_bytes(b)
        };

        let mut token = Self {
            version: u32_at(take(4)),
            ..Self::default()
        };
        token.challenge.copy_from_slice(take(AUTH_TOKEN_CHALLENGE_LEN));
        token.secure_uid = u64_at(take(8));
        token.enrolled_id = u64_at(take(8));
        token.credential_id = u64_at(take(8));
        token.time = u64_at(take(8));
        token.auth_trust_level = u32_at(take(4));
        token.auth_type = u32_at(take(4));
        token.auth_mode = u32_at(take(4));
        token.security_level = u32_at(take(4));
        token.sign.copy_from_slice(take(AUTH_TOKEN_SIGN_LEN));
        Ok(token)
    }
}

fn split<'a>(rest: &mut &'a [u8], n: usize) -> &'a [u8] {
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    head
}

/// Process-wide cache of the auth token HMAC key.
///
/// The key is generated at most once: `get` checks without locking, then
/// takes the generation lock and checks again before generating.
pub struct AuthTokenKeyCache {
    crypto: Arc<dyn CryptoProvider>,
    key: OnceLock<Zeroizing<[u8; AUTH_TOKEN_KEY_LEN]>>,
    gen_lock: Mutex<()>,
}

impl AuthTokenKeyCache {
    /// Empty cache
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            key: OnceLock::new(),
            gen_lock: Mutex::new(()),
        }
    }

    /// Try to generate the key now. A failure is logged and generation is
    /// retried on the next [`Self::get`].
    pub fn init(&self) {
        if let Err(e) = self.get() {
            tracing::warn!(error = %e, "auth token key generation deferred");
        }
    }

    /// Whether the key has been generated
    pub fn is_initialized(&self) -> bool {
        self.key.get().is_some()
    }

    /// The cached key, generating it on first use
    pub fn get(&self) -> Result<&[u8; AUTH_TOKEN_KEY_LEN]> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let _guard = self
            .gen_lock
            .lock()
            .map_err(|_| Error::storage("auth_token_key", "lock poisoned"))?;
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let mut fresh = Zeroizing::new([0u8; AUTH_TOKEN_KEY_LEN]);
        self.crypto.fill_random(&mut fresh[..])?;
        let key = self.key.get_or_init(|| fresh);
        tracing::info!("auth token key generated");
        Ok(key)
    }

    /// Drop the cached key; the next [`Self::get`] generates a new one
    pub fn teardown(&mut self) {
        // Zeroizing wipes the old key on drop
        self.key = OnceLock::new();
        tracing::debug!("auth token key cleared");
    }

    /// Compute the trailing signature of `token` and store it in `token.sign`
    pub fn sign_token(&self, token: &mut UserAuthToken) -> Result<()> {
        let key = self.get()?;
        let bytes = token.to_bytes();
        let mac = self.crypto.hmac(
            KeyDigest::Sha256,
            key,
            &bytes[..USER_AUTH_TOKEN_LEN - AUTH_TOKEN_SIGN_LEN],
        )?;
        token.sign.copy_from_slice(&mac);
        Ok(())
    }

    /// Check the trailing HMAC-SHA256 of a serialized token.
    ///
    /// # Errors
    ///
    /// [`Error::KeyAuthVerifyFailed`] on a signature mismatch.
    pub fn verify_auth_token_sign(&self, token: &[u8]) -> Result<UserAuthToken> {
        let parsed = UserAuthToken::from_bytes(token)?;
        let key = self.get()?;
        let (body, sign) = token.split_at(USER_AUTH_TOKEN_LEN - AUTH_TOKEN_SIGN_LEN);
        let expected = self.crypto.hmac(KeyDigest::Sha256, key, body)?;
        if !bool::from(expected.ct_eq(sign)) {
            tracing::debug!("auth token signature mismatch");
            return Err(Error::KeyAuthVerifyFailed);
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCrypto;

    fn sample() -> UserAuthToken {
        UserAuthToken {
            version: 1,
            challenge: [7; 32],
            secure_uid: 1001,
            enrolled_id: 2,
            credential_id: 3,
            time: 1_700_000_000_000,
            auth_trust_level: 10000,
            auth_type: 1,
            auth_mode: 0,
            security_level: 2,
            sign: [0; 32],
        }
    }

    #[test]
    fn test_token_layout() {
        let token = sample();
        let bytes = token.to_bytes();
        assert_eq!(bytes.len(), USER_AUTH_TOKEN_LEN);
        assert_eq!(&bytes[36..44], &1001u64.to_le_bytes());
        assert_eq!(UserAuthToken::from_bytes(&bytes).unwrap(), token);
        assert!(UserAuthToken::from_bytes(&bytes[1..]).is_err());
    }

    #[test]
    fn test_key_generated_once() {
        let cache = AuthTokenKeyCache::new(Arc::new(SoftwareCrypto::new()));
        assert!(!cache.is_initialized());
        cache.init();
        assert!(cache.is_initialized());
        let first = *cache.get().unwrap();
        assert_eq!(*cache.get().unwrap(), first);
    }

    #[test]
    fn test_concurrent_get_agrees() {
        let cache = Arc::new(AuthTokenKeyCache::new(Arc::new(SoftwareCrypto::new())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || *cache.get().unwrap())
            })
            .collect();
        let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_sign_and_verify() {
        let cache = AuthTokenKeyCache::new(Arc::new(SoftwareCrypto::new()));
        let mut token = sample();
        cache.sign_token(&mut token).unwrap();
        let bytes = token.to_bytes();
        assert_eq!(cache.verify_auth_token_sign(&bytes).unwrap(), token);

        let mut tampered = bytes.clone();
        tampered[40] ^= 1;
        assert!(matches!(
            cache.verify_auth_token_sign(&tampered),
            Err(Error::KeyAuthVerifyFailed)
        ));
    }

    #[test]
    fn test_teardown_rotates_key() {
        let mut cache = AuthTokenKeyCache::new(Arc::new(SoftwareCrypto::new()));
        let mut token = sample();
        cache.sign_token(&mut token).unwrap();
        cache.teardown();
        assert!(!cache.is_initialized());
        assert!(cache.verify_auth_token_sign(&token.to_bytes()).is_err());
    }
}
