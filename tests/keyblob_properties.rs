//! Property tests for key blob building, parsing and storage
//!
//! These integration tests verify:
//! - Round trip and tamper detection of sealed blobs
//! - Binding of a blob to the identity it was built for
//! - The KEY-last layout the AEAD associated data relies on
//! - Clear material wiped when sealing fails
//! - Self-healing storage and collision-free file names

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use rust_keyblob::{
    auth::{self, AuthId},
    crypto::{CryptoProvider, SoftwareCrypto},
    keyblob::{EngineConfig, KeyBlobEngine, KeyBlobInfo, KEY_BLOB_INFO_LEN},
    param::{Param, ParamSet, Tag},
    rkc::StaticMainKey,
    storage::{
        decode_file_name, encode_file_name, FileSystem, KeyStore, MemoryFileSystem, StorageConfig,
        StorageType,
    },
    Error, KeyAlg, KeyDigest, KeyFlag, KeyPurpose, ProcessIdentity, Result,
};
use std::collections::HashSet;
use std::sync::Arc;
use zeroize::Zeroizing;

fn weak_config() -> EngineConfig {
    EngineConfig {
        kdf_iterations: 10,
        allow_weak_kdf: true,
        ..EngineConfig::default()
    }
}

fn engine_with(crypto: Arc<dyn CryptoProvider>) -> KeyBlobEngine {
    KeyBlobEngine::new(
        crypto,
        Arc::new(StaticMainKey::new(vec![0x5A; 32]).unwrap()),
        weak_config(),
    )
    .unwrap()
}

fn engine() -> KeyBlobEngine {
    engine_with(Arc::new(SoftwareCrypto::from_seed(42)))
}

fn identity_a() -> ProcessIdentity {
    ProcessIdentity::new("100", "com.example.a").unwrap()
}

fn aes_params() -> ParamSet {
    ParamSet::from_params(&[
        Param::uint(Tag::ALGORITHM, KeyAlg::Aes.as_u32()),
        Param::uint(Tag::PURPOSE, (KeyPurpose::ENCRYPT | KeyPurpose::DECRYPT).bits()),
        Param::uint(Tag::KEY_SIZE, 256),
        Param::bytes(Tag::KEY_ALIAS, b"alias".to_vec()),
    ])
    .unwrap()
}

fn key_range(blob: &[u8]) -> std::ops::Range<usize> {
    ParamSet::scan(blob).unwrap().last().unwrap().value_range.clone()
}

#[test]
fn test_round_trip_recovers_raw_key() {
    let engine = engine();
    for len in [1usize, 16, 32, 65, 300] {
        let raw: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
        let blob = engine
            .build_key_blob(b"alias", KeyFlag::Import, &raw, &aes_params(), &identity_a())
            .unwrap();
        let node = engine.parse_key_blob(&blob, &identity_a()).unwrap();
        assert_eq!(&node.raw_key().unwrap()[..], &raw[..]);
        assert_eq!(
            node.params().get_uint(Tag::KEY_FLAG).unwrap(),
            KeyFlag::Import.as_u32()
        );
    }
}

#[test]
fn test_tamper_with_tag_or_ciphertext_fails_auth() {
    let engine = engine();
    let raw = [0x11u8; 32];
    let blob = engine
        .build_key_blob(b"alias", KeyFlag::Generate, &raw, &aes_params(), &identity_a())
        .unwrap();
    let key = key_range(&blob);
    // salt(16) nonce(12) tag(16) size(4), then the ciphertext
    let tag_start = key.start + 28;
    let tag_end = key.start + 44;
    let ciphertext = key.start + KEY_BLOB_INFO_LEN..key.end;

    let positions = (tag_start..tag_end).chain(ciphertext);
    for byte in positions {
        for bit in 0..8 {
            let mut bad = blob.clone();
            bad[byte] ^= 1 << bit;
            assert!(
                matches!(
                    engine.parse_key_blob(&bad, &identity_a()),
                    Err(Error::KeyAuthVerifyFailed)
                ),
                "flip at byte {byte} bit {bit} was not detected"
            );
        }
    }
}

#[test]
fn test_tamper_with_associated_data_fails_auth() {
    let engine = engine();
    let blob = engine
        .build_key_blob(b"alias", KeyFlag::Generate, &[0x22; 32], &aes_params(), &identity_a())
        .unwrap();
    let entries = ParamSet::scan(&blob).unwrap();
    let alias = entries.iter().find(|e| e.tag == Tag::KEY_ALIAS).unwrap();

    let mut bad = blob.clone();
    bad[alias.value_range.start] ^= 0x20;
    assert!(matches!(
        engine.parse_key_blob(&bad, &identity_a()),
        Err(Error::KeyAuthVerifyFailed)
    ));
}

#[test]
fn test_blob_is_bound_to_process_identity() {
    let engine = engine();
    let blob = engine
        .build_key_blob(b"alias", KeyFlag::Generate, &[0x33; 32], &aes_params(), &identity_a())
        .unwrap();
    let others = [
        ProcessIdentity::new("100", "com.example.b").unwrap(),
        ProcessIdentity::new("101", "com.example.a").unwrap(),
        ProcessIdentity::new("1001", "com.example.a").unwrap(),
        ProcessIdentity::new("10", "0com.example.a").unwrap(),
    ];
    for other in &others {
        assert!(matches!(
            engine.parse_key_blob(&blob, other),
            Err(Error::KeyAuthVerifyFailed)
        ));
    }
    assert!(engine.parse_key_blob(&blob, &identity_a()).is_ok());
}

#[test]
fn test_key_is_last_and_ends_blob() {
    let engine = engine();
    let mut params = ParamSet::new();
    for p in aes_params().without(Tag::KEY_ALIAS).unwrap().iter() {
        params.push(p.clone()).unwrap();
    }
    params
        .add(&[
            Param::bytes(Tag::KEY_ALIAS, b"a much longer alias value".to_vec()),
            Param::ulong(Tag::CREATION_DATETIME, 1_700_000_000_000),
            Param::boolean(Tag::NO_AUTH_REQUIRED, true),
        ])
        .unwrap();
    params.build().unwrap();

    for raw_len in [16usize, 17, 18, 19] {
        let blob = engine
            .build_key_blob(b"alias", KeyFlag::Import, &vec![1; raw_len], &params, &identity_a())
            .unwrap();
        let declared = u32::from_le_bytes(blob[4..8].try_into().unwrap()) as usize;
        let entries = ParamSet::scan(&blob).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.tag, Tag::KEY);
        assert_eq!(last.value_range.end, declared);
        assert_eq!(declared, blob.len());
        assert_eq!(
            entries.iter().filter(|e| e.tag == Tag::KEY).count(),
            1,
            "KEY appears once"
        );
    }
}

#[test]
fn test_salts_are_unique() {
    let engine = engine();
    let mut salts = HashSet::new();
    for _ in 0..1000 {
        let blob = engine
            .build_key_blob(b"same", KeyFlag::Generate, &[0x44; 16], &aes_params(), &identity_a())
            .unwrap();
        let key = key_range(&blob);
        let info = KeyBlobInfo::from_bytes(&blob[key]).unwrap();
        assert!(salts.insert(info.salt), "salt repeated");
    }
    assert_eq!(salts.len(), 1000);
}

/// Delegates to the software provider but refuses to encrypt
struct FailingEncrypt {
    inner: SoftwareCrypto,
}

impl CryptoProvider for FailingEncrypt {
    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        self.inner.fill_random(buf)
    }

    fn aead_encrypt(&self, _: &[u8], _: &[u8], _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
        Err(Error::crypto("aead_encrypt", "injected failure"))
    }

    fn aead_decrypt(&self, key: &[u8], nonce: &[u8], aad: &[u8], ct: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.inner.aead_decrypt(key, nonce, aad, ct)
    }

    fn hash(&self, digest: KeyDigest, data: &[u8]) -> Result<Vec<u8>> {
        self.inner.hash(digest, data)
    }

    fn hmac(&self, digest: KeyDigest, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.inner.hmac(digest, key, data)
    }

    fn kdf(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        digest: KeyDigest,
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.inner.kdf(password, salt, iterations, digest, out_len)
    }

    fn hkdf(
        &self,
        digest: KeyDigest,
        ikm: &[u8],
        salt: &[u8],
        info: &[u8],
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.inner.hkdf(digest, ikm, salt, info, out_len)
    }

    fn generate_key(&self, alg: KeyAlg, key_size: u32) -> Result<Zeroizing<Vec<u8>>> {
        self.inner.generate_key(alg, key_size)
    }

    fn public_key(&self, alg: KeyAlg, material: &[u8]) -> Result<Vec<u8>> {
        self.inner.public_key(alg, material)
    }

    fn sign(&self, alg: KeyAlg, material: &[u8], digest: KeyDigest, message: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign(alg, material, digest, message)
    }

    fn verify(
        &self,
        alg: KeyAlg,
        public_key: &[u8],
        digest: KeyDigest,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        self.inner.verify(alg, public_key, digest, message, signature)
    }

    fn agree(&self, alg: KeyAlg, material: &[u8], peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.inner.agree(alg, material, peer_public)
    }
}

#[test]
fn test_failed_seal_wipes_clear_material() {
    let engine = engine_with(Arc::new(FailingEncrypt {
        inner: SoftwareCrypto::new(),
    }));
    let raw = [0xA5u8; 32];
    let mut staged = engine
        .stage_clear_blob(KeyFlag::Import, &raw, &aes_params())
        .unwrap();
    let range = staged.material_range();
    assert_eq!(&staged.bytes()[range.clone()], &raw[..]);

    let err = engine.seal(&mut staged, &identity_a()).unwrap_err();
    assert!(matches!(err, Error::CryptoEngineError { .. }));
    assert!(!staged.is_sealed());
    assert!(staged.bytes()[range].iter().all(|&b| b == 0));
    assert!(staged.into_bytes().is_err());

    assert!(engine
        .build_key_blob(b"alias", KeyFlag::Import, &raw, &aes_params(), &identity_a())
        .is_err());
}

#[test]
fn test_purpose_bitmask_authorization() {
    let stored = ParamSet::from_params(&[
        Param::uint(Tag::ALGORITHM, KeyAlg::Ed25519.as_u32()),
        Param::uint(Tag::PURPOSE, (KeyPurpose::SIGN | KeyPurpose::VERIFY).bits()),
        Param::uint(Tag::KEY_SIZE, 256),
    ])
    .unwrap();
    let request =
        |bits: u32| ParamSet::from_params(&[Param::uint(Tag::PURPOSE, bits)]).unwrap();
    let id = AuthId::SignVerifyEd25519;

    assert!(auth::authorize(id, &stored, &request(KeyPurpose::SIGN.bits())).is_ok());
    assert!(auth::authorize(id, &stored, &request(KeyPurpose::ENCRYPT.bits())).is_err());
    assert!(auth::authorize(id, &stored, &request(0)).is_err());

    let sign_only = ParamSet::from_params(&[
        Param::uint(Tag::ALGORITHM, KeyAlg::Ed25519.as_u32()),
        Param::uint(Tag::PURPOSE, KeyPurpose::SIGN.bits()),
    ])
    .unwrap();
    let both = (KeyPurpose::SIGN | KeyPurpose::VERIFY).bits();
    assert!(matches!(
        auth::authorize(id, &sign_only, &request(both)),
        Err(Error::MismatchedTag { .. })
    ));
}

#[test]
fn test_store_heals_missing_or_empty_primary() {
    let fs = Arc::new(MemoryFileSystem::new());
    let store = KeyStore::new(fs.clone(), StorageConfig::under("/data")).unwrap();
    let id = identity_a();
    let blob = engine()
        .build_key_blob(b"heal", KeyFlag::Generate, &[9; 32], &aes_params(), &id)
        .unwrap();
    store.write(&id, b"heal", StorageType::Key, &blob).unwrap();
    let path = store.path_for(&id, b"heal", StorageType::Key).unwrap();

    fs.remove(&path.primary).unwrap();
    assert_eq!(store.read(&id, b"heal", StorageType::Key).unwrap(), blob);
    assert_eq!(fs.read(&path.primary).unwrap(), blob);

    fs.write(&path.primary, &[]).unwrap();
    assert_eq!(store.read(&id, b"heal", StorageType::Key).unwrap(), blob);
    assert_eq!(fs.read(&path.primary).unwrap(), blob);
}

#[test]
fn test_file_names_round_trip_without_collisions() {
    let mut rng = ChaCha20Rng::seed_from_u64(0x6b65_7962);
    let reserved = b":<>?\\|/+#$%&()~ \0\x7f";
    let mut seen = HashSet::new();
    let mut encoded_names = HashSet::new();

    for i in 0..10_000 {
        let len = 1 + (rng.next_u32() as usize % 64);
        let mut alias = vec![0u8; len];
        rng.fill_bytes(&mut alias);
        if i % 3 == 0 {
            for b in alias.iter_mut().step_by(2) {
                *b = reserved[*b as usize % reserved.len()];
            }
        }
        let name = encode_file_name(&alias);
        assert!(
            !name.bytes().any(|c| b":<>?\\|/\0".contains(&c)),
            "{name:?} carries a reserved character"
        );
        assert_eq!(decode_file_name(&name).unwrap(), alias);
        if seen.insert(alias) {
            assert!(encoded_names.insert(name), "two aliases share a file name");
        }
    }
}
