//! Authorization matcher: checks a usage request against the policy fixed
//! when the key was created.
//!
//! Each authorization domain ([`AuthId`]) names the tags that must agree
//! between the stored parameters and the request. For every required tag:
//!
//! - `PURPOSE` is a bitmask subset check; a request must name at least one
//!   purpose, and only purposes granted at creation.
//! - A tag present on both sides must match exactly.
//! - A tag stored but not requested takes the stored value.
//! - A tag not stored falls back to the domain's [`OptionalRule`].

use crate::param::{ParamSet, Tag};
use crate::{Error, KeyAlg, KeyPurpose, Result};

/// Authorization domain of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthId {
    /// RSA signing and verification
    SignVerifyRsa,
    /// ECC, SM2 and DSA signing and verification
    SignVerifyEcc,
    /// Ed25519 signing and verification
    SignVerifyEd25519,
    /// Key agreement
    Agree,
    /// HMAC
    MacHmac,
    /// SM3 MAC
    MacSm3,
    /// AES and SM4 encryption and decryption
    SymCipher,
    /// RSA encryption and decryption
    AsymCipher,
    /// Key derivation
    Derive,
}

/// Treatment of a required tag that the stored parameters leave open
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionalRule {
    /// Negotiated per use; the request must supply it
    UsageSupplied,
    /// Must have been fixed at creation
    Pinned,
    /// Not checked when left open
    Ignored,
}

/// Required tags of one authorization domain
#[derive(Debug)]
pub struct AuthPolicy {
    /// The domain
    pub auth_id: AuthId,
    /// Tags that must agree between key and request
    pub required: &'static [Tag],
}

/// Policy table, one entry per [`AuthId`]
pub const AUTH_POLICIES: &[AuthPolicy] = &[
    AuthPolicy {
        auth_id: AuthId::SignVerifyRsa,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::KEY_SIZE, Tag::DIGEST, Tag::PADDING],
    },
    AuthPolicy {
        auth_id: AuthId::SignVerifyEcc,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::KEY_SIZE, Tag::DIGEST],
    },
    AuthPolicy {
        auth_id: AuthId::SignVerifyEd25519,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::KEY_SIZE],
    },
    AuthPolicy {
        auth_id: AuthId::Agree,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::KEY_SIZE],
    },
    AuthPolicy {
        auth_id: AuthId::MacHmac,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::DIGEST],
    },
    AuthPolicy {
        auth_id: AuthId::MacSm3,
        required: &[Tag::ALGORITHM, Tag::PURPOSE],
    },
    AuthPolicy {
        auth_id: AuthId::SymCipher,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::BLOCK_MODE, Tag::PADDING],
    },
    AuthPolicy {
        auth_id: AuthId::AsymCipher,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::PADDING, Tag::DIGEST],
    },
    AuthPolicy {
        auth_id: AuthId::Derive,
        required: &[Tag::ALGORITHM, Tag::PURPOSE, Tag::DIGEST],
    },
];

/// Policy entry for `auth_id`
pub fn policy_for(auth_id: AuthId) -> &'static AuthPolicy {
    AUTH_POLICIES
        .iter()
        .find(|p| p.auth_id == auth_id)
        .unwrap_or(&AUTH_POLICIES[0])
}

/// Rule for a required `tag` the stored parameters do not fix
pub fn optional_rule(auth_id: AuthId, tag: Tag) -> OptionalRule {
    use AuthId::*;
    match (auth_id, tag) {
        (_, Tag::ALGORITHM) | (_, Tag::PURPOSE) => OptionalRule::Pinned,
        (_, Tag::KEY_SIZE) => OptionalRule::Ignored,
        (MacHmac, Tag::DIGEST) => OptionalRule::Pinned,
        (SignVerifyRsa, Tag::DIGEST) | (SignVerifyRsa, Tag::PADDING) => OptionalRule::UsageSupplied,
        (SignVerifyEcc, Tag::DIGEST) => OptionalRule::UsageSupplied,
        (SymCipher, Tag::BLOCK_MODE) | (SymCipher, Tag::PADDING) => OptionalRule::UsageSupplied,
        (AsymCipher, Tag::PADDING) | (AsymCipher, Tag::DIGEST) => OptionalRule::UsageSupplied,
        (Derive, Tag::DIGEST) => OptionalRule::UsageSupplied,
        _ => OptionalRule::Pinned,
    }
}

/// Authorization domain for using a key of `alg` for `purpose`.
///
/// `purpose` must stay within one domain: `SIGN|VERIFY` is fine,
/// `SIGN|ENCRYPT` is not.
pub fn auth_id_for(alg: KeyAlg, purpose: KeyPurpose) -> Result<AuthId> {
    const SIGN_VERIFY: u32 = KeyPurpose::SIGN.bits() | KeyPurpose::VERIFY.bits();
    const CIPHER: u32 = KeyPurpose::ENCRYPT.bits() | KeyPurpose::DECRYPT.bits();

    let bits = purpose.bits();
    if bits == 0 {
        return Err(Error::invalid_argument("auth_id_for", "empty purpose"));
    }
    let within = |mask: u32| bits & !mask == 0;

    let id = match alg {
        KeyAlg::Rsa if within(SIGN_VERIFY) => AuthId::SignVerifyRsa,
        KeyAlg::Rsa if within(CIPHER) => AuthId::AsymCipher,
        KeyAlg::Ecc | KeyAlg::Sm2 | KeyAlg::Dsa if within(SIGN_VERIFY) => AuthId::SignVerifyEcc,
        KeyAlg::Ed25519 if within(SIGN_VERIFY) => AuthId::SignVerifyEd25519,
        KeyAlg::Ecc | KeyAlg::Ecdh | KeyAlg::X25519 | KeyAlg::Dh
            if within(KeyPurpose::AGREE.bits()) =>
        {
            AuthId::Agree
        }
        KeyAlg::Hmac if within(KeyPurpose::MAC.bits()) => AuthId::MacHmac,
        KeyAlg::Sm3 if within(KeyPurpose::MAC.bits()) => AuthId::MacSm3,
        KeyAlg::Aes | KeyAlg::Sm4 if within(CIPHER) => AuthId::SymCipher,
        KeyAlg::Hkdf | KeyAlg::Pbkdf2 | KeyAlg::Hmac | KeyAlg::Aes
            if within(KeyPurpose::DERIVE.bits()) =>
        {
            AuthId::Derive
        }
        _ => {
            return Err(Error::not_supported(format!(
                "{alg:?} with purpose {bits:#x}"
            )))
        }
    };
    Ok(id)
}

fn check_purpose(stored: &ParamSet, request: &ParamSet) -> Result<()> {
    let granted = stored.get_uint(Tag::PURPOSE).map_err(|_| Error::MissingRequired {
        tag: Tag::PURPOSE.raw(),
        location: "key policy".into(),
    })?;
    let requested = request.get_uint(Tag::PURPOSE).map_err(|_| Error::MissingRequired {
        tag: Tag::PURPOSE.raw(),
        location: "request".into(),
    })?;
    if requested == 0 || requested & granted != requested {
        return Err(Error::MismatchedTag {
            tag: Tag::PURPOSE.raw(),
            expected: format!("subset of {granted:#x}"),
            actual: format!("{requested:#x}"),
        });
    }
    Ok(())
}

/// Check `request` against the `stored` policy of a key under `auth_id`.
///
/// # Errors
///
/// - [`Error::MismatchedTag`] when a value disagrees (or a purpose was not granted)
/// - [`Error::MissingRequired`] when a required tag is absent where it must be present
pub fn authorize(auth_id: AuthId, stored: &ParamSet, request: &ParamSet) -> Result<()> {
    for &tag in policy_for(auth_id).required {
        if tag == Tag::PURPOSE {
            check_purpose(stored, request)?;
            continue;
        }
        match (stored.get(tag).ok(), request.get(tag).ok()) {
            (Some(s), Some(r)) => {
                if !s.value().matches(r.value()) {
                    return Err(Error::MismatchedTag {
                        tag: tag.raw(),
                        expected: s.value().describe(),
                        actual: r.value().describe(),
                    });
                }
            }
            (Some(_), None) => {}
            (None, requested) => match optional_rule(auth_id, tag) {
                OptionalRule::Ignored => {}
                OptionalRule::UsageSupplied if requested.is_some() => {}
                OptionalRule::UsageSupplied => {
                    return Err(Error::MissingRequired {
                        tag: tag.raw(),
                        location: "request".into(),
                    })
                }
                OptionalRule::Pinned => {
                    return Err(Error::MissingRequired {
                        tag: tag.raw(),
                        location: "key policy".into(),
                    })
                }
            },
        }
    }
    tracing::trace!(?auth_id, "authorized");
    Ok(())
}
