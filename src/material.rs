//! Key material codec
//!
//! Asymmetric key material is stored as a fixed 20-byte little-endian header
//! followed by the raw components:
//!
//! ```text
//! RSA:        keyAlg | keySize | nSize      | eSize       | dSize    | n e d
//! ECC:        keyAlg | keySize | xSize      | ySize       | zSize    | x y z
//! X25519/Ed25519: keyAlg | keySize | pubKeySize | priKeySize | reserved | pub priv
//! ```
//!
//! Symmetric keys (AES, HMAC, ...) are stored as the raw key bytes.

use crate::{Error, KeyAlg, Result};
use zeroize::Zeroizing;

/// Size of the asymmetric material header
pub const KEY_MATERIAL_HEADER_SIZE: usize = 20;
/// Ed25519 / X25519 component size
pub const CURVE25519_KEY_BYTES: usize = 32;
/// Ed25519 compact form: `public ‖ private`
pub const ED25519_COMPACT_SIZE: usize = 2 * CURVE25519_KEY_BYTES;

/// Borrowed views of the components inside a key material buffer
#[derive(Clone, Copy)]
pub enum RawKey<'a> {
    /// RSA modulus, public exponent, private exponent
    Rsa {
        /// Modulus
        n: &'a [u8],
        /// Public exponent
        e: &'a [u8],
        /// Private exponent (may be empty for public-only material)
        d: &'a [u8],
    },
    /// Elliptic curve public point and private scalar
    Ecc {
        /// Public X coordinate
        x: &'a [u8],
        /// Public Y coordinate
        y: &'a [u8],
        /// Private scalar (may be empty for public-only material)
        z: &'a [u8],
    },
    /// X25519 or Ed25519 key pair
    Curve25519 {
        /// Public key
        public: &'a [u8],
        /// Private key (may be empty for public-only material)
        private: &'a [u8],
    },
    /// Raw symmetric key
    Symmetric(&'a [u8]),
}

/// Decoded material header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaterialHeader {
    /// Algorithm wire value
    pub key_alg: u32,
    /// Key size in bits
    pub key_size: u32,
    /// Component sizes in layout order
    pub sizes: [u32; 3],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Layout {
    Rsa,
    Ecc,
    Curve25519,
    Symmetric,
}

fn layout_for(alg: KeyAlg) -> Result<Layout> {
    match alg {
        KeyAlg::Rsa => Ok(Layout::Rsa),
        KeyAlg::Ecc | KeyAlg::Ecdh | KeyAlg::Sm2 => Ok(Layout::Ecc),
        KeyAlg::X25519 | KeyAlg::Ed25519 => Ok(Layout::Curve25519),
        alg if alg.is_symmetric() => Ok(Layout::Symmetric),
        other => Err(Error::not_supported(format!("key material for {other:?}"))),
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

/// Decode the fixed header of asymmetric material
pub fn read_header(material: &[u8]) -> Result<MaterialHeader> {
    if material.len() < KEY_MATERIAL_HEADER_SIZE {
        return Err(Error::invalid_key_info(format!(
            "material of {} bytes is shorter than its header",
            material.len()
        )));
    }
    Ok(MaterialHeader {
        key_alg: read_u32(material, 0),
        key_size: read_u32(material, 4),
        sizes: [
            read_u32(material, 8),
            read_u32(material, 12),
            read_u32(material, 16),
        ],
    })
}

/// Validate `material` for `alg` and return views of its components.
///
/// The declared component sizes must account for every byte after the
/// header, no more and no less.
pub fn material_to_raw(material: &[u8], alg: KeyAlg) -> Result<RawKey<'_>> {
    let layout = layout_for(alg)?;
    if layout == Layout::Symmetric {
        if material.is_empty() {
            return Err(Error::invalid_key_info("empty symmetric key"));
        }
        return Ok(RawKey::Symmetric(material));
    }

    let header = read_header(material)?;
    if header.key_alg != alg.as_u32() {
        return Err(Error::invalid_key_info(format!(
            "material is for algorithm {}, expected {}",
            header.key_alg,
            alg.as_u32()
        )));
    }
    let component_count = if layout == Layout::Curve25519 {
        if header.sizes[2] != 0 {
            return Err(Error::invalid_key_info("reserved field must be zero"));
        }
        2
    } else {
        3
    };

    let body = &material[KEY_MATERIAL_HEADER_SIZE..];
    let mut total: usize = 0;
    for size in &header.sizes[..component_count] {
        total = total
            .checked_add(*size as usize)
            .ok_or_else(|| Error::invalid_key_info("component sizes overflow"))?;
    }
    if total != body.len() {
        return Err(Error::invalid_key_info(format!(
            "components declare {total} bytes, material holds {}",
            body.len()
        )));
    }

    let mut parts = [&body[..0]; 3];
    let mut offset = 0;
    for (i, size) in header.sizes[..component_count].iter().enumerate() {
        let end = offset + *size as usize;
        parts[i] = &body[offset..end];
        offset = end;
    }

    Ok(match layout {
        Layout::Rsa => RawKey::Rsa {
            n: parts[0],
            e: parts[1],
            d: parts[2],
        },
        Layout::Ecc => RawKey::Ecc {
            x: parts[0],
            y: parts[1],
            z: parts[2],
        },
        Layout::Curve25519 => RawKey::Curve25519 {
            public: parts[0],
            private: parts[1],
        },
        Layout::Symmetric => RawKey::Symmetric(material),
    })
}

/// Encode components into material for `alg`.
///
/// The output is built directly in a self-wiping buffer; no intermediate copy
/// of the private components is left behind.
pub fn raw_to_material(raw: &RawKey<'_>, alg: KeyAlg, key_size: u32) -> Result<Zeroizing<Vec<u8>>> {
    let layout = layout_for(alg)?;
    let components: Vec<&[u8]> = match (*raw, layout) {
        (RawKey::Symmetric(key), Layout::Symmetric) => {
            if key.is_empty() {
                return Err(Error::invalid_key_info("empty symmetric key"));
            }
            return Ok(Zeroizing::new(key.to_vec()));
        }
        (RawKey::Rsa { n, e, d }, Layout::Rsa) => vec![n, e, d],
        (RawKey::Ecc { x, y, z }, Layout::Ecc) => vec![x, y, z],
        (RawKey::Curve25519 { public, private }, Layout::Curve25519) => vec![public, private],
        _ => {
            return Err(Error::invalid_argument(
                "raw_to_material",
                format!("components do not match algorithm {alg:?}"),
            ))
        }
    };

    let body_len: usize = components.iter().map(|c| c.len()).sum();
    let mut out = Zeroizing::new(Vec::with_capacity(KEY_MATERIAL_HEADER_SIZE + body_len));
    out.extend_from_slice(&alg.as_u32().to_le_bytes());
    out.extend_from_slice(&key_size.to_le_bytes());
    for i in 0..3 {
        let size = components.get(i).map_or(0, |c| c.len());
        let size = u32::try_from(size)
            .map_err(|_| Error::invalid_key_info("component larger than 4 GiB"))?;
        out.extend_from_slice(&size.to_le_bytes());
    }
    for c in &components {
        out.extend_from_slice(c);
    }
    Ok(out)
}

/// Full Ed25519 material to the 64-byte `public ‖ private` compact form
pub fn ed25519_to_compact(material: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    match material_to_raw(material, KeyAlg::Ed25519)? {
        RawKey::Curve25519 { public, private }
            if public.len() == CURVE25519_KEY_BYTES && private.len() == CURVE25519_KEY_BYTES =>
        {
            let mut out = Zeroizing::new(Vec::with_capacity(ED25519_COMPACT_SIZE));
            out.extend_from_slice(public);
            out.extend_from_slice(private);
            Ok(out)
        }
        _ => Err(Error::invalid_key_info(
            "compact form needs a 32-byte public and private key",
        )),
    }
}

/// Compact Ed25519 form back to full material; the header is fixed by the
/// algorithm constants.
pub fn ed25519_from_compact(compact: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if compact.len() != ED25519_COMPACT_SIZE {
        return Err(Error::invalid_key_info(format!(
            "compact Ed25519 key must be {ED25519_COMPACT_SIZE} bytes, got {}",
            compact.len()
        )));
    }
    let raw = RawKey::Curve25519 {
        public: &compact[..CURVE25519_KEY_BYTES],
        private: &compact[CURVE25519_KEY_BYTES..],
    };
    raw_to_material(&raw, KeyAlg::Ed25519, 256)
}
