//! Parameter sets: tag-keyed, typed attribute collections.
//!
//! A parameter set describes both the policy of a key (algorithm, purpose,
//! digest, ...) and, inside a key blob, its payload. It has a stable
//! little-endian binary layout:
//!
//! ```text
//! paramsCount u32 | paramSetSize u32 | entry*
//! entry := tag u32 | value
//! value := u32            (INT, UINT, BOOL)
//!        | u64            (ULONG)
//!        | size u32 data  (BYTES)
//! ```
//!
//! Every entry starts on a 4-byte boundary. Padding is inserted *before* an
//! entry when the previous byte blob left the cursor unaligned, never after
//! the last entry, so the last entry's data always ends exactly at
//! `paramSetSize`. After [`ParamSet::build`] the `KEY` tag, when present, is
//! always the last entry.
//!
//! [`ParamSet::from_bytes`] parses bytes that may come from another process
//! and checks every read against the declared size.

use crate::{Error, Result};
use std::fmt;
use std::ops::Range;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the `{paramsCount, paramSetSize}` header
pub const PARAM_SET_HEADER_SIZE: usize = 8;
/// Upper bound accepted for `paramSetSize`
pub const MAX_PARAM_SET_SIZE: usize = 4 * 1024 * 1024;
/// Upper bound on the number of parameters in one set
pub const MAX_PARAM_COUNT: usize = 31;
/// Offset added to a byte tag whose buffer was absent or empty
pub const PARAM_BUFFER_NULL_INTERVAL: u32 = 0x0010_0000;

const TAG_TYPE_SHIFT: u32 = 28;
const TAG_TYPE_MASK: u32 = 0xF << TAG_TYPE_SHIFT;

/// Value kind encoded in the high four bits of a tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagType {
    /// Not a valid kind
    Invalid,
    /// Signed 32-bit
    Int,
    /// Unsigned 32-bit
    Uint,
    /// Unsigned 64-bit
    Ulong,
    /// Boolean
    Bool,
    /// Byte string
    Bytes,
}

impl TagType {
    const fn bits(self) -> u32 {
        let n = match self {
            Self::Invalid => 0,
            Self::Int => 1,
            Self::Uint => 2,
            Self::Ulong => 3,
            Self::Bool => 4,
            Self::Bytes => 5,
        };
        n << TAG_TYPE_SHIFT
    }

    const fn from_tag(raw: u32) -> Self {
        match (raw & TAG_TYPE_MASK) >> TAG_TYPE_SHIFT {
            1 => Self::Int,
            2 => Self::Uint,
            3 => Self::Ulong,
            4 => Self::Bool,
            5 => Self::Bytes,
            _ => Self::Invalid,
        }
    }
}

/// A parameter tag. The high four bits carry the [`TagType`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

macro_rules! tags {
    ($($(#[$doc:meta])* $name:ident = $kind:ident | $id:expr;)*) => {
        impl Tag {
            $(
                $(#[$doc])*
                pub const $name: Tag = Tag(TagType::$kind.bits() | $id);
            )*
        }
    };
}

tags! {
    /// Key algorithm ([`crate::KeyAlg`])
    ALGORITHM = Uint | 1;
    /// Purpose bitmask ([`crate::KeyPurpose`])
    PURPOSE = Uint | 2;
    /// Key size in bits
    KEY_SIZE = Uint | 3;
    /// Digest ([`crate::KeyDigest`])
    DIGEST = Uint | 4;
    /// Padding ([`crate::KeyPadding`])
    PADDING = Uint | 5;
    /// Block mode ([`crate::BlockMode`])
    BLOCK_MODE = Uint | 6;
    /// Key type
    KEY_TYPE = Uint | 7;
    /// AEAD associated data for a cipher operation
    ASSOCIATED_DATA = Bytes | 8;
    /// AEAD nonce for a cipher operation
    NONCE = Bytes | 9;
    /// IV for a cipher operation
    IV = Bytes | 10;
    /// KDF info
    INFO = Bytes | 11;
    /// KDF salt
    SALT = Bytes | 12;
    /// Password
    PWD = Bytes | 13;
    /// KDF iteration count
    ITERATION = Uint | 14;
    /// Key generation type
    KEY_GENERATE_TYPE = Uint | 15;
    /// Derivation algorithm
    DERIVE_ALG = Uint | 18;
    /// Agreement algorithm
    AGREE_ALG = Uint | 19;
    /// Peer public key is a stored alias
    AGREE_PUBLIC_KEY_IS_KEY_ALIAS = Bool | 20;
    /// Peer public key for agreement
    AGREE_PUBLIC_KEY = Bytes | 22;
    /// Key alias
    KEY_ALIAS = Bytes | 23;
    /// Output size of a derivation, in bytes
    DERIVE_KEY_SIZE = Uint | 24;
    /// Earliest use time (ms since epoch)
    ACTIVE_DATETIME = Ulong | 201;
    /// Creation time (ms since epoch)
    CREATION_DATETIME = Ulong | 204;
    /// User id
    USER_ID = Uint | 302;
    /// Key is usable without user authentication
    NO_AUTH_REQUIRED = Bool | 303;
    /// Accepted user auth types (bitmask)
    USER_AUTH_TYPE = Uint | 304;
    /// Auth token validity, in seconds
    AUTH_TIMEOUT = Uint | 305;
    /// Serialized user auth token
    AUTH_TOKEN = Bytes | 306;
    /// Key is addressed by alias
    IS_KEY_ALIAS = Bool | 1001;
    /// Storage flag
    KEY_STORAGE_FLAG = Uint | 1002;
    /// Key may be wrapped
    IS_ALLOWED_WRAP = Bool | 1003;
    /// Key auth id
    KEY_AUTH_ID = Bytes | 1005;
    /// Key role
    KEY_ROLE = Uint | 1006;
    /// How the key was created ([`crate::KeyFlag`])
    KEY_FLAG = Uint | 1007;
    /// Owning process name
    PROCESS_NAME = Bytes | 10001;
    /// Owning package name
    PACKAGE_NAME = Bytes | 10002;
    /// Key blob payload: `KeyBlobInfo ‖ key material`
    KEY = Bytes | 10006;
    /// Key blob format version
    KEY_VERSION = Uint | 10007;
    /// Payload length
    PAYLOAD_LEN = Uint | 10008;
    /// AE tag
    AE_TAG = Bytes | 10009;
    /// OS version at creation
    OS_VERSION = Uint | 10101;
    /// OS patch level at creation
    OS_PATCHLEVEL = Uint | 10102;
    /// Symmetric key bytes for import
    SYMMETRIC_KEY_DATA = Bytes | 20001;
    /// Asymmetric public key bytes for import
    ASYMMETRIC_PUBLIC_KEY_DATA = Bytes | 20002;
    /// Asymmetric private key bytes for import
    ASYMMETRIC_PRIVATE_KEY_DATA = Bytes | 20003;
}

impl Tag {
    /// Wrap a raw tag value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw 32-bit value
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Kind encoded in the high bits
    pub const fn kind(&self) -> TagType {
        TagType::from_tag(self.0)
    }

    /// True if this tag marks a substituted empty byte buffer
    pub const fn is_null_substituted(&self) -> bool {
        matches!(self.kind(), TagType::Bytes) && self.0 & PARAM_BUFFER_NULL_INTERVAL != 0
    }

    /// The tag used when this byte tag's buffer is absent
    pub const fn null_substitute(&self) -> Self {
        Self(self.0 | PARAM_BUFFER_NULL_INTERVAL)
    }

    fn validate(&self) -> Result<()> {
        if self.kind() == TagType::Invalid {
            return Err(Error::InvalidTag { tag: self.0 });
        }
        if self.0 & PARAM_BUFFER_NULL_INTERVAL != 0 && self.kind() != TagType::Bytes {
            return Err(Error::InvalidTag { tag: self.0 });
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:#010x})", self.0)
    }
}

/// Typed parameter value
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub enum ParamValue {
    /// Signed 32-bit
    Int(i32),
    /// Unsigned 32-bit
    Uint(u32),
    /// Unsigned 64-bit
    Ulong(u64),
    /// Boolean
    Bool(bool),
    /// Byte string
    Bytes(Vec<u8>),
}

impl ParamValue {
    /// Kind of this value
    pub fn kind(&self) -> TagType {
        match self {
            Self::Int(_) => TagType::Int,
            Self::Uint(_) => TagType::Uint,
            Self::Ulong(_) => TagType::Ulong,
            Self::Bool(_) => TagType::Bool,
            Self::Bytes(_) => TagType::Bytes,
        }
    }

    /// Compare two values; byte strings compare in constant time
    pub fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bytes(a), Self::Bytes(b)) => a.len() == b.len() && bool::from(a.ct_eq(b)),
            (a, b) => a == b,
        }
    }

    /// Printable rendering for diagnostics; byte strings print their length only
    pub fn describe(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Uint(v) => v.to_string(),
            Self::Ulong(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Int(_) | Self::Uint(_) | Self::Bool(_) => 4,
            Self::Ulong(_) => 8,
            Self::Bytes(b) => 4 + b.len(),
        }
    }
}

impl fmt::Debug for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Uint(v) => write!(f, "Uint({v})"),
            Self::Ulong(v) => write!(f, "Ulong({v})"),
            Self::Bool(v) => write!(f, "Bool({v})"),
            Self::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
        }
    }
}

/// A single tagged parameter. Byte values are wiped on drop.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Param {
    #[zeroize(skip)]
    tag: Tag,
    value: ParamValue,
}

impl Param {
    /// Build a parameter; the kind is checked when it is added to a set
    pub fn new(tag: Tag, value: ParamValue) -> Self {
        Self { tag, value }
    }

    /// Signed 32-bit parameter
    pub fn int(tag: Tag, value: i32) -> Self {
        Self::new(tag, ParamValue::Int(value))
    }

    /// Unsigned 32-bit parameter
    pub fn uint(tag: Tag, value: u32) -> Self {
        Self::new(tag, ParamValue::Uint(value))
    }

    /// Unsigned 64-bit parameter
    pub fn ulong(tag: Tag, value: u64) -> Self {
        Self::new(tag, ParamValue::Ulong(value))
    }

    /// Boolean parameter
    pub fn boolean(tag: Tag, value: bool) -> Self {
        Self::new(tag, ParamValue::Bool(value))
    }

    /// Byte string parameter
    pub fn bytes(tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, ParamValue::Bytes(value.into()))
    }

    /// The tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// The value
    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    fn encoded_len(&self) -> usize {
        4 + self.value.encoded_len()
    }

    /// Check the tag kind against the value and apply the empty-buffer
    /// substitution.
    fn normalize(mut self) -> Result<Self> {
        self.tag.validate()?;
        if self.tag.kind() != self.value.kind() {
            return Err(Error::InvalidTag { tag: self.tag.raw() });
        }
        if let ParamValue::Bytes(ref mut data) = self.value {
            if self.tag.is_null_substituted() {
                if data.len() != 1 {
                    return Err(Error::ParamMalformed {
                        tag: self.tag.raw(),
                        message: "null placeholder must be one byte".into(),
                    });
                }
            } else if data.is_empty() {
                self.tag = self.tag.null_substitute();
                *data = vec![0u8];
            }
        }
        Ok(self)
    }
}

/// Location of one entry inside a serialized parameter set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamEntry {
    /// The entry's tag
    pub tag: Tag,
    /// Byte range of the entry, starting at its tag
    pub entry_range: Range<usize>,
    /// Byte range of the value payload (for byte strings, the data only)
    pub value_range: Range<usize>,
}

/// An ordered collection of parameters with unique tags
#[derive(Clone, Debug, Default)]
pub struct ParamSet {
    params: Vec<Param>,
    built: bool,
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

impl ParamSet {
    /// Empty, unbuilt set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `params` and build in one step
    pub fn from_params(params: &[Param]) -> Result<Self> {
        let mut set = Self::new();
        set.add(params)?;
        set.build()?;
        Ok(set)
    }

    /// Append parameters.
    ///
    /// The batch is all-or-nothing: a duplicate tag (against the set or
    /// within the batch), an invalid tag or a kind mismatch leaves the set
    /// untouched.
    pub fn add(&mut self, params: &[Param]) -> Result<()> {
        self.add_owned(params.to_vec())
    }

    /// Append a single parameter, taking ownership
    pub fn push(&mut self, param: Param) -> Result<()> {
        self.add_owned(vec![param])
    }

    fn add_owned(&mut self, params: Vec<Param>) -> Result<()> {
        if self.built {
            return Err(Error::BadState {
                operation: "param_set_add".into(),
                message: "parameter set is already built".into(),
            });
        }
        if self.params.len() + params.len() > MAX_PARAM_COUNT {
            return Err(Error::InsufficientMemory {
                operation: "param_set_add".into(),
            });
        }
        let mut staged = Vec::with_capacity(params.len());
        for param in params {
            let param = param.normalize()?;
            let dup = |p: &Param| p.tag.raw() & !PARAM_BUFFER_NULL_INTERVAL
                == param.tag.raw() & !PARAM_BUFFER_NULL_INTERVAL;
            if self.params.iter().any(&dup) || staged.iter().any(&dup) {
                return Err(Error::DuplicateTag { tag: param.tag.raw() });
            }
            staged.push(param);
        }
        self.params.append(&mut staged);
        Ok(())
    }

    /// Finalize: sort by tag with `KEY` last, fix the size, freeze.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Ok(());
        }
        self.params
            .sort_by_key(|p| (p.tag == Tag::KEY, p.tag.raw()));
        let size = self.encoded_size();
        if size > MAX_PARAM_SET_SIZE {
            return Err(Error::BufferTooSmall {
                operation: "param_set_build".into(),
                needed: size,
                available: MAX_PARAM_SET_SIZE,
            });
        }
        self.built = true;
        Ok(())
    }

    /// Whether [`ParamSet::build`] has run
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// True if the set holds no parameters
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate in stored order
    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// Serialized size in bytes (`paramSetSize`)
    pub fn encoded_size(&self) -> usize {
        let mut cursor = PARAM_SET_HEADER_SIZE;
        for p in &self.params {
            cursor = align4(cursor) + p.encoded_len();
        }
        cursor
    }

    /// Look up a parameter by exact tag
    pub fn get(&self, tag: Tag) -> Result<&Param> {
        self.params
            .iter()
            .find(|p| p.tag == tag)
            .ok_or(Error::ParamNotExist { tag: tag.raw() })
    }

    /// True if the tag (or its empty-buffer substitute) is present
    pub fn contains(&self, tag: Tag) -> bool {
        self.get(tag).is_ok()
            || (tag.kind() == TagType::Bytes && self.get(tag.null_substitute()).is_ok())
    }

    /// Unsigned 32-bit value of `tag`
    pub fn get_uint(&self, tag: Tag) -> Result<u32> {
        match self.get(tag)?.value {
            ParamValue::Uint(v) => Ok(v),
            ref other => Err(malformed(tag, other)),
        }
    }

    /// Unsigned 64-bit value of `tag`
    pub fn get_ulong(&self, tag: Tag) -> Result<u64> {
        match self.get(tag)?.value {
            ParamValue::Ulong(v) => Ok(v),
            ref other => Err(malformed(tag, other)),
        }
    }

    /// Boolean value of `tag`
    pub fn get_bool(&self, tag: Tag) -> Result<bool> {
        match self.get(tag)?.value {
            ParamValue::Bool(v) => Ok(v),
            ref other => Err(malformed(tag, other)),
        }
    }

    /// Byte value of `tag`; a substituted empty buffer reads back as `&[]`
    pub fn get_bytes(&self, tag: Tag) -> Result<&[u8]> {
        match self.get(tag) {
            Ok(p) => match p.value {
                ParamValue::Bytes(ref b) => Ok(b),
                ref other => Err(malformed(tag, other)),
            },
            Err(e) => {
                if tag.kind() == TagType::Bytes && self.get(tag.null_substitute()).is_ok() {
                    Ok(&[])
                } else {
                    Err(e)
                }
            }
        }
    }

    /// A built copy without `tag`
    pub fn without(&self, tag: Tag) -> Result<Self> {
        let kept: Vec<Param> = self.params.iter().filter(|p| p.tag != tag).cloned().collect();
        let mut set = Self::new();
        set.add_owned(kept)?;
        set.build()?;
        Ok(set)
    }

    /// Replace the bytes of an existing byte parameter, wiping the old value
    pub(crate) fn replace_bytes(&mut self, tag: Tag, data: Vec<u8>) -> Result<()> {
        let param = self
            .params
            .iter_mut()
            .find(|p| p.tag == tag)
            .ok_or(Error::ParamNotExist { tag: tag.raw() })?;
        match param.value {
            ParamValue::Bytes(ref mut old) => {
                old.zeroize();
                *old = data;
                Ok(())
            }
            ref other => Err(malformed(tag, other)),
        }
    }

    /// Overwrite the bytes of `tag` with zeros in place
    pub fn wipe_bytes(&mut self, tag: Tag) {
        for p in self.params.iter_mut().filter(|p| p.tag == tag) {
            if let ParamValue::Bytes(ref mut b) = p.value {
                b.iter_mut().for_each(|x| *x = 0);
            }
        }
    }

    /// Serialize. The set must be built.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if !self.built {
            return Err(Error::BadState {
                operation: "param_set_serialize".into(),
                message: "parameter set is not built".into(),
            });
        }
        let size = self.encoded_size();
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&(self.params.len() as u32).to_le_bytes());
        out.extend_from_slice(&(size as u32).to_le_bytes());
        for p in &self.params {
            out.resize(align4(out.len()), 0);
            out.extend_from_slice(&p.tag.raw().to_le_bytes());
            match p.value {
                ParamValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
                ParamValue::Uint(v) => out.extend_from_slice(&v.to_le_bytes()),
                ParamValue::Bool(v) => out.extend_from_slice(&u32::from(v).to_le_bytes()),
                ParamValue::Ulong(v) => out.extend_from_slice(&v.to_le_bytes()),
                ParamValue::Bytes(ref b) => {
                    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        debug_assert_eq!(out.len(), size);
        Ok(out)
    }

    /// Walk a serialized set and return the location of every entry.
    ///
    /// Validates the header against the buffer length and every read against
    /// the declared size. Does not copy values.
    pub fn scan(bytes: &[u8]) -> Result<Vec<ParamEntry>> {
        let mut reader = Reader::new(bytes)?;
        let count = reader.count;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            reader.align()?;
            let start = reader.pos;
            let tag = Tag(reader.u32()?);
            tag.validate()?;
            let value_range = match tag.kind() {
                TagType::Int | TagType::Uint | TagType::Bool => reader.take(4)?,
                TagType::Ulong => reader.take(8)?,
                TagType::Bytes => {
                    let len = reader.u32()? as usize;
                    reader.take(len)?
                }
                TagType::Invalid => return Err(Error::InvalidTag { tag: tag.raw() }),
            };
            entries.push(ParamEntry {
                tag,
                entry_range: start..reader.pos,
                value_range,
            });
        }
        if reader.pos != reader.size {
            return Err(Error::invalid_argument(
                "param_set_parse",
                format!("{} trailing bytes after last entry", reader.size - reader.pos),
            ));
        }
        Ok(entries)
    }

    /// Parse a serialized set. The result is built and keeps the stored order.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let entries = Self::scan(bytes)?;
        let mut params = Vec::with_capacity(entries.len());
        for entry in entries {
            let raw = &bytes[entry.value_range.clone()];
            let value = match entry.tag.kind() {
                TagType::Int => ParamValue::Int(i32::from_le_bytes(word(raw))),
                TagType::Uint => ParamValue::Uint(u32::from_le_bytes(word(raw))),
                TagType::Bool => match u32::from_le_bytes(word(raw)) {
                    0 => ParamValue::Bool(false),
                    1 => ParamValue::Bool(true),
                    other => {
                        return Err(Error::ParamMalformed {
                            tag: entry.tag.raw(),
                            message: format!("boolean encoded as {other}"),
                        })
                    }
                },
                TagType::Ulong => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(raw);
                    ParamValue::Ulong(u64::from_le_bytes(b))
                }
                TagType::Bytes => ParamValue::Bytes(raw.to_vec()),
                TagType::Invalid => return Err(Error::InvalidTag { tag: entry.tag.raw() }),
            };
            params.push(Param::new(entry.tag, value));
        }
        let mut set = Self::new();
        set.add_owned(params)?;
        set.built = true;
        Ok(set)
    }
}

fn malformed(tag: Tag, found: &ParamValue) -> Error {
    Error::ParamMalformed {
        tag: tag.raw(),
        message: format!("unexpected value kind {:?}", found.kind()),
    }
}

fn word(raw: &[u8]) -> [u8; 4] {
    let mut b = [0u8; 4];
    b.copy_from_slice(raw);
    b
}

/// Bounds-checked cursor over a serialized parameter set
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    size: usize,
    count: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < PARAM_SET_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                operation: "param_set_parse".into(),
                needed: PARAM_SET_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let count = u32::from_le_bytes(word(&bytes[0..4])) as usize;
        let size = u32::from_le_bytes(word(&bytes[4..8])) as usize;
        if size > MAX_PARAM_SET_SIZE || size < PARAM_SET_HEADER_SIZE {
            return Err(Error::invalid_argument(
                "param_set_parse",
                format!("declared size {size} out of range"),
            ));
        }
        if size > bytes.len() {
            return Err(Error::BufferTooSmall {
                operation: "param_set_parse".into(),
                needed: size,
                available: bytes.len(),
            });
        }
        if size != bytes.len() {
            return Err(Error::invalid_argument(
                "param_set_parse",
                format!("declared size {size} does not match buffer length {}", bytes.len()),
            ));
        }
        if count > MAX_PARAM_COUNT {
            return Err(Error::invalid_argument(
                "param_set_parse",
                format!("param count {count} exceeds {MAX_PARAM_COUNT}"),
            ));
        }
        Ok(Self {
            bytes,
            pos: PARAM_SET_HEADER_SIZE,
            size,
            count,
        })
    }

    fn take(&mut self, len: usize) -> Result<Range<usize>> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.size)
            .ok_or(Error::BufferTooSmall {
                operation: "param_set_parse".into(),
                needed: self.pos.saturating_add(len),
                available: self.size,
            })?;
        let range = self.pos..end;
        self.pos = end;
        Ok(range)
    }

    fn align(&mut self) -> Result<()> {
        let aligned = align4(self.pos);
        if aligned > self.size {
            return Err(Error::BufferTooSmall {
                operation: "param_set_parse".into(),
                needed: aligned,
                available: self.size,
            });
        }
        if self.bytes[self.pos..aligned].iter().any(|b| *b != 0) {
            return Err(Error::invalid_argument(
                "param_set_parse",
                format!("non-zero padding at offset {}", self.pos),
            ));
        }
        self.pos = aligned;
        Ok(())
    }

    fn u32(&mut self) -> Result<u32> {
        let range = self.take(4)?;
        Ok(u32::from_le_bytes(word(&self.bytes[range])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSet {
        ParamSet::from_params(&[
            Param::uint(Tag::PURPOSE, 4),
            Param::bytes(Tag::KEY, vec![0xAA; 5]),
            Param::uint(Tag::ALGORITHM, 102),
            Param::bytes(Tag::PROCESS_NAME, b"app".to_vec()),
            Param::ulong(Tag::CREATION_DATETIME, 1_700_000_000_000),
            Param::boolean(Tag::NO_AUTH_REQUIRED, true),
        ])
        .unwrap()
    }

    #[test]
    fn test_tag_kinds() {
        assert_eq!(Tag::ALGORITHM.kind(), TagType::Uint);
        assert_eq!(Tag::KEY.kind(), TagType::Bytes);
        assert_eq!(Tag::CREATION_DATETIME.kind(), TagType::Ulong);
        assert_eq!(Tag::NO_AUTH_REQUIRED.kind(), TagType::Bool);
        assert_eq!(Tag::ALGORITHM.raw(), 0x2000_0001);
        assert!(Tag::from_raw(0x0000_0001).validate().is_err());
        assert!(Tag::from_raw(0x7000_0001).validate().is_err());
    }

    #[test]
    fn test_duplicate_tag_rejected_atomically() {
        let mut set = ParamSet::new();
        set.push(Param::uint(Tag::ALGORITHM, 20)).unwrap();
        let err = set
            .add(&[Param::uint(Tag::KEY_SIZE, 256), Param::uint(Tag::ALGORITHM, 1)])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTag { .. }));
        assert_eq!(set.len(), 1);

        let err = set
            .add(&[Param::uint(Tag::DIGEST, 12), Param::uint(Tag::DIGEST, 12)])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTag { .. }));
    }

    #[test]
    fn test_kind_mismatch_is_invalid_tag() {
        let mut set = ParamSet::new();
        let err = set.push(Param::bytes(Tag::ALGORITHM, vec![1])).unwrap_err();
        assert!(matches!(err, Error::InvalidTag { .. }));
    }

    #[test]
    fn test_build_sorts_with_key_last() {
        let set = sample();
        let tags: Vec<u32> = set.iter().map(|p| p.tag().raw()).collect();
        assert_eq!(*tags.last().unwrap(), Tag::KEY.raw());
        let rest = &tags[..tags.len() - 1];
        assert!(rest.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_add_after_build_fails() {
        let mut set = sample();
        assert!(matches!(
            set.push(Param::uint(Tag::DIGEST, 12)),
            Err(Error::BadState { .. })
        ));
    }

    #[test]
    fn test_serialize_and_parse() {
        let set = sample();
        let bytes = set.to_bytes().unwrap();
        assert_eq!(bytes.len(), set.encoded_size());
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize, bytes.len());

        let parsed = ParamSet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.get_uint(Tag::ALGORITHM).unwrap(), 102);
        assert_eq!(parsed.get_bytes(Tag::PROCESS_NAME).unwrap(), b"app");
        assert_eq!(parsed.get_ulong(Tag::CREATION_DATETIME).unwrap(), 1_700_000_000_000);
        assert!(parsed.get_bool(Tag::NO_AUTH_REQUIRED).unwrap());
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_last_entry_ends_at_declared_size() {
        let bytes = sample().to_bytes().unwrap();
        let entries = ParamSet::scan(&bytes).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.tag, Tag::KEY);
        assert_eq!(last.value_range.end, bytes.len());
        for e in &entries {
            assert_eq!(e.entry_range.start % 4, 0);
        }
    }

    #[test]
    fn test_empty_buffer_substitution() {
        let mut set = ParamSet::new();
        set.push(Param::bytes(Tag::ASSOCIATED_DATA, Vec::new())).unwrap();
        set.build().unwrap();
        assert!(set.get(Tag::ASSOCIATED_DATA).is_err());
        assert!(set.contains(Tag::ASSOCIATED_DATA));
        assert_eq!(set.get_bytes(Tag::ASSOCIATED_DATA).unwrap(), &[] as &[u8]);

        let parsed = ParamSet::from_bytes(&set.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.get_bytes(Tag::ASSOCIATED_DATA).unwrap(), &[] as &[u8]);
        assert!(parsed
            .get(Tag::ASSOCIATED_DATA.null_substitute())
            .unwrap()
            .tag()
            .is_null_substituted());

        // substitute and real tag must not coexist
        let mut set = ParamSet::new();
        set.push(Param::bytes(Tag::NONCE, Vec::new())).unwrap();
        assert!(matches!(
            set.push(Param::bytes(Tag::NONCE, vec![1, 2])),
            Err(Error::DuplicateTag { .. })
        ));
    }

    #[test]
    fn test_get_distinguishes_absent_and_malformed() {
        let set = sample();
        assert!(matches!(set.get(Tag::DIGEST), Err(Error::ParamNotExist { .. })));
        assert!(matches!(
            set.get_bytes(Tag::ALGORITHM),
            Err(Error::ParamMalformed { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_size_mismatch() {
        let bytes = sample().to_bytes().unwrap();

        let mut longer = bytes.clone();
        longer.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            ParamSet::from_bytes(&longer),
            Err(Error::InvalidArgument { .. })
        ));

        assert!(matches!(
            ParamSet::from_bytes(&bytes[..bytes.len() - 1]),
            Err(Error::BufferTooSmall { .. })
        ));

        let mut oversized = bytes.clone();
        oversized[4..8].copy_from_slice(&(MAX_PARAM_SET_SIZE as u32 + 1).to_le_bytes());
        assert!(ParamSet::from_bytes(&oversized).is_err());
    }

    #[test]
    fn test_parse_rejects_lengths_past_end() {
        let bytes = sample().to_bytes().unwrap();
        let entries = ParamSet::scan(&bytes).unwrap();
        let key = entries.last().unwrap();
        // declared length of the KEY blob sits right before its data
        let len_at = key.value_range.start - 4;
        let mut evil = bytes.clone();
        evil[len_at..len_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            ParamSet::from_bytes(&evil),
            Err(Error::BufferTooSmall { .. })
        ));

        let mut evil = bytes.clone();
        evil[0..4].copy_from_slice(&(entries.len() as u32 + 1).to_le_bytes());
        assert!(matches!(
            ParamSet::from_bytes(&evil),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_zero_padding() {
        let bytes = sample().to_bytes().unwrap();
        let entries = ParamSet::scan(&bytes).unwrap();
        let name = entries
            .iter()
            .position(|e| e.tag == Tag::PROCESS_NAME)
            .unwrap();
        // three bytes of "app" leave one byte of padding before the next entry
        let pad = entries[name].entry_range.end;
        assert_eq!(entries[name + 1].entry_range.start, pad + 1);
        assert_eq!(bytes[pad], 0);

        let mut dirty = bytes.clone();
        dirty[pad] = 0x01;
        assert!(matches!(
            ParamSet::scan(&dirty),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(ParamSet::from_bytes(&dirty).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_bool_and_duplicates() {
        let set = ParamSet::from_params(&[Param::boolean(Tag::NO_AUTH_REQUIRED, true)]).unwrap();
        let mut bytes = set.to_bytes().unwrap();
        bytes[12..16].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            ParamSet::from_bytes(&bytes),
            Err(Error::ParamMalformed { .. })
        ));

        let one = ParamSet::from_params(&[Param::uint(Tag::ALGORITHM, 1)]).unwrap();
        let entry = one.to_bytes().unwrap()[8..].to_vec();
        let mut dup = Vec::new();
        dup.extend_from_slice(&2u32.to_le_bytes());
        dup.extend_from_slice(&24u32.to_le_bytes());
        dup.extend_from_slice(&entry);
        dup.extend_from_slice(&entry);
        assert!(matches!(
            ParamSet::from_bytes(&dup),
            Err(Error::DuplicateTag { .. })
        ));
    }

    #[test]
    fn test_without_and_replace() {
        let mut set = sample();
        let public = set.without(Tag::KEY).unwrap();
        assert!(!public.contains(Tag::KEY));
        assert_eq!(public.len(), set.len() - 1);

        set.replace_bytes(Tag::KEY, vec![1, 2, 3]).unwrap();
        assert_eq!(set.get_bytes(Tag::KEY).unwrap(), &[1, 2, 3]);
        set.wipe_bytes(Tag::KEY);
        assert_eq!(set.get_bytes(Tag::KEY).unwrap(), &[0, 0, 0]);
    }

    #[test]
    fn test_debug_redacts_bytes() {
        let p = Param::bytes(Tag::KEY, vec![0x42; 4]);
        let text = format!("{p:?}");
        assert!(text.contains("len=4"));
        assert!(!text.contains("66"));
    }

    #[test]
    fn test_value_matching() {
        assert!(ParamValue::Bytes(vec![1, 2]).matches(&ParamValue::Bytes(vec![1, 2])));
        assert!(!ParamValue::Bytes(vec![1, 2]).matches(&ParamValue::Bytes(vec![1])));
        assert!(!ParamValue::Uint(1).matches(&ParamValue::Int(1)));
    }
}
