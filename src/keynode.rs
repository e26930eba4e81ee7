//! Decrypted key handles and the session table.

use crate::crypto::CryptoProvider;
use crate::keyblob;
use crate::param::{ParamSet, Tag};
use crate::{Error, KeyAlg, KeyPurpose, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Maximum number of concurrently open sessions
pub const MAX_KEY_NODE_COUNT: usize = 100;

/// Whether a node is registered in the session table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyNodeStatus {
    /// Bound to a live session
    Active,
    /// Not (or no longer) bound to a session
    Inactive,
}

struct KeyNodeInner {
    params: ParamSet,
    active: AtomicBool,
    handle: AtomicU64,
}

impl Drop for KeyNodeInner {
    fn drop(&mut self) {
        self.params.wipe_bytes(Tag::KEY);
        tracing::trace!(handle = self.handle.load(Ordering::Relaxed), "key node released");
    }
}

/// Reference-counted handle on a decrypted parameter set.
///
/// Cloning shares the node. The clear key bytes are wiped when the last
/// clone is dropped.
#[derive(Clone)]
pub struct KeyNode {
    inner: Arc<KeyNodeInner>,
}

impl std::fmt::Debug for KeyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyNode")
            .field("status", &self.status())
            .field("handle", &self.handle())
            .field("ref_count", &self.ref_count())
            .finish_non_exhaustive()
    }
}

impl KeyNode {
    /// Wrap a decrypted parameter set. The node starts `Inactive`.
    pub fn new(params: ParamSet) -> Self {
        Self {
            inner: Arc::new(KeyNodeInner {
                params,
                active: AtomicBool::new(false),
                handle: AtomicU64::new(0),
            }),
        }
    }

    /// The decrypted parameter set, `KEY` included
    pub fn params(&self) -> &ParamSet {
        &self.inner.params
    }

    /// Clear key material
    pub fn raw_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        keyblob::get_raw_key(&self.inner.params)
    }

    /// Stored key algorithm
    pub fn alg(&self) -> Result<KeyAlg> {
        KeyAlg::from_u32(self.inner.params.get_uint(Tag::ALGORITHM)?)
    }

    /// Current status
    pub fn status(&self) -> KeyNodeStatus {
        if self.inner.active.load(Ordering::Acquire) {
            KeyNodeStatus::Active
        } else {
            KeyNodeStatus::Inactive
        }
    }

    /// Session handle, 0 when unregistered
    pub fn handle(&self) -> u64 {
        self.inner.handle.load(Ordering::Acquire)
    }

    /// Number of live clones
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    fn activate(&self, handle: u64) {
        self.inner.handle.store(handle, Ordering::Release);
        self.inner.active.store(true, Ordering::Release);
    }

    fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
    }
}

/// What a session was opened to do
#[derive(Debug)]
pub struct Operation {
    /// Stored key algorithm
    pub alg: KeyAlg,
    /// Requested purpose (single bit)
    pub purpose: KeyPurpose,
    /// Request parameters as supplied to `init`
    pub request: ParamSet,
}

/// One open `init → update* → finish | abort` sequence
pub struct Session {
    node: KeyNode,
    operation: Operation,
    alias: Vec<u8>,
    data: Mutex<Zeroizing<Vec<u8>>>,
}

impl Session {
    /// The key node driving this session
    pub fn node(&self) -> &KeyNode {
        &self.node
    }

    /// The operation this session performs
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Alias of the key
    pub fn alias(&self) -> &[u8] {
        &self.alias
    }

    /// Buffer input for `finish`
    pub fn append(&self, chunk: &[u8]) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::storage("session_update", "lock poisoned"))?;
        data.extend_from_slice(chunk);
        Ok(())
    }

    /// Take the buffered input, leaving the buffer empty
    pub fn take_data(&self) -> Result<Zeroizing<Vec<u8>>> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::storage("session_finish", "lock poisoned"))?;
        Ok(std::mem::take(&mut *data))
    }
}

/// Table of open sessions keyed by random 64-bit handles
pub struct SessionManager {
    crypto: Arc<dyn CryptoProvider>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    limit: usize,
}

impl SessionManager {
    /// Empty table with the default limit
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self::with_limit(crypto, MAX_KEY_NODE_COUNT)
    }

    /// Empty table holding at most `limit` sessions
    pub fn with_limit(crypto: Arc<dyn CryptoProvider>, limit: usize) -> Self {
        Self {
            crypto,
            sessions: Mutex::new(HashMap::new()),
            limit,
        }
    }

    /// Register a session for `node` and mark the node `Active`
    pub fn create(&self, node: KeyNode, operation: Operation, alias: &[u8]) -> Result<u64> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| Error::storage("session_create", "lock poisoned"))?;
        if sessions.len() >= self.limit {
            tracing::warn!(limit = self.limit, "session table full");
            return Err(Error::SessionReachedLimit { limit: self.limit });
        }
        let handle = loop {
            let mut buf = [0u8; 8];
            self.crypto.fill_random(&mut buf)?;
            let candidate = u64::from_le_bytes(buf);
            if candidate != 0 && !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        node.activate(handle);
        sessions.insert(
            handle,
            Arc::new(Session {
                node,
                operation,
                alias: alias.to_vec(),
                data: Mutex::new(Zeroizing::new(Vec::new())),
            }),
        );
        tracing::debug!(handle, alias = %hex::encode(alias), "session opened");
        Ok(handle)
    }

    /// Look up a live session
    pub fn get(&self, handle: u64) -> Result<Arc<Session>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| Error::storage("session_get", "lock poisoned"))?;
        sessions
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::not_exist(format!("session {handle:#x}")))
    }

    /// Unregister a session and mark its node `Inactive`.
    ///
    /// A second removal of the same handle fails with [`Error::NotExist`].
    pub fn remove(&self, handle: u64) -> Result<Arc<Session>> {
        let session = {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|_| Error::storage("session_remove", "lock poisoned"))?;
            sessions
                .remove(&handle)
                .ok_or_else(|| Error::not_exist(format!("session {handle:#x}")))?
        };
        session.node.deactivate();
        tracing::debug!(handle, "session closed");
        Ok(session)
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether no session is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
