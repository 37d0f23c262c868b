//! Capability providers supplied by the caller.
//!
//! A session borrows one [`SecretProvider`] and, optionally, one
//! [`RemoteProvider`] for its whole lifetime. Both are called synchronously and
//! may block (password prompts, hardware tokens, network round trips); the
//! engine imposes no timeout of its own.

use zeroize::Zeroizing;

use crate::error::{LockError, NetworkError};
use crate::lock::LockType;

/// Secret material handed over by a provider. Wiped when dropped.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Public view of a lock, passed to providers so they can pick the right secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub index: usize,
    pub lock_type: LockType,
    pub label: String,
}

/// Produces password or key material for one lock.
///
/// What the bytes mean depends on the lock type: the password for
/// `Password`, the raw symmetric key for `SymmetricKey`, and the 32-byte X25519
/// private key for `PublicKey`, `Certificate` and `ServerAssisted`.
/// Called exactly once per wrap or unwrap attempt that needs a secret.
pub trait SecretProvider {
    fn provide_secret(&self, lock: &LockInfo) -> Result<SecretBytes, LockError>;
}

/// Network-dependent operations. Failures are reported as [`NetworkError`].
pub trait RemoteProvider {
    /// Certificates available to the current user, raw bytes each
    fn list_certificates(&self) -> Result<Vec<Vec<u8>>, NetworkError>;

    /// Ask the key server to release the capsule referenced by `request`
    fn unwrap_via_server(&self, lock_index: usize, request: &[u8]) -> Result<Vec<u8>, NetworkError>;

    /// Deposit a capsule on `server_id`; returns the transaction id needed to fetch it back
    fn store_capsule(&self, server_id: &str, request: &[u8]) -> Result<String, NetworkError> {
        let _ = request;
        Err(NetworkError::new(format!(
            "storing capsules on server '{}' is not supported",
            server_id
        )))
    }
}

/// Secret provider with no secrets; useful for listing locks or writing
/// containers whose recipients all carry their own material.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretProvider for NoSecrets {
    fn provide_secret(&self, _lock: &LockInfo) -> Result<SecretBytes, LockError> {
        Err(LockError::NoSecret)
    }
}

/// Hands out secrets by lock label.
#[derive(Default)]
pub struct LabelSecrets {
    secrets: Vec<(String, SecretBytes)>,
}

impl LabelSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, label: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.insert(label, secret);
        self
    }

    pub fn insert(&mut self, label: impl Into<String>, secret: impl Into<Vec<u8>>) {
        let label = label.into();
        self.secrets.retain(|(l, _)| *l != label);
        self.secrets.push((label, Zeroizing::new(secret.into())));
    }
}

impl SecretProvider for LabelSecrets {
    fn provide_secret(&self, lock: &LockInfo) -> Result<SecretBytes, LockError> {
        self.secrets
            .iter()
            .find(|(label, _)| *label == lock.label)
            .map(|(_, secret)| secret.clone())
            .ok_or(LockError::NoSecret)
    }
}
