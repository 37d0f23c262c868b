//! Locks and recipients.
//!
//! A [`Recipient`] describes who should be able to open a container; wrapping
//! the FMK for it produces a [`Lock`], which is what the container stores.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::provider::{LockInfo, SecretBytes};
use crate::suite::{self, KEY_LEN, NONCE_LEN, SALT_LEN};
use crate::util::{b64, b64_array};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Password,
    SymmetricKey,
    PublicKey,
    Certificate,
    ServerAssisted,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::SymmetricKey => "symmetric_key",
            Self::PublicKey => "public_key",
            Self::Certificate => "certificate",
            Self::ServerAssisted => "server",
        }
    }

    /// Lock types whose secret is a shared password or key rather than a private key
    pub fn is_symmetric(&self) -> bool {
        matches!(self, Self::Password | Self::SymmetricKey)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most PBKDF2 iterations a password lock may ask for. The count is read
/// before the header can be authenticated.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;

/// Type-specific parameters needed to re-derive the key-encryption key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Capsule {
    Password {
        #[serde(with = "b64_array")]
        salt: [u8; SALT_LEN],
        #[serde(with = "b64_array")]
        pw_salt: [u8; SALT_LEN],
        kdf_iterations: u32,
    },
    SymmetricKey {
        #[serde(with = "b64_array")]
        salt: [u8; SALT_LEN],
    },
    PublicKey {
        #[serde(with = "b64_array")]
        recipient_key: [u8; KEY_LEN],
        #[serde(with = "b64_array")]
        sender_key: [u8; KEY_LEN],
    },
    Certificate {
        #[serde(with = "b64_array")]
        fingerprint: [u8; 32],
        #[serde(with = "b64_array")]
        recipient_key: [u8; KEY_LEN],
        #[serde(with = "b64_array")]
        sender_key: [u8; KEY_LEN],
    },
    Server {
        #[serde(with = "b64_array")]
        recipient_key: [u8; KEY_LEN],
        server_id: String,
        transaction_id: String,
    },
}

impl Capsule {
    pub fn lock_type(&self) -> LockType {
        match self {
            Self::Password { .. } => LockType::Password,
            Self::SymmetricKey { .. } => LockType::SymmetricKey,
            Self::PublicKey { .. } => LockType::PublicKey,
            Self::Certificate { .. } => LockType::Certificate,
            Self::Server { .. } => LockType::ServerAssisted,
        }
    }

    /// Reject parameters no writer of this format produces
    pub fn check(&self) -> std::result::Result<(), String> {
        match self {
            Self::Password { kdf_iterations, .. } => check_kdf_iterations(*kdf_iterations),
            _ => Ok(()),
        }
    }
}

pub fn check_kdf_iterations(iterations: u32) -> std::result::Result<(), String> {
    if iterations == 0 || iterations > MAX_KDF_ITERATIONS {
        return Err(format!(
            "kdf_iterations {} outside 1..={}",
            iterations, MAX_KDF_ITERATIONS
        ));
    }
    Ok(())
}

/// One recipient's wrapped copy of the FMK. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Position in the container's lock table
    #[serde(skip)]
    pub index: usize,
    pub label: String,
    #[serde(with = "b64_array")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub encrypted_fmk: Vec<u8>,
    pub capsule: Capsule,
}

impl Lock {
    pub fn lock_type(&self) -> LockType {
        self.capsule.lock_type()
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            index: self.index,
            lock_type: self.lock_type(),
            label: self.label.clone(),
        }
    }

    /// Recipient public key for the asymmetric lock types
    pub fn recipient_key(&self) -> Option<&[u8; KEY_LEN]> {
        match &self.capsule {
            Capsule::PublicKey { recipient_key, .. }
            | Capsule::Certificate { recipient_key, .. }
            | Capsule::Server { recipient_key, .. } => Some(recipient_key),
            _ => None,
        }
    }

    pub fn has_key(&self, public_key: &[u8]) -> bool {
        self.recipient_key()
            .is_some_and(|key| key.as_slice() == public_key)
    }

    /// True if this lock was made for `certificate`
    pub fn matches_certificate(&self, certificate: &[u8]) -> bool {
        match &self.capsule {
            Capsule::Certificate { fingerprint, .. } => *fingerprint == suite::sha256(certificate),
            _ => false,
        }
    }
}

/// Additional data bound into the FMK wrap
pub(crate) fn wrap_aad(lock_type: LockType, label: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(lock_type.as_str().len() + 1 + label.len());
    aad.extend_from_slice(lock_type.as_str().as_bytes());
    aad.push(0);
    aad.extend_from_slice(label.as_bytes());
    aad
}

/// Writer-side description of an intended lock.
///
/// Password and symmetric-key recipients may leave their secret out; the writer
/// then asks its secret provider for it, keyed by the new lock's index and label.
pub enum Recipient {
    Password {
        label: String,
        password: Option<SecretBytes>,
        kdf_iterations: Option<u32>,
    },
    SymmetricKey {
        label: String,
        key: Option<SecretBytes>,
    },
    PublicKey {
        label: String,
        public_key: [u8; KEY_LEN],
    },
    Certificate {
        label: String,
        certificate: Vec<u8>,
        public_key: [u8; KEY_LEN],
    },
    Server {
        label: String,
        public_key: [u8; KEY_LEN],
        server_id: Option<String>,
    },
}

impl Recipient {
    pub fn password(label: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self::Password {
            label: label.into(),
            password: Some(SecretBytes::new(password.into())),
            kdf_iterations: None,
        }
    }

    pub fn password_from_provider(label: impl Into<String>) -> Self {
        Self::Password {
            label: label.into(),
            password: None,
            kdf_iterations: None,
        }
    }

    pub fn symmetric_key(label: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self::SymmetricKey {
            label: label.into(),
            key: Some(SecretBytes::new(key.into())),
        }
    }

    pub fn symmetric_key_from_provider(label: impl Into<String>) -> Self {
        Self::SymmetricKey {
            label: label.into(),
            key: None,
        }
    }

    pub fn public_key(label: impl Into<String>, public_key: [u8; KEY_LEN]) -> Self {
        Self::PublicKey {
            label: label.into(),
            public_key,
        }
    }

    /// Certificate parsing is the caller's job; pass the certificate bytes together
    /// with the X25519 key they certify.
    pub fn certificate(
        label: impl Into<String>,
        certificate: impl Into<Vec<u8>>,
        public_key: [u8; KEY_LEN],
    ) -> Self {
        Self::Certificate {
            label: label.into(),
            certificate: certificate.into(),
            public_key,
        }
    }

    /// `server_id` falls back to the configured key server when `None`
    pub fn server(label: impl Into<String>, public_key: [u8; KEY_LEN], server_id: Option<String>) -> Self {
        Self::Server {
            label: label.into(),
            public_key,
            server_id,
        }
    }

    /// Override the PBKDF2 iteration count of a password recipient; ignored for other kinds
    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        if let Self::Password { kdf_iterations, .. } = &mut self {
            *kdf_iterations = Some(iterations);
        }
        self
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Password { label, .. }
            | Self::SymmetricKey { label, .. }
            | Self::PublicKey { label, .. }
            | Self::Certificate { label, .. }
            | Self::Server { label, .. } => label,
        }
    }

    pub fn lock_type(&self) -> LockType {
        match self {
            Self::Password { .. } => LockType::Password,
            Self::SymmetricKey { .. } => LockType::SymmetricKey,
            Self::PublicKey { .. } => LockType::PublicKey,
            Self::Certificate { .. } => LockType::Certificate,
            Self::Server { .. } => LockType::ServerAssisted,
        }
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("type", &self.lock_type())
            .field("label", &self.label())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lock(capsule: Capsule) -> Lock {
        Lock {
            index: 3,
            label: "data:cn=test".to_string(),
            nonce: [1u8; NONCE_LEN],
            encrypted_fmk: vec![2u8; 48],
            capsule,
        }
    }

    #[test]
    fn test_lock_json_round_trip_keeps_capsule() {
        let lock = sample_lock(Capsule::Password {
            salt: [3u8; SALT_LEN],
            pw_salt: [4u8; SALT_LEN],
            kdf_iterations: 1000,
        });
        let json = serde_json::to_string(&lock).unwrap();
        assert!(json.contains(r#""type":"password""#));
        assert!(!json.contains("index"));

        let mut parsed: Lock = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.index, 0);
        parsed.index = 3;
        assert_eq!(parsed, lock);
    }

    #[test]
    fn test_unknown_capsule_type_fails_to_parse() {
        let json = r#"{"label":"x","nonce":"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA","encrypted_fmk":"","capsule":{"type":"quantum"}}"#;
        assert!(serde_json::from_str::<Lock>(json).is_err());
    }

    #[test]
    fn test_key_and_certificate_matching() {
        let cert = b"certificate bytes".to_vec();
        let lock = sample_lock(Capsule::Certificate {
            fingerprint: suite::sha256(&cert),
            recipient_key: [5u8; KEY_LEN],
            sender_key: [6u8; KEY_LEN],
        });
        assert_eq!(lock.lock_type(), LockType::Certificate);
        assert!(lock.has_key(&[5u8; KEY_LEN]));
        assert!(!lock.has_key(&[6u8; KEY_LEN]));
        assert!(lock.matches_certificate(&cert));
        assert!(!lock.matches_certificate(b"other"));

        let info = lock.info();
        assert_eq!(info.index, 3);
        assert_eq!(info.lock_type, LockType::Certificate);
    }

    #[test]
    fn test_recipient_debug_hides_secret() {
        let rcpt = Recipient::password("label", "hunter2").with_kdf_iterations(10);
        let shown = format!("{:?}", rcpt);
        assert!(shown.contains("label"));
        assert!(!shown.contains("hunter2"));
        match rcpt {
            Recipient::Password { kdf_iterations, .. } => assert_eq!(kdf_iterations, Some(10)),
            other => panic!("unexpected recipient {:?}", other),
        }
    }

    #[test]
    fn test_aad_binds_type_and_label() {
        assert_ne!(wrap_aad(LockType::Password, "a"), wrap_aad(LockType::SymmetricKey, "a"));
        assert_ne!(wrap_aad(LockType::Password, "a"), wrap_aad(LockType::Password, "b"));
    }
}
