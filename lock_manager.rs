//! Wrapping and unwrapping the FMK, one lock at a time.
//!
//! Unwrapping a lock only ever looks at that lock. Secret-based locks ask the
//! [`SecretProvider`] exactly once per attempt; server and certificate locks
//! also talk to the [`RemoteProvider`], whose failures come back as
//! [`CdocError::Network`] rather than as a lock error.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::{CdocError, LockError, NetworkError, Result};
use crate::fmk::Fmk;
use crate::lock::{check_kdf_iterations, wrap_aad, Capsule, Lock, LockType, Recipient};
use crate::provider::{LockInfo, RemoteProvider, SecretBytes, SecretProvider};
use crate::suite::{self, Key, KEY_LEN, NONCE_LEN, SALT_LEN};
use crate::util::b64_array;

/// Body sent to the key server when depositing a capsule
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreCapsuleRequest {
    #[serde(with = "b64_array")]
    pub recipient_key: [u8; KEY_LEN],
    #[serde(with = "b64_array")]
    pub sender_key: [u8; KEY_LEN],
}

/// Body sent to the key server to fetch a capsule back. The response is the
/// raw 32-byte sender key.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchCapsuleRequest {
    pub server_id: String,
    pub transaction_id: String,
}

pub struct LockManager<'a> {
    secrets: &'a dyn SecretProvider,
    remote: Option<&'a dyn RemoteProvider>,
    config: &'a dyn Configuration,
}

impl<'a> LockManager<'a> {
    pub fn new(
        secrets: &'a dyn SecretProvider,
        remote: Option<&'a dyn RemoteProvider>,
        config: &'a dyn Configuration,
    ) -> Self {
        Self {
            secrets,
            remote,
            config,
        }
    }

    /// Wrap `fmk` for `recipient`, producing the lock stored at `index`.
    /// Salts, nonces and ephemeral keys are fresh on every call.
    pub fn wrap(&self, index: usize, recipient: &Recipient, fmk: &Fmk) -> Result<Lock> {
        let label = recipient.label().to_string();
        let lock_type = recipient.lock_type();
        let info = LockInfo {
            index,
            lock_type,
            label: label.clone(),
        };
        debug!(lock = index, lock_type = %lock_type, "wrapping FMK");

        let (kek, capsule) = match recipient {
            Recipient::Password {
                password,
                kdf_iterations,
                ..
            } => {
                let password = self.secret_for_wrap(&info, password.as_ref())?;
                let iterations = kdf_iterations.unwrap_or_else(|| self.config.kdf_iterations());
                check_kdf_iterations(iterations).map_err(CdocError::Config)?;
                let salt = suite::random_bytes::<SALT_LEN>();
                let pw_salt = suite::random_bytes::<SALT_LEN>();
                let kek = password_kek(&password, &label, &salt, &pw_salt, iterations)?;
                (
                    kek,
                    Capsule::Password {
                        salt,
                        pw_salt,
                        kdf_iterations: iterations,
                    },
                )
            }
            Recipient::SymmetricKey { key, .. } => {
                let key = self.secret_for_wrap(&info, key.as_ref())?;
                if key.is_empty() {
                    return Err(CdocError::crypto("symmetric key cannot be empty"));
                }
                let salt = suite::random_bytes::<SALT_LEN>();
                let kek = suite::hkdf(&key, Some(&salt), &[suite::INFO_KEK, label.as_bytes()])?;
                (kek, Capsule::SymmetricKey { salt })
            }
            Recipient::PublicKey { public_key, .. } => {
                let agreement = suite::agree_ephemeral(public_key)?;
                (
                    agreement.kek,
                    Capsule::PublicKey {
                        recipient_key: *public_key,
                        sender_key: agreement.sender_public,
                    },
                )
            }
            Recipient::Certificate {
                certificate,
                public_key,
                ..
            } => {
                let agreement = suite::agree_ephemeral(public_key)?;
                (
                    agreement.kek,
                    Capsule::Certificate {
                        fingerprint: suite::sha256(certificate),
                        recipient_key: *public_key,
                        sender_key: agreement.sender_public,
                    },
                )
            }
            Recipient::Server {
                public_key,
                server_id,
                ..
            } => {
                let remote = self
                    .remote
                    .ok_or_else(|| NetworkError::new("server-assisted recipient needs a remote provider"))?;
                let server_id = server_id
                    .clone()
                    .or_else(|| self.config.key_server().map(String::from))
                    .ok_or_else(|| CdocError::config("no key server configured"))?;

                let agreement = suite::agree_ephemeral(public_key)?;
                let request = serde_json::to_vec(&StoreCapsuleRequest {
                    recipient_key: *public_key,
                    sender_key: agreement.sender_public,
                })
                .map_err(|e| CdocError::crypto(format!("encoding capsule: {}", e)))?;
                let transaction_id = remote.store_capsule(&server_id, &request)?;
                info!(lock = index, server = %server_id, "capsule stored on key server");
                (
                    agreement.kek,
                    Capsule::Server {
                        recipient_key: *public_key,
                        server_id,
                        transaction_id,
                    },
                )
            }
        };

        let nonce = suite::random_bytes::<NONCE_LEN>();
        let encrypted_fmk = suite::seal(&kek, &nonce, &wrap_aad(lock_type, &label), fmk.as_bytes())?;

        Ok(Lock {
            index,
            label,
            nonce,
            encrypted_fmk,
            capsule,
        })
    }

    /// Recover the FMK from `lock`.
    pub fn unwrap(&self, lock: &Lock) -> Result<Fmk> {
        let info = lock.info();
        let index = lock.index;
        debug!(lock = index, lock_type = %info.lock_type, "unwrapping FMK");

        let kek = match &lock.capsule {
            Capsule::Password {
                salt,
                pw_salt,
                kdf_iterations,
            } => {
                check_kdf_iterations(*kdf_iterations).map_err(CdocError::parse)?;
                let password = self.secret_for_unwrap(&info)?;
                password_kek(&password, &lock.label, salt, pw_salt, *kdf_iterations)?
            }
            Capsule::SymmetricKey { salt } => {
                let key = self.secret_for_unwrap(&info)?;
                suite::hkdf(&key, Some(salt), &[suite::INFO_KEK, lock.label.as_bytes()])?
            }
            Capsule::PublicKey {
                recipient_key,
                sender_key,
            } => {
                let private = self.secret_for_unwrap(&info)?;
                agreed_kek(index, &private, recipient_key, sender_key)?
            }
            Capsule::Certificate {
                fingerprint,
                recipient_key,
                sender_key,
            } => {
                let remote = self.remote_for(index, "certificate")?;
                let certificates = remote.list_certificates()?;
                if !certificates
                    .iter()
                    .any(|cert| suite::sha256(cert) == *fingerprint)
                {
                    warn!(lock = index, offered = certificates.len(), "no matching certificate");
                    return Err(CdocError::lock(index, LockError::CertificateNotFound));
                }
                let private = self.secret_for_unwrap(&info)?;
                agreed_kek(index, &private, recipient_key, sender_key)?
            }
            Capsule::Server {
                recipient_key,
                server_id,
                transaction_id,
            } => {
                let remote = self.remote_for(index, "server-assisted")?;
                let request = serde_json::to_vec(&FetchCapsuleRequest {
                    server_id: server_id.clone(),
                    transaction_id: transaction_id.clone(),
                })
                .map_err(|e| CdocError::crypto(format!("encoding capsule request: {}", e)))?;
                let response = remote.unwrap_via_server(index, &request)?;
                let sender_key = <[u8; KEY_LEN]>::try_from(response.as_slice()).map_err(|_| {
                    NetworkError::new(format!(
                        "key server '{}' returned {} bytes, expected {}",
                        server_id,
                        response.len(),
                        KEY_LEN
                    ))
                })?;
                let private = self.secret_for_unwrap(&info)?;
                agreed_kek(index, &private, recipient_key, &sender_key)?
            }
        };

        let plain = suite::open(
            &kek,
            &lock.nonce,
            &wrap_aad(info.lock_type, &lock.label),
            &lock.encrypted_fmk,
        )
        .ok_or_else(|| {
            warn!(lock = index, "FMK authentication failed");
            CdocError::lock(index, LockError::WrongSecret)
        })?;
        let fmk = Fmk::from_slice(&SecretBytes::new(plain))?;

        info!(lock = index, lock_type = %info.lock_type, "FMK unwrapped");
        Ok(fmk)
    }

    fn secret_for_wrap(&self, info: &LockInfo, inline: Option<&SecretBytes>) -> Result<SecretBytes> {
        match inline {
            Some(secret) => Ok(secret.clone()),
            None => self
                .secrets
                .provide_secret(info)
                .map_err(|e| CdocError::lock(info.index, e)),
        }
    }

    fn secret_for_unwrap(&self, info: &LockInfo) -> Result<SecretBytes> {
        self.secrets
            .provide_secret(info)
            .map_err(|e| CdocError::lock(info.index, e))
    }

    fn remote_for(&self, index: usize, kind: &str) -> Result<&'a dyn RemoteProvider> {
        self.remote.ok_or_else(|| {
            CdocError::lock(
                index,
                LockError::Unsupported(format!("{} lock needs a remote provider", kind)),
            )
        })
    }
}

fn password_kek(
    password: &[u8],
    label: &str,
    salt: &[u8; SALT_LEN],
    pw_salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Result<Key> {
    let stretched = suite::pbkdf2(password, pw_salt, iterations)?;
    suite::hkdf(stretched.as_slice(), Some(salt), &[suite::INFO_KEK, label.as_bytes()])
}

fn agreed_kek(
    index: usize,
    private: &[u8],
    recipient_key: &[u8; KEY_LEN],
    sender_key: &[u8; KEY_LEN],
) -> Result<Key> {
    suite::agree_static(private, recipient_key, sender_key)?
        .ok_or(CdocError::lock(index, LockError::WrongSecret))
}

/// One-line summary of a lock for listings
pub fn describe(lock: &Lock) -> String {
    match &lock.capsule {
        Capsule::Password { kdf_iterations, .. } => {
            format!("{} (PBKDF2, {} iterations)", LockType::Password, kdf_iterations)
        }
        Capsule::Server { server_id, .. } => format!("{} ({})", LockType::ServerAssisted, server_id),
        other => other.lock_type().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfiguration;
    use crate::lock::MAX_KDF_ITERATIONS;
    use crate::provider::{LabelSecrets, NoSecrets};

    const FAST: u32 = 100;

    #[test]
    fn test_password_wrap_unwrap() {
        let config = DefaultConfiguration;
        let manager = LockManager::new(&NoSecrets, None, &config);
        let fmk = Fmk::generate();
        let lock = manager
            .wrap(0, &Recipient::password("pw", "secret").with_kdf_iterations(FAST), &fmk)
            .unwrap();
        assert_eq!(lock.lock_type(), LockType::Password);

        let secrets = LabelSecrets::new().with("pw", "secret");
        let reader = LockManager::new(&secrets, None, &config);
        assert_eq!(reader.unwrap(&lock).unwrap(), fmk);
    }

    #[test]
    fn test_wrong_password_is_wrong_secret() {
        let config = DefaultConfiguration;
        let manager = LockManager::new(&NoSecrets, None, &config);
        let fmk = Fmk::generate();
        let lock = manager
            .wrap(2, &Recipient::password("pw", "secret").with_kdf_iterations(FAST), &fmk)
            .unwrap();

        let secrets = LabelSecrets::new().with("pw", "guess");
        let reader = LockManager::new(&secrets, None, &config);
        assert!(matches!(
            reader.unwrap(&lock),
            Err(CdocError::Lock { index: 2, source: LockError::WrongSecret })
        ));
    }

    #[test]
    fn test_missing_secret_is_passed_through() {
        let config = DefaultConfiguration;
        let manager = LockManager::new(&NoSecrets, None, &config);
        let lock = manager
            .wrap(0, &Recipient::symmetric_key("k", vec![7u8; 32]), &Fmk::generate())
            .unwrap();
        assert!(matches!(
            manager.unwrap(&lock),
            Err(CdocError::Lock { source: LockError::NoSecret, .. })
        ));
    }

    #[test]
    fn test_provider_secret_used_when_recipient_has_none() {
        let config = DefaultConfiguration;
        let secrets = LabelSecrets::new().with("k", vec![1u8; 16]);
        let manager = LockManager::new(&secrets, None, &config);
        let fmk = Fmk::generate();
        let lock = manager
            .wrap(0, &Recipient::symmetric_key_from_provider("k"), &fmk)
            .unwrap();
        assert_eq!(manager.unwrap(&lock).unwrap(), fmk);

        let refused = LockManager::new(&NoSecrets, None, &config)
            .wrap(0, &Recipient::symmetric_key_from_provider("k"), &fmk);
        assert!(matches!(refused, Err(CdocError::Lock { source: LockError::NoSecret, .. })));
    }

    #[test]
    fn test_wrapping_twice_differs() {
        let config = DefaultConfiguration;
        let manager = LockManager::new(&NoSecrets, None, &config);
        let fmk = Fmk::generate();
        let rcpt = Recipient::symmetric_key("k", vec![1u8; 32]);
        let a = manager.wrap(0, &rcpt, &fmk).unwrap();
        let b = manager.wrap(0, &rcpt, &fmk).unwrap();
        assert_ne!(a.encrypted_fmk, b.encrypted_fmk);
        assert_ne!(a.capsule, b.capsule);
    }

    #[test]
    fn test_public_key_lock_needs_matching_private_key() {
        let config = DefaultConfiguration;
        let private = suite::random_bytes::<KEY_LEN>();
        let public = suite::public_key_of(&private);
        let fmk = Fmk::generate();
        let lock = LockManager::new(&NoSecrets, None, &config)
            .wrap(0, &Recipient::public_key("pk", public), &fmk)
            .unwrap();

        let right = LabelSecrets::new().with("pk", private.to_vec());
        assert_eq!(LockManager::new(&right, None, &config).unwrap(&lock).unwrap(), fmk);

        let wrong = LabelSecrets::new().with("pk", suite::random_bytes::<KEY_LEN>().to_vec());
        assert!(matches!(
            LockManager::new(&wrong, None, &config).unwrap(&lock),
            Err(CdocError::Lock { source: LockError::WrongSecret, .. })
        ));
    }

    #[test]
    fn test_certificate_lock_without_remote_is_unsupported() {
        let config = DefaultConfiguration;
        let public = suite::public_key_of(&suite::random_bytes::<KEY_LEN>());
        let lock = LockManager::new(&NoSecrets, None, &config)
            .wrap(0, &Recipient::certificate("c", b"cert".to_vec(), public), &Fmk::generate())
            .unwrap();
        assert!(matches!(
            LockManager::new(&NoSecrets, None, &config).unwrap(&lock),
            Err(CdocError::Lock { source: LockError::Unsupported(_), .. })
        ));
    }

    #[test]
    fn test_server_recipient_without_remote_is_network_error() {
        let config = DefaultConfiguration;
        let public = suite::public_key_of(&suite::random_bytes::<KEY_LEN>());
        let result = LockManager::new(&NoSecrets, None, &config).wrap(
            0,
            &Recipient::server("s", public, Some("ks".into())),
            &Fmk::generate(),
        );
        assert!(matches!(result, Err(CdocError::Network(_))));
    }

    #[test]
    fn test_describe_mentions_parameters() {
        let config = DefaultConfiguration;
        let lock = LockManager::new(&NoSecrets, None, &config)
            .wrap(0, &Recipient::password("pw", "x").with_kdf_iterations(FAST), &Fmk::generate())
            .unwrap();
        assert_eq!(describe(&lock), "password (PBKDF2, 100 iterations)");
    }

    #[test]
    fn test_iteration_count_bounded_both_ways() {
        let config = DefaultConfiguration;
        let manager = LockManager::new(&NoSecrets, None, &config);
        for iterations in [0, MAX_KDF_ITERATIONS + 1] {
            assert!(matches!(
                manager.wrap(0, &Recipient::password("pw", "x").with_kdf_iterations(iterations), &Fmk::generate()),
                Err(CdocError::Config(_))
            ));
        }

        let mut lock = manager
            .wrap(0, &Recipient::password("pw", "x").with_kdf_iterations(FAST), &Fmk::generate())
            .unwrap();
        if let Capsule::Password { kdf_iterations, .. } = &mut lock.capsule {
            *kdf_iterations = u32::MAX;
        }
        let secrets = LabelSecrets::new().with("pw", "x");
        let reader = LockManager::new(&secrets, None, &config);
        assert!(matches!(reader.unwrap(&lock), Err(CdocError::Parse(_))));
    }
}
