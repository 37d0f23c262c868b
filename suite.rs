//! The concrete algorithm suite.
//!
//! - Key derivation: HKDF-SHA256, PBKDF2-HMAC-SHA256 for passwords
//! - Key agreement: X25519 with an ephemeral sender key
//! - Wrapping and payload: XChaCha20-Poly1305
//! - Header authentication: HMAC-SHA256
//!
//! Everything here is stateless; keys are passed in and derived keys are
//! returned in [`Zeroizing`] buffers.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{CdocError, Result};

/// Identifier written into every header
pub const SUITE_ID: &str = "X25519+HKDF-SHA256+PBKDF2-SHA256+XChaCha20Poly1305";

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const SALT_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

pub const INFO_CEK: &[u8] = b"CDOC20cek";
pub const INFO_HMAC: &[u8] = b"CDOC20hmac";
pub const INFO_KEK: &[u8] = b"CDOC20kek";
pub const AAD_PAYLOAD: &[u8] = b"CDOC20payload";

type HmacSha256 = Hmac<Sha256>;

pub type Key = Zeroizing<[u8; KEY_LEN]>;

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// HKDF-SHA256 extract-and-expand to a 256-bit key
pub fn hkdf(ikm: &[u8], salt: Option<&[u8]>, info: &[&[u8]]) -> Result<Key> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand_multi_info(info, &mut okm[..])
        .map_err(|e| CdocError::crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Stretch a password with PBKDF2-HMAC-SHA256
pub fn pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> Result<Key> {
    if iterations == 0 {
        return Err(CdocError::crypto("PBKDF2 iterations must be at least 1"));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out[..]);
    Ok(out)
}

pub fn cipher(key: &[u8; KEY_LEN]) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(key.into())
}

/// AEAD seal
pub fn seal(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    #[allow(deprecated)]
    let nonce = XNonce::from_slice(nonce);
    cipher(key)
        .encrypt(nonce, Payload { msg, aad })
        .map_err(|e| CdocError::crypto(format!("encryption failed: {}", e)))
}

/// AEAD open; authentication failure is `None` so each caller can pick its own error
pub fn open(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8], ct: &[u8]) -> Option<Vec<u8>> {
    #[allow(deprecated)]
    let nonce = XNonce::from_slice(nonce);
    cipher(key).decrypt(nonce, Payload { msg: ct, aad }).ok()
}

pub fn hmac_sha256(key: &[u8], data: &[&[u8]]) -> Result<[u8; MAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CdocError::crypto(format!("HMAC key rejected: {}", e)))?;
    for part in data {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC check
pub fn hmac_verify(key: &[u8], data: &[&[u8]], tag: &[u8]) -> Result<bool> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CdocError::crypto(format!("HMAC key rejected: {}", e)))?;
    for part in data {
        mac.update(part);
    }
    Ok(mac.verify_slice(tag).is_ok())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Result of an ephemeral agreement on the sending side
pub struct Agreement {
    pub sender_public: [u8; KEY_LEN],
    pub kek: Key,
}

/// Sender side: fresh ephemeral key, agree with `recipient`, derive the KEK
pub fn agree_ephemeral(recipient: &[u8; KEY_LEN]) -> Result<Agreement> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let sender_public = PublicKey::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&PublicKey::from(*recipient));
    if !shared.was_contributory() {
        return Err(CdocError::crypto("recipient public key is a low-order point"));
    }
    let kek = hkdf(shared.as_bytes(), Some(sender_public.as_slice()), &[INFO_KEK, recipient.as_slice()])?;
    Ok(Agreement { sender_public, kek })
}

/// Recipient side. Returns `None` when `private` does not belong to `recipient`
/// or the agreement is degenerate.
pub fn agree_static(
    private: &[u8],
    recipient: &[u8; KEY_LEN],
    sender_public: &[u8; KEY_LEN],
) -> Result<Option<Key>> {
    let Ok(bytes) = <[u8; KEY_LEN]>::try_from(private).map(Zeroizing::new) else {
        return Ok(None);
    };
    let secret = StaticSecret::from(*bytes);
    if PublicKey::from(&secret).as_bytes() != recipient {
        return Ok(None);
    }
    let shared = secret.diffie_hellman(&PublicKey::from(*sender_public));
    if !shared.was_contributory() {
        return Ok(None);
    }
    hkdf(shared.as_bytes(), Some(sender_public.as_slice()), &[INFO_KEK, recipient.as_slice()]).map(Some)
}

/// Public half of an X25519 private key
pub fn public_key_of(private: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    PublicKey::from(&StaticSecret::from(*private)).to_bytes()
}
