//! File Master Key lifecycle.
//!
//! This module provides [`Fmk`], the per-container 256-bit key that every lock
//! wraps, and [`ContentKey`], the keys actually used on the payload and header.
//!
//! ## Security Features
//!
//! - Keys are zeroized on drop (via `Zeroize` trait)
//! - Cryptographically secure random generation via `OsRng`
//! - The FMK never encrypts payload bytes itself; it only feeds HKDF

use rand_core::{OsRng, RngCore};
use std::fmt;
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{CdocError, Result};
use crate::suite::{self, KEY_LEN};

pub const FMK_LEN: usize = KEY_LEN;

/// The File Master Key of one container.
pub struct Fmk {
    key_bytes: [u8; FMK_LEN],
}

impl Drop for Fmk {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl fmt::Debug for Fmk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fmk(..)")
    }
}

impl PartialEq for Fmk {
    fn eq(&self, other: &Self) -> bool {
        // fixed-length compare without early exit
        self.key_bytes
            .iter()
            .zip(other.key_bytes.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for Fmk {}

impl Fmk {
    pub fn generate() -> Self {
        debug!("generating new file master key");
        let mut key_bytes = [0u8; FMK_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        Self { key_bytes }
    }

    /// Rebuild an FMK from raw bytes, e.g. one obtained out of band
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FMK_LEN {
            return Err(CdocError::crypto(format!(
                "expected {}-byte FMK but found {} bytes",
                FMK_LEN,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; FMK_LEN];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { key_bytes })
    }

    pub fn as_bytes(&self) -> &[u8; FMK_LEN] {
        &self.key_bytes
    }

    /// Derive the key used for `context` (one of the `suite::INFO_*` labels)
    pub fn derive_content_key(&self, context: &[u8]) -> Result<ContentKey> {
        let key = suite::hkdf(&self.key_bytes, None, &[context])?;
        Ok(ContentKey { key_bytes: *key })
    }

    /// Wipe the key now. Same as dropping it.
    pub fn release(self) {
        drop(self);
    }
}

/// A key derived from the FMK. Zeroized on drop.
pub struct ContentKey {
    key_bytes: [u8; KEY_LEN],
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl ContentKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key_bytes
    }
}
