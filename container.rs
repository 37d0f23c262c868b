//! Container preamble and authenticated header.
//!
//! ```text
//! ["CDOC"][version:1][flags:1][header_len:4 BE][header JSON][HMAC-SHA256:32][payload frames...]
//! ```
//!
//! The MAC covers the preamble and the header JSON and is keyed from the FMK,
//! so it can only be checked once some lock has been opened.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

use crate::error::{CdocError, Result};
use crate::fmk::Fmk;
use crate::lock::Lock;
use crate::streaming::FormatFlags;
use crate::suite::{self, INFO_HMAC, MAC_LEN, NONCE_LEN, SUITE_ID};
use crate::util::b64_array;

pub const MAGIC: &[u8; 4] = b"CDOC";

/// The only container version this engine reads and writes
pub const VERSION: u8 = 2;

pub const PREAMBLE_LEN: usize = 4 + 1 + 1 + 4;

/// Largest header JSON accepted (16MB)
pub const MAX_HEADER_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct Header {
    pub suite: String,
    #[serde(with = "b64_array")]
    pub payload_nonce: [u8; NONCE_LEN],
    pub locks: Vec<Lock>,
}

/// Header as stored, before lock entries are interpreted
#[derive(Deserialize)]
struct RawHeader {
    suite: String,
    #[serde(with = "b64_array")]
    payload_nonce: [u8; NONCE_LEN],
    locks: Vec<serde_json::Value>,
}

fn preamble(version: u8, flags: FormatFlags, header_len: u32) -> [u8; PREAMBLE_LEN] {
    let mut out = [0u8; PREAMBLE_LEN];
    out[..4].copy_from_slice(MAGIC);
    out[4] = version;
    out[5] = flags.to_byte();
    out[6..].copy_from_slice(&header_len.to_be_bytes());
    out
}

fn header_mac(fmk: &Fmk, preamble: &[u8], json: &[u8]) -> Result<[u8; MAC_LEN]> {
    let key = fmk.derive_content_key(INFO_HMAC)?;
    suite::hmac_sha256(key.as_bytes(), &[preamble, json])
}

/// Write preamble, header and header MAC. Returns the number of bytes written.
pub fn write_header<W: Write>(
    sink: &mut W,
    version: u8,
    flags: FormatFlags,
    header: &Header,
    fmk: &Fmk,
) -> Result<u64> {
    let json = serde_json::to_vec(header).map_err(|e| CdocError::parse(format!("encoding header: {}", e)))?;
    if json.len() > MAX_HEADER_LEN {
        return Err(CdocError::parse(format!("header is {} bytes, limit is {}", json.len(), MAX_HEADER_LEN)));
    }
    let pre = preamble(version, flags, json.len() as u32);
    let mac = header_mac(fmk, &pre, &json)?;

    sink.write_all(&pre)?;
    sink.write_all(&json)?;
    sink.write_all(&mac)?;
    debug!(locks = header.locks.len(), header_len = json.len(), "header written");
    Ok((PREAMBLE_LEN + json.len() + MAC_LEN) as u64)
}

/// A parsed header whose MAC has not been checked yet
#[derive(Debug)]
pub struct ParsedHeader {
    pub version: u8,
    pub flags: FormatFlags,
    pub payload_nonce: [u8; NONCE_LEN],
    /// Usable locks, each carrying its position in the stored table
    pub locks: Vec<Lock>,
    pub skipped_locks: usize,
    preamble: [u8; PREAMBLE_LEN],
    json: Vec<u8>,
    mac: [u8; MAC_LEN],
}

impl ParsedHeader {
    /// Check the header MAC with the key derived from `fmk`
    pub fn verify(&self, fmk: &Fmk) -> Result<()> {
        let key = fmk.derive_content_key(INFO_HMAC)?;
        if suite::hmac_verify(key.as_bytes(), &[self.preamble.as_slice(), self.json.as_slice()], &self.mac)? {
            Ok(())
        } else {
            warn!("header MAC mismatch");
            Err(CdocError::integrity("header authentication failed"))
        }
    }

    pub fn lock(&self, index: usize) -> Option<&Lock> {
        self.locks.iter().find(|lock| lock.index == index)
    }
}

fn read_exact_or_parse<R: Read>(source: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CdocError::parse(format!("container truncated in {}", what))
        } else {
            e.into()
        }
    })
}

/// Read and parse everything up to the first payload frame.
///
/// With `ignore_data_errors` set, lock entries that do not parse are skipped
/// instead of failing the whole header.
pub fn read_header<R: Read>(source: &mut R, ignore_data_errors: bool) -> Result<ParsedHeader> {
    let mut pre = [0u8; PREAMBLE_LEN];
    read_exact_or_parse(source, &mut pre, "preamble")?;
    if &pre[..4] != MAGIC {
        return Err(CdocError::parse("not a CDOC container"));
    }
    let version = pre[4];
    if version != VERSION {
        return Err(CdocError::UnsupportedVersion(version));
    }
    if pre[5] & !FormatFlags::KNOWN_BITS != 0 {
        return Err(CdocError::parse(format!("unknown format flags {:#04x}", pre[5])));
    }
    let flags = FormatFlags::from_byte(pre[5]);
    let header_len = u32::from_be_bytes([pre[6], pre[7], pre[8], pre[9]]) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(CdocError::parse(format!("header length {} exceeds limit", header_len)));
    }

    let mut json = vec![0u8; header_len];
    read_exact_or_parse(source, &mut json, "header")?;
    let mut mac = [0u8; MAC_LEN];
    read_exact_or_parse(source, &mut mac, "header MAC")?;

    let raw: RawHeader =
        serde_json::from_slice(&json).map_err(|e| CdocError::parse(format!("malformed header: {}", e)))?;
    if raw.suite != SUITE_ID {
        return Err(CdocError::parse(format!("unsupported algorithm suite '{}'", raw.suite)));
    }
    if raw.locks.is_empty() {
        return Err(CdocError::parse("container has no locks"));
    }

    let mut locks = Vec::with_capacity(raw.locks.len());
    let mut skipped_locks = 0;
    for (index, value) in raw.locks.into_iter().enumerate() {
        let parsed = serde_json::from_value::<Lock>(value)
            .map_err(|e| e.to_string())
            .and_then(|lock| lock.capsule.check().map(|()| lock));
        match parsed {
            Ok(mut lock) => {
                lock.index = index;
                locks.push(lock);
            }
            Err(e) if ignore_data_errors => {
                warn!(lock = index, error = %e, "skipping unreadable lock");
                skipped_locks += 1;
            }
            Err(e) => return Err(CdocError::parse(format!("lock {}: {}", index, e))),
        }
    }

    debug!(version, locks = locks.len(), skipped_locks, compressed = flags.compressed, "header parsed");
    Ok(ParsedHeader {
        version,
        flags,
        payload_nonce: raw.payload_nonce,
        locks,
        skipped_locks,
        preamble: pre,
        json,
        mac,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::Capsule;
    use crate::suite::SALT_LEN;
    use std::io::Cursor;

    fn sample_lock() -> Lock {
        Lock {
            index: 0,
            label: "data:v=1".to_string(),
            nonce: [1u8; NONCE_LEN],
            encrypted_fmk: vec![0u8; 48],
            capsule: Capsule::SymmetricKey { salt: [2u8; SALT_LEN] },
        }
    }

    fn encoded(fmk: &Fmk, locks: Vec<Lock>) -> Vec<u8> {
        let header = Header {
            suite: SUITE_ID.to_string(),
            payload_nonce: [3u8; NONCE_LEN],
            locks,
        };
        let mut out = Vec::new();
        let n = write_header(&mut out, VERSION, FormatFlags { compressed: true }, &header, fmk).unwrap();
        assert_eq!(n as usize, out.len());
        out
    }

    #[test]
    fn test_header_round_trip_and_mac() {
        let fmk = Fmk::generate();
        let bytes = encoded(&fmk, vec![sample_lock(), sample_lock()]);
        let parsed = read_header(&mut Cursor::new(bytes), false).unwrap();
        assert_eq!(parsed.version, VERSION);
        assert!(parsed.flags.compressed);
        assert_eq!(parsed.payload_nonce, [3u8; NONCE_LEN]);
        assert_eq!(parsed.locks.len(), 2);
        assert_eq!(parsed.locks[1].index, 1);
        assert!(parsed.verify(&fmk).is_ok());
        assert!(matches!(parsed.verify(&Fmk::generate()), Err(CdocError::Integrity(_))));
    }

    #[test]
    fn test_modified_header_fails_mac() {
        let fmk = Fmk::generate();
        let mut bytes = encoded(&fmk, vec![sample_lock()]);
        let pos = bytes
            .windows(8)
            .position(|w| w == b"data:v=1")
            .unwrap();
        bytes[pos + 7] = b'2';
        let parsed = read_header(&mut Cursor::new(bytes), false).unwrap();
        assert_eq!(parsed.locks[0].label, "data:v=2");
        assert!(matches!(parsed.verify(&fmk), Err(CdocError::Integrity(_))));
    }

    #[test]
    fn test_rejects_bad_preamble() {
        assert!(matches!(
            read_header(&mut Cursor::new(b"NOPE".to_vec()), false),
            Err(CdocError::Parse(_))
        ));
        assert!(matches!(
            read_header(&mut Cursor::new(b"XDOC\x02\x00\x00\x00\x00\x00".to_vec()), false),
            Err(CdocError::Parse(_))
        ));
        assert!(matches!(
            read_header(&mut Cursor::new(b"CDOC\x01\x00\x00\x00\x00\x00".to_vec()), false),
            Err(CdocError::UnsupportedVersion(1))
        ));
        assert!(matches!(
            read_header(&mut Cursor::new(b"CDOC\x02\x80\x00\x00\x00\x00".to_vec()), false),
            Err(CdocError::Parse(_))
        ));
        assert!(matches!(
            read_header(&mut Cursor::new(b"CDOC\x02\x00\xff\xff\xff\xff".to_vec()), false),
            Err(CdocError::Parse(_))
        ));
    }

    #[test]
    fn test_unreadable_lock_skipped_only_when_ignoring_errors() {
        let fmk = Fmk::generate();
        let good = serde_json::to_value(sample_lock()).unwrap();
        let json = serde_json::json!({
            "suite": SUITE_ID,
            "payload_nonce": "AwMDAwMDAwMDAwMDAwMDAwMDAwMDAwMD",
            "locks": [{"label": "future", "capsule": {"type": "quantum"}}, good],
        });
        let json = serde_json::to_vec(&json).unwrap();
        let pre = preamble(VERSION, FormatFlags::default(), json.len() as u32);
        let mac = header_mac(&fmk, &pre, &json).unwrap();
        let bytes = [pre.as_slice(), json.as_slice(), mac.as_slice()].concat();

        assert!(matches!(
            read_header(&mut Cursor::new(bytes.clone()), false),
            Err(CdocError::Parse(_))
        ));
        let parsed = read_header(&mut Cursor::new(bytes), true).unwrap();
        assert_eq!(parsed.skipped_locks, 1);
        assert_eq!(parsed.locks.len(), 1);
        assert_eq!(parsed.locks[0].index, 1);
        assert!(parsed.lock(1).is_some());
        assert!(parsed.lock(0).is_none());
        assert!(parsed.verify(&fmk).is_ok());
    }

    #[test]
    fn test_out_of_range_kdf_iterations_treated_as_malformed_lock() {
        use crate::lock::MAX_KDF_ITERATIONS;

        for iterations in [0, MAX_KDF_ITERATIONS + 1, u32::MAX] {
            let fmk = Fmk::generate();
            let hostile = Lock {
                capsule: Capsule::Password {
                    salt: [4u8; SALT_LEN],
                    pw_salt: [5u8; SALT_LEN],
                    kdf_iterations: iterations,
                },
                ..sample_lock()
            };
            let bytes = encoded(&fmk, vec![hostile, sample_lock()]);

            assert!(
                matches!(read_header(&mut Cursor::new(bytes.clone()), false), Err(CdocError::Parse(_))),
                "strict parse accepted {iterations} iterations"
            );
            let parsed = read_header(&mut Cursor::new(bytes), true).unwrap();
            assert_eq!(parsed.skipped_locks, 1);
            assert!(parsed.lock(0).is_none());
            assert_eq!(parsed.lock(1).map(|l| l.index), Some(1));
        }
    }

    #[test]
    fn test_empty_lock_table_rejected() {
        let fmk = Fmk::generate();
        let bytes = encoded(&fmk, Vec::new());
        assert!(matches!(
            read_header(&mut Cursor::new(bytes), true),
            Err(CdocError::Parse(_))
        ));
    }
}
