//! Streaming payload multiplexer.
//!
//! Packs any number of named files into one forward-only stream of AEAD frames
//! and unpacks them again, without ever holding a whole file in memory.
//!
//! ## Frame Format
//!
//! ```text
//! [length:4 BE][ciphertext:length]
//!
//! Plaintext of a frame (deflated as a whole when the compressed flag is set):
//! [1][name_len:2 BE][name][size:8 BE]   FILE, starts an entry
//! [2][bytes...]                         DATA, at most CHUNK_SIZE bytes of one entry
//! [3]                                   END, last frame of the stream
//! ```
//!
//! Frame `n` is sealed with the payload nonce XOR `n` (big-endian, last eight
//! bytes), so dropped, repeated or reordered frames fail authentication. A
//! stream without its END frame is truncated and rejected.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use tracing::{debug, trace, warn};

use crate::error::{CdocError, Result};
use crate::fmk::ContentKey;
use crate::metadata::{validate_name, FileInfo, MAX_NAME_LEN};
use crate::suite::{self, AAD_PAYLOAD, NONCE_LEN, TAG_LEN};

/// Largest DATA frame payload (64KB)
pub const CHUNK_SIZE: usize = 64 * 1024;

const KIND_FILE: u8 = 1;
const KIND_DATA: u8 = 2;
const KIND_END: u8 = 3;

const FILE_FRAME_FIXED: usize = 1 + 2 + 8;
const MAX_PLAIN_FRAME: usize = FILE_FRAME_FIXED + MAX_NAME_LEN;
/// Upper bound on a frame's stored length; deflate can grow incompressible input slightly
pub const MAX_FRAME_LEN: usize = MAX_PLAIN_FRAME + 1024 + TAG_LEN;

/// Flags for container format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatFlags {
    pub compressed: bool,
}

impl FormatFlags {
    pub const KNOWN_BITS: u8 = 0x01;

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.compressed {
            flags |= 0x01; // Bit 0: payload frames deflated
        }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            compressed: (byte & 0x01) != 0,
        }
    }
}

/// Additional data bound into every payload frame
pub fn payload_aad(version: u8, flags: FormatFlags) -> Vec<u8> {
    let mut aad = AAD_PAYLOAD.to_vec();
    aad.push(version);
    aad.push(flags.to_byte());
    aad
}

fn frame_nonce(base: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    for (n, c) in nonce[NONCE_LEN - 8..].iter_mut().zip(counter.to_be_bytes()) {
        *n ^= c;
    }
    nonce
}

fn deflate(plain: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(plain.len() / 2), Compression::default());
    encoder.write_all(plain)?;
    Ok(encoder.finish()?)
}

fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    let mut plain = Vec::new();
    DeflateDecoder::new(body)
        .take(MAX_PLAIN_FRAME as u64 + 1)
        .read_to_end(&mut plain)
        .map_err(|e| CdocError::integrity(format!("frame does not inflate: {}", e)))?;
    if plain.len() > MAX_PLAIN_FRAME {
        return Err(CdocError::integrity("inflated frame exceeds size limit"));
    }
    Ok(plain)
}

struct OpenFile {
    name: String,
    declared: u64,
    written: u64,
}

/// Writer half of the multiplexer.
///
/// Bytes handed to [`write`](Self::write) are buffered until a full chunk is
/// available or the current file reaches its declared size.
pub struct PayloadWriter<W: Write> {
    sink: W,
    cipher: XChaCha20Poly1305,
    base_nonce: [u8; NONCE_LEN],
    aad: Vec<u8>,
    flags: FormatFlags,
    counter: u64,
    buffer: Vec<u8>,
    current: Option<OpenFile>,
    names: HashSet<String>,
}

impl<W: Write> PayloadWriter<W> {
    pub fn new(sink: W, key: &ContentKey, base_nonce: [u8; NONCE_LEN], version: u8, flags: FormatFlags) -> Self {
        Self {
            sink,
            cipher: suite::cipher(key.as_bytes()),
            base_nonce,
            aad: payload_aad(version, flags),
            flags,
            counter: 0,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            current: None,
            names: HashSet::new(),
        }
    }

    /// Start a new entry. The previous entry must have received all its bytes.
    pub fn declare_file(&mut self, name: &str, size: u64) -> Result<()> {
        validate_name(name)?;
        self.check_complete()?;
        if self.names.contains(name) {
            return Err(CdocError::DuplicateName(name.to_string()));
        }

        let mut frame = Vec::with_capacity(FILE_FRAME_FIXED + name.len());
        frame.push(KIND_FILE);
        frame.extend_from_slice(&(name.len() as u16).to_be_bytes());
        frame.extend_from_slice(name.as_bytes());
        frame.extend_from_slice(&size.to_be_bytes());
        self.emit(&frame)?;

        debug!(name, size, "declared payload entry");
        self.names.insert(name.to_string());
        self.current = Some(OpenFile {
            name: name.to_string(),
            declared: size,
            written: 0,
        });
        Ok(())
    }

    /// Append bytes to the current entry
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .current
            .as_ref()
            .ok_or_else(|| CdocError::sequence("write before any file was declared"))?;
        let after = file.written + data.len() as u64;
        if after > file.declared {
            return Err(CdocError::SizeMismatch {
                name: file.name.clone(),
                declared: file.declared,
                written: after,
            });
        }
        let complete = after == file.declared;

        let mut input = data;
        while !input.is_empty() {
            let take = (CHUNK_SIZE - self.buffer.len()).min(input.len());
            self.buffer.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.buffer.len() == CHUNK_SIZE {
                self.flush_data()?;
            }
        }
        if complete {
            self.flush_data()?;
        }

        if let Some(file) = self.current.as_mut() {
            file.written = after;
        }
        Ok(())
    }

    /// `SizeMismatch` if the current entry has not received exactly its declared size
    pub fn check_complete(&self) -> Result<()> {
        match &self.current {
            Some(file) if file.written != file.declared => Err(CdocError::SizeMismatch {
                name: file.name.clone(),
                declared: file.declared,
                written: file.written,
            }),
            _ => Ok(()),
        }
    }

    pub fn entries(&self) -> usize {
        self.names.len()
    }

    /// Write the END frame and hand back the sink
    pub fn close(mut self) -> Result<W> {
        self.check_complete()?;
        self.emit(&[KIND_END])?;
        self.sink.flush()?;
        debug!(entries = self.names.len(), frames = self.counter, "payload closed");
        Ok(self.sink)
    }

    fn flush_data(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut frame = Vec::with_capacity(1 + self.buffer.len());
        frame.push(KIND_DATA);
        frame.extend_from_slice(&self.buffer);
        self.buffer.clear();
        self.emit(&frame)
    }

    fn emit(&mut self, plain: &[u8]) -> Result<()> {
        let body = if self.flags.compressed {
            deflate(plain)?
        } else {
            plain.to_vec()
        };
        let nonce = frame_nonce(&self.base_nonce, self.counter);
        #[allow(deprecated)]
        let nonce = XNonce::from_slice(&nonce);
        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: &body, aad: &self.aad })
            .map_err(|e| CdocError::crypto(format!("frame encryption failed: {}", e)))?;

        self.sink.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.sink.write_all(&ciphertext)?;
        trace!(frame = self.counter, len = ciphertext.len(), "frame written");
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| CdocError::crypto("frame counter exhausted"))?;
        Ok(())
    }
}

enum Cursor {
    NoEntry,
    Pending { info: FileInfo, remaining: u64 },
    Consumed,
    End,
}

enum Frame {
    File(FileInfo),
    Data(Vec<u8>),
    End,
}

/// Reader half of the multiplexer. Strictly forward-only.
pub struct PayloadReader<R: Read> {
    source: R,
    cipher: XChaCha20Poly1305,
    base_nonce: [u8; NONCE_LEN],
    aad: Vec<u8>,
    flags: FormatFlags,
    counter: u64,
    cursor: Cursor,
    allow_trailing: bool,
    failed: bool,
}

impl<R: Read> PayloadReader<R> {
    pub fn new(
        source: R,
        key: &ContentKey,
        base_nonce: [u8; NONCE_LEN],
        version: u8,
        flags: FormatFlags,
        allow_trailing: bool,
    ) -> Self {
        Self {
            source,
            cipher: suite::cipher(key.as_bytes()),
            base_nonce,
            aad: payload_aad(version, flags),
            flags,
            counter: 0,
            cursor: Cursor::NoEntry,
            allow_trailing,
            failed: false,
        }
    }

    /// Advance to the next entry; `None` once the END frame has been seen
    pub fn next_entry(&mut self) -> Result<Option<FileInfo>> {
        self.check_failed()?;
        match &self.cursor {
            Cursor::End => return Ok(None),
            Cursor::Pending { info, remaining } if *remaining > 0 => {
                return Err(CdocError::sequence(format!(
                    "entry '{}' still has {} unread bytes",
                    info.name, remaining
                )));
            }
            _ => {}
        }

        let frame = self.guard(|this| this.read_frame())?;
        match frame {
            Frame::File(info) => {
                debug!(name = %info.name, size = info.size, "payload entry");
                self.cursor = Cursor::Pending {
                    remaining: info.size,
                    info: info.clone(),
                };
                Ok(Some(info))
            }
            Frame::End => {
                self.guard(|this| this.check_trailing())?;
                self.cursor = Cursor::End;
                Ok(None)
            }
            Frame::Data(_) => Err(self.fail("data frame outside of an entry")),
        }
    }

    /// Stream the current entry into `sink`. Only authenticated frames reach the sink.
    pub fn read_into<S: Write + ?Sized>(&mut self, sink: &mut S) -> Result<u64> {
        self.check_failed()?;
        let (size, mut remaining) = match &self.cursor {
            Cursor::Pending { info, remaining } if *remaining == info.size => (info.size, *remaining),
            Cursor::Pending { .. } | Cursor::Consumed => {
                return Err(CdocError::sequence("current entry has already been read"))
            }
            Cursor::NoEntry => return Err(CdocError::sequence("no current entry")),
            Cursor::End => return Err(CdocError::sequence("payload already ended")),
        };

        while remaining > 0 {
            match self.guard(|this| this.read_frame())? {
                Frame::Data(bytes) if bytes.len() as u64 <= remaining => {
                    sink.write_all(&bytes)?;
                    remaining -= bytes.len() as u64;
                    if let Cursor::Pending { remaining: left, .. } = &mut self.cursor {
                        *left = remaining;
                    }
                }
                Frame::Data(_) => return Err(self.fail("entry data exceeds declared size")),
                _ => return Err(self.fail("entry ended before its declared size")),
            }
        }
        sink.flush()?;
        self.cursor = Cursor::Consumed;
        Ok(size)
    }

    /// True once the END frame has been authenticated
    pub fn is_finished(&self) -> bool {
        matches!(self.cursor, Cursor::End)
    }

    fn check_failed(&self) -> Result<()> {
        if self.failed {
            return Err(CdocError::integrity("payload stream already failed"));
        }
        Ok(())
    }

    fn fail(&mut self, msg: &str) -> CdocError {
        warn!(frame = self.counter, "{}", msg);
        self.failed = true;
        CdocError::integrity(msg)
    }

    /// Run `f`, marking the stream failed on integrity or I/O errors
    fn guard<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = f(self);
        if let Err(e) = &result {
            if matches!(e, CdocError::Integrity(_) | CdocError::Io(_)) {
                warn!(frame = self.counter, error = %e, "payload stream failed");
                self.failed = true;
            }
        }
        result
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let mut len_buf = [0u8; 4];
        read_exact_or_truncated(&mut self.source, &mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if !(TAG_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(CdocError::integrity(format!("frame length {} out of range", len)));
        }
        let mut ciphertext = vec![0u8; len];
        read_exact_or_truncated(&mut self.source, &mut ciphertext)?;

        let nonce = frame_nonce(&self.base_nonce, self.counter);
        #[allow(deprecated)]
        let nonce = XNonce::from_slice(&nonce);
        let body = self
            .cipher
            .decrypt(nonce, Payload { msg: &ciphertext, aad: &self.aad })
            .map_err(|_| CdocError::integrity(format!("frame {} failed authentication", self.counter)))?;
        trace!(frame = self.counter, len, "frame authenticated");
        self.counter += 1;

        let plain = if self.flags.compressed { inflate(&body)? } else { body };
        parse_frame(plain)
    }

    fn check_trailing(&mut self) -> Result<()> {
        let mut probe = [0u8; 1];
        let extra = loop {
            match self.source.read(&mut probe) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if extra > 0 {
            if self.allow_trailing {
                warn!("ignoring trailing data after payload");
            } else {
                return Err(CdocError::integrity("trailing data after payload"));
            }
        }
        Ok(())
    }
}

fn read_exact_or_truncated<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<()> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CdocError::integrity("payload truncated")
        } else {
            e.into()
        }
    })
}

fn parse_frame(mut plain: Vec<u8>) -> Result<Frame> {
    let Some(&kind) = plain.first() else {
        return Err(CdocError::integrity("empty frame"));
    };
    match kind {
        KIND_FILE => {
            if plain.len() < FILE_FRAME_FIXED {
                return Err(CdocError::integrity("short FILE frame"));
            }
            let name_len = u16::from_be_bytes([plain[1], plain[2]]) as usize;
            if plain.len() != FILE_FRAME_FIXED + name_len {
                return Err(CdocError::integrity("FILE frame length disagrees with name length"));
            }
            let name = std::str::from_utf8(&plain[3..3 + name_len])
                .map_err(|_| CdocError::integrity("entry name is not UTF-8"))?
                .to_string();
            let mut size = [0u8; 8];
            size.copy_from_slice(&plain[3 + name_len..]);
            let info = FileInfo::new(name, u64::from_be_bytes(size))
                .map_err(|e| CdocError::integrity(e.to_string()))?;
            Ok(Frame::File(info))
        }
        KIND_DATA => {
            if plain.len() == 1 || plain.len() > 1 + CHUNK_SIZE {
                return Err(CdocError::integrity("DATA frame size out of range"));
            }
            plain.remove(0);
            Ok(Frame::Data(plain))
        }
        KIND_END if plain.len() == 1 => Ok(Frame::End),
        KIND_END => Err(CdocError::integrity("END frame carries data")),
        other => Err(CdocError::integrity(format!("unknown frame kind {}", other))),
    }
}
