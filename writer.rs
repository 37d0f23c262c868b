//! Writer session: generate an FMK, add locks and files, seal the container.
//!
//! Payload frames are spooled (memory first, then a temporary file) until
//! [`Writer::finish_encryption`], because the header listing every lock has to
//! precede them and recipients may still be added between files. The
//! destination receives nothing until the container is complete.

use std::io::{self, Read, Seek, SeekFrom, Write};
use tempfile::SpooledTempFile;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::container::{self, Header, VERSION};
use crate::error::{CdocError, Result};
use crate::fmk::Fmk;
use crate::lock::{Lock, Recipient};
use crate::lock_manager::LockManager;
use crate::metadata::FileInfo;
use crate::provider::{RemoteProvider, SecretProvider};
use crate::streaming::{FormatFlags, PayloadWriter, CHUNK_SIZE};
use crate::suite::{self, INFO_CEK, NONCE_LEN, SUITE_ID};

struct Mismatch {
    name: String,
    declared: u64,
    written: u64,
}

enum State {
    Created,
    Accepting {
        fmk: Fmk,
        payload_nonce: [u8; NONCE_LEN],
        payload: PayloadWriter<SpooledTempFile>,
        locks: Vec<Lock>,
    },
    Sealed,
    Failed(Option<Mismatch>),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Accepting { .. } => "accepting",
            Self::Sealed => "sealed",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct Writer<'a, W: Write> {
    version: u8,
    flags: FormatFlags,
    dest: W,
    config: &'a dyn Configuration,
    locks: LockManager<'a>,
    state: State,
}

impl<'a, W: Write> Writer<'a, W> {
    pub fn create(
        version: u8,
        dest: W,
        config: &'a dyn Configuration,
        secrets: &'a dyn SecretProvider,
        remote: Option<&'a dyn RemoteProvider>,
    ) -> Result<Self> {
        if version != VERSION {
            return Err(CdocError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            flags: FormatFlags {
                compressed: config.compress_payload(),
            },
            dest,
            config,
            locks: LockManager::new(secrets, remote, config),
            state: State::Created,
        })
    }

    /// Generate the FMK and open the payload stream
    pub fn begin_encryption(&mut self) -> Result<()> {
        if !matches!(self.state, State::Created) {
            return Err(self.state_error("begin_encryption"));
        }
        let fmk = Fmk::generate();
        let payload_nonce = suite::random_bytes::<NONCE_LEN>();
        let cek = fmk.derive_content_key(INFO_CEK)?;
        let spool = SpooledTempFile::new(self.config.spool_limit());
        let payload = PayloadWriter::new(spool, &cek, payload_nonce, self.version, self.flags);

        debug!(compressed = self.flags.compressed, "encryption started");
        self.state = State::Accepting {
            fmk,
            payload_nonce,
            payload,
            locks: Vec::new(),
        };
        Ok(())
    }

    /// Wrap the FMK for `recipient`. Returns the new lock's index.
    pub fn add_recipient(&mut self, recipient: &Recipient) -> Result<usize> {
        let State::Accepting { fmk, locks, .. } = &mut self.state else {
            return Err(self.state_error("add_recipient"));
        };
        let index = locks.len();
        let lock = self.locks.wrap(index, recipient, fmk)?;
        locks.push(lock);
        info!(lock = index, lock_type = %recipient.lock_type(), label = recipient.label(), "recipient added");
        Ok(index)
    }

    /// Declare the next file. The previous one must be complete.
    pub fn add_file(&mut self, name: &str, size: u64) -> Result<()> {
        let State::Accepting { payload, .. } = &mut self.state else {
            return Err(self.state_error("add_file"));
        };
        let result = payload.declare_file(name, size);
        self.check(result)
    }

    /// Append bytes to the current file
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let State::Accepting { payload, .. } = &mut self.state else {
            return Err(self.state_error("write_data"));
        };
        let result = payload.write(data);
        self.check(result)
    }

    /// Seal the container and write it to the destination.
    ///
    /// Fails with `NoRecipients` without any lock and `SizeMismatch` while the
    /// last file is incomplete; either way the session is over and the
    /// destination has not been touched.
    pub fn finish_encryption(&mut self) -> Result<()> {
        match &self.state {
            State::Accepting { locks, payload, .. } => {
                if locks.is_empty() {
                    warn!("refusing to seal a container without recipients");
                    self.state = State::Failed(None);
                    return Err(CdocError::NoRecipients);
                }
                let complete = payload.check_complete();
                self.check(complete)?;
            }
            State::Failed(Some(m)) => {
                return Err(CdocError::SizeMismatch {
                    name: m.name.clone(),
                    declared: m.declared,
                    written: m.written,
                })
            }
            _ => return Err(self.state_error("finish_encryption")),
        }

        let State::Accepting {
            fmk,
            payload_nonce,
            payload,
            locks,
        } = std::mem::replace(&mut self.state, State::Failed(None))
        else {
            return Err(self.state_error("finish_encryption"));
        };

        let entries = payload.entries();
        let mut spool = payload.close()?;
        spool.seek(SeekFrom::Start(0))?;

        let header = Header {
            suite: SUITE_ID.to_string(),
            payload_nonce,
            locks,
        };
        let header_len = container::write_header(&mut self.dest, self.version, self.flags, &header, &fmk)?;
        let payload_len = io::copy(&mut spool, &mut self.dest)?;
        self.dest.flush()?;
        fmk.release();

        self.state = State::Sealed;
        info!(
            locks = header.locks.len(),
            entries,
            bytes = header_len + payload_len,
            "container sealed"
        );
        Ok(())
    }

    /// Add every recipient and file, then seal. Each source must yield exactly
    /// the size declared next to it.
    pub fn encrypt_all<S, I>(&mut self, recipients: &[Recipient], files: I) -> Result<()>
    where
        S: Read,
        I: IntoIterator<Item = (FileInfo, S)>,
    {
        if matches!(self.state, State::Created) {
            self.begin_encryption()?;
        }
        for recipient in recipients {
            self.add_recipient(recipient)?;
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        for (info, source) in files {
            self.add_file(&info.name, info.size)?;
            let mut source = source.take(info.size);
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                self.write_data(&buf[..n])?;
            }
        }
        self.finish_encryption()
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn lock_count(&self) -> usize {
        match &self.state {
            State::Accepting { locks, .. } => locks.len(),
            _ => 0,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.state, State::Sealed)
    }

    /// Give back the destination, e.g. to inspect an in-memory container
    pub fn into_inner(self) -> W {
        self.dest
    }

    /// Contract violations and sink failures end the session
    fn check(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(CdocError::SizeMismatch {
                name,
                declared,
                written,
            }) => {
                warn!(name = %name, declared, written, "size contract violated, writer failed");
                self.state = State::Failed(Some(Mismatch {
                    name: name.clone(),
                    declared,
                    written,
                }));
                Err(CdocError::SizeMismatch {
                    name,
                    declared,
                    written,
                })
            }
            Err(e @ CdocError::Io(_)) => {
                warn!(error = %e, "sink failed, writer failed");
                self.state = State::Failed(None);
                Err(e)
            }
            other => other,
        }
    }

    fn state_error(&self, operation: &'static str) -> CdocError {
        CdocError::State {
            operation,
            state: self.state.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::NoSecrets;

    fn fast_config() -> Config {
        Config {
            kdf_iterations: 100,
            ..Config::default()
        }
    }

    #[test]
    fn test_operations_before_begin_are_state_errors() {
        let config = fast_config();
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        assert!(matches!(
            writer.add_recipient(&Recipient::password("p", "x")),
            Err(CdocError::State { operation: "add_recipient", state: "created" })
        ));
        assert!(matches!(writer.add_file("a", 1), Err(CdocError::State { .. })));
        assert!(matches!(writer.write_data(b"a"), Err(CdocError::State { .. })));
        assert!(matches!(writer.finish_encryption(), Err(CdocError::State { .. })));
        writer.begin_encryption().unwrap();
        assert!(matches!(writer.begin_encryption(), Err(CdocError::State { .. })));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let config = fast_config();
        assert!(matches!(
            Writer::create(1, Vec::new(), &config, &NoSecrets, None),
            Err(CdocError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn test_lock_indices_count_up() {
        let config = fast_config();
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        writer.begin_encryption().unwrap();
        assert_eq!(writer.add_recipient(&Recipient::password("a", "1")).unwrap(), 0);
        assert_eq!(writer.add_recipient(&Recipient::symmetric_key("b", vec![2u8; 32])).unwrap(), 1);
        assert_eq!(writer.lock_count(), 2);
    }

    #[test]
    fn test_no_recipients_leaves_destination_empty() {
        let config = fast_config();
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        writer.begin_encryption().unwrap();
        writer.add_file("a", 1).unwrap();
        writer.write_data(b"a").unwrap();
        assert!(matches!(writer.finish_encryption(), Err(CdocError::NoRecipients)));
        assert!(matches!(writer.finish_encryption(), Err(CdocError::State { state: "failed", .. })));
        assert!(!writer.is_sealed());
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_size_mismatch_poisons_and_repeats() {
        let config = fast_config();
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        writer.begin_encryption().unwrap();
        writer.add_recipient(&Recipient::password("p", "x")).unwrap();
        writer.add_file("x", 10).unwrap();
        writer.write_data(b"12345").unwrap();
        assert!(matches!(writer.add_file("y", 1), Err(CdocError::SizeMismatch { .. })));
        assert!(matches!(writer.write_data(b"67890"), Err(CdocError::State { .. })));
        assert!(matches!(
            writer.finish_encryption(),
            Err(CdocError::SizeMismatch { declared: 10, written: 5, .. })
        ));
        assert!(writer.into_inner().is_empty());
    }

    #[test]
    fn test_duplicate_name_does_not_poison() {
        let config = fast_config();
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        writer.begin_encryption().unwrap();
        writer.add_recipient(&Recipient::password("p", "x")).unwrap();
        writer.add_file("a", 0).unwrap();
        assert!(matches!(writer.add_file("a", 0), Err(CdocError::DuplicateName(_))));
        writer.add_file("b", 0).unwrap();
        writer.finish_encryption().unwrap();
        assert!(writer.is_sealed());
        assert!(writer.into_inner().starts_with(b"CDOC"));
    }

    #[test]
    fn test_small_spool_limit_goes_to_disk() {
        let config = Config {
            spool_limit: 16,
            ..fast_config()
        };
        let data = vec![1u8; CHUNK_SIZE + 10];
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        writer
            .encrypt_all(
                &[Recipient::symmetric_key("k", vec![3u8; 32])],
                vec![(FileInfo::new("big", data.len() as u64).unwrap(), data.as_slice())],
            )
            .unwrap();
        assert!(writer.into_inner().len() > data.len());
    }
}
