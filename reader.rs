//! Reader session: parse the lock table, open one lock, stream the files out.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::container::{self, ParsedHeader};
use crate::error::{CdocError, Result};
use crate::fmk::Fmk;
use crate::lock::Lock;
use crate::lock_manager::LockManager;
use crate::metadata::FileInfo;
use crate::provider::{LockInfo, RemoteProvider, SecretProvider};
use crate::streaming::PayloadReader;
use crate::suite::INFO_CEK;

/// Receives every entry during [`Reader::decrypt_all`]
pub trait MultiDataConsumer {
    type Sink: Write;

    fn open_entry(&mut self, info: &FileInfo) -> io::Result<Self::Sink>;

    fn close_entry(&mut self, info: &FileInfo, sink: Self::Sink) -> io::Result<()>;

    /// Called instead of `close_entry` when the entry failed part way through
    fn abort_entry(&mut self, info: &FileInfo, sink: Self::Sink) {
        let _ = info;
        drop(sink);
    }
}

/// Collects every entry in memory
#[derive(Debug, Default)]
pub struct MemoryConsumer {
    pub files: Vec<(FileInfo, Vec<u8>)>,
}

impl MultiDataConsumer for MemoryConsumer {
    type Sink = Vec<u8>;

    fn open_entry(&mut self, info: &FileInfo) -> io::Result<Vec<u8>> {
        Ok(Vec::with_capacity(info.size.min(1 << 20) as usize))
    }

    fn close_entry(&mut self, info: &FileInfo, sink: Vec<u8>) -> io::Result<()> {
        self.files.push((info.clone(), sink));
        Ok(())
    }
}

/// Writes every entry into a directory. Entry names are reduced to their final
/// path component, so a container cannot write outside `dir`. Existing files
/// are never replaced: a second entry landing on the same path, or a file
/// already present in `dir`, fails with `AlreadyExists`.
#[derive(Debug)]
pub struct DirectoryConsumer {
    dir: PathBuf,
    pub written: Vec<PathBuf>,
}

impl DirectoryConsumer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
        }
    }

    pub fn target(&self, info: &FileInfo) -> io::Result<PathBuf> {
        let name = info
            .name
            .rsplit(['/', '\\'])
            .next()
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("unusable entry name '{}'", info.name))
            })?;
        Ok(self.dir.join(name))
    }
}

pub struct OutputFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl MultiDataConsumer for DirectoryConsumer {
    type Sink = OutputFile;

    fn open_entry(&mut self, info: &FileInfo) -> io::Result<OutputFile> {
        let path = self.target(info)?;
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let writer = BufWriter::new(file);
        Ok(OutputFile { path, writer })
    }

    fn close_entry(&mut self, _info: &FileInfo, mut sink: OutputFile) -> io::Result<()> {
        sink.writer.flush()?;
        self.written.push(sink.path);
        Ok(())
    }

    fn abort_entry(&mut self, info: &FileInfo, sink: OutputFile) {
        let OutputFile { path, writer } = sink;
        drop(writer);
        if let Err(e) = fs::remove_file(&path) {
            warn!(name = %info.name, error = %e, "could not remove partial output");
        }
    }
}

enum State<R: Read> {
    LocksParsed { source: R },
    FmkObtained { source: R },
    Decrypting { fmk: Fmk, payload: PayloadReader<R> },
    Finished { complete: bool },
    /// Transient placeholder while moving between states
    Poisoned,
}

impl<R: Read> State<R> {
    fn name(&self) -> &'static str {
        match self {
            Self::LocksParsed { .. } => "locks parsed",
            Self::FmkObtained { .. } => "FMK obtained",
            Self::Decrypting { .. } => "decrypting",
            Self::Finished { .. } => "finished",
            Self::Poisoned => "poisoned",
        }
    }
}

pub struct Reader<'a, R: Read> {
    header: ParsedHeader,
    locks: LockManager<'a>,
    ignore_data_errors: bool,
    state: State<R>,
}

impl<'a, R: Read> Reader<'a, R> {
    /// Parse the container header and lock table from `source`
    pub fn create(
        mut source: R,
        ignore_data_errors: bool,
        config: &'a dyn Configuration,
        secrets: &'a dyn SecretProvider,
        remote: Option<&'a dyn RemoteProvider>,
    ) -> Result<Self> {
        let header = container::read_header(&mut source, ignore_data_errors)?;
        info!(version = header.version, locks = header.locks.len(), "container opened");
        Ok(Self {
            header,
            locks: LockManager::new(secrets, remote, config),
            ignore_data_errors,
            state: State::LocksParsed { source },
        })
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn is_compressed(&self) -> bool {
        self.header.flags.compressed
    }

    pub fn locks(&self) -> Vec<LockInfo> {
        self.header.locks.iter().map(Lock::info).collect()
    }

    pub fn lock(&self, index: usize) -> Option<&Lock> {
        self.header.lock(index)
    }

    /// Locks dropped while parsing because `ignore_data_errors` was set
    pub fn skipped_locks(&self) -> usize {
        self.header.skipped_locks
    }

    /// First lock made for `certificate`
    pub fn lock_for_certificate(&self, certificate: &[u8]) -> Option<LockInfo> {
        self.header
            .locks
            .iter()
            .find(|lock| lock.matches_certificate(certificate))
            .map(Lock::info)
    }

    /// Unwrap lock `index` and check the header MAC with the result.
    ///
    /// A lock or network failure leaves the session where it was, so another
    /// lock can be tried.
    pub fn get_fmk(&mut self, index: usize) -> Result<Fmk> {
        if !matches!(self.state, State::LocksParsed { .. } | State::FmkObtained { .. }) {
            return Err(self.state_error("get_fmk"));
        }
        let lock = self.header.lock(index).ok_or(CdocError::NoSuchLock(index))?;
        let fmk = self.locks.unwrap(lock)?;
        self.header.verify(&fmk)?;

        if let State::LocksParsed { .. } = self.state {
            if let State::LocksParsed { source } = std::mem::replace(&mut self.state, State::Poisoned) {
                self.state = State::FmkObtained { source };
            }
        }
        Ok(fmk)
    }

    /// Start streaming the payload. The session owns `fmk` from here on and
    /// wipes it in [`finish_decryption`](Self::finish_decryption).
    pub fn begin_decryption(&mut self, fmk: Fmk) -> Result<()> {
        if !matches!(self.state, State::LocksParsed { .. } | State::FmkObtained { .. }) {
            return Err(self.state_error("begin_decryption"));
        }
        self.header.verify(&fmk)?;
        let cek = fmk.derive_content_key(INFO_CEK)?;

        let source = match std::mem::replace(&mut self.state, State::Poisoned) {
            State::LocksParsed { source } | State::FmkObtained { source } => source,
            _ => return Err(self.state_error("begin_decryption")),
        };
        let payload = PayloadReader::new(
            source,
            &cek,
            self.header.payload_nonce,
            self.header.version,
            self.header.flags,
            self.ignore_data_errors,
        );
        debug!("decryption started");
        self.state = State::Decrypting { fmk, payload };
        Ok(())
    }

    /// Next entry, or `None` at the end of the payload
    pub fn next_file(&mut self) -> Result<Option<FileInfo>> {
        match &mut self.state {
            State::Decrypting { payload, .. } => payload.next_entry(),
            _ => Err(self.state_error("next_file")),
        }
    }

    /// Stream the current entry into `sink`; returns the bytes delivered
    pub fn read_file<S: Write + ?Sized>(&mut self, sink: &mut S) -> Result<u64> {
        match &mut self.state {
            State::Decrypting { payload, .. } => payload.read_into(sink),
            _ => Err(self.state_error("read_file")),
        }
    }

    /// End the session and wipe the FMK. Stopping before the end of the
    /// payload is allowed but leaves the container not fully decrypted.
    pub fn finish_decryption(&mut self) -> Result<()> {
        if !matches!(self.state, State::Decrypting { .. }) {
            return Err(self.state_error("finish_decryption"));
        }
        let State::Decrypting { fmk, payload } = std::mem::replace(&mut self.state, State::Poisoned) else {
            return Err(self.state_error("finish_decryption"));
        };
        fmk.release();
        let complete = payload.is_finished();
        if complete {
            info!("decryption finished");
        } else {
            warn!("decryption stopped before the end of the payload");
        }
        self.state = State::Finished { complete };
        Ok(())
    }

    pub fn is_fully_decrypted(&self) -> bool {
        matches!(self.state, State::Finished { complete: true })
    }

    /// Stream every entry into `consumer`, then finish. Returns the entry count.
    pub fn decrypt_all<C: MultiDataConsumer>(&mut self, fmk: Fmk, consumer: &mut C) -> Result<usize> {
        self.begin_decryption(fmk)?;
        let drained = self.drain(consumer);
        let finished = self.finish_decryption();
        let count = drained?;
        finished?;
        Ok(count)
    }

    fn drain<C: MultiDataConsumer>(&mut self, consumer: &mut C) -> Result<usize> {
        let mut count = 0;
        while let Some(info) = self.next_file()? {
            let mut sink = consumer.open_entry(&info)?;
            match self.read_file(&mut sink) {
                Ok(_) => consumer.close_entry(&info, sink)?,
                Err(e) => {
                    consumer.abort_entry(&info, sink);
                    return Err(e);
                }
            }
            count += 1;
        }
        Ok(count)
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
    use crate::config::{Config, DefaultConfiguration};
    use crate::container::VERSION;
    use crate::lock::Recipient;
    use crate::provider::{LabelSecrets, NoSecrets};
    use crate::writer::Writer;

    #[test]
    fn test_directory_consumer_keeps_final_component() {
        let consumer = DirectoryConsumer::new("/out");
        let target = |name: &str| consumer.target(&FileInfo { name: name.to_string(), size: 0 });
        assert_eq!(target("a.txt").unwrap(), PathBuf::from("/out/a.txt"));
        assert_eq!(target("../../etc/passwd").unwrap(), PathBuf::from("/out/passwd"));
        assert_eq!(target("dir\\win.txt").unwrap(), PathBuf::from("/out/win.txt"));
        assert!(target("dir/").is_err());
        assert!(target("..").is_err());
    }

    fn sealed(files: &[(&str, &[u8])]) -> Vec<u8> {
        let config = Config {
            kdf_iterations: 100,
            ..Config::default()
        };
        let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None).unwrap();
        writer.begin_encryption().unwrap();
        writer.add_recipient(&Recipient::symmetric_key("k", vec![7u8; 32])).unwrap();
        for (name, data) in files {
            writer.add_file(name, data.len() as u64).unwrap();
            writer.write_data(data).unwrap();
        }
        writer.finish_encryption().unwrap();
        writer.into_inner()
    }

    fn decrypt_into(container: &[u8], consumer: &mut DirectoryConsumer) -> Result<usize> {
        let config = DefaultConfiguration;
        let secrets = LabelSecrets::new().with("k", vec![7u8; 32]);
        let mut reader = Reader::create(container, false, &config, &secrets, None)?;
        let fmk = reader.get_fmk(0)?;
        reader.decrypt_all(fmk, consumer)
    }

    #[test]
    fn test_directory_consumer_refuses_colliding_names() {
        let tmp = tempfile::TempDir::new().unwrap();
        let container = sealed(&[("a/x", b"first".as_slice()), ("b/x", b"second".as_slice())]);

        let mut consumer = DirectoryConsumer::new(tmp.path());
        let err = decrypt_into(&container, &mut consumer).unwrap_err();
        assert!(matches!(&err, CdocError::Io(e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(consumer.written, vec![tmp.path().join("x")]);
        assert_eq!(fs::read(tmp.path().join("x")).unwrap(), b"first");
    }

    #[test]
    fn test_directory_consumer_keeps_existing_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::write(tmp.path().join("report.txt"), b"mine").unwrap();
        let container = sealed(&[("report.txt", b"theirs".as_slice())]);

        let mut consumer = DirectoryConsumer::new(tmp.path());
        assert!(decrypt_into(&container, &mut consumer).is_err());
        assert!(consumer.written.is_empty());
        assert_eq!(fs::read(tmp.path().join("report.txt")).unwrap(), b"mine");
    }

    #[test]
    fn test_memory_consumer_collects() {
        let mut consumer = MemoryConsumer::default();
        let info = FileInfo::new("a", 2).unwrap();
        let mut sink = consumer.open_entry(&info).unwrap();
        sink.extend_from_slice(b"hi");
        consumer.close_entry(&info, sink).unwrap();
        assert_eq!(consumer.files, vec![(info, b"hi".to_vec())]);
    }
}
