//! Filesystem operations on container files.
//!
//! This module provides [`ContainerFileOps`], the path-based interface used by
//! the command-line tool. The engine itself is synchronous and works on byte
//! streams; each operation here runs it on tokio's blocking pool.
//!
//! ## Features
//!
//! - Encrypt a list of files into one container
//! - Decrypt a container into a directory
//! - List the locks of a container without any secret

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::VERSION;
use crate::lock::Recipient;
use crate::lock_manager::describe;
use crate::metadata::FileInfo;
use crate::provider::{LockInfo, NoSecrets, RemoteProvider, SecretProvider};
use crate::reader::{DirectoryConsumer, Reader};
use crate::writer::Writer;

pub type SharedSecrets = Arc<dyn SecretProvider + Send + Sync>;
pub type SharedRemote = Arc<dyn RemoteProvider + Send + Sync>;

pub struct ContainerFileOps {
    config: Config,
    secrets: SharedSecrets,
    remote: Option<SharedRemote>,
}

impl ContainerFileOps {
    pub fn new(config: Config, secrets: SharedSecrets) -> Self {
        Self {
            config,
            secrets,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: SharedRemote) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Encrypt `inputs` into a new container at `output`.
    /// Entries are named after the final component of each input path.
    /// Returns the container size in bytes.
    pub async fn encrypt_files(
        &self,
        output: &Path,
        recipients: Vec<Recipient>,
        inputs: &[PathBuf],
    ) -> Result<u64> {
        let mut entries = Vec::with_capacity(inputs.len());
        for input in inputs {
            let name = input
                .file_name()
                .with_context(|| format!("input {:?} has no file name", input))?
                .to_string_lossy()
                .into_owned();
            let size = fs::metadata(input)
                .await
                .with_context(|| format!("reading metadata for {:?}", input))?
                .len();
            entries.push((FileInfo::new(name, size)?, input.clone()));
        }
        debug!(output = %output.display(), files = entries.len(), recipients = recipients.len(), "encrypting files");

        let dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let output = output.to_path_buf();
        let config = self.config.clone();
        let secrets = Arc::clone(&self.secrets);
        let remote = self.remote.clone();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut sources = Vec::with_capacity(entries.len());
            for (info, path) in entries {
                let file = File::open(&path).with_context(|| format!("opening {:?}", path))?;
                sources.push((info, BufReader::new(file)));
            }

            let tmp = NamedTempFile::new_in(&dir).with_context(|| format!("creating temp file in {:?}", dir))?;
            let mut writer = Writer::create(
                VERSION,
                BufWriter::new(tmp),
                &config,
                &*secrets,
                remote.as_deref().map(|r| r as &dyn RemoteProvider),
            )?;
            writer.encrypt_all(&recipients, sources)?;

            let tmp = writer.into_inner().into_inner().map_err(|e| e.into_error())?;
            let file = tmp
                .persist(&output)
                .with_context(|| format!("writing container {:?}", output))?;
            let size = file.metadata()?.len();
            info!(output = %output.display(), bytes = size, "container written");
            Ok(size)
        })
        .await
        .context("encryption task failed")?
    }

    /// Open lock `lock_index` of `container` and write every entry into `out_dir`.
    /// Returns the paths written.
    pub async fn decrypt_to_dir(&self, container: &Path, lock_index: usize, out_dir: &Path) -> Result<Vec<PathBuf>> {
        debug!(container = %container.display(), lock = lock_index, "decrypting container");
        fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("creating output directory {:?}", out_dir))?;

        let container = container.to_path_buf();
        let out_dir = out_dir.to_path_buf();
        let config = self.config.clone();
        let secrets = Arc::clone(&self.secrets);
        let remote = self.remote.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let file = File::open(&container).with_context(|| format!("opening {:?}", container))?;
            let mut reader = Reader::create(
                BufReader::new(file),
                false,
                &config,
                &*secrets,
                remote.as_deref().map(|r| r as &dyn RemoteProvider),
            )?;
            let fmk = reader.get_fmk(lock_index)?;
            let mut consumer = DirectoryConsumer::new(&out_dir);
            let count = reader.decrypt_all(fmk, &mut consumer)?;
            info!(container = %container.display(), entries = count, "container decrypted");
            Ok(consumer.written)
        })
        .await
        .context("decryption task failed")?
    }

    /// Locks of `container` with a one-line description each.
    /// Unreadable lock entries are skipped.
    pub async fn list_locks(&self, container: &Path) -> Result<Vec<(LockInfo, String)>> {
        let container = container.to_path_buf();
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<(LockInfo, String)>> {
            let file = File::open(&container).with_context(|| format!("opening {:?}", container))?;
            let reader = Reader::create(BufReader::new(file), true, &config, &NoSecrets, None)?;
            if reader.skipped_locks() > 0 {
                warn!(skipped = reader.skipped_locks(), "some locks could not be read");
            }
            let locks = reader
                .locks()
                .into_iter()
                .filter_map(|info| {
                    let description = describe(reader.lock(info.index)?);
                    Some((info, description))
                })
                .collect();
            Ok(locks)
        })
        .await
        .context("listing task failed")?
    }
}
