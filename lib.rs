//! # cdoc - Multi-Recipient Encrypted Containers
//!
//! cdoc packs one or more named files into a single encrypted container that
//! any number of recipients can open. Every container has one random File
//! Master Key (FMK); each recipient gets a *lock* holding their own wrapped
//! copy of it.
//!
//! ## Features
//!
//! - **Heterogeneous locks**: password, symmetric key, X25519 public key,
//!   certificate and key-server assisted recipients in one container
//! - **Streaming payload**: files flow through 64KB XChaCha20-Poly1305 frames,
//!   never loaded whole into memory
//! - **Pluggable capabilities**: secrets and network access come from caller
//!   supplied [`SecretProvider`] and [`RemoteProvider`] implementations
//! - **Compression**: Optional deflate of payload frames
//! - **Key hygiene**: FMK and derived keys are zeroized on every exit path
//!
//! ## Quick Start
//!
//! ```no_run
//! use cdoc::{DefaultConfiguration, LabelSecrets, NoSecrets, Reader, Recipient, Writer, VERSION};
//!
//! fn main() -> cdoc::Result<()> {
//!     let config = DefaultConfiguration;
//!     let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None)?;
//!     writer.begin_encryption()?;
//!     writer.add_recipient(&Recipient::password("test", "pw"))?;
//!     writer.add_file("a.txt", 3)?;
//!     writer.write_data(b"abc")?;
//!     writer.finish_encryption()?;
//!     let container = writer.into_inner();
//!
//!     let secrets = LabelSecrets::new().with("test", "pw");
//!     let mut reader = Reader::create(container.as_slice(), false, &config, &secrets, None)?;
//!     let fmk = reader.get_fmk(0)?;
//!     reader.begin_decryption(fmk)?;
//!     while let Some(info) = reader.next_file()? {
//!         let mut data: Vec<u8> = Vec::new();
//!         reader.read_file(&mut data)?;
//!         println!("{}: {} bytes", info.name, data.len());
//!     }
//!     reader.finish_decryption()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Container Format
//!
//! See [`container`] for the preamble and header and [`streaming`] for the
//! payload frames.

pub mod config;
pub mod container;
pub mod error;
pub mod file_ops;
pub mod fmk;
pub mod label;
pub mod lock;
pub mod lock_manager;
pub mod metadata;
pub mod provider;
pub mod reader;
pub mod streaming;
pub mod suite;
pub mod util;
pub mod writer;

// Re-export common types for convenience
pub use config::{Config, Configuration, DefaultConfiguration};
pub use container::VERSION;
pub use error::{CdocError, LockError, NetworkError, Result};
pub use fmk::Fmk;
pub use label::{build_label, parse_label};
pub use lock::{LockType, Recipient};
pub use metadata::FileInfo;
pub use provider::{LabelSecrets, LockInfo, NoSecrets, RemoteProvider, SecretBytes, SecretProvider};
pub use reader::{MemoryConsumer, MultiDataConsumer, Reader};
pub use writer::Writer;
