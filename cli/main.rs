use anyhow::{Context, Result};
use cdoc::config::Config;
use cdoc::file_ops::ContainerFileOps;
use cdoc::label::{build_label, label_value, parse_label};
use cdoc::{
    DefaultConfiguration, LabelSecrets, LockInfo, MemoryConsumer, NetworkError, NoSecrets, Reader,
    Recipient, RemoteProvider, Writer, VERSION,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// cdoc - Multi-recipient encrypted containers
#[derive(Parser)]
#[command(name = "cdoc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (falls back to CDOC_CONFIG, then defaults)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt files into a container
    Encrypt {
        /// Container file to create
        #[arg(short, long)]
        out: PathBuf,

        /// Recipient as LABEL:TYPE:VALUE, TYPE one of pw, skey (hex), pkey (hex),
        /// cert (VALUE is CERT_FILE:PUBKEY_HEX)
        #[arg(short, long = "rcpt", required = true)]
        rcpt: Vec<String>,

        /// Deflate the payload
        #[arg(long)]
        compress: bool,

        /// Files to encrypt
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Decrypt a container into a directory
    Decrypt {
        /// Container file
        file: PathBuf,

        /// Label of the lock to open
        #[arg(short, long)]
        label: String,

        /// Password for a password lock
        #[arg(short, long, conflicts_with = "secret")]
        password: Option<String>,

        /// Hex key: symmetric key or X25519 private key
        #[arg(short, long)]
        secret: Option<String>,

        /// Certificate to offer for certificate locks
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// List the locks of a container
    Locks {
        /// Container file
        file: PathBuf,
    },

    /// Run the label codec and an in-memory encrypt/decrypt round trip
    Test,
}

/// Offers locally stored certificates; has no key server.
struct LocalCertificates {
    certificates: Vec<Vec<u8>>,
}

impl RemoteProvider for LocalCertificates {
    fn list_certificates(&self) -> std::result::Result<Vec<Vec<u8>>, NetworkError> {
        Ok(self.certificates.clone())
    }

    fn unwrap_via_server(&self, _lock_index: usize, _request: &[u8]) -> std::result::Result<Vec<u8>, NetworkError> {
        Err(NetworkError::new("no key server available to the command-line tool"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,cdoc=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "cdoc starting");
    let config = Config::load_with_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Encrypt {
            out,
            rcpt,
            compress,
            files,
        } => cmd_encrypt(config, &out, &rcpt, compress, &files).await,

        Commands::Decrypt {
            file,
            label,
            password,
            secret,
            cert,
            out,
        } => cmd_decrypt(config, &file, &label, password, secret, cert, &out).await,

        Commands::Locks { file } => cmd_locks(config, &file).await,

        Commands::Test => cmd_test(),
    }
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

/// Label stored in the lock for a recipient named `name`
fn lock_label(name: &str, kind: &str) -> Result<String> {
    Ok(build_label(&[("v", "1"), ("type", kind), ("label", name)])?)
}

fn parse_key(hex_value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_value.trim()).context("key is not valid hex")?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| anyhow::anyhow!("expected a 32-byte key, got {} bytes", bytes.len()))
}

async fn parse_recipient(arg: &str) -> Result<Recipient> {
    let mut parts = arg.splitn(3, ':');
    let (Some(name), Some(kind), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        anyhow::bail!("recipient '{}' is not LABEL:TYPE:VALUE", arg);
    };
    if name.is_empty() {
        anyhow::bail!("recipient '{}' has an empty label", arg);
    }

    let recipient = match kind {
        "pw" => Recipient::password(lock_label(name, "password")?, value),
        "skey" => Recipient::symmetric_key(
            lock_label(name, "secret")?,
            hex::decode(value).context("symmetric key is not valid hex")?,
        ),
        "pkey" => Recipient::public_key(lock_label(name, "pub_key")?, parse_key(value)?),
        "cert" => {
            let (cert_file, key_hex) = value
                .rsplit_once(':')
                .with_context(|| format!("certificate recipient '{}' needs CERT_FILE:PUBKEY_HEX", name))?;
            let certificate = fs::read(cert_file)
                .await
                .with_context(|| format!("reading certificate {}", cert_file))?;
            Recipient::certificate(lock_label(name, "cert")?, certificate, parse_key(key_hex)?)
        }
        other => anyhow::bail!("unknown recipient type '{}' (expected pw, skey, pkey or cert)", other),
    };
    Ok(recipient)
}

/// The lock whose label names `wanted`, either verbatim or via its `label` key
fn find_lock<'l>(locks: &'l [(LockInfo, String)], wanted: &str) -> Option<&'l LockInfo> {
    locks
        .iter()
        .map(|(info, _)| info)
        .find(|info| info.label == wanted || label_value(&info.label, "label").as_deref() == Some(wanted))
}

async fn cmd_encrypt(
    mut config: Config,
    out: &Path,
    rcpt: &[String],
    compress: bool,
    files: &[PathBuf],
) -> Result<()> {
    config.compress |= compress;
    let mut recipients = Vec::with_capacity(rcpt.len());
    for arg in rcpt {
        recipients.push(parse_recipient(arg).await?);
    }

    let ops = ContainerFileOps::new(config, Arc::new(NoSecrets));
    let spinner = create_spinner(&format!("Encrypting {} file(s)...", files.len()))?;
    let size = ops.encrypt_files(out, recipients, files).await?;
    spinner.finish_with_message(format!("Wrote {} bytes -> {}", size, out.display()));

    for file in files {
        println!("  {}", file.display());
    }
    Ok(())
}

async fn cmd_decrypt(
    config: Config,
    file: &Path,
    label: &str,
    password: Option<String>,
    secret: Option<String>,
    cert: Option<PathBuf>,
    out: &Path,
) -> Result<()> {
    let listing = ContainerFileOps::new(config.clone(), Arc::new(NoSecrets));
    let locks = listing.list_locks(file).await?;
    let lock = find_lock(&locks, label)
        .with_context(|| format!("no lock labelled '{}' in {}", label, file.display()))?
        .clone();

    let secret_bytes = match (password, secret) {
        (Some(pw), _) => pw.into_bytes(),
        (None, Some(hex_value)) => hex::decode(hex_value.trim()).context("secret is not valid hex")?,
        (None, None) => anyhow::bail!("either --password or --secret is required"),
    };
    let secrets = LabelSecrets::new().with(lock.label.clone(), secret_bytes);

    let mut ops = ContainerFileOps::new(config, Arc::new(secrets));
    if let Some(cert) = cert {
        let certificate = fs::read(&cert)
            .await
            .with_context(|| format!("reading certificate {:?}", cert))?;
        ops = ops.with_remote(Arc::new(LocalCertificates {
            certificates: vec![certificate],
        }));
    }

    let spinner = create_spinner(&format!("Decrypting {} with lock {}...", file.display(), lock.index))?;
    let written = ops.decrypt_to_dir(file, lock.index, out).await?;
    spinner.finish_with_message(format!("Decrypted {} file(s) -> {}", written.len(), out.display()));

    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

async fn cmd_locks(config: Config, file: &Path) -> Result<()> {
    let ops = ContainerFileOps::new(config, Arc::new(NoSecrets));
    let locks = ops.list_locks(file).await?;

    if locks.is_empty() {
        println!("No readable locks found");
        return Ok(());
    }

    println!("Locks in {} ({} total):", file.display(), locks.len());
    println!();
    println!("{:<6} {:<40} {}", "INDEX", "LABEL", "TYPE");
    println!("{}", "-".repeat(72));
    for (info, description) in locks {
        let shown = label_value(&info.label, "label").unwrap_or_else(|| info.label.clone());
        println!("{:<6} {:<40} {}", info.index, shown, description);
    }
    Ok(())
}

/// Exercise the label codec and a password round trip entirely in memory
fn cmd_test() -> Result<()> {
    println!("Label codec:");
    let label = build_label(&[("v", "1"), ("type", "password"), ("label", "a&b=c d")])?;
    let pairs = parse_label(&label)?;
    println!("  encoded: {}", label);
    for (key, value) in &pairs {
        println!("  {} = {}", key, value);
    }
    println!();

    println!("Round trip:");
    let config = DefaultConfiguration;
    let mut writer = Writer::create(VERSION, Vec::new(), &config, &NoSecrets, None)?;
    writer.begin_encryption()?;
    let index = writer.add_recipient(&Recipient::password(label.clone(), "pw"))?;
    writer.add_file("a.txt", 3)?;
    writer.write_data(b"abc")?;
    writer.finish_encryption()?;
    let container = writer.into_inner();
    println!("  container: {} bytes, lock {}", container.len(), index);

    let secrets = LabelSecrets::new().with(label, "pw");
    let mut reader = Reader::create(container.as_slice(), false, &config, &secrets, None)?;
    for lock in reader.locks() {
        println!("  lock {}: {} {}", lock.index, lock.lock_type, lock.label);
    }
    let fmk = reader.get_fmk(index)?;
    let mut consumer = MemoryConsumer::default();
    reader.decrypt_all(fmk, &mut consumer)?;
    for (info, data) in &consumer.files {
        println!("  {} ({} bytes): {}", info.name, info.size, String::from_utf8_lossy(data));
    }
    anyhow::ensure!(reader.is_fully_decrypted(), "container was not fully decrypted");
    println!();
    println!("OK");
    Ok(())
}
