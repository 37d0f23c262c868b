use thiserror::Error;

/// Failures reported by a [`SecretProvider`](crate::provider::SecretProvider) or
/// raised while unwrapping a single lock. Recoverable: another lock may still work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The provider has no secret for this lock
    #[error("no secret available")]
    NoSecret,

    /// The secret was supplied but does not open the lock
    #[error("wrong secret")]
    WrongSecret,

    /// None of the certificates offered by the remote provider match the lock
    #[error("no matching certificate")]
    CertificateNotFound,

    /// The lock kind cannot be opened with the configured providers
    #[error("unsupported lock: {0}")]
    Unsupported(String),
}

/// A remote provider could not complete a network-dependent operation.
/// Kept apart from [`LockError`] so "can't reach server" never reads as "wrong secret".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network error: {message}")]
pub struct NetworkError {
    pub message: String,
}

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Custom error types for container operations
#[derive(Debug, Error)]
pub enum CdocError {
    /// Malformed or unsupported container header or lock table
    #[error("Parse error: {0}")]
    Parse(String),

    /// Container version not handled by this engine
    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u8),

    /// Unwrapping a specific lock failed
    #[error("Lock {index}: {source}")]
    Lock {
        index: usize,
        #[source]
        source: LockError,
    },

    /// No lock with this index exists in the container
    #[error("No such lock: {0}")]
    NoSuchLock(usize),

    /// Remote provider unreachable or failed
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Tampered or corrupt payload or header
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Payload operation called out of order (e.g. next entry before the current one is read)
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Session operation not valid in the current state
    #[error("State error: {operation} not allowed while {state}")]
    State {
        operation: &'static str,
        state: &'static str,
    },

    /// A file did not receive exactly its declared number of bytes
    #[error("Size mismatch for '{name}': declared {declared} bytes, got {written}")]
    SizeMismatch {
        name: String,
        declared: u64,
        written: u64,
    },

    /// The container would have no locks
    #[error("No recipients: at least one lock is required")]
    NoRecipients,

    /// File name declared twice in one container
    #[error("Duplicate file name: {0}")]
    DuplicateName(String),

    /// File name empty or too long
    #[error("Invalid file name: {0}")]
    InvalidName(String),

    /// Label codec input is malformed
    #[error("Format error: {0}")]
    Format(String),

    /// Primitive failure (RNG, key derivation, bad key material)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Underlying source or sink failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdocError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn lock(index: usize, source: LockError) -> Self {
        Self::Lock { index, source }
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn sequence(msg: impl Into<String>) -> Self {
        Self::Sequence(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for failures the caller may recover from by trying another lock or provider setup
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Lock { .. } | Self::Network(_) | Self::NoSuchLock(_))
    }
}

pub type Result<T, E = CdocError> = std::result::Result<T, E>;
