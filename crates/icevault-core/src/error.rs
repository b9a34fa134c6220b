use thiserror::Error;

pub type Result<T> = std::result::Result<T, IcevaultError>;

#[derive(Debug, Error)]
pub enum IcevaultError {
    #[error("storage vault error: {0}")]
    Vault(String),

    #[error("object not found in vault: '{0}'")]
    NoSuchKey(String),

    #[error("vault access denied: {0}")]
    AccessDenied(String),

    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),

    #[error("chunking '{path}' failed after {attempts} attempts: {source}")]
    ChunkRetriesExhausted {
        path: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk manifest conflict for etag {etag}: length {seen} does not match recorded {recorded}")]
    ManifestConflict { etag: String, seen: u32, recorded: u32 },

    #[error("recovery point cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("got cancel request")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl IcevaultError {
    /// The distinguished cancellation sentinel. Never merged with real
    /// failures; short-circuits dependent tasks.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IcevaultError::Cancelled)
    }

    /// Source-side errors that skip a single file instead of failing the
    /// whole backup (the file is recorded with the error flag set).
    pub fn is_soft_file_error(&self) -> bool {
        matches!(
            self,
            IcevaultError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            )
        )
    }
}
