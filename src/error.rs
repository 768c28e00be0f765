use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Minimum memory {min} exceeds maximum memory {max}")]
    MemoryBounds { min: String, max: String },

    #[error("Java executable reports major version {found}, instance requires {required}")]
    JavaMajorMismatch { required: u32, found: u32 },

    #[error("Could not parse java version output: {0}")]
    UnparseableJavaVersion(String),

    #[error("Failed to probe java executable: {0}")]
    JavaProbeFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum SpawnError {
    #[error("Executable not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn process: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    #[error("A session is already running for this instance")]
    AlreadyRunning,

    #[error("Instance not found")]
    InstanceNotFound,

    #[error("Failed to resolve launch credential: {0}")]
    Auth(String),

    #[error("Instance store failure: {0}")]
    Store(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

#[derive(Debug, Clone, Error)]
pub enum MappingError {
    #[error("No controllable gateway discovered")]
    Unavailable,

    #[error("Gateway rejected the mapping (code {code})")]
    Rejected { code: u16 },

    #[error("Gateway did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Malformed gateway response: {0}")]
    Protocol(String),
}

impl MappingError {
    /// Rejections are definitive; everything else may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, MappingError::Rejected { .. })
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Storage backend failure: {0}")]
    Backend(String),
}
