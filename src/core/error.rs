use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Insufficient space: {required} blocks required, {free} free")]
    InsufficientSpace { required: usize, free: usize },

    #[error("Insufficient contiguous space: no free run of {required} blocks")]
    InsufficientContiguousSpace { required: usize },

    #[error("Path too long: {len} bytes (limit {limit})")]
    PathTooLong { len: usize, limit: usize },

    #[error("Invalid entry name: {0}")]
    InvalidName(String),

    #[error("Invalid volume geometry: {0}")]
    InvalidGeometry(String),

    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    #[error("Passphrase does not match image")]
    BadPassphrase,

    #[error("Unsupported image version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Allocation inconsistency: {0}")]
    AllocationInconsistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for VolumeError {
    fn from(err: toml::de::Error) -> Self {
        VolumeError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VolumeError>;
