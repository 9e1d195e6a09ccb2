use std::io;

use thiserror::Error;

/// Reasons a request is rejected before it reaches a slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request length must be greater than zero")]
    ZeroLength,
    #[error("length {len} is not a multiple of the block size {block_size}")]
    MisalignedLength { len: usize, block_size: usize },
    #[error("offset {offset} is not a multiple of the block size {block_size}")]
    MisalignedOffset { offset: u64, block_size: usize },
    #[error("offset {offset} + length {len} overflows a 64-bit file position")]
    OffsetOverflow { offset: u64, len: usize },
    #[error("the insert buffer array only accepts reads")]
    IbufWrite,
}

#[derive(Error, Debug)]
pub enum AioError {
    #[error("invalid i/o request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("invalid aio configuration: {0}")]
    InvalidConfig(String),

    #[error("disk full while writing {file} at offset {offset}")]
    DiskFull { file: String, offset: u64 },

    #[error("{operation} on {file} failed: {source}")]
    Io {
        file: String,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("native aio is not available: {0}")]
    NativeUnavailable(String),

    #[error("the i/o subsystem is shutting down")]
    ShuttingDown,
}

impl AioError {
    /// Raw OS error code carried by an I/O failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AioError::Io { source, .. } => source.raw_os_error(),
            AioError::DiskFull { .. } => Some(libc::ENOSPC),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for AioError {
    fn from(err: ConfigError) -> Self {
        AioError::InvalidConfig(err.to_string())
    }
}
