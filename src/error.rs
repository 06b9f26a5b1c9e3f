use thiserror::Error;

/// Error taxonomy of the metadata engine. Allocator and cache errors surface
/// to the caller unmasked; user-visible rendering is the dispatcher's concern.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("out of space")]
    OutOfSpace,
    #[error("corrupt superblock: {0}")]
    CorruptSuperblock(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("already in use")]
    AlreadyInUse,
    #[error("not supported")]
    NotSupported,
}

pub type Result<T> = std::result::Result<T, FsError>;
