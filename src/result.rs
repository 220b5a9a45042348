//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from underlying I/O
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The ZIP archive contained invalid or inconsistent data.
    #[error("Invalid Zip archive: {0}")]
    InvalidArchive(&'static str),

    /// The file was compressed with something other than store or DEFLATE.
    #[error("Unsupported compression method {0}")]
    UnsupportedMethod(u16),

    /// The ZIP archive uses an unsupported feature
    /// (spanning across disks, encryption, ...)
    #[error("Unsupported Zip archive: {0}")]
    UnsupportedArchive(String),

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// No entry in the central directory has the requested name
    #[error("No file in the archive named {0}")]
    NoSuchFile(String),

    /// A cast from a 64-bit int to a usize failed while sizing a buffer,
    /// probably on a 32-bit system.
    #[error("Zip entry too large for address space")]
    InsufficientAddressSpace,
}
