//! appxzip is a small, read-only Zip archive reader
//! for pulling individual files out of APPX packages (and any other Zip archive)
//! using a simple API:
//!
//! ```no_run
//! # use appxzip::*;
//! let mut archive = ZipArchive::open("app.appx")?;
//! let manifest: Vec<u8> = archive.file_contents("AppxManifest.xml")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//! Archives already in memory (or memory-mapped) work just as well:
//! ```no_run
//! # use std::fs;
//! # use appxzip::*;
//! let bytes = fs::read("app.appx")?;
//! let mut archive = ZipArchive::from_bytes(&bytes)?;
//!
//! // Entries come back in central directory order.
//! for entry in archive.entries() {
//!     println!("{} ({} bytes)", entry.path()?, entry.size);
//! }
//! let manifest = archive.file_contents("AppxManifest.xml")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Zip archives keep a central directory at the back of the file
//! telling us where to find each file, which is compressed independently.
//! Opening an archive reads that directory and nothing else.
//! Asking for a file then checks its local header against the directory
//! and reads it out in full, either stored as-is or inflated from DEFLATE.
//! Other compression methods, encryption, and writing are not supported.

pub mod read;
pub mod result;

pub use read::extract;
pub use read::CompressionMethod;
pub use read::FileMetadata;
pub use read::ZipArchive;
pub use result::{ZipError, ZipResult};

mod arch;
mod spec;
