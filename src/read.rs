//! Tools for reading a ZIP archive.
//!
//! To start reading an archive, first create a [`ZipArchive`] from a file,
//! a byte buffer, or anything else that's [`Read`] + [`Seek`].
//!
//! [`ZipArchive`]: struct.ZipArchive.html
//! [`Read`]: https://doc.rust-lang.org/std/io/trait.Read.html
//! [`Seek`]: https://doc.rust-lang.org/std/io/trait.Seek.html

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, prelude::*, BufReader, SeekFrom};

use camino::Utf8Path;
use chrono::NaiveDateTime;
use codepage_437::*;
use flate2::read::DeflateDecoder;
use log::*;

use crate::arch::usize;
use crate::result::*;
use crate::spec;

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// Metadata for a file in the archive,
/// retrieved from its central directory
///
/// This is plain data: it doesn't refer back to the archive it came from,
/// so it can be cloned, sent between threads,
/// and handed to [`extract()`] along with any handle to the same archive.
///
/// [`extract()`]: fn.extract.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// The file's name, exactly as stored in the central directory
    pub file_name: Vec<u8>,

    /// Uncompressed size of the file in bytes
    pub size: u64,

    /// Compressed size of the file in bytes
    pub compressed_size: u64,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// The general purpose bit flags
    pub flags: u16,

    /// MS-DOS modification time, as stored
    pub last_modified_time: u16,

    /// MS-DOS modification date, as stored
    pub last_modified_date: u16,

    /// The offset to the local file header in the archive
    pub header_offset: u64,
}

impl FileMetadata {
    /// Decodes the file's name as a path.
    ///
    /// Names flagged as UTF-8 must be valid UTF-8;
    /// everything else is read as code page 437.
    /// Lookups don't use this: they match the raw bytes.
    pub fn path(&self) -> ZipResult<Cow<'_, Utf8Path>> {
        if self.is_utf8() {
            let utf8 = std::str::from_utf8(&self.file_name)?;
            Ok(Cow::Borrowed(Utf8Path::new(utf8)))
        } else {
            let str_cow: Cow<str> =
                Cow::borrow_from_cp437(self.file_name.as_slice(), &CP437_CONTROL);
            // Annoying: doesn't seem to be any Cow<str> -> Cow<Utf8Path>
            match str_cow {
                Cow::Borrowed(s) => Ok(Cow::Borrowed(Utf8Path::new(s))),
                Cow::Owned(s) => Ok(Cow::Owned(s.into())),
            }
        }
    }

    /// The date and time the file was last modified,
    /// or `None` if the archive stored something nonsensical.
    pub fn last_modified(&self) -> Option<NaiveDateTime> {
        spec::parse_msdos(self.last_modified_time, self.last_modified_date)
    }

    /// True if the file is encrypted (decryption is unsupported)
    pub fn is_encrypted(&self) -> bool {
        spec::is_encrypted(self.flags)
    }

    /// True if the CRC and sizes were written after the file's data
    /// instead of in its local header
    pub fn has_data_descriptor(&self) -> bool {
        spec::has_data_descriptor(self.flags)
    }

    /// True if the name is flagged as UTF-8
    pub fn is_utf8(&self) -> bool {
        spec::is_utf8(self.flags)
    }
}

/// A ZIP archive to be read
///
/// The archive owns its byte source and seeks around in it for every read,
/// so extraction needs `&mut self`.
/// To extract from several threads at once, give each thread its own handle
/// to the archive and use [`extract()`] with metadata from [`entries()`].
///
/// [`extract()`]: fn.extract.html
/// [`entries()`]: struct.ZipArchive.html#method.entries
#[derive(Debug)]
pub struct ZipArchive<R> {
    /// Where we read the archive from.
    source: R,
    /// A list of entries from the ZIP's central directory, in directory order
    entries: Vec<FileMetadata>,
}

impl ZipArchive<File> {
    /// Opens the ZIP archive at the given path.
    ///
    /// ```no_run
    /// # use appxzip::*;
    /// let mut archive = ZipArchive::open("app.appx")?;
    /// let manifest = archive.file_contents("AppxManifest.xml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> ZipResult<Self> {
        let path = path.as_ref();
        debug!("Opening {}", path.display());
        Self::new(File::open(path)?)
    }
}

impl<'a> ZipArchive<io::Cursor<&'a [u8]>> {
    /// Reads a ZIP archive from a byte slice,
    /// e.g. a file read into memory or memory-mapped.
    ///
    /// ```no_run
    /// # use std::fs;
    /// # use appxzip::*;
    /// let bytes = fs::read("app.appx")?;
    /// let archive = ZipArchive::from_bytes(&bytes)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_bytes(bytes: &'a [u8]) -> ZipResult<Self> {
        Self::new(io::Cursor::new(bytes))
    }
}

impl<R: Read + Seek> ZipArchive<R> {
    /// Reads the central directory of the ZIP archive in `source`.
    ///
    /// Nothing is returned unless the whole directory was read successfully.
    pub fn new(mut source: R) -> ZipResult<Self> {
        let (central_directory_offset, entry_count) = locate_central_directory(&mut source)?;
        let entries = read_central_directory(&mut source, central_directory_offset, entry_count)?;
        Ok(Self { source, entries })
    }

    /// Returns the entries found in the ZIP archive's central directory,
    /// in the order they appear there.
    ///
    /// No effort is made to deduplicate or otherwise validate these entries.
    pub fn entries(&self) -> &[FileMetadata] {
        &self.entries
    }

    /// The number of entries in the central directory
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry with exactly the given name.
    ///
    /// If the archive contains duplicates, the first one in the central
    /// directory wins.
    pub fn lookup<N: AsRef<[u8]>>(&self, name: N) -> ZipResult<&FileMetadata> {
        lookup(&self.entries, name.as_ref())
    }

    /// Reads out the complete, decompressed contents of the named file.
    pub fn file_contents<N: AsRef<[u8]>>(&mut self, name: N) -> ZipResult<Vec<u8>> {
        let metadata = lookup(&self.entries, name.as_ref())?;
        extract(&mut self.source, metadata)
    }

    /// Reads out the complete, decompressed contents of the given file,
    /// which should have come from this archive's [`entries()`].
    ///
    /// [`entries()`]: struct.ZipArchive.html#method.entries
    pub fn read(&mut self, metadata: &FileMetadata) -> ZipResult<Vec<u8>> {
        extract(&mut self.source, metadata)
    }

    /// Gives back the byte source the archive was read from.
    pub fn into_inner(self) -> R {
        self.source
    }
}

fn lookup<'e>(entries: &'e [FileMetadata], name: &[u8]) -> ZipResult<&'e FileMetadata> {
    entries
        .iter()
        .find(|e| e.file_name == name)
        .ok_or_else(|| ZipError::NoSuchFile(String::from_utf8_lossy(name).into_owned()))
}

/// Reads exactly `length` bytes from `source` at `offset`.
///
/// `length` often comes straight from the archive, so the buffer only grows
/// as data actually arrives. Running out early is an `UnexpectedEof`.
fn read_at<R: Read + Seek>(source: &mut R, offset: u64, length: u64) -> ZipResult<Vec<u8>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    source.by_ref().take(length).read_to_end(&mut buf)?;
    if buf.len() as u64 != length {
        return Err(ZipError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Wanted {} bytes at offset {}, got {}", length, offset, buf.len()),
        )));
    }
    Ok(buf)
}

/// Finds the central directory using the End of central directory record
/// (and the Zip64 one, if needed).
///
/// Returns the central directory's offset and the number of entries in it.
fn locate_central_directory<R: Read + Seek>(source: &mut R) -> ZipResult<(u64, u64)> {
    let archive_size = source.seek(SeekFrom::End(0))?;

    // No searching here: we expect the record to sit flush against the
    // end of the file, i.e., the archive has no comment.
    let eocdr_posit = archive_size
        .checked_sub(spec::EndOfCentralDirectory::SIZE as u64)
        .ok_or(ZipError::InvalidArchive(
            "Too small for an End Of Central Directory Record",
        ))?;
    let eocdr = spec::EndOfCentralDirectory::parse(&read_at(
        source,
        eocdr_posit,
        spec::EndOfCentralDirectory::SIZE as u64,
    )?)?;
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory {
        return Err(ZipError::UnsupportedArchive(format!(
            "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
            eocdr.disk_number, eocdr.disk_with_central_directory
        )));
    }
    if eocdr.entries != eocdr.entries_on_this_disk {
        return Err(ZipError::UnsupportedArchive(format!(
            "No support for multi-disk archives: entries ({}) != entries this disk ({})",
            eocdr.entries, eocdr.entries_on_this_disk
        )));
    }

    if !eocdr.is_zip64() {
        return Ok((eocdr.central_directory_offset.into(), eocdr.entries.into()));
    }

    let locator_posit = eocdr_posit
        .checked_sub(spec::Zip64EndOfCentralDirectoryLocator::SIZE as u64)
        .ok_or(ZipError::InvalidArchive(
            "Too small for Zip64 End Of Central Directory Locator",
        ))?;
    let locator = spec::Zip64EndOfCentralDirectoryLocator::parse(&read_at(
        source,
        locator_posit,
        spec::Zip64EndOfCentralDirectoryLocator::SIZE as u64,
    )?)?;
    trace!("{:?}", locator);

    if locator.disks != 1 {
        return Err(ZipError::UnsupportedArchive(format!(
            "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
            locator.disks
        )));
    }

    let zip64_eocdr = spec::Zip64EndOfCentralDirectory::parse(&read_at(
        source,
        locator.zip64_eocdr_offset,
        spec::Zip64EndOfCentralDirectory::SIZE as u64,
    )?)?;
    trace!("{:?}", zip64_eocdr);

    if zip64_eocdr.disk_number != zip64_eocdr.disk_with_central_directory {
        return Err(ZipError::UnsupportedArchive(format!(
            "No support for multi-disk archives: Zip64 disk ({}) != disk with central directory ({})",
            zip64_eocdr.disk_number, zip64_eocdr.disk_with_central_directory
        )));
    }
    if zip64_eocdr.entries != zip64_eocdr.entries_on_this_disk {
        return Err(ZipError::UnsupportedArchive(format!(
            "No support for multi-disk archives: entries ({}) != entries this disk ({})",
            zip64_eocdr.entries, zip64_eocdr.entries_on_this_disk
        )));
    }

    Ok((zip64_eocdr.central_directory_offset, zip64_eocdr.entries))
}

/// Reads `entry_count` central directory entries, starting at `offset`.
fn read_central_directory<R: Read + Seek>(
    source: &mut R,
    offset: u64,
    entry_count: u64,
) -> ZipResult<Vec<FileMetadata>> {
    trace!("{} entries at offset {}", entry_count, offset);
    source.seek(SeekFrom::Start(offset))?;
    let mut directory = BufReader::new(source);

    // Don't trust the count for preallocation; a corrupt one could be huge.
    let mut entries = Vec::with_capacity(usize(entry_count.min(u16::MAX.into()))?);
    let mut fixed = [0; spec::CentralDirectoryEntry::SIZE];

    for _ in 0..entry_count {
        directory.read_exact(&mut fixed)?;
        let dir_entry = spec::CentralDirectoryEntry::parse(&fixed)?;
        trace!("{:?}", dir_entry);

        let mut file_name = vec![0; usize(dir_entry.path_length)?];
        directory.read_exact(&mut file_name)?;
        let mut extra_field = vec![0; usize(dir_entry.extra_field_length)?];
        directory.read_exact(&mut extra_field)?;
        // We don't need the comment; skip it.
        directory.seek_relative(i64::from(dir_entry.file_comment_length))?;

        let file_metadata = FileMetadata::from_cde(&dir_entry, file_name, &extra_field)?;
        debug!("{:?}", file_metadata);
        entries.push(file_metadata);
    }

    Ok(entries)
}

/// Reads the given file's local header, checks it against its central
/// directory entry, and returns the offset where the file's data starts.
fn read_local_header<R: Read + Seek>(source: &mut R, metadata: &FileMetadata) -> ZipResult<u64> {
    let local_header = spec::LocalFileHeader::parse(&read_at(
        source,
        metadata.header_offset,
        spec::LocalFileHeader::SIZE as u64,
    )?)?;
    trace!("{:?}", local_header);

    // The source is now right after the fixed part of the header.
    let mut local_name = vec![0; usize(local_header.path_length)?];
    source.read_exact(&mut local_name)?;
    if local_name != metadata.file_name {
        return Err(ZipError::InvalidArchive("Local header filename mismatch"));
    }

    if cfg!(feature = "check-local-metadata") {
        check_local_metadata(&local_header, metadata)?;
    }

    // The local extra field can legitimately differ from the central one,
    // so its length only comes from here.
    Ok(local_header.data_offset(metadata.header_offset))
}

/// Makes sure the local header agrees with the central directory
/// about how the file was stored.
fn check_local_metadata(local: &spec::LocalFileHeader, metadata: &FileMetadata) -> ZipResult<()> {
    if CompressionMethod::from_u16(local.compression_method) != metadata.compression_method {
        return Err(ZipError::InvalidArchive(
            "Central directory entry and local file header disagree on compression method",
        ));
    }

    // With a data descriptor, the local CRC and sizes are zeroes.
    if spec::has_data_descriptor(local.flags) {
        return Ok(());
    }
    if local.crc32 != metadata.crc32 {
        return Err(ZipError::InvalidArchive(
            "Central directory entry and local file header disagree on CRC-32",
        ));
    }
    // Zip64 sizes live in the local extra field; we only compare plain ones.
    let sizes_agree = |local_size: u32, central_size: u64| {
        local_size == u32::MAX || u64::from(local_size) == central_size
    };
    if !sizes_agree(local.compressed_size, metadata.compressed_size)
        || !sizes_agree(local.uncompressed_size, metadata.size)
    {
        return Err(ZipError::InvalidArchive(
            "Central directory entry and local file header disagree on file size",
        ));
    }
    Ok(())
}

/// Reads out the complete, decompressed contents of the given file
/// from `source`, which must be a handle to the archive `metadata` came from.
///
/// The local file header is checked against `metadata` first.
/// Either every byte the central directory promised comes back, or an error does.
pub fn extract<R: Read + Seek>(source: &mut R, metadata: &FileMetadata) -> ZipResult<Vec<u8>> {
    if metadata.is_encrypted() {
        return Err(ZipError::UnsupportedArchive(format!(
            "Can't read encrypted file {}",
            String::from_utf8_lossy(&metadata.file_name)
        )));
    }

    let data_offset = read_local_header(source, metadata)?;
    debug!(
        "Reading {} ({:?}, {} -> {} bytes) at offset {}",
        String::from_utf8_lossy(&metadata.file_name),
        metadata.compression_method,
        metadata.compressed_size,
        metadata.size,
        data_offset
    );

    if let CompressionMethod::Unsupported(method) = metadata.compression_method {
        return Err(ZipError::UnsupportedMethod(method));
    }
    let compressed = read_at(source, data_offset, metadata.compressed_size)?;
    let contents = decompress(metadata.compression_method, compressed, metadata.size)?;

    if cfg!(feature = "check-crc32") && crc32fast::hash(&contents) != metadata.crc32 {
        return Err(ZipError::InvalidArchive("Invalid checksum"));
    }
    Ok(contents)
}

/// Turns a file's stored bytes into its contents,
/// which must be exactly `size` bytes long.
fn decompress(
    compression_method: CompressionMethod,
    compressed: Vec<u8>,
    size: u64,
) -> ZipResult<Vec<u8>> {
    match compression_method {
        CompressionMethod::None => {
            if compressed.len() as u64 != size {
                return Err(ZipError::InvalidArchive(
                    "Stored file has different compressed and uncompressed sizes",
                ));
            }
            Ok(compressed)
        }
        CompressionMethod::Deflate => {
            // DEFLATE can't expand much past 1032:1; don't preallocate more.
            let capacity = size.min((compressed.len() as u64).saturating_mul(1032));
            let mut contents = Vec::with_capacity(usize(capacity)?);
            // Read one past the expected size so that too much output
            // is caught instead of silently truncated.
            DeflateDecoder::new(compressed.as_slice())
                .take(size.saturating_add(1))
                .read_to_end(&mut contents)
                .map_err(|_| ZipError::InvalidArchive("Could not extract data"))?;
            if contents.len() as u64 != size {
                return Err(ZipError::InvalidArchive("Could not extract data"));
            }
            Ok(contents)
        }
        CompressionMethod::Unsupported(method) => Err(ZipError::UnsupportedMethod(method)),
    }
}
