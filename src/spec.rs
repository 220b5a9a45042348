//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] module.
//! Every record is decoded field by field from a little-endian byte slice;
//! nothing here cares about Rust struct layout.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`read`]: ../read/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use chrono::{NaiveDate, NaiveDateTime};

use crate::arch::usize;
use crate::read::{CompressionMethod, FileMetadata};
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];

/// Header ID of the Zip64 extended information extra field
const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::None,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Makes sure `record` holds a whole fixed-size record starting with `magic`,
/// and returns the bytes after the magic number.
///
/// Every `read_*` above relies on this length check.
fn strip_magic<'a>(
    record: &'a [u8],
    magic: [u8; 4],
    size: usize,
    complaint: &'static str,
) -> ZipResult<&'a [u8]> {
    if record.len() < size || record[..4] != magic {
        return Err(ZipError::InvalidArchive(complaint));
    }
    Ok(&record[4..size])
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[allow(dead_code)]
#[derive(Debug)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub comment_length: u16,
}

impl EndOfCentralDirectory {
    /// Size of the record, assuming an empty archive comment
    pub const SIZE: usize = 22;

    pub fn parse(eocdr: &[u8]) -> ZipResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        let mut eocdr = strip_magic(
            eocdr,
            EOCDR_MAGIC,
            Self::SIZE,
            "Couldn't find End Of Central Directory Record",
        )?;
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        let comment_length = read_u16(&mut eocdr);

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            comment_length,
        })
    }

    /// True if the real entry count or central directory offset
    /// lives in the Zip64 end of central directory record.
    pub fn is_zip64(&self) -> bool {
        // 4.4.1.4  If one of the fields in the end of central directory
        // record is too small to hold required data, the field SHOULD be
        // set to -1 (0xFFFF or 0xFFFFFFFF) and the ZIP64 format record
        // SHOULD be created.
        self.entries == u16::MAX || self.central_directory_offset == u32::MAX
    }
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[allow(dead_code)]
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub const SIZE: usize = 20;

    pub fn parse(locator: &[u8]) -> ZipResult<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        let mut locator = strip_magic(
            locator,
            ZIP64_EOCDR_LOCATOR_MAGIC,
            Self::SIZE,
            "Couldn't find Zip64 End Of Central Directory Locator",
        )?;
        let disk_with_central_directory = read_u32(&mut locator);
        let zip64_eocdr_offset = read_u64(&mut locator);
        let disks = read_u32(&mut locator);

        Ok(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }
}

/// Data from the Zip64 end of central directory record
///
/// Holds the 64-bit versions of the End of central directory fields.
/// We only read its fixed-size part; the extensible data sector is ignored.
#[allow(dead_code)]
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub const SIZE: usize = 56;

    pub fn parse(eocdr: &[u8]) -> ZipResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        let mut eocdr = strip_magic(
            eocdr,
            ZIP64_EOCDR_MAGIC,
            Self::SIZE,
            "Couldn't find Zip64 End Of Central Directory Record",
        )?;
        let eocdr_size = read_u64(&mut eocdr);
        let source_version = read_u16(&mut eocdr);
        let minimum_extract_version = read_u16(&mut eocdr);
        let disk_number = read_u32(&mut eocdr);
        let disk_with_central_directory = read_u32(&mut eocdr);
        let entries_on_this_disk = read_u64(&mut eocdr);
        let entries = read_u64(&mut eocdr);
        let central_directory_size = read_u64(&mut eocdr);
        let central_directory_offset = read_u64(&mut eocdr);

        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        if eocdr_size.saturating_add(12) < Self::SIZE as u64 {
            return Err(ZipError::InvalidArchive(
                "Invalid size in Zip64 End Of Central Directory Record",
            ));
        }

        Ok(Self {
            source_version,
            minimum_extract_version,
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
        })
    }
}

/// The fixed-size part of a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
/// The name, extra field, and comment follow it in the file.
#[allow(dead_code)]
#[derive(Debug)]
pub struct CentralDirectoryEntry {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
}

impl CentralDirectoryEntry {
    pub const SIZE: usize = 46;

    pub fn parse(entry: &[u8]) -> ZipResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        let mut entry = strip_magic(
            entry,
            CENTRAL_DIRECTORY_MAGIC,
            Self::SIZE,
            "Invalid central directory entry",
        )?;
        let source_version = read_u16(&mut entry);
        let minimum_extract_version = read_u16(&mut entry);
        let flags = read_u16(&mut entry);
        let compression_method = read_u16(&mut entry);
        let last_modified_time = read_u16(&mut entry);
        let last_modified_date = read_u16(&mut entry);
        let crc32 = read_u32(&mut entry);
        let compressed_size = read_u32(&mut entry);
        let uncompressed_size = read_u32(&mut entry);
        let path_length = read_u16(&mut entry);
        let extra_field_length = read_u16(&mut entry);
        let file_comment_length = read_u16(&mut entry);
        let disk_number = read_u16(&mut entry);
        let internal_file_attributes = read_u16(&mut entry);
        let external_file_attributes = read_u32(&mut entry);
        let header_offset = read_u32(&mut entry);

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path_length,
            extra_field_length,
            file_comment_length,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
        })
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumped to be CP437.
pub(crate) fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & (1 << 11) != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
pub(crate) fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

/// Extracts the "sizes and CRC follow the data" bit from the 16-bit flags field.
pub(crate) fn has_data_descriptor(flags: u16) -> bool {
    // Bit 3: If this bit is set, the fields crc-32, compressed
    //        size and uncompressed size are set to zero in the
    //        local header.  The correct values are put in the
    //        data descriptor immediately following the compressed
    //        data.
    flags & (1 << 3) != 0
}

impl FileMetadata {
    /// Extracts `FileMetadata` from a central directory entry
    /// and the variable-length fields that followed it.
    pub(crate) fn from_cde(
        cde: &CentralDirectoryEntry,
        file_name: Vec<u8>,
        extra_field: &[u8],
    ) -> ZipResult<Self> {
        let mut metadata = Self {
            file_name,
            size: cde.uncompressed_size.into(),
            compressed_size: cde.compressed_size.into(),
            compression_method: CompressionMethod::from_u16(cde.compression_method),
            crc32: cde.crc32,
            flags: cde.flags,
            last_modified_time: cde.last_modified_time,
            last_modified_date: cde.last_modified_date,
            header_offset: cde.header_offset.into(),
        };

        // Zip64 writers can leave the real disk number in the extra field.
        let disk_number = parse_extra_field(&mut metadata, extra_field, cde.disk_number)?;
        if disk_number != 0 {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                String::from_utf8_lossy(&metadata.file_name),
                disk_number,
            )));
        }

        Ok(metadata)
    }
}

pub(crate) fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// Parses the "extra fields" found in central directory entries.
///
/// Currently we just look for Zip64 info (64-bit values for files > 2^32 in size)
/// and skip everything else.
/// Returns the disk the file starts on, which is `disk_number`
/// unless that was a sentinel the Zip64 info replaced.
fn parse_extra_field(
    metadata: &mut FileMetadata,
    mut extra_field: &[u8],
    disk_number: u16,
) -> ZipResult<u32> {
    let mut disk_number = u32::from(disk_number);
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:

    //     header1+data1 + header2+data2 . . .

    // Each header MUST consist of:

    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    while !extra_field.is_empty() {
        if extra_field.len() < 4 {
            return Err(ZipError::InvalidArchive("Truncated extra field header"));
        }
        let kind = read_u16(&mut extra_field);
        let field_len = usize(read_u16(&mut extra_field))?;
        if field_len > extra_field.len() {
            return Err(ZipError::InvalidArchive(
                "Extra field runs past the end of its entry",
            ));
        }
        let (mut data, rest) = extra_field.split_at(field_len);
        extra_field = rest;

        if kind != ZIP64_EXTRA_FIELD_ID {
            continue;
        }
        // 4.5.3 The order of the fields in the zip64 extended
        // information record is fixed, but the fields MUST
        // only appear if the corresponding Local or Central
        // directory record field is set to 0xFFFF or 0xFFFFFFFF.
        let sentinel = u64::from(u32::MAX);
        if metadata.size == sentinel {
            metadata.size = zip64_value(&mut data)?;
        }
        if metadata.compressed_size == sentinel {
            metadata.compressed_size = zip64_value(&mut data)?;
        }
        if metadata.header_offset == sentinel {
            metadata.header_offset = zip64_value(&mut data)?;
        }
        if disk_number == u32::from(u16::MAX) {
            if data.len() < std::mem::size_of::<u32>() {
                return Err(ZipError::InvalidArchive(
                    "Zip64 extra field is missing a disk number",
                ));
            }
            disk_number = read_u32(&mut data);
        }
    }
    Ok(disk_number)
}

fn zip64_value(data: &mut &[u8]) -> ZipResult<u64> {
    if data.len() < std::mem::size_of::<u64>() {
        return Err(ZipError::InvalidArchive(
            "Zip64 extra field is missing a value",
        ));
    }
    Ok(read_u64(data))
}

/// The fixed-size part of a local file header
///
/// Each files' actual contents is preceded by this header,
/// then its name and extra field.
/// We use it to double-check the central directory and to find
/// where the file's data starts.
#[allow(dead_code)]
#[derive(Debug)]
pub struct LocalFileHeader {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    pub const SIZE: usize = 30;

    pub fn parse(header: &[u8]) -> ZipResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        let mut header = strip_magic(
            header,
            LOCAL_FILE_HEADER_MAGIC,
            Self::SIZE,
            "Invalid local file header",
        )?;
        let minimum_extract_version = read_u16(&mut header);
        let flags = read_u16(&mut header);
        let compression_method = read_u16(&mut header);
        let last_modified_time = read_u16(&mut header);
        let last_modified_date = read_u16(&mut header);
        let crc32 = read_u32(&mut header);
        let compressed_size = read_u32(&mut header);
        let uncompressed_size = read_u32(&mut header);
        let path_length = read_u16(&mut header);
        let extra_field_length = read_u16(&mut header);

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path_length,
            extra_field_length,
        })
    }

    /// Where the file's data starts, given where this header starts.
    pub fn data_offset(&self, header_offset: u64) -> u64 {
        header_offset
            + Self::SIZE as u64
            + u64::from(self.path_length)
            + u64::from(self.extra_field_length)
    }
}
