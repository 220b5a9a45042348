//! Builds small Zip archives in memory, with knobs for breaking them.
//!
//! Output has fixed timestamps and no archive comment,
//! and remembers where every record landed so tests can corrupt them.

#![allow(dead_code)]

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::Compression;

pub const LOCAL_MAGIC: u32 = 0x04034b50;
pub const CENTRAL_MAGIC: u32 = 0x02014b50;
pub const EOCDR_MAGIC: u32 = 0x06054b50;
pub const ZIP64_EOCDR_MAGIC: u32 = 0x06064b50;
pub const ZIP64_LOCATOR_MAGIC: u32 = 0x07064b50;
const DATA_DESCRIPTOR_MAGIC: u32 = 0x08074b50;

/// 2021-06-15 13:37:42
pub const DOS_TIME: u16 = (13 << 11) | (37 << 5) | 21;
pub const DOS_DATE: u16 = ((2021 - 1980) << 9) | (6 << 5) | 15;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One file to put in the archive
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: Vec<u8>,
    /// Name written to the local header, if different
    pub local_name: Option<Vec<u8>>,
    /// What the file decompresses to
    pub contents: Vec<u8>,
    /// What actually gets written after the local header
    pub stored: Vec<u8>,
    pub method: u16,
    /// Method written to the local header, if different
    pub local_method: Option<u16>,
    /// Declared uncompressed size
    pub size: u32,
    pub crc32: u32,
    pub flags: u16,
    pub local_extra: Vec<u8>,
    pub comment: Vec<u8>,
    /// Write a data descriptor instead of local CRC and sizes
    pub data_descriptor: bool,
    /// Put sizes and offset in a Zip64 extra field
    /// and 0xFFFFFFFF in the central directory
    pub zip64_extra: bool,
}

impl Entry {
    pub fn stored(name: &str, contents: &[u8]) -> Self {
        Self {
            name: name.as_bytes().to_vec(),
            local_name: None,
            contents: contents.to_vec(),
            stored: contents.to_vec(),
            method: 0,
            local_method: None,
            size: contents.len() as u32,
            crc32: crc32fast::hash(contents),
            flags: 0,
            local_extra: Vec::new(),
            comment: Vec::new(),
            data_descriptor: false,
            zip64_extra: false,
        }
    }

    pub fn deflated(name: &str, contents: &[u8]) -> Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(contents).unwrap();
        Self {
            stored: encoder.finish().unwrap(),
            method: 8,
            ..Self::stored(name, contents)
        }
    }
}

/// Where things landed in a built archive
#[derive(Debug)]
pub struct Built {
    pub bytes: Vec<u8>,
    pub local_headers: Vec<usize>,
    pub central_headers: Vec<usize>,
    pub zip64_eocdr: Option<usize>,
    pub zip64_locator: Option<usize>,
    pub eocdr: usize,
}

impl Built {
    /// Flips a bit in the byte at `offset`.
    pub fn corrupt(&mut self, offset: usize) {
        self.bytes[offset] ^= 0x01;
    }
}

#[derive(Debug, Default)]
pub struct ZipBuilder {
    entries: Vec<Entry>,
    zip64: bool,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn stored(self, name: &str, contents: &[u8]) -> Self {
        self.entry(Entry::stored(name, contents))
    }

    pub fn deflated(self, name: &str, contents: &[u8]) -> Self {
        self.entry(Entry::deflated(name, contents))
    }

    /// Writes Zip64 end records and points the classic one at them.
    pub fn zip64(mut self) -> Self {
        self.zip64 = true;
        self
    }

    pub fn build(&self) -> Built {
        let mut out = Vec::new();
        let mut local_headers = Vec::new();

        for entry in &self.entries {
            local_headers.push(out.len());
            let local_name = entry.local_name.as_ref().unwrap_or(&entry.name);
            let (crc32, compressed, size) = if entry.data_descriptor {
                (0, 0, 0)
            } else {
                (entry.crc32, entry.stored.len() as u32, entry.size)
            };
            let flags = entry.flags | if entry.data_descriptor { 1 << 3 } else { 0 };

            put_u32(&mut out, LOCAL_MAGIC);
            put_u16(&mut out, 20);
            put_u16(&mut out, flags);
            put_u16(&mut out, entry.local_method.unwrap_or(entry.method));
            put_u16(&mut out, DOS_TIME);
            put_u16(&mut out, DOS_DATE);
            put_u32(&mut out, crc32);
            put_u32(&mut out, compressed);
            put_u32(&mut out, size);
            put_u16(&mut out, local_name.len() as u16);
            put_u16(&mut out, entry.local_extra.len() as u16);
            out.extend_from_slice(local_name);
            out.extend_from_slice(&entry.local_extra);
            out.extend_from_slice(&entry.stored);

            if entry.data_descriptor {
                put_u32(&mut out, DATA_DESCRIPTOR_MAGIC);
                put_u32(&mut out, entry.crc32);
                put_u32(&mut out, entry.stored.len() as u32);
                put_u32(&mut out, entry.size);
            }
        }

        let central_directory = out.len();
        let mut central_headers = Vec::new();
        for (entry, local_offset) in self.entries.iter().zip(&local_headers) {
            central_headers.push(out.len());
            let flags = entry.flags | if entry.data_descriptor { 1 << 3 } else { 0 };
            let (compressed, size, offset, extra) = if entry.zip64_extra {
                let mut extra = Vec::new();
                put_u16(&mut extra, 0x0001);
                put_u16(&mut extra, 24);
                put_u64(&mut extra, entry.size as u64);
                put_u64(&mut extra, entry.stored.len() as u64);
                put_u64(&mut extra, *local_offset as u64);
                (u32::MAX, u32::MAX, u32::MAX, extra)
            } else {
                (
                    entry.stored.len() as u32,
                    entry.size,
                    *local_offset as u32,
                    Vec::new(),
                )
            };

            put_u32(&mut out, CENTRAL_MAGIC);
            put_u16(&mut out, 20);
            put_u16(&mut out, 20);
            put_u16(&mut out, flags);
            put_u16(&mut out, entry.method);
            put_u16(&mut out, DOS_TIME);
            put_u16(&mut out, DOS_DATE);
            put_u32(&mut out, entry.crc32);
            put_u32(&mut out, compressed);
            put_u32(&mut out, size);
            put_u16(&mut out, entry.name.len() as u16);
            put_u16(&mut out, extra.len() as u16);
            put_u16(&mut out, entry.comment.len() as u16);
            put_u16(&mut out, 0); // disk number start
            put_u16(&mut out, 0); // internal attributes
            put_u32(&mut out, 0); // external attributes
            put_u32(&mut out, offset);
            out.extend_from_slice(&entry.name);
            out.extend_from_slice(&extra);
            out.extend_from_slice(&entry.comment);
        }
        let central_directory_size = out.len() - central_directory;
        let count = self.entries.len();

        let (mut zip64_eocdr, mut zip64_locator) = (None, None);
        if self.zip64 {
            let record = out.len();
            zip64_eocdr = Some(record);
            put_u32(&mut out, ZIP64_EOCDR_MAGIC);
            put_u64(&mut out, 44); // Everything after this field
            put_u16(&mut out, 45);
            put_u16(&mut out, 45);
            put_u32(&mut out, 0);
            put_u32(&mut out, 0);
            put_u64(&mut out, count as u64);
            put_u64(&mut out, count as u64);
            put_u64(&mut out, central_directory_size as u64);
            put_u64(&mut out, central_directory as u64);

            zip64_locator = Some(out.len());
            put_u32(&mut out, ZIP64_LOCATOR_MAGIC);
            put_u32(&mut out, 0);
            put_u64(&mut out, record as u64);
            put_u32(&mut out, 1);
        }

        let eocdr = out.len();
        let (count, size, offset) = if self.zip64 {
            (u16::MAX, u32::MAX, u32::MAX)
        } else {
            (
                count as u16,
                central_directory_size as u32,
                central_directory as u32,
            )
        };
        put_u32(&mut out, EOCDR_MAGIC);
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u16(&mut out, count);
        put_u16(&mut out, count);
        put_u32(&mut out, size);
        put_u32(&mut out, offset);
        put_u16(&mut out, 0);

        Built {
            bytes: out,
            local_headers,
            central_headers,
            zip64_eocdr,
            zip64_locator,
            eocdr,
        }
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Predictable, somewhat compressible junk
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
