//! # Archive Container
//!
//! Writing and reading of the ZIP container: one local header plus payload per
//! entry, a central directory listing every entry in order, and the end of
//! central directory record that points at it. All integers are little-endian.
//!
//! Entry payloads are prepared (compressed, optionally sealed) before anything is
//! written, so the writer never needs to seek back and patch a header. That also
//! lets callers prepare entries on several threads and commit them serially.

pub mod reader;

use std::collections::HashSet;
use std::io::{Read, Seek, Write};

use chrono::NaiveDateTime;

use crate::common::{self, ArchiveEntry, ArchiveManifest, DEFAULT_FILE_MODE};
use crate::compress::{self, CompressionMethod};
use crate::crypto::{self, Algorithm, EncryptionHeader};
use crate::error::{ArchiveError, CodecError, CryptoError};

pub use reader::ArchiveReader;

pub const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
pub const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
pub const EOCD_SIG: u32 = 0x0605_4b50;

pub const LOCAL_HEADER_LEN: usize = 30;
pub const CENTRAL_HEADER_LEN: usize = 46;
pub const EOCD_LEN: usize = 22;
pub const MAX_COMMENT_LEN: usize = u16::MAX as usize;

/// Extra field id of the entry encryption record.
pub const ENCRYPTION_EXTRA_ID: u16 = 0x5A4D;

pub const FLAG_ENCRYPTED: u16 = 1 << 0;
pub const FLAG_UTF8: u16 = 1 << 11;

const VERSION_NEEDED: u16 = 20;
// high byte 3 = unix, low byte = format version 2.0
const VERSION_MADE_BY: u16 = (3 << 8) | 20;

const MAX_ENTRIES: usize = u16::MAX as usize;
const MAX_U32: u64 = u32::MAX as u64;

/// Password parameters for sealing one entry.
#[derive(Debug, Clone, Copy)]
pub struct SealParams<'a> {
    pub password: &'a str,
    pub algorithm: Algorithm,
    pub iterations: u32,
}

/// How a single entry is encoded.
#[derive(Debug, Clone, Copy)]
pub struct EntryOptions<'a> {
    pub level: u32,
    pub modified: NaiveDateTime,
    pub permissions: u32,
    pub seal: Option<SealParams<'a>>,
}

impl Default for EntryOptions<'_> {
    fn default() -> Self {
        Self {
            level: compress::DEFAULT_LEVEL,
            modified: common::deterministic_timestamp(),
            permissions: DEFAULT_FILE_MODE,
            seal: None,
        }
    }
}

/// An entry whose payload is final and ready to be committed.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub path: String,
    pub method: CompressionMethod,
    pub crc32: u32,
    pub uncompressed_size: u64,
    pub modified: NaiveDateTime,
    pub permissions: u32,
    pub encryption: Option<EncryptionHeader>,
    /// Compressed bytes, encrypted when `encryption` is set.
    pub payload: Vec<u8>,
}

impl PreparedEntry {
    /// Rebuilds a prepared entry from an existing archive entry and its stored payload.
    pub fn from_stored(entry: &ArchiveEntry, payload: Vec<u8>) -> Self {
        Self {
            path: entry.path.clone(),
            method: entry.method,
            crc32: entry.crc32,
            uncompressed_size: entry.uncompressed_size,
            modified: entry.modified,
            permissions: entry.permissions,
            encryption: entry.encryption,
            payload,
        }
    }

    /// Seals the (already compressed) payload. Fails if the entry is sealed already.
    pub fn seal(mut self, params: SealParams<'_>) -> Result<Self, CryptoError> {
        if self.encryption.is_some() {
            return Err(CryptoError::SealFailed);
        }
        let (ciphertext, header) = crypto::seal_entry(
            std::mem::take(&mut self.payload),
            params.password,
            params.algorithm,
            params.iterations,
            self.path.as_bytes(),
        )?;
        self.payload = ciphertext;
        self.encryption = Some(header);
        Ok(self)
    }

    /// Opens a sealed payload, leaving the compressed plaintext.
    pub fn unseal(mut self, password: &str) -> Result<Self, CryptoError> {
        if let Some(header) = self.encryption.take() {
            let sealed = std::mem::take(&mut self.payload);
            self.payload = crypto::open_entry(sealed, &header, password, self.path.as_bytes())?;
        }
        Ok(self)
    }
}

/// Compresses and optionally seals one entry. Pure, so it is safe to call from
/// worker threads.
pub fn prepare_entry(
    path: &str,
    data: &[u8],
    opts: &EntryOptions<'_>,
) -> Result<PreparedEntry, ArchiveError> {
    let path = common::validate_entry_path(path)?;
    let size = data.len() as u64;
    if size > MAX_U32 {
        return Err(CodecError::TooLarge { what: path, size }.into());
    }
    let (method, payload) = compress::encode(data, opts.level).map_err(CodecError::from)?;
    let encoded = compress::Encoded {
        method,
        crc32: crc32fast::hash(data),
        size,
        payload: payload.into_owned(),
    };
    assemble(path, encoded, opts)
}

/// Like [`prepare_entry`], but reads the content from `src`. Only the
/// compressed payload is held in memory, and sealing happens in place on it.
pub fn prepare_reader<R: Read + Seek>(
    path: &str,
    src: &mut R,
    opts: &EntryOptions<'_>,
) -> Result<PreparedEntry, ArchiveError> {
    let path = common::validate_entry_path(path)?;
    let encoded = compress::encode_reader(src, opts.level, MAX_U32).map_err(CodecError::from)?;
    if encoded.size > MAX_U32 {
        return Err(CodecError::TooLarge {
            what: path,
            size: encoded.size,
        }
        .into());
    }
    assemble(path, encoded, opts)
}

fn assemble(
    path: String,
    encoded: compress::Encoded,
    opts: &EntryOptions<'_>,
) -> Result<PreparedEntry, ArchiveError> {
    let prepared = PreparedEntry {
        crc32: encoded.crc32,
        uncompressed_size: encoded.size,
        method: encoded.method,
        modified: common::normalize_timestamp(opts.modified),
        permissions: opts.permissions,
        encryption: None,
        payload: encoded.payload,
        path,
    };
    match opts.seal {
        Some(params) => Ok(prepared.seal(params)?),
        None => Ok(prepared),
    }
}

/// Streams entries into a ZIP container.
pub struct ArchiveWriter<W: Write> {
    out: W,
    offset: u64,
    entries: Vec<ArchiveEntry>,
    seen: HashSet<String>,
    comment: String,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            entries: Vec::new(),
            seen: HashSet::new(),
            comment: String::new(),
        }
    }

    pub fn set_comment(&mut self, comment: &str) -> Result<(), CodecError> {
        if comment.len() > MAX_COMMENT_LEN {
            return Err(CodecError::TooLarge {
                what: "archive comment".into(),
                size: comment.len() as u64,
            });
        }
        self.comment = comment.to_string();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Reads `src` to the end, then prepares and commits it.
    pub fn add_entry(
        &mut self,
        path: &str,
        src: &mut dyn Read,
        opts: &EntryOptions<'_>,
    ) -> Result<&ArchiveEntry, ArchiveError> {
        let mut data = Vec::new();
        src.read_to_end(&mut data).map_err(CodecError::from)?;
        let prepared = prepare_entry(path, &data, opts)?;
        Ok(self.add_prepared(prepared)?)
    }

    /// Commits a prepared entry: local header, extra field, payload.
    pub fn add_prepared(&mut self, entry: PreparedEntry) -> Result<&ArchiveEntry, CodecError> {
        if self.seen.contains(&entry.path) {
            return Err(CodecError::DuplicatePath(entry.path));
        }
        if self.entries.len() >= MAX_ENTRIES {
            return Err(CodecError::TooLarge {
                what: "entry count".into(),
                size: self.entries.len() as u64 + 1,
            });
        }
        let compressed_size = entry.payload.len() as u64;
        if compressed_size > MAX_U32 || entry.uncompressed_size > MAX_U32 {
            return Err(CodecError::TooLarge {
                what: entry.path,
                size: compressed_size.max(entry.uncompressed_size),
            });
        }
        if self.offset > MAX_U32 {
            return Err(CodecError::TooLarge {
                what: "archive".into(),
                size: self.offset,
            });
        }

        let record = ArchiveEntry {
            path: entry.path,
            uncompressed_size: entry.uncompressed_size,
            compressed_size,
            crc32: entry.crc32,
            method: entry.method,
            modified: entry.modified,
            permissions: entry.permissions,
            encryption: entry.encryption,
            header_offset: self.offset,
        };

        let header = local_header(&record);
        self.out.write_all(&header)?;
        self.out.write_all(&entry.payload)?;
        self.offset += header.len() as u64 + compressed_size;

        self.seen.insert(record.path.clone());
        self.entries.push(record);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Writes the central directory and end record. Returns the manifest of
    /// everything written and the sink.
    pub fn finish(mut self) -> Result<(ArchiveManifest, W), CodecError> {
        let cd_offset = self.offset;
        let mut cd = Vec::with_capacity(self.entries.len() * (CENTRAL_HEADER_LEN + 64));
        for entry in &self.entries {
            central_header(entry, &mut cd);
        }
        let cd_size = cd.len() as u64;
        if cd_offset > MAX_U32 || cd_size > MAX_U32 {
            return Err(CodecError::TooLarge {
                what: "archive".into(),
                size: cd_offset + cd_size,
            });
        }

        let count = self.entries.len() as u16;
        let mut eocd = Vec::with_capacity(EOCD_LEN + self.comment.len());
        put_u32(&mut eocd, EOCD_SIG);
        put_u16(&mut eocd, 0); // this disk
        put_u16(&mut eocd, 0); // disk with central directory
        put_u16(&mut eocd, count);
        put_u16(&mut eocd, count);
        put_u32(&mut eocd, cd_size as u32);
        put_u32(&mut eocd, cd_offset as u32);
        put_u16(&mut eocd, self.comment.len() as u16);
        eocd.extend_from_slice(self.comment.as_bytes());

        self.out.write_all(&cd)?;
        self.out.write_all(&eocd)?;
        self.out.flush()?;

        let manifest = ArchiveManifest {
            entries: self.entries,
            comment: self.comment,
            total_length: cd_offset + cd_size + eocd.len() as u64,
        };
        Ok((manifest, self.out))
    }
}

fn flags(entry: &ArchiveEntry) -> u16 {
    if entry.is_encrypted() {
        FLAG_UTF8 | FLAG_ENCRYPTED
    } else {
        FLAG_UTF8
    }
}

fn extra_field(entry: &ArchiveEntry) -> Vec<u8> {
    let mut extra = Vec::new();
    if let Some(header) = &entry.encryption {
        let body = header.to_bytes();
        put_u16(&mut extra, ENCRYPTION_EXTRA_ID);
        put_u16(&mut extra, body.len() as u16);
        extra.extend_from_slice(&body);
    }
    extra
}

fn local_header(entry: &ArchiveEntry) -> Vec<u8> {
    let extra = extra_field(entry);
    let (time, date) = common::to_dos_datetime(&entry.modified);
    let mut buf = Vec::with_capacity(LOCAL_HEADER_LEN + entry.path.len() + extra.len());
    put_u32(&mut buf, LOCAL_HEADER_SIG);
    put_u16(&mut buf, VERSION_NEEDED);
    put_u16(&mut buf, flags(entry));
    put_u16(&mut buf, entry.method.tag());
    put_u16(&mut buf, time);
    put_u16(&mut buf, date);
    put_u32(&mut buf, entry.crc32);
    put_u32(&mut buf, entry.compressed_size as u32);
    put_u32(&mut buf, entry.uncompressed_size as u32);
    put_u16(&mut buf, entry.path.len() as u16);
    put_u16(&mut buf, extra.len() as u16);
    buf.extend_from_slice(entry.path.as_bytes());
    buf.extend_from_slice(&extra);
    buf
}

fn central_header(entry: &ArchiveEntry, buf: &mut Vec<u8>) {
    let extra = extra_field(entry);
    let (time, date) = common::to_dos_datetime(&entry.modified);
    put_u32(buf, CENTRAL_HEADER_SIG);
    put_u16(buf, VERSION_MADE_BY);
    put_u16(buf, VERSION_NEEDED);
    put_u16(buf, flags(entry));
    put_u16(buf, entry.method.tag());
    put_u16(buf, time);
    put_u16(buf, date);
    put_u32(buf, entry.crc32);
    put_u32(buf, entry.compressed_size as u32);
    put_u32(buf, entry.uncompressed_size as u32);
    put_u16(buf, entry.path.len() as u16);
    put_u16(buf, extra.len() as u16);
    put_u16(buf, 0); // entry comment
    put_u16(buf, 0); // disk start
    put_u16(buf, 0); // internal attributes
    put_u32(buf, entry.permissions << 16);
    put_u32(buf, entry.header_offset as u32);
    buf.extend_from_slice(entry.path.as_bytes());
    buf.extend_from_slice(&extra);
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Builds a complete archive in memory from `(path, data)` pairs.
pub fn write_archive<'a, I>(entries: I, opts: &EntryOptions<'_>) -> Result<Vec<u8>, ArchiveError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut writer = ArchiveWriter::new(Vec::new());
    for (path, data) in entries {
        let prepared = prepare_entry(path, data, opts)?;
        writer.add_prepared(prepared)?;
    }
    let (_, bytes) = writer.finish()?;
    Ok(bytes)
}
