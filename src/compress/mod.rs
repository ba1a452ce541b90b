//! # Compression Methods
//!
//! Per-entry payload transforms used by the container:
//! - **Stored**: no transform.
//! - **Deflate**: dictionary + Huffman coding via `flate2`.
//!
//! The caller-facing level in `0..=9` maps monotonically onto deflate effort,
//! with `0` meaning stored. A deflate result that is not smaller than its input
//! is discarded and the entry is stored instead, so a higher level never yields
//! a larger payload than level 0.
//!
//! The module also carries the single-file gzip stream used by the `gz` format.

use std::borrow::Cow;
use std::io::{self, Read, Seek, SeekFrom, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::DeflateEncoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MAX_LEVEL: u32 = 9;
pub const DEFAULT_LEVEL: u32 = 6;

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const IO_BUF: usize = 64 * 1024;

/// Compression method tag as recorded in the container.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    Stored,
    Deflate,
    /// A method this crate cannot decode; kept so foreign archives still list.
    Unknown(u16),
}

impl CompressionMethod {
    pub const fn tag(self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(t) => t,
        }
    }

    pub const fn from_tag(tag: u16) -> Self {
        match tag {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            t => CompressionMethod::Unknown(t),
        }
    }
}

pub fn validate_level(level: u32) -> Result<u32, ValidationError> {
    if level > MAX_LEVEL {
        return Err(ValidationError::InvalidLevel(level));
    }
    Ok(level)
}

/// Compress one payload at `level`. The returned method tells which transform
/// was actually applied.
pub fn encode(data: &[u8], level: u32) -> io::Result<(CompressionMethod, Cow<'_, [u8]>)> {
    if level == 0 || data.is_empty() {
        return Ok((CompressionMethod::Stored, Cow::Borrowed(data)));
    }
    let level = level.min(MAX_LEVEL);
    let mut enc = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    enc.write_all(data)?;
    let out = enc.finish()?;
    if out.len() >= data.len() {
        return Ok((CompressionMethod::Stored, Cow::Borrowed(data)));
    }
    Ok((CompressionMethod::Deflate, Cow::Owned(out)))
}

/// A payload encoded from a reader, with the checksum of what was read.
#[derive(Debug)]
pub struct Encoded {
    pub method: CompressionMethod,
    pub payload: Vec<u8>,
    pub crc32: u32,
    /// Uncompressed bytes read, capped at `limit + 1`.
    pub size: u64,
}

/// Compress what `src` yields at `level` without holding the uncompressed
/// bytes in memory. Reads at most `limit + 1` bytes so an oversized source is
/// detectable. When deflate does not shrink the data, `src` is rewound and
/// read once more as a stored payload.
pub fn encode_reader<R: Read + Seek>(src: &mut R, level: u32, limit: u64) -> io::Result<Encoded> {
    let start = src.stream_position()?;
    if level == 0 {
        return read_stored(src, limit);
    }
    let level = level.min(MAX_LEVEL);
    let mut enc = ChecksumWriter::new(DeflateEncoder::new(Vec::new(), Compression::new(level)));
    io::copy(&mut src.by_ref().take(limit.saturating_add(1)), &mut enc)?;
    let (enc, crc32, size) = enc.finish();
    let payload = enc.finish()?;
    if size > 0 && (payload.len() as u64) < size {
        return Ok(Encoded {
            method: CompressionMethod::Deflate,
            payload,
            crc32,
            size,
        });
    }
    drop(payload);
    src.seek(SeekFrom::Start(start))?;
    read_stored(src, limit)
}

fn read_stored<R: Read>(src: &mut R, limit: u64) -> io::Result<Encoded> {
    let mut payload = Vec::new();
    src.by_ref().take(limit.saturating_add(1)).read_to_end(&mut payload)?;
    Ok(Encoded {
        method: CompressionMethod::Stored,
        crc32: crc32fast::hash(&payload),
        size: payload.len() as u64,
        payload,
    })
}

/// Why decoding stopped: the payload itself, or the destination.
#[derive(Debug)]
pub enum DecodeFailure {
    Corrupt(io::Error),
    Sink(io::Error),
    Unsupported(u16),
}

/// Write adapter that computes the CRC-32 and length of everything passing through.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    count: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            count: 0,
        }
    }

    /// Returns the inner writer, the CRC-32 and the byte count.
    pub fn finish(self) -> (W, u32, u64) {
        (self.inner, self.hasher.finalize(), self.count)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decode `payload` into `out`, producing at most `limit + 1` bytes so an
/// oversized stream is detectable without decoding it to the end.
///
/// Returns the CRC-32 and length of the produced bytes.
pub fn decode_to<W: Write>(
    method: CompressionMethod,
    payload: &[u8],
    limit: u64,
    out: W,
) -> Result<(u32, u64), DecodeFailure> {
    let mut sink = ChecksumWriter::new(out);
    match method {
        CompressionMethod::Stored => {
            sink.write_all(payload).map_err(DecodeFailure::Sink)?;
        }
        CompressionMethod::Deflate => {
            let mut dec = DeflateDecoder::new(payload).take(limit.saturating_add(1));
            let mut buf = vec![0u8; IO_BUF];
            loop {
                let n = dec.read(&mut buf).map_err(DecodeFailure::Corrupt)?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buf[..n]).map_err(DecodeFailure::Sink)?;
            }
        }
        CompressionMethod::Unknown(tag) => return Err(DecodeFailure::Unsupported(tag)),
    }
    sink.flush().map_err(DecodeFailure::Sink)?;
    let (_, crc, n) = sink.finish();
    Ok((crc, n))
}

/// Compress `src` as a single-member gzip stream. Returns the uncompressed byte count.
pub fn gzip_encode<R: Read, W: Write>(
    src: &mut R,
    dst: W,
    level: u32,
    name: Option<&str>,
    mtime: u32,
) -> io::Result<u64> {
    let mut builder = GzBuilder::new().mtime(mtime);
    if let Some(name) = name {
        builder = builder.filename(name.as_bytes());
    }
    let mut enc = builder.write(dst, Compression::new(level.min(MAX_LEVEL)));
    let n = io::copy(src, &mut enc)?;
    enc.finish()?;
    Ok(n)
}

/// Decode a gzip stream into `dst`. The trailing CRC-32 and length are checked
/// by the decoder. Returns the original file name, if the header carries one,
/// and the decoded length.
pub fn gzip_decode<R: Read, W: Write>(
    src: R,
    mut dst: W,
) -> Result<(Option<String>, u64), DecodeFailure> {
    let mut dec = GzDecoder::new(src);
    let mut buf = vec![0u8; IO_BUF];
    let mut total = 0u64;
    loop {
        let n = dec.read(&mut buf).map_err(DecodeFailure::Corrupt)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n]).map_err(DecodeFailure::Sink)?;
        total += n as u64;
    }
    dst.flush().map_err(DecodeFailure::Sink)?;
    let name = dec
        .header()
        .and_then(|h| h.filename())
        .map(|b| String::from_utf8_lossy(b).into_owned());
    Ok((name, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(n: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog. "
            .iter()
            .cycle()
            .take(n)
            .copied()
            .collect()
    }

    #[test]
    fn level_zero_is_stored() {
        let data = text(4096);
        let (method, out) = encode(&data, 0).unwrap();
        assert_eq!(method, CompressionMethod::Stored);
        assert_eq!(out.as_ref(), &data[..]);
    }

    #[test]
    fn deflate_shrinks_repetitive_data() {
        let data = text(64 * 1024);
        let (method, out) = encode(&data, 9).unwrap();
        assert_eq!(method, CompressionMethod::Deflate);
        assert!(out.len() < data.len() / 10);

        let mut back = Vec::new();
        let (crc, n) = decode_to(method, &out, data.len() as u64, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(n, data.len() as u64);
        assert_eq!(crc, crc32fast::hash(&data));
    }

    #[test]
    fn incompressible_data_falls_back_to_stored() {
        use rand::RngCore;
        let mut data = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut data);
        for level in 1..=MAX_LEVEL {
            let (method, out) = encode(&data, level).unwrap();
            assert_eq!(method, CompressionMethod::Stored, "level {level}");
            assert_eq!(out.len(), data.len());
        }
    }

    #[test]
    fn higher_levels_never_exceed_stored_size() {
        let data = text(10_000);
        for level in 0..=MAX_LEVEL {
            let (_, out) = encode(&data, level).unwrap();
            assert!(out.len() <= data.len());
        }
    }

    #[test]
    fn reader_encoding_matches_slice_encoding() {
        let data = text(30_000);
        let enc = encode_reader(&mut io::Cursor::new(&data), 6, u64::MAX).unwrap();
        assert_eq!(enc.method, CompressionMethod::Deflate);
        assert_eq!(enc.size, data.len() as u64);
        assert_eq!(enc.crc32, crc32fast::hash(&data));
        let mut back = Vec::new();
        decode_to(enc.method, &enc.payload, enc.size, &mut back).unwrap();
        assert_eq!(back, data);

        let stored = encode_reader(&mut io::Cursor::new(&data), 0, u64::MAX).unwrap();
        assert_eq!(stored.method, CompressionMethod::Stored);
        assert_eq!(stored.payload, data);
    }

    #[test]
    fn reader_encoding_rewinds_for_incompressible_input() {
        use rand::RngCore;
        let mut data = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut data);
        let enc = encode_reader(&mut io::Cursor::new(&data), 9, u64::MAX).unwrap();
        assert_eq!(enc.method, CompressionMethod::Stored);
        assert_eq!(enc.payload, data);
        assert_eq!(enc.crc32, crc32fast::hash(&data));
    }

    #[test]
    fn reader_encoding_stops_past_limit() {
        let data = text(1000);
        let enc = encode_reader(&mut io::Cursor::new(&data), 6, 100).unwrap();
        assert_eq!(enc.size, 101);
    }

    #[test]
    fn rejects_level_above_nine() {
        assert_eq!(validate_level(10), Err(ValidationError::InvalidLevel(10)));
        assert_eq!(validate_level(9), Ok(9));
    }

    #[test]
    fn decode_stops_just_past_limit() {
        let data = text(50_000);
        let (method, out) = encode(&data, 6).unwrap();
        let (_, n) = decode_to(method, &out, 100, io::sink()).unwrap();
        assert_eq!(n, 101);
    }

    #[test]
    fn garbage_deflate_is_corrupt() {
        let garbage = [0xffu8; 64];
        match decode_to(CompressionMethod::Deflate, &garbage, 1024, io::sink()) {
            Err(DecodeFailure::Corrupt(_)) => {}
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn gzip_round_trip_keeps_name() {
        let data = text(20_000);
        let mut gz = Vec::new();
        gzip_encode(&mut &data[..], &mut gz, 6, Some("notes.txt"), 0).unwrap();
        assert_eq!(&gz[..2], &GZIP_MAGIC);

        let mut back = Vec::new();
        let (name, n) = gzip_decode(&gz[..], &mut back).unwrap();
        assert_eq!(name.as_deref(), Some("notes.txt"));
        assert_eq!(n, data.len() as u64);
        assert_eq!(back, data);
    }
}
