//! Volume splitting and joining.
//!
//! A stream is cut into `ceil(len / part_size)` parts. Every part is exactly
//! `part_size` bytes except the last, which holds the remainder. Parts are named
//! `<base>.<index>` with a 1-based, zero-padded index at least three digits wide,
//! so a plain lexicographic sort returns them in split order.
//!
//! A JSON [`VolumeManifest`] written next to the parts records each part's
//! length and BLAKE3 checksum plus a checksum of the whole stream. Joining
//! refuses to start when a part is missing and refuses to finish when any
//! checksum disagrees.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ArchiveError, Result, ValidationError};

const MIB: u64 = 1024 * 1024;

/// Part sizes offered to users: 50, 100, 200 and 500 MiB.
pub const PRESET_PART_SIZES: [u64; 4] = [50 * MIB, 100 * MIB, 200 * MIB, 500 * MIB];

pub const MANIFEST_SUFFIX: &str = ".vol.json";
pub const MIN_INDEX_WIDTH: usize = 3;
const MANIFEST_VERSION: u32 = 1;
const COPY_BUF: usize = 256 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// 1-based.
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    /// BLAKE3, hex encoded.
    pub checksum: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VolumeManifest {
    pub version: u32,
    /// File name the parts are derived from, e.g. `backup.zip`.
    pub base_name: String,
    pub total_length: u64,
    pub part_size: u64,
    pub index_width: usize,
    pub stream_checksum: String,
    pub volumes: Vec<VolumeInfo>,
}

impl VolumeManifest {
    pub fn part_name(&self, index: u32) -> String {
        part_name(&self.base_name, index, self.index_width)
    }

    pub fn manifest_name(&self) -> String {
        format!("{}{}", self.base_name, MANIFEST_SUFFIX)
    }

    /// Checks that the volume list tiles the stream exactly once, in order.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let bad = |msg: &str| Err(ValidationError::VolumeManifest(msg.to_string()));
        if self.version != MANIFEST_VERSION {
            return bad("unknown manifest version");
        }
        if self.part_size == 0 {
            return Err(ValidationError::InvalidPartSize);
        }
        if self.volumes.is_empty() || self.total_length == 0 {
            return Err(ValidationError::EmptyStream);
        }
        if self.base_name.is_empty() || self.base_name.contains(['/', '\\']) {
            return bad("base name must be a plain file name");
        }
        let count = self.volumes.len() as u64;
        if count != estimate_volume_count(self.total_length, self.part_size) {
            return bad("volume count does not match total length and part size");
        }
        let mut offset = 0u64;
        for (i, vol) in self.volumes.iter().enumerate() {
            let expected = i as u32 + 1;
            if vol.index != expected {
                return Err(ValidationError::VolumeOutOfSequence {
                    expected,
                    found: vol.index,
                });
            }
            let want_len = if expected as u64 == count {
                self.total_length - offset
            } else {
                self.part_size
            };
            if vol.offset != offset || vol.length != want_len || vol.length == 0 {
                return bad("volume offsets do not tile the stream");
            }
            offset += vol.length;
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        // serializing plain data into a String cannot fail
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> std::result::Result<Self, ValidationError> {
        let m: VolumeManifest =
            serde_json::from_str(s).map_err(|e| ValidationError::VolumeManifest(e.to_string()))?;
        m.validate()?;
        Ok(m)
    }
}

/// `ceil(total / part_size)`; zero when either is zero.
pub fn estimate_volume_count(total: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    total.div_ceil(part_size)
}

pub fn index_width(count: u64) -> usize {
    let digits = count.max(1).to_string().len();
    digits.max(MIN_INDEX_WIDTH)
}

pub fn part_name(base: &str, index: u32, width: usize) -> String {
    format!("{base}.{index:0width$}")
}

fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn check_split_args(total: u64, part_size: u64) -> std::result::Result<(), ValidationError> {
    if part_size == 0 {
        return Err(ValidationError::InvalidPartSize);
    }
    if total == 0 {
        return Err(ValidationError::EmptyStream);
    }
    Ok(())
}

/// One in-memory part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub index: u32,
    pub data: Vec<u8>,
}

/// Splits `stream` into parts of `part_size` bytes.
pub fn split(
    stream: &[u8],
    part_size: u64,
    base_name: &str,
) -> std::result::Result<(VolumeManifest, Vec<Volume>), ValidationError> {
    check_split_args(stream.len() as u64, part_size)?;
    let count = estimate_volume_count(stream.len() as u64, part_size);
    let chunk = usize::try_from(part_size).unwrap_or(usize::MAX);
    let mut volumes = Vec::with_capacity(count as usize);
    let mut infos = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    for (i, data) in stream.chunks(chunk).enumerate() {
        let index = i as u32 + 1;
        infos.push(VolumeInfo {
            index,
            offset,
            length: data.len() as u64,
            checksum: checksum(data),
        });
        offset += data.len() as u64;
        volumes.push(Volume {
            index,
            data: data.to_vec(),
        });
    }
    let manifest = VolumeManifest {
        version: MANIFEST_VERSION,
        base_name: base_name.to_string(),
        total_length: stream.len() as u64,
        part_size,
        index_width: index_width(count),
        stream_checksum: checksum(stream),
        volumes: infos,
    };
    Ok((manifest, volumes))
}

/// Reassembles parts given in split order. A gap at index `k` is
/// [`ArchiveError::MissingVolume`] with `index == k`.
pub fn join(parts: &[Volume], manifest: &VolumeManifest) -> Result<Vec<u8>> {
    manifest.validate()?;
    let mut out = Vec::with_capacity(manifest.total_length as usize);
    let mut given = parts.iter().peekable();
    for info in &manifest.volumes {
        let part = match given.peek() {
            Some(p) if p.index == info.index => given.next(),
            Some(p) if p.index < info.index => {
                return Err(ValidationError::VolumeOutOfSequence {
                    expected: info.index,
                    found: p.index,
                }
                .into())
            }
            _ => None,
        };
        let part = part.ok_or(ArchiveError::MissingVolume { index: info.index })?;
        verify_part(info, &part.data)?;
        out.extend_from_slice(&part.data);
    }
    if let Some(extra) = given.next() {
        return Err(ValidationError::VolumeOutOfSequence {
            expected: manifest.volumes.len() as u32 + 1,
            found: extra.index,
        }
        .into());
    }
    if checksum(&out) != manifest.stream_checksum {
        return Err(ValidationError::VolumeManifest("joined stream checksum mismatch".into()).into());
    }
    Ok(out)
}

fn verify_part(info: &VolumeInfo, data: &[u8]) -> std::result::Result<(), ValidationError> {
    if data.len() as u64 != info.length {
        return Err(ValidationError::VolumeLength {
            index: info.index,
            expected: info.length,
            actual: data.len() as u64,
        });
    }
    if checksum(data) != info.checksum {
        return Err(ValidationError::VolumeChecksum { index: info.index });
    }
    Ok(())
}

/// Writer that hashes what passes through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes one numbered part file per call, streaming from the source.
pub struct FileSplitter<R: Read> {
    src: R,
    dir: PathBuf,
    base_name: String,
    part_size: u64,
    width: usize,
    total_length: u64,
    offset: u64,
    stream_hasher: blake3::Hasher,
    volumes: Vec<VolumeInfo>,
    written: Vec<PathBuf>,
}

impl<R: Read> FileSplitter<R> {
    pub fn new(
        src: R,
        total_length: u64,
        dir: &Path,
        base_name: &str,
        part_size: u64,
    ) -> std::result::Result<Self, ValidationError> {
        check_split_args(total_length, part_size)?;
        Ok(Self {
            src,
            dir: dir.to_path_buf(),
            base_name: base_name.to_string(),
            part_size,
            width: index_width(estimate_volume_count(total_length, part_size)),
            total_length,
            offset: 0,
            stream_hasher: blake3::Hasher::new(),
            volumes: Vec::new(),
            written: Vec::new(),
        })
    }

    pub fn expected_parts(&self) -> u64 {
        estimate_volume_count(self.total_length, self.part_size)
    }

    /// Writes the next part. Returns `None` once the source is exhausted.
    pub fn write_next(&mut self) -> Result<Option<&VolumeInfo>> {
        if self.offset >= self.total_length {
            return Ok(None);
        }
        let index = self.volumes.len() as u32 + 1;
        let path = self.dir.join(part_name(&self.base_name, index, self.width));
        let tmp = NamedTempFile::new_in(&self.dir).map_err(|e| ArchiveError::io(&self.dir, e))?;
        let mut sink = HashingWriter {
            inner: BufWriter::new(tmp),
            hasher: blake3::Hasher::new(),
        };
        let want = self.part_size.min(self.total_length - self.offset);
        let mut limited = (&mut self.src).take(want);
        let mut buf = vec![0u8; COPY_BUF.min(want as usize).max(1)];
        let mut n = 0u64;
        loop {
            let got = limited.read(&mut buf).map_err(|e| ArchiveError::io(&path, e))?;
            if got == 0 {
                break;
            }
            self.stream_hasher.update(&buf[..got]);
            sink.write_all(&buf[..got]).map_err(|e| ArchiveError::io(&path, e))?;
            n += got as u64;
        }
        if n != want {
            return Err(ArchiveError::io(
                &path,
                io::Error::new(io::ErrorKind::UnexpectedEof, "source shrank while splitting"),
            ));
        }
        sink.flush().map_err(|e| ArchiveError::io(&path, e))?;
        let checksum = sink.hasher.finalize().to_hex().to_string();
        let tmp = sink
            .inner
            .into_inner()
            .map_err(|e| ArchiveError::io(&path, e.into_error()))?;
        tmp.persist(&path).map_err(|e| ArchiveError::io(&path, e.error))?;
        debug!(index, length = n, path = %path.display(), "wrote volume");

        self.volumes.push(VolumeInfo {
            index,
            offset: self.offset,
            length: n,
            checksum,
        });
        self.offset += n;
        self.written.push(path);
        Ok(self.volumes.last())
    }

    /// Paths of the part files written so far.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Writes the manifest file and returns it together with its path.
    pub fn finish(self) -> Result<(VolumeManifest, PathBuf)> {
        let manifest = VolumeManifest {
            version: MANIFEST_VERSION,
            base_name: self.base_name,
            total_length: self.total_length,
            part_size: self.part_size,
            index_width: self.width,
            stream_checksum: self.stream_hasher.finalize().to_hex().to_string(),
            volumes: self.volumes,
        };
        manifest.validate()?;
        let path = self.dir.join(manifest.manifest_name());
        fs::write(&path, manifest.to_json()).map_err(|e| ArchiveError::io(&path, e))?;
        Ok((manifest, path))
    }

    /// Removes every part written so far. Used after a failed or cancelled split.
    pub fn discard(self) {
        for path in &self.written {
            let _ = fs::remove_file(path);
        }
    }
}

/// Appends numbered part files, in order, to an output stream.
pub struct FileJoiner {
    dir: PathBuf,
    manifest: VolumeManifest,
    next: usize,
    hasher: blake3::Hasher,
}

impl FileJoiner {
    /// Loads and validates the manifest at `manifest_path`; parts are looked up
    /// in the same directory.
    pub fn open(manifest_path: &Path) -> Result<Self> {
        let text = fs::read_to_string(manifest_path).map_err(|e| ArchiveError::io(manifest_path, e))?;
        let manifest = VolumeManifest::from_json(&text)?;
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self::with_manifest(dir, manifest))
    }

    pub fn with_manifest(dir: PathBuf, manifest: VolumeManifest) -> Self {
        Self {
            dir,
            manifest,
            next: 0,
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn manifest(&self) -> &VolumeManifest {
        &self.manifest
    }

    pub fn part_path(&self, index: u32) -> PathBuf {
        self.dir.join(self.manifest.part_name(index))
    }

    /// Checks that every part exists with the recorded length, before any
    /// output is produced. The first gap is reported as `MissingVolume`.
    pub fn check_present(&self) -> Result<()> {
        for info in &self.manifest.volumes {
            let path = self.part_path(info.index);
            let meta = match fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                Ok(_) => return Err(ArchiveError::MissingVolume { index: info.index }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ArchiveError::MissingVolume { index: info.index })
                }
                Err(e) => return Err(ArchiveError::io(&path, e)),
            };
            if meta.len() != info.length {
                return Err(ValidationError::VolumeLength {
                    index: info.index,
                    expected: info.length,
                    actual: meta.len(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Copies the next part into `out`. Returns its index, or `None` when all
    /// parts have been appended.
    pub fn append_next<W: Write>(&mut self, out: &mut W) -> Result<Option<u32>> {
        let Some(info) = self.manifest.volumes.get(self.next).cloned() else {
            return Ok(None);
        };
        let path = self.part_path(info.index);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArchiveError::MissingVolume { index: info.index })
            }
            Err(e) => return Err(ArchiveError::io(&path, e)),
        };
        let mut reader = BufReader::new(file);
        let mut part_hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; COPY_BUF];
        let mut n = 0u64;
        loop {
            let got = reader.read(&mut buf).map_err(|e| ArchiveError::io(&path, e))?;
            if got == 0 {
                break;
            }
            part_hasher.update(&buf[..got]);
            self.hasher.update(&buf[..got]);
            out.write_all(&buf[..got])
                .map_err(|e| ArchiveError::io(&path, e))?;
            n += got as u64;
        }
        if n != info.length {
            return Err(ValidationError::VolumeLength {
                index: info.index,
                expected: info.length,
                actual: n,
            }
            .into());
        }
        if part_hasher.finalize().to_hex().as_str() != info.checksum {
            return Err(ValidationError::VolumeChecksum { index: info.index }.into());
        }
        self.next += 1;
        Ok(Some(info.index))
    }

    /// Confirms that all parts were appended and the whole stream matches.
    pub fn finish(self) -> Result<VolumeManifest> {
        if self.next != self.manifest.volumes.len() {
            return Err(ArchiveError::MissingVolume {
                index: self.next as u32 + 1,
            });
        }
        if self.hasher.finalize().to_hex().as_str() != self.manifest.stream_checksum {
            return Err(ValidationError::VolumeManifest("joined stream checksum mismatch".into()).into());
        }
        Ok(self.manifest)
    }
}
