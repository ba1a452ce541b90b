//! Encrypt and decrypt pipelines. Both rewrite the archive entry by entry
//! without recompressing: sealing wraps the stored compressed payload, opening
//! unwraps it. Every payload is checked against its CRC-32 on the way through.
//!
//! The new archive is built in a temporary file and only replaces the target
//! once the last entry is written. Under `continue_on_error` an entry that
//! fails is left out of the new archive and reported in the task output.

use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::options::{DecryptOptions, EncryptOptions};
use super::{open_archive, parent_dir, persist, require_file, temp_in, EntryPolicy};
use crate::archive::{reader::check_payload, ArchiveWriter, PreparedEntry, SealParams};
use crate::common::ArchiveEntry;
use crate::crypto::Algorithm;
use crate::error::{ArchiveError, CodecError, Result, ValidationError};
use crate::progress::{Phase, Stop, TaskContext, TaskOutput};

enum Direction {
    Seal { algorithm: Algorithm, iterations: u32 },
    Open,
}

pub(super) struct RewriteJob {
    archive: PathBuf,
    output: PathBuf,
    out_dir: PathBuf,
    password: String,
    direction: Direction,
    continue_on_error: bool,
}

impl RewriteJob {
    pub(super) fn encrypt(archive: &Path, output: Option<&Path>, opts: EncryptOptions) -> Result<Self> {
        opts.validate()?;
        let direction = Direction::Seal {
            algorithm: opts.algorithm,
            iterations: opts.kdf_iterations,
        };
        Self::new(archive, output, opts.password, direction, opts.continue_on_error)
    }

    pub(super) fn decrypt(archive: &Path, output: Option<&Path>, opts: DecryptOptions) -> Result<Self> {
        opts.validate()?;
        Self::new(archive, output, opts.password, Direction::Open, opts.continue_on_error)
    }

    fn new(
        archive: &Path,
        output: Option<&Path>,
        password: String,
        direction: Direction,
        continue_on_error: bool,
    ) -> Result<Self> {
        require_file(archive)?;
        let output = output.unwrap_or(archive);
        if output.is_dir() {
            return Err(ValidationError::OutputExists(output.to_path_buf()).into());
        }
        let out_dir = parent_dir(output)?;
        Ok(Self {
            archive: archive.to_path_buf(),
            output: output.to_path_buf(),
            out_dir,
            password,
            direction,
            continue_on_error,
        })
    }

    pub(super) fn run(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_phase(match self.direction {
            Direction::Seal { .. } => Phase::Encrypting,
            Direction::Open => Phase::Decrypting,
        });
        let mut reader = open_archive(&self.archive)?;
        let manifest = reader.manifest().clone();
        match self.direction {
            Direction::Seal { .. } => {
                if let Some(sealed) = manifest.entries.iter().find(|e| e.is_encrypted()) {
                    return Err(ValidationError::AlreadyEncrypted(sealed.path.clone()).into());
                }
            }
            Direction::Open => {
                if !manifest.has_encrypted_entries() {
                    return Err(ValidationError::NotEncrypted.into());
                }
            }
        }
        ctx.set_total(manifest.len() as u64);

        let tmp = temp_in(&self.out_dir)?;
        let mut writer = ArchiveWriter::new(BufWriter::new(tmp));
        writer.set_comment(&manifest.comment)?;

        let mut policy = EntryPolicy::new(self.continue_on_error);
        let mut committed = 0u64;
        for (index, entry) in manifest.entries.iter().enumerate() {
            ctx.checkpoint()?;
            let rewritten = reader
                .read_raw(index)
                .map_err(|e| e.at(&self.archive))
                .and_then(|raw| self.rewrite(PreparedEntry::from_stored(entry, raw)));
            let res = match rewritten {
                Ok(prepared) => match writer.add_prepared(prepared) {
                    Ok(_) => Ok(()),
                    Err(CodecError::Io(e)) => {
                        return Err(ArchiveError::io(&self.output, e).into());
                    }
                    Err(other) => Err(other.at(&self.output)),
                },
                Err(e) => Err(e),
            };
            match res {
                Ok(()) => {
                    committed += 1;
                    debug!(entry = %entry.path, "rewritten");
                }
                Err(e) => policy.fail(&entry.path, e)?,
            }
            ctx.advance(&entry.path);
        }
        let failures = policy.finish(committed)?;

        ctx.set_phase(Phase::Finalizing);
        // the source may be the target
        drop(reader);
        let (manifest, sink) = writer.finish().map_err(|e| e.at(&self.output))?;
        let tmp = sink
            .into_inner()
            .map_err(|e| ArchiveError::io(&self.output, e.into_error()))?;
        persist(tmp, &self.output, true)?;

        Ok(TaskOutput {
            outputs: vec![self.output],
            entries_processed: committed,
            manifest: Some(manifest),
            failures,
            ..TaskOutput::default()
        })
    }

    fn rewrite(&self, stored: PreparedEntry) -> Result<PreparedEntry> {
        match self.direction {
            Direction::Seal {
                algorithm,
                iterations,
            } => {
                verify(&stored)?;
                if stored.path.ends_with('/') {
                    return Ok(stored);
                }
                let params = SealParams {
                    password: &self.password,
                    algorithm,
                    iterations,
                };
                Ok(stored.seal(params)?)
            }
            Direction::Open => {
                let opened = stored.unseal(&self.password)?;
                verify(&opened)?;
                Ok(opened)
            }
        }
    }
}

/// Decodes the (unsealed) payload to nowhere, checking size and CRC-32.
fn verify(entry: &PreparedEntry) -> Result<()> {
    let record = ArchiveEntry {
        path: entry.path.clone(),
        uncompressed_size: entry.uncompressed_size,
        compressed_size: entry.payload.len() as u64,
        crc32: entry.crc32,
        method: entry.method,
        modified: entry.modified,
        permissions: entry.permissions,
        encryption: None,
        header_offset: 0,
    };
    check_payload(&record, &entry.payload, io::sink()).map(|_| ())
}
