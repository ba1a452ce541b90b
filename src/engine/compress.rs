//! Compress pipeline: scan sources, encode each entry, commit in input order,
//! then optionally split the finished archive into volumes.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone, Utc};
use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use super::options::{CompressOptions, FormatTag};
use super::{parent_dir, persist, split, temp_in, EntryPolicy};
use crate::archive::{self, ArchiveWriter, EntryOptions, PreparedEntry, SealParams};
use crate::common;
use crate::compress as codec;
use crate::error::{ArchiveError, CodecError, Result, ValidationError};
use crate::fsx;
use crate::progress::{Phase, Stop, TaskContext, TaskOutput};

/// One file or (empty) directory to be archived.
#[derive(Debug, Clone)]
struct Source {
    fs_path: PathBuf,
    entry_path: String,
    is_dir: bool,
    modified: NaiveDateTime,
    mode: u32,
}

pub(super) struct CompressPlan {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    out_dir: PathBuf,
    pub(super) opts: CompressOptions,
}

/// Checks everything that can be checked before the task starts.
pub(super) fn plan(inputs: &[PathBuf], output: &Path, opts: CompressOptions) -> Result<CompressPlan> {
    opts.validate()?;
    if inputs.is_empty() {
        return Err(ValidationError::EmptyInput.into());
    }
    for input in inputs {
        if fs::symlink_metadata(input).is_err() {
            return Err(ValidationError::SourceNotFound(input.clone()).into());
        }
    }
    let out_dir = parent_dir(output)?;
    if output.is_dir() {
        return Err(ValidationError::OutputExists(output.to_path_buf()).into());
    }
    if opts.format == FormatTag::Gz {
        let files = if inputs.len() == 1 && inputs[0].is_file() {
            1
        } else {
            scan(inputs, true)?.len()
        };
        if files != 1 {
            return Err(ValidationError::SingleFileFormat(files).into());
        }
    }
    Ok(CompressPlan {
        inputs: inputs.to_vec(),
        output: output.to_path_buf(),
        out_dir,
        opts,
    })
}

/// Directory entry names are taken relative to: the input's parent for a
/// named input, the input itself for `.` or `/`.
fn name_base(input: &Path) -> &Path {
    match (input.file_name(), input.parent()) {
        (Some(_), Some(parent)) => parent,
        _ => input,
    }
}

fn entry_name(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

fn scan(inputs: &[PathBuf], deterministic: bool) -> Result<Vec<Source>> {
    let mut sources = Vec::new();
    for input in inputs {
        let base = name_base(input);
        for item in WalkDir::new(input).sort_by_file_name() {
            let item = item.map_err(|e| {
                let path = e.path().unwrap_or(input).to_path_buf();
                ArchiveError::io(path, e.into())
            })?;
            let ft = item.file_type();
            let name = entry_name(item.path(), base);
            if ft.is_dir() {
                let empty = fs::read_dir(item.path())
                    .map_err(|e| ArchiveError::io(item.path(), e))?
                    .next()
                    .is_none();
                if !empty || name.is_empty() {
                    continue;
                }
            } else if !ft.is_file() {
                debug!(path = %item.path().display(), "skipping non-regular file");
                continue;
            }
            let meta = item
                .metadata()
                .map_err(|e| ArchiveError::io(item.path(), e.into()))?;
            let (modified, mode) = if deterministic {
                (common::deterministic_timestamp(), fsx::default_mode(ft.is_dir()))
            } else {
                (fsx::modified_time(&meta), fsx::file_mode(&meta))
            };
            sources.push(Source {
                fs_path: item.path().to_path_buf(),
                entry_path: if ft.is_dir() { format!("{name}/") } else { name },
                is_dir: ft.is_dir(),
                modified,
                mode,
            });
        }
    }
    Ok(sources)
}

fn prepare(src: &Source, level: u32, seal: Option<SealParams<'_>>) -> Result<PreparedEntry> {
    let opts = EntryOptions {
        level,
        modified: src.modified,
        permissions: src.mode,
        seal: if src.is_dir { None } else { seal },
    };
    if src.is_dir {
        return archive::prepare_entry(&src.entry_path, &[], &opts);
    }
    let file = File::open(&src.fs_path).map_err(|e| ArchiveError::io(&src.fs_path, e))?;
    archive::prepare_reader(&src.entry_path, &mut BufReader::new(file), &opts).map_err(|e| match e {
        ArchiveError::Codec(CodecError::Io(io)) => ArchiveError::io(&src.fs_path, io),
        other => other,
    })
}

impl CompressPlan {
    pub(super) fn run(self, ctx: &TaskContext) -> std::result::Result<TaskOutput, Stop> {
        ctx.set_phase(Phase::Scanning);
        let sources = scan(&self.inputs, self.opts.deterministic)?;
        debug!(entries = sources.len(), "scan complete");
        ctx.checkpoint()?;

        let (mut out, tmp) = match self.opts.format {
            FormatTag::Gz => self.write_gzip(ctx, &sources)?,
            _ => self.write_zip(ctx, &sources)?,
        };

        match self.opts.part_size {
            // the volumes are cut from the temporary file, so the single-file
            // archive never appears at `output`
            Some(part_size) => {
                ctx.set_phase(Phase::Splitting);
                let base_name = self
                    .output
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| ValidationError::OutputExists(self.output.clone()))?;
                let (volumes, files) =
                    split::split_named(tmp.path(), &base_name, &self.out_dir, part_size, None)?;
                ctx.advance(&volumes.base_name);
                out.outputs = files;
                out.volumes = Some(volumes);
            }
            None => {
                persist(tmp, &self.output, true)?;
                out.outputs = vec![self.output.clone()];
            }
        }
        Ok(out)
    }

    /// Writes the archive to a temporary file in the output directory.
    fn write_zip(
        &self,
        ctx: &TaskContext,
        sources: &[Source],
    ) -> std::result::Result<(TaskOutput, NamedTempFile), Stop> {
        let splitting = self.opts.part_size.is_some();
        ctx.set_total(sources.len() as u64 + u64::from(splitting));
        ctx.set_phase(Phase::Compressing);

        let tmp = temp_in(&self.out_dir)?;
        let mut writer = ArchiveWriter::new(BufWriter::new(tmp));
        if let Some(comment) = &self.opts.comment {
            writer.set_comment(comment)?;
        }
        let seal = self.opts.password.as_deref().map(|password| SealParams {
            password,
            algorithm: self.opts.algorithm,
            iterations: self.opts.kdf_iterations,
        });
        let level = self.opts.level;
        let batch = if self.opts.parallel {
            rayon::current_num_threads().max(1)
        } else {
            1
        };

        let mut policy = EntryPolicy::new(self.opts.continue_on_error);
        let mut committed = 0u64;
        for chunk in sources.chunks(batch) {
            ctx.checkpoint()?;
            let prepared: Vec<Result<PreparedEntry>> = if chunk.len() > 1 {
                chunk.par_iter().map(|s| prepare(s, level, seal)).collect()
            } else {
                chunk.iter().map(|s| prepare(s, level, seal)).collect()
            };
            for (src, res) in chunk.iter().zip(prepared) {
                // nothing of the next entry is written once cancellation is seen
                ctx.checkpoint()?;
                let res = match res {
                    Ok(entry) => match writer.add_prepared(entry) {
                        Ok(_) => Ok(()),
                        Err(CodecError::Io(e)) => {
                            return Err(ArchiveError::io(&self.output, e).into());
                        }
                        Err(other) => Err(ArchiveError::from(other)),
                    },
                    Err(e) => Err(e),
                };
                match res {
                    Ok(()) => {
                        committed += 1;
                        debug!(entry = %src.entry_path, "added");
                    }
                    Err(e) => policy.fail(&src.entry_path, e)?,
                }
                ctx.advance(&src.entry_path);
            }
        }
        let failures = policy.finish(committed)?;

        ctx.set_phase(Phase::Finalizing);
        let (manifest, sink) = writer.finish().map_err(|e| e.at(&self.output))?;
        let tmp = sink
            .into_inner()
            .map_err(|e| ArchiveError::io(&self.output, e.into_error()))?;
        debug!(bytes = manifest.total_length, "archive written");

        let out = TaskOutput {
            manifest: Some(manifest),
            failures,
            entries_processed: committed,
            ..TaskOutput::default()
        };
        Ok((out, tmp))
    }

    fn write_gzip(
        &self,
        ctx: &TaskContext,
        sources: &[Source],
    ) -> std::result::Result<(TaskOutput, NamedTempFile), Stop> {
        let src = match sources {
            [one] if !one.is_dir => one,
            _ => return Err(ValidationError::SingleFileFormat(sources.len()).into()),
        };
        ctx.set_total(1 + u64::from(self.opts.part_size.is_some()));
        ctx.set_phase(Phase::Compressing);
        ctx.checkpoint()?;

        let file = File::open(&src.fs_path)
            .map_err(|e| ArchiveError::io(&src.fs_path, e).for_entry(&src.entry_path))?;
        let tmp = temp_in(&self.out_dir)?;
        let mut sink = BufWriter::new(tmp);
        let mtime = if self.opts.deterministic {
            0
        } else {
            u32::try_from(Utc.from_utc_datetime(&src.modified).timestamp()).unwrap_or(0)
        };
        let name = src.fs_path.file_name().map(|n| n.to_string_lossy().into_owned());
        codec::gzip_encode(
            &mut BufReader::new(file),
            &mut sink,
            self.opts.level,
            name.as_deref(),
            mtime,
        )
        .map_err(|e| ArchiveError::io(&src.fs_path, e).for_entry(&src.entry_path))?;
        let tmp = sink
            .into_inner()
            .map_err(|e| ArchiveError::io(&self.output, e.into_error()))?;
        ctx.advance(&src.entry_path);

        let out = TaskOutput {
            entries_processed: 1,
            ..TaskOutput::default()
        };
        Ok((out, tmp))
    }
}
