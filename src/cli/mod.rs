use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::crypto::Algorithm;
use crate::engine::FormatTag;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new archive from specified files and directories.
    #[command(alias = "c")]
    Create {
        /// One or more input files or directories to add to the archive.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// The path for the output archive file (e.g., backup.zip).
        #[arg(short, long)]
        output: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value_t = FormatArg::Zip)]
        format: FormatArg,

        /// Compression level (0-9). 0 stores entries without compression.
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
        level: u32,

        /// Encrypt every entry with a key derived from this password.
        #[arg(long)]
        password: Option<String>,

        /// Cipher used when a password is given.
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Aes256)]
        algorithm: AlgorithmArg,

        /// Split the archive into volumes of this many MiB.
        #[arg(long)]
        volume_size: Option<u64>,

        /// Skip unreadable entries instead of aborting.
        #[arg(long)]
        continue_on_error: bool,

        /// Compress entries on all cores.
        #[arg(long)]
        parallel: bool,

        /// Fixed timestamps and modes, for reproducible output.
        #[arg(long)]
        deterministic: bool,

        /// Archive comment.
        #[arg(long)]
        comment: Option<String>,
    },

    /// Extract files from an archive.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory where files will be extracted. Defaults to the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The password for encrypted entries. If not provided, will try to read from ZIPMASTER_PASSWORD.
        #[arg(long)]
        password: Option<String>,

        /// Replace existing files.
        #[arg(long)]
        overwrite: bool,

        /// Skip entries that fail instead of aborting.
        #[arg(long)]
        continue_on_error: bool,
    },

    /// List the contents of an archive without extracting it.
    #[command(alias = "l")]
    List {
        /// The archive file to list contents of.
        #[arg(required = true)]
        archive: PathBuf,

        /// Print the manifest as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check every entry's checksum without writing anything.
    Verify {
        #[arg(required = true)]
        archive: PathBuf,

        #[arg(long)]
        password: Option<String>,
    },

    /// Encrypt every entry of an existing archive.
    Encrypt {
        #[arg(required = true)]
        archive: PathBuf,

        /// Write the result here instead of replacing the archive.
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        password: Option<String>,

        #[arg(long, value_enum, default_value_t = AlgorithmArg::Aes256)]
        algorithm: AlgorithmArg,

        /// Leave out entries that fail instead of aborting.
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Remove entry encryption from an archive.
    Decrypt {
        #[arg(required = true)]
        archive: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        password: Option<String>,

        /// Leave out entries that fail instead of aborting.
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Split a file into numbered volumes.
    Split {
        #[arg(required = true)]
        archive: PathBuf,

        /// Volume size in MiB (presets: 50, 100, 200, 500).
        #[arg(long, default_value_t = 100)]
        size: u64,

        /// Volume size in bytes; overrides --size.
        #[arg(long)]
        bytes: Option<u64>,

        /// Directory for the volumes. Defaults to the archive's directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Reassemble a volume set from its manifest (`<name>.vol.json`).
    Join {
        #[arg(required = true)]
        manifest: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum FormatArg {
    Zip,
    Gz,
}

impl From<FormatArg> for FormatTag {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Zip => FormatTag::Zip,
            FormatArg::Gz => FormatTag::Gz,
        }
    }
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum AlgorithmArg {
    #[value(name = "aes-128")]
    Aes128,
    #[value(name = "aes-256")]
    Aes256,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(a: AlgorithmArg) -> Self {
        match a {
            AlgorithmArg::Aes128 => Algorithm::Aes128Gcm,
            AlgorithmArg::Aes256 => Algorithm::Aes256Gcm,
        }
    }
}

pub const PASSWORD_ENV: &str = "ZIPMASTER_PASSWORD";

/// Gets the password from the command-line option or the `ZIPMASTER_PASSWORD` environment variable.
///
/// Priority:
/// 1. `--password` command-line argument.
/// 2. `ZIPMASTER_PASSWORD` environment variable.
/// 3. `None` if neither is present.
pub fn get_password_from_opt_or_env(password_opt: Option<String>) -> Option<String> {
    if let Some(pass) = password_opt {
        return Some(pass);
    }
    std::env::var(PASSWORD_ENV).ok()
}

/// Converts a size given in MiB to bytes, or `None` when it does not fit in a `u64`.
pub fn mib_to_bytes(mib: u64) -> Option<u64> {
    mib.checked_mul(1024 * 1024)
}

/// Parses command-line arguments using `clap` and returns the command to execute.
pub fn run() -> Commands {
    Args::parse().command
}
