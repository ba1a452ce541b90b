//! Plain option records for the engine operations.
//!
//! Every record has a `Default` and round-trips through serde, so a front end
//! can build one from JSON without knowing the engine internals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::compress::{self, DEFAULT_LEVEL};
use crate::crypto::{self, Algorithm, DEFAULT_ITERATIONS};
use crate::error::ValidationError;

/// Output container format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatTag {
    #[default]
    Zip,
    /// Single-file gzip stream.
    Gz,
    #[serde(rename = "7z")]
    SevenZ,
    Tar,
}

impl FormatTag {
    pub const fn name(self) -> &'static str {
        match self {
            FormatTag::Zip => "zip",
            FormatTag::Gz => "gz",
            FormatTag::SevenZ => "7z",
            FormatTag::Tar => "tar",
        }
    }

    /// Fails for tags this crate recognises but cannot write.
    pub fn ensure_supported(self) -> Result<Self, ValidationError> {
        match self {
            FormatTag::Zip | FormatTag::Gz => Ok(self),
            other => Err(ValidationError::UnsupportedFormat(other.name().to_string())),
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FormatTag {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(FormatTag::Zip),
            "gz" | "gzip" => Ok(FormatTag::Gz),
            "7z" => Ok(FormatTag::SevenZ),
            "tar" => Ok(FormatTag::Tar),
            _ => Err(ValidationError::UnsupportedFormat(s.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CompressOptions {
    pub format: FormatTag,
    /// 0 (store) through 9 (smallest).
    pub level: u32,
    /// When set, every entry is sealed with a key derived from it.
    pub password: Option<String>,
    pub algorithm: Algorithm,
    pub kdf_iterations: u32,
    /// Split the finished archive into volumes of this many bytes.
    pub part_size: Option<u64>,
    pub continue_on_error: bool,
    /// Compress entries on the rayon pool; the archive is still written in input order.
    pub parallel: bool,
    /// Record a fixed timestamp and default modes so identical input gives identical bytes.
    pub deterministic: bool,
    pub comment: Option<String>,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            format: FormatTag::Zip,
            level: DEFAULT_LEVEL,
            password: None,
            algorithm: Algorithm::default(),
            kdf_iterations: DEFAULT_ITERATIONS,
            part_size: None,
            continue_on_error: false,
            parallel: false,
            deterministic: false,
            comment: None,
        }
    }
}

impl CompressOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.format.ensure_supported()?;
        compress::validate_level(self.level)?;
        if let Some(pw) = &self.password {
            if self.format != FormatTag::Zip {
                return Err(ValidationError::FormatCannotEncrypt(self.format.name().into()));
            }
            crypto::validate_policy(pw, self.kdf_iterations)?;
        }
        if self.part_size == Some(0) {
            return Err(ValidationError::InvalidPartSize);
        }
        if let Some(c) = &self.comment {
            if c.len() > crate::archive::MAX_COMMENT_LEN {
                return Err(ValidationError::CommentTooLong(c.len()));
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractOptions {
    pub password: Option<String>,
    pub continue_on_error: bool,
    /// Replace files that already exist at the destination.
    pub overwrite: bool,
}

impl ExtractOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(&self.password, Some(pw) if pw.is_empty()) {
            return Err(ValidationError::EmptyPassword);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EncryptOptions {
    pub password: String,
    pub algorithm: Algorithm,
    pub kdf_iterations: u32,
    /// Leave out entries that fail to seal instead of stopping.
    pub continue_on_error: bool,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            password: String::new(),
            algorithm: Algorithm::default(),
            kdf_iterations: DEFAULT_ITERATIONS,
            continue_on_error: false,
        }
    }
}

impl EncryptOptions {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        crypto::validate_policy(&self.password, self.kdf_iterations)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DecryptOptions {
    pub password: String,
    /// Leave out entries that fail to open instead of stopping.
    pub continue_on_error: bool,
}

impl DecryptOptions {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            continue_on_error: false,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.password.is_empty() {
            return Err(ValidationError::EmptyPassword);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct SplitOptions {
    pub part_size: u64,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            part_size: crate::volume::PRESET_PART_SIZES[1],
        }
    }
}

impl SplitOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.part_size == 0 {
            return Err(ValidationError::InvalidPartSize);
        }
        Ok(())
    }
}
