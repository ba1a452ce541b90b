//! # zipmaster Core Library
//!
//! This crate provides the archive engine behind the `zipmaster` command-line
//! tool: ZIP containers with stored or deflate entries, password-based
//! AES-GCM entry encryption, and splitting archives into numbered volumes.
//!
//! Front ends drive it through [`engine::Engine`]. Every operation validates
//! its input up front, then runs as a cancellable background task whose
//! progress can be polled or streamed.
//!
//! ## Key Modules
//!
//! - [`archive`]: reading and writing the ZIP container.
//! - [`compress`]: per-entry stored/deflate transforms and the single-file gzip stream.
//! - [`crypto`]: PBKDF2-HMAC-SHA256 key derivation and AES-GCM sealing.
//! - [`volume`]: split/join of byte streams into numbered parts.
//! - [`engine`]: the public operations, run as [`progress`] tasks.
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use zipmaster::engine::{CompressOptions, Engine};
//!
//! let engine = Engine::new();
//! let task = engine
//!     .compress(&[PathBuf::from("docs")], Path::new("docs.zip"), CompressOptions::default())
//!     .expect("valid input");
//! let outcome = task.wait();
//! println!("{:?}", outcome.state());
//! ```

pub mod archive;
pub mod cli;
pub mod common;
pub mod compress;
pub mod crypto;
pub mod engine;
pub mod error;
pub use error::{ArchiveError, ErrorKind};

// Cross-platform filesystem wrapper
pub mod fsx;

pub mod progress;
pub mod volume;

pub use engine::Engine;
pub use progress::{TaskHandle, TaskOutcome, TaskState};
