//! Main entry point for the zipmaster CLI app

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use zipmaster::cli::{self, Commands};
use zipmaster::engine::{
    CompressOptions, DecryptOptions, EncryptOptions, Engine, ExtractOptions, SplitOptions,
};
use zipmaster::progress::{TaskEvent, TaskHandle, TaskOutcome};

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new();
    match cli::run() {
        Commands::Create {
            inputs,
            output,
            format,
            level,
            password,
            algorithm,
            volume_size,
            continue_on_error,
            parallel,
            deterministic,
            comment,
        } => {
            let part_size = volume_size.map(volume_bytes).transpose()?;
            let opts = CompressOptions {
                format: format.into(),
                level,
                password: cli::get_password_from_opt_or_env(password),
                algorithm: algorithm.into(),
                part_size,
                continue_on_error,
                parallel,
                deterministic,
                comment,
                ..CompressOptions::default()
            };
            drive(engine.compress(&inputs, &output, opts)?)?;
        }
        Commands::Extract {
            archive,
            output,
            password,
            overwrite,
            continue_on_error,
        } => {
            let opts = ExtractOptions {
                password: cli::get_password_from_opt_or_env(password),
                continue_on_error,
                overwrite,
            };
            let dest = output.unwrap_or_else(|| PathBuf::from("."));
            drive(engine.extract(&archive, &dest, opts)?)?;
        }
        Commands::List { archive, json } => {
            let manifest = engine.list(&archive)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                for e in &manifest.entries {
                    let lock = if e.is_encrypted() { "*" } else { " " };
                    println!(
                        "{:>12} {:>12} {} {}  {}",
                        e.uncompressed_size,
                        e.compressed_size,
                        e.modified.format("%Y-%m-%d %H:%M"),
                        lock,
                        e.path
                    );
                }
                println!(
                    "{} entries, {} bytes ({} compressed)",
                    manifest.len(),
                    manifest.total_uncompressed(),
                    manifest.total_compressed()
                );
                if !manifest.comment.is_empty() {
                    println!("comment: {}", manifest.comment);
                }
            }
        }
        Commands::Verify { archive, password } => {
            let opts = ExtractOptions {
                password: cli::get_password_from_opt_or_env(password),
                ..ExtractOptions::default()
            };
            drive(engine.verify(&archive, opts)?)?;
            println!("{}: OK", archive.display());
        }
        Commands::Encrypt {
            archive,
            output,
            password,
            algorithm,
            continue_on_error,
        } => {
            let password = cli::get_password_from_opt_or_env(password).ok_or("a password is required")?;
            let opts = EncryptOptions {
                algorithm: algorithm.into(),
                continue_on_error,
                ..EncryptOptions::new(password)
            };
            drive(engine.encrypt_entries(&archive, output.as_deref(), opts)?)?;
        }
        Commands::Decrypt {
            archive,
            output,
            password,
            continue_on_error,
        } => {
            let password = cli::get_password_from_opt_or_env(password).ok_or("a password is required")?;
            let opts = DecryptOptions {
                continue_on_error,
                ..DecryptOptions::new(password)
            };
            drive(engine.decrypt_entries(&archive, output.as_deref(), opts)?)?;
        }
        Commands::Split {
            archive,
            size,
            bytes,
            output,
        } => {
            let part_size = match bytes {
                Some(b) => b,
                None => volume_bytes(size)?,
            };
            let opts = SplitOptions { part_size };
            drive(engine.split_archive(&archive, output.as_deref(), opts)?)?;
        }
        Commands::Join { manifest, output } => {
            drive(engine.join_volumes(Path::new(&manifest), &output)?)?;
        }
    }
    Ok(())
}

fn volume_bytes(mib: u64) -> Result<u64, String> {
    cli::mib_to_bytes(mib).ok_or_else(|| format!("volume size of {mib} MiB is too large"))
}

/// Waits for a task, logging progress, and turns its outcome into a result.
fn drive(task: TaskHandle) -> Result<(), Box<dyn std::error::Error>> {
    let events = task.events();
    while task.wait_timeout(Duration::from_millis(200)).is_none() {
        for ev in events.try_iter() {
            if let TaskEvent::Progress(p) = ev {
                tracing::debug!(
                    "{:>5.1}% {}",
                    p.fraction * 100.0,
                    p.current.as_deref().unwrap_or("")
                );
            }
        }
    }
    match task.wait() {
        TaskOutcome::Completed(out) => {
            for f in &out.failures {
                eprintln!("skipped {}: {}", f.path, f.error);
            }
            for path in &out.outputs {
                tracing::info!(path = %path.display(), "written");
            }
            Ok(())
        }
        TaskOutcome::Failed(e) => Err(e.into()),
        TaskOutcome::Cancelled => Err("cancelled".into()),
    }
}
