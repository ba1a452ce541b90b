use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use zipmaster::crypto::{Algorithm, MIN_ITERATIONS};
use zipmaster::engine::{CompressOptions, DecryptOptions, EncryptOptions, Engine, ExtractOptions};
use zipmaster::error::{CryptoError, ValidationError};
use zipmaster::progress::{TaskOutcome, TaskState};
use zipmaster::{ArchiveError, ErrorKind};

const PASSWORD: &str = "correct horse battery staple";

fn sample_inputs(dir: &Path) -> Vec<PathBuf> {
    let files = [
        ("secret.txt", b"the eagle lands at midnight".to_vec()),
        ("data.bin", (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect()),
    ];
    files
        .iter()
        .map(|(name, data)| {
            let p = dir.join(name);
            fs::write(&p, data).unwrap();
            p
        })
        .collect()
}

fn sealed_options(algorithm: Algorithm) -> CompressOptions {
    CompressOptions {
        password: Some(PASSWORD.to_string()),
        algorithm,
        kdf_iterations: MIN_ITERATIONS,
        ..CompressOptions::default()
    }
}

fn extract_with(archive: &Path, dest: &Path, password: Option<&str>) -> TaskOutcome {
    let opts = ExtractOptions {
        password: password.map(str::to_string),
        ..ExtractOptions::default()
    };
    Engine::new().extract(archive, dest, opts).unwrap().wait()
}

#[test]
fn encrypted_archive_round_trips_with_both_key_sizes() {
    for algorithm in [Algorithm::Aes128Gcm, Algorithm::Aes256Gcm] {
        let src = tempdir().unwrap();
        let inputs = sample_inputs(src.path());
        let archive = src.path().join("sealed.zip");
        let engine = Engine::new();
        let outcome = engine
            .compress(&inputs, &archive, sealed_options(algorithm))
            .unwrap()
            .wait();
        assert_eq!(outcome.state(), TaskState::Completed);

        let manifest = engine.list(&archive).unwrap();
        assert!(manifest.entries.iter().all(|e| e.is_encrypted()));
        assert_eq!(manifest.entries[0].encryption.unwrap().algorithm, algorithm);

        let dest = tempdir().unwrap();
        assert_eq!(
            extract_with(&archive, dest.path(), Some(PASSWORD)).state(),
            TaskState::Completed
        );
        for input in &inputs {
            let name = input.file_name().unwrap();
            assert_eq!(fs::read(dest.path().join(name)).unwrap(), fs::read(input).unwrap());
        }
    }
}

#[test]
fn wrong_password_fails_authentication_and_writes_nothing() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("sealed.zip");
    Engine::new()
        .compress(&inputs, &archive, sealed_options(Algorithm::Aes256Gcm))
        .unwrap()
        .wait();

    let dest = tempdir().unwrap();
    let outcome = extract_with(&archive, dest.path(), Some("wrong password"));
    let err = outcome.error().expect("wrong password must fail");
    assert!(err.is_authentication_failure(), "{err}");
    assert_eq!(err.kind(), ErrorKind::Crypto);
    assert_eq!(err.entry_path(), Some("secret.txt"));
    assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[test]
fn missing_password_is_reported_per_entry() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("sealed.zip");
    Engine::new()
        .compress(&inputs, &archive, sealed_options(Algorithm::Aes128Gcm))
        .unwrap()
        .wait();

    let dest = tempdir().unwrap();
    let outcome = extract_with(&archive, dest.path(), None);
    match outcome.error().map(ArchiveError::root) {
        Some(ArchiveError::Validation(ValidationError::PasswordRequired(path))) => {
            assert_eq!(path, "secret.txt")
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn encrypt_then_decrypt_existing_archive_in_place() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("plain.zip");
    let engine = Engine::new();
    engine
        .compress(&inputs, &archive, CompressOptions::default())
        .unwrap()
        .wait();
    let before = engine.list(&archive).unwrap();

    let opts = EncryptOptions {
        kdf_iterations: MIN_ITERATIONS,
        ..EncryptOptions::new(PASSWORD)
    };
    let outcome = engine.encrypt_entries(&archive, None, opts.clone()).unwrap().wait();
    assert_eq!(outcome.state(), TaskState::Completed);
    let sealed = engine.list(&archive).unwrap();
    assert!(sealed.entries.iter().all(|e| e.is_encrypted()));
    for (a, b) in before.entries.iter().zip(&sealed.entries) {
        assert_eq!(a.path, b.path);
        assert_eq!(a.crc32, b.crc32);
    }

    // sealing twice is refused
    let again = engine.encrypt_entries(&archive, None, opts).unwrap().wait();
    assert!(matches!(
        again.error().map(ArchiveError::root),
        Some(ArchiveError::Validation(ValidationError::AlreadyEncrypted(_)))
    ));

    let wrong = engine
        .decrypt_entries(&archive, None, DecryptOptions::new("not it"))
        .unwrap()
        .wait();
    assert!(wrong.error().unwrap().is_authentication_failure());
    assert!(engine.list(&archive).unwrap().has_encrypted_entries());

    let plain = src.path().join("opened.zip");
    let outcome = engine
        .decrypt_entries(&archive, Some(&plain), DecryptOptions::new(PASSWORD))
        .unwrap()
        .wait();
    assert_eq!(outcome.state(), TaskState::Completed);
    assert!(!engine.list(&plain).unwrap().has_encrypted_entries());

    let dest = tempdir().unwrap();
    assert_eq!(extract_with(&plain, dest.path(), None).state(), TaskState::Completed);
    for input in &inputs {
        let name = input.file_name().unwrap();
        assert_eq!(fs::read(dest.path().join(name)).unwrap(), fs::read(input).unwrap());
    }
}

#[test]
fn password_policy_is_enforced_up_front() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("p.zip");
    let engine = Engine::new();

    let empty = CompressOptions {
        password: Some(String::new()),
        ..CompressOptions::default()
    };
    let err = engine.compress(&inputs, &archive, empty).unwrap_err();
    assert!(matches!(err, ArchiveError::Validation(ValidationError::EmptyPassword)));

    engine
        .compress(&inputs, &archive, CompressOptions::default())
        .unwrap()
        .wait();
    let weak = EncryptOptions {
        kdf_iterations: 10,
        ..EncryptOptions::new(PASSWORD)
    };
    assert!(matches!(
        engine.encrypt_entries(&archive, None, weak).unwrap_err(),
        ArchiveError::Validation(ValidationError::IterationsTooLow { .. })
    ));
    let slow = EncryptOptions {
        kdf_iterations: u32::MAX,
        ..EncryptOptions::new(PASSWORD)
    };
    assert!(matches!(
        engine.encrypt_entries(&archive, None, slow).unwrap_err(),
        ArchiveError::Validation(ValidationError::IterationsTooHigh { .. })
    ));
    assert!(engine.decrypt_entries(&archive, None, DecryptOptions::new("")).is_err());

    let outcome = engine.decrypt_entries(&archive, None, DecryptOptions::new(PASSWORD)).unwrap().wait();
    assert!(matches!(
        outcome.error().map(ArchiveError::root),
        Some(ArchiveError::Validation(ValidationError::NotEncrypted))
    ));
}

#[test]
fn tampered_ciphertext_is_detected() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("sealed.zip");
    let engine = Engine::new();
    engine
        .compress(&inputs, &archive, sealed_options(Algorithm::Aes256Gcm))
        .unwrap()
        .wait();

    let manifest = engine.list(&archive).unwrap();
    let entry = &manifest.entries[1];
    let mut bytes = fs::read(&archive).unwrap();
    // local header: 30 fixed bytes, the name, then the 54-byte encryption record
    let payload = entry.header_offset as usize + 30 + entry.path.len() + 4 + 50;
    bytes[payload + 3] ^= 0x40;
    fs::write(&archive, &bytes).unwrap();

    let outcome = engine
        .verify(
            &archive,
            ExtractOptions {
                password: Some(PASSWORD.into()),
                ..ExtractOptions::default()
            },
        )
        .unwrap()
        .wait();
    let err = outcome.error().expect("tampering must be detected");
    assert!(matches!(err.root(), ArchiveError::Crypto(CryptoError::AuthenticationFailed)));
    assert_eq!(err.entry_path(), Some("data.bin"));
}

/// Flips one byte in the middle of the stored payload of entry `index`.
/// `record` is the length of the encryption extra field of that entry.
fn corrupt_payload(archive: &Path, index: usize, record: usize) -> String {
    let manifest = Engine::new().list(archive).unwrap();
    let entry = &manifest.entries[index];
    let mut bytes = fs::read(archive).unwrap();
    let start = entry.header_offset as usize + 30 + entry.path.len() + record;
    bytes[start + entry.compressed_size as usize / 2] ^= 0x21;
    fs::write(archive, &bytes).unwrap();
    entry.path.clone()
}

#[test]
fn decrypt_can_skip_an_entry_that_fails_to_open() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("sealed.zip");
    let engine = Engine::new();
    engine
        .compress(&inputs, &archive, sealed_options(Algorithm::Aes128Gcm))
        .unwrap()
        .wait();
    let victim = corrupt_payload(&archive, 1, 4 + 50);

    let strict = src.path().join("strict.zip");
    let outcome = engine
        .decrypt_entries(&archive, Some(&strict), DecryptOptions::new(PASSWORD))
        .unwrap()
        .wait();
    let err = outcome.error().expect("fail-fast decrypt stops");
    assert_eq!(err.entry_path(), Some(victim.as_str()));
    assert!(!strict.exists());

    let partial = src.path().join("partial.zip");
    let opts = DecryptOptions {
        continue_on_error: true,
        ..DecryptOptions::new(PASSWORD)
    };
    let outcome = engine.decrypt_entries(&archive, Some(&partial), opts).unwrap().wait();
    let out = outcome.into_output().expect("partial decrypt completes");
    assert!(out.is_partial());
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].path, victim);
    assert!(out.failures[0].error.is_authentication_failure());
    assert_eq!(out.entries_processed, 1);

    let manifest = engine.list(&partial).unwrap();
    let paths: Vec<_> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, ["secret.txt"]);
    assert!(!manifest.has_encrypted_entries());
}

#[test]
fn encrypt_can_skip_a_corrupt_entry() {
    let src = tempdir().unwrap();
    let inputs = sample_inputs(src.path());
    let archive = src.path().join("plain.zip");
    let engine = Engine::new();
    engine
        .compress(&inputs, &archive, CompressOptions { level: 0, ..CompressOptions::default() })
        .unwrap()
        .wait();
    let victim = corrupt_payload(&archive, 0, 0);

    let base = EncryptOptions {
        kdf_iterations: MIN_ITERATIONS,
        ..EncryptOptions::new(PASSWORD)
    };
    let strict = src.path().join("strict.zip");
    let outcome = engine
        .encrypt_entries(&archive, Some(&strict), base.clone())
        .unwrap()
        .wait();
    assert_eq!(outcome.error().unwrap().kind(), ErrorKind::Codec);
    assert!(!strict.exists());

    let sealed = src.path().join("sealed.zip");
    let opts = EncryptOptions {
        continue_on_error: true,
        ..base
    };
    let outcome = engine.encrypt_entries(&archive, Some(&sealed), opts).unwrap().wait();
    let out = outcome.into_output().expect("partial encrypt completes");
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].path, victim);
    assert_eq!(out.failures[0].error.kind(), ErrorKind::Codec);

    let manifest = engine.list(&sealed).unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest.entries[0].path, "data.bin");
    assert!(manifest.entries[0].is_encrypted());
}
