use rand::{thread_rng, Rng};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use zipmaster::engine::{CompressOptions, Engine, ExtractOptions, FormatTag};
use zipmaster::progress::{TaskOutcome, TaskOutput, TaskState};
use zipmaster::ErrorKind;

// Helper function to create a directory with some random files
fn create_test_data(dir: &Path, num_files: usize, file_size: usize) -> std::io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut paths = Vec::new();
    let mut rng = thread_rng();
    for i in 0..num_files {
        let file_path = dir.join(format!("file_{}.txt", i));
        let mut file = File::create(&file_path)?;
        let mut buffer = vec![0u8; file_size];
        rng.fill(&mut buffer[..]);
        file.write_all(&buffer)?;
        paths.push(file_path);
    }
    Ok(paths)
}

fn completed(outcome: TaskOutcome) -> TaskOutput {
    match outcome {
        TaskOutcome::Completed(out) => out,
        other => panic!("task did not complete: {:?}", other),
    }
}

#[test]
fn three_files_round_trip_at_level_five() {
    let src = tempdir().unwrap();
    let files = vec![
        ("a.txt", b"hello world hello world hello world".to_vec()),
        ("b.bin", (0..50_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>()),
        ("c.md", b"".to_vec()),
    ];
    let mut inputs = Vec::new();
    for (name, data) in &files {
        let p = src.path().join(name);
        fs::write(&p, data).unwrap();
        inputs.push(p);
    }

    let out = tempdir().unwrap();
    let archive = out.path().join("three.zip");
    let engine = Engine::new();
    let opts = CompressOptions {
        level: 5,
        ..CompressOptions::default()
    };
    let output = completed(engine.compress(&inputs, &archive, opts).unwrap().wait());
    assert_eq!(output.entries_processed, 3);
    assert_eq!(output.outputs, vec![archive.clone()]);

    let manifest = engine.list(&archive).unwrap();
    let names: Vec<_> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(names, ["a.txt", "b.bin", "c.md"]);

    let dest = tempdir().unwrap();
    completed(
        engine
            .extract(&archive, dest.path(), ExtractOptions::default())
            .unwrap()
            .wait(),
    );
    for (name, data) in &files {
        assert_eq!(&fs::read(dest.path().join(name)).unwrap(), data, "{}", name);
    }
}

#[test]
fn directory_tree_keeps_every_entry() {
    let src = tempdir().unwrap();
    let root = src.path().join("tree");
    create_test_data(&root, 6, 1024).unwrap();
    create_test_data(&root.join("nested"), 4, 512).unwrap();

    let archive = src.path().join("tree.zip");
    let engine = Engine::new();
    completed(
        engine
            .compress(&[root.clone()], &archive, CompressOptions::default())
            .unwrap()
            .wait(),
    );
    let manifest = engine.list(&archive).unwrap();
    assert_eq!(manifest.len(), 10);
    assert!(manifest.get("tree/nested/file_3.txt").is_some());

    let dest = tempdir().unwrap();
    completed(
        engine
            .extract(&archive, dest.path(), ExtractOptions::default())
            .unwrap()
            .wait(),
    );
    for entry in &manifest.entries {
        let original = src.path().join(&entry.path);
        let extracted = dest.path().join(&entry.path);
        assert_eq!(fs::read(original).unwrap(), fs::read(extracted).unwrap());
    }
}

#[test]
fn level_zero_stores_without_shrinking() {
    let src = tempdir().unwrap();
    let inputs = create_test_data(src.path(), 3, 4096).unwrap();
    let total: u64 = inputs.iter().map(|p| fs::metadata(p).unwrap().len()).sum();

    let archive = src.path().join("stored.zip");
    let opts = CompressOptions {
        level: 0,
        ..CompressOptions::default()
    };
    completed(Engine::new().compress(&inputs, &archive, opts).unwrap().wait());
    assert!(fs::metadata(&archive).unwrap().len() >= total);
}

#[test]
fn invalid_options_are_rejected_before_the_task_starts() {
    let src = tempdir().unwrap();
    let inputs = create_test_data(src.path(), 1, 16).unwrap();
    let archive = src.path().join("x.zip");
    let engine = Engine::new();

    let err = engine
        .compress(&inputs, &archive, CompressOptions { level: 10, ..CompressOptions::default() })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = engine
        .compress(&[], &archive, CompressOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let missing = src.path().join("nope");
    assert!(engine.compress(&[missing], &archive, CompressOptions::default()).is_err());
    assert!(engine
        .extract(&archive, &src.path().join("no-such-dir"), ExtractOptions::default())
        .is_err());
    assert!(!archive.exists());
}

#[test]
fn existing_files_are_kept_unless_overwrite() {
    let src = tempdir().unwrap();
    let inputs = create_test_data(src.path(), 2, 64).unwrap();
    let archive = src.path().join("o.zip");
    let engine = Engine::new();
    completed(engine.compress(&inputs, &archive, CompressOptions::default()).unwrap().wait());

    let dest = tempdir().unwrap();
    fs::write(dest.path().join("file_0.txt"), b"keep me").unwrap();

    let outcome = engine
        .extract(&archive, dest.path(), ExtractOptions::default())
        .unwrap()
        .wait();
    let err = outcome.error().expect("extract should fail");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.entry_path(), Some("file_0.txt"));
    assert_eq!(fs::read(dest.path().join("file_0.txt")).unwrap(), b"keep me");

    let opts = ExtractOptions {
        overwrite: true,
        ..ExtractOptions::default()
    };
    completed(engine.extract(&archive, dest.path(), opts).unwrap().wait());
    assert_eq!(
        fs::read(dest.path().join("file_0.txt")).unwrap(),
        fs::read(&inputs[0]).unwrap()
    );
}

#[test]
fn parallel_and_deterministic_output_is_reproducible() {
    let src = tempdir().unwrap();
    let root = src.path().join("data");
    create_test_data(&root, 8, 2048).unwrap();
    let engine = Engine::new();
    let opts = CompressOptions {
        parallel: true,
        deterministic: true,
        ..CompressOptions::default()
    };

    let first = src.path().join("one.zip");
    let second = src.path().join("two.zip");
    completed(engine.compress(&[root.clone()], &first, opts.clone()).unwrap().wait());
    completed(engine.compress(&[root], &second, opts).unwrap().wait());
    assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
}

#[test]
fn gzip_holds_a_single_file() {
    let src = tempdir().unwrap();
    let input = src.path().join("notes.txt");
    fs::write(&input, b"gzip me, gzip me, gzip me").unwrap();
    let archive = src.path().join("notes.txt.gz");
    let engine = Engine::new();
    let opts = CompressOptions {
        format: FormatTag::Gz,
        ..CompressOptions::default()
    };
    completed(engine.compress(&[input.clone()], &archive, opts).unwrap().wait());

    let mut magic = [0u8; 2];
    File::open(&archive).unwrap().read_exact(&mut magic).unwrap();
    assert_eq!(magic, [0x1f, 0x8b]);

    let dest = tempdir().unwrap();
    completed(
        engine
            .extract(&archive, dest.path(), ExtractOptions::default())
            .unwrap()
            .wait(),
    );
    assert_eq!(fs::read(dest.path().join("notes.txt")).unwrap(), fs::read(&input).unwrap());
}

#[test]
fn archive_comment_is_listed() {
    let src = tempdir().unwrap();
    let inputs = create_test_data(src.path(), 1, 10).unwrap();
    let archive = src.path().join("c.zip");
    let opts = CompressOptions {
        comment: Some("nightly build".into()),
        ..CompressOptions::default()
    };
    let engine = Engine::new();
    let out = completed(engine.compress(&inputs, &archive, opts).unwrap().wait());
    assert_eq!(out.manifest.unwrap().comment, "nightly build");
    assert_eq!(engine.list(&archive).unwrap().comment, "nightly build");
}

#[test]
fn zip_output_is_readable_by_other_tools() {
    let src = tempdir().unwrap();
    let inputs = create_test_data(src.path(), 3, 3000).unwrap();
    let archive = src.path().join("interop.zip");
    completed(
        Engine::new()
            .compress(&inputs, &archive, CompressOptions::default())
            .unwrap()
            .wait(),
    );

    let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
    assert_eq!(zip.len(), 3);
    for input in &inputs {
        let name = input.file_name().unwrap().to_str().unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(data, fs::read(input).unwrap());
    }
}

#[test]
fn reads_archives_written_by_other_tools() {
    let dir = tempdir().unwrap();
    let archive = dir.path().join("foreign.zip");
    {
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        let deflated = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file("deflated.txt", deflated).unwrap();
        zip.write_all(&b"abc".repeat(1000)).unwrap();
        let stored = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("stored.bin", stored).unwrap();
        zip.write_all(&[7u8; 100]).unwrap();
        zip.finish().unwrap();
    }

    let engine = Engine::new();
    assert_eq!(engine.list(&archive).unwrap().len(), 2);
    let dest = tempdir().unwrap();
    let task = engine
        .extract(&archive, dest.path(), ExtractOptions::default())
        .unwrap();
    assert_eq!(task.wait().state(), TaskState::Completed);
    assert_eq!(fs::read(dest.path().join("deflated.txt")).unwrap(), b"abc".repeat(1000));
    assert_eq!(fs::read(dest.path().join("stored.bin")).unwrap(), vec![7u8; 100]);
}
