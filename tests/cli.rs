use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_create_list_extract_cycle() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Setup: Create a temporary directory and some test files
    let source_dir = tempdir()?;
    let file1_path = source_dir.path().join("file1.txt");
    let file2_path = source_dir.path().join("file2.log");
    let nested_dir = source_dir.path().join("nested");
    fs::create_dir(&nested_dir)?;
    let nested_file_path = nested_dir.join("nested_file.dat");

    let mut file1 = fs::File::create(&file1_path)?;
    writeln!(file1, "Hello, this is the first file.")?;
    let mut file2 = fs::File::create(&file2_path)?;
    writeln!(file2, "Some log data here.")?;
    let mut nested_file = fs::File::create(&nested_file_path)?;
    nested_file.write_all(&[0, 1, 2, 3, 4, 5])?;

    let archive_dir = tempdir()?;
    let archive_path = archive_dir.path().join("test_archive.zip");

    // 2. Create archive from the directory contents
    let mut cmd = Command::cargo_bin("zipmaster")?;
    cmd.arg("create")
        .arg("--output")
        .arg(&archive_path)
        .arg("--level")
        .arg("9")
        .arg(&file1_path)
        .arg(&file2_path)
        .arg(&nested_dir);
    cmd.assert().success();
    assert!(archive_path.exists());

    // 3. List contents of the archive
    let mut cmd = Command::cargo_bin("zipmaster")?;
    cmd.arg("list").arg(&archive_path);
    cmd.assert().success().stdout(
        predicate::str::contains("file1.txt")
            .and(predicate::str::contains("file2.log"))
            .and(predicate::str::contains("nested/nested_file.dat"))
            .and(predicate::str::contains("3 entries, 57 bytes")),
    );

    // 4. Verify, then extract to a new directory
    let mut cmd = Command::cargo_bin("zipmaster")?;
    cmd.arg("verify").arg(&archive_path);
    cmd.assert().success().stdout(predicate::str::contains("OK"));

    let extract_dir = tempdir()?;
    let mut cmd = Command::cargo_bin("zipmaster")?;
    cmd.arg("extract").arg(&archive_path).arg("-o").arg(extract_dir.path());
    cmd.assert().success();

    // 5. Verify extracted files
    assert_eq!(fs::read(extract_dir.path().join("file1.txt"))?, fs::read(&file1_path)?);
    assert_eq!(fs::read(extract_dir.path().join("file2.log"))?, fs::read(&file2_path)?);
    assert_eq!(
        fs::read(extract_dir.path().join("nested/nested_file.dat"))?,
        fs::read(&nested_file_path)?
    );
    Ok(())
}

#[test]
fn test_cli_password_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("secret.txt");
    fs::write(&input, "top secret")?;
    let archive = dir.path().join("secret.zip");

    Command::cargo_bin("zipmaster")?
        .env("ZIPMASTER_PASSWORD", "hunter22")
        .arg("create")
        .arg("-o")
        .arg(&archive)
        .arg(&input)
        .assert()
        .success();

    let out = tempdir()?;
    Command::cargo_bin("zipmaster")?
        .env_remove("ZIPMASTER_PASSWORD")
        .arg("extract")
        .arg(&archive)
        .arg("-o")
        .arg(out.path())
        .arg("--password")
        .arg("wrong")
        .assert()
        .failure()
        .stderr(predicate::str::contains("authentication"));
    assert!(!out.path().join("secret.txt").exists());

    Command::cargo_bin("zipmaster")?
        .env("ZIPMASTER_PASSWORD", "hunter22")
        .arg("extract")
        .arg(&archive)
        .arg("-o")
        .arg(out.path())
        .assert()
        .success();
    assert_eq!(fs::read_to_string(out.path().join("secret.txt"))?, "top secret");
    Ok(())
}

#[test]
fn test_cli_split_and_join() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let blob = dir.path().join("blob.bin");
    fs::write(&blob, vec![42u8; 2500])?;

    Command::cargo_bin("zipmaster")?
        .arg("split")
        .arg(&blob)
        .arg("--bytes")
        .arg("1000")
        .assert()
        .success();
    for part in ["blob.bin.001", "blob.bin.002", "blob.bin.003"] {
        assert!(dir.path().join(part).exists(), "{part}");
    }

    let joined = dir.path().join("joined.bin");
    Command::cargo_bin("zipmaster")?
        .arg("join")
        .arg(dir.path().join("blob.bin.vol.json"))
        .arg("-o")
        .arg(&joined)
        .assert()
        .success();
    assert_eq!(fs::read(&joined)?, fs::read(&blob)?);

    fs::remove_file(dir.path().join("blob.bin.002"))?;
    Command::cargo_bin("zipmaster")?
        .arg("join")
        .arg(dir.path().join("blob.bin.vol.json"))
        .arg("-o")
        .arg(dir.path().join("again.bin"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("volume 2 is missing"));
    Ok(())
}

#[test]
fn test_cli_rejects_bad_level() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("a.txt");
    fs::write(&input, "a")?;
    Command::cargo_bin("zipmaster")?
        .arg("create")
        .arg("-o")
        .arg(dir.path().join("a.zip"))
        .arg("--level")
        .arg("12")
        .arg(&input)
        .assert()
        .failure();
    Ok(())
}

#[test]
fn test_cli_rejects_overflowing_volume_size() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("a.txt");
    fs::write(&input, "a")?;
    Command::cargo_bin("zipmaster")?
        .arg("create")
        .arg("-o")
        .arg(dir.path().join("a.zip"))
        .arg("--volume-size")
        .arg(u64::MAX.to_string())
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("too large"));
    assert!(!dir.path().join("a.zip").exists());

    Command::cargo_bin("zipmaster")?
        .arg("split")
        .arg(&input)
        .arg("--size")
        .arg((1u64 << 50).to_string())
        .assert()
        .failure()
        .stderr(predicate::str::contains("too large"));
    Ok(())
}
