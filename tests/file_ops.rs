use anyhow::Result;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use cdoc::config::Config;
use cdoc::file_ops::ContainerFileOps;
use cdoc::{LabelSecrets, LockType, NoSecrets, Recipient};

fn test_config() -> Config {
    Config {
        kdf_iterations: 1_000,
        ..Config::default()
    }
}

/// Helper to create a temp dir holding a few plaintext files
fn setup_inputs(tmp: &TempDir) -> Result<Vec<std::path::PathBuf>> {
    let inputs = vec![
        tmp.path().join("notes.txt"),
        tmp.path().join("empty.bin"),
        tmp.path().join("large.bin"),
    ];
    fs::write(&inputs[0], b"meeting at noon")?;
    fs::write(&inputs[1], b"")?;
    fs::write(&inputs[2], vec![0xA5u8; 300_000])?;
    Ok(inputs)
}

#[tokio::test]
async fn test_encrypt_then_decrypt_directory() -> Result<()> {
    let tmp = TempDir::new()?;
    let inputs = setup_inputs(&tmp)?;
    let container = tmp.path().join("bundle.cdoc");

    let writer = ContainerFileOps::new(test_config(), Arc::new(NoSecrets));
    let size = writer
        .encrypt_files(&container, vec![Recipient::password("me", "pw")], &inputs)
        .await?;
    assert_eq!(size, fs::metadata(&container)?.len());

    let reader = ContainerFileOps::new(test_config(), Arc::new(LabelSecrets::new().with("me", "pw")));
    let out_dir = tmp.path().join("out");
    let written = reader.decrypt_to_dir(&container, 0, &out_dir).await?;
    assert_eq!(written.len(), 3);

    for input in &inputs {
        let restored = out_dir.join(input.file_name().unwrap());
        assert_eq!(fs::read(&restored)?, fs::read(input)?);
    }
    Ok(())
}

#[tokio::test]
async fn test_list_locks_without_secrets() -> Result<()> {
    let tmp = TempDir::new()?;
    let inputs = setup_inputs(&tmp)?;
    let container = tmp.path().join("locks.cdoc");

    let ops = ContainerFileOps::new(test_config(), Arc::new(NoSecrets));
    ops.encrypt_files(
        &container,
        vec![
            Recipient::password("alice", "a"),
            Recipient::symmetric_key("bob", vec![9u8; 32]),
        ],
        &inputs[..1],
    )
    .await?;

    let locks = ops.list_locks(&container).await?;
    assert_eq!(locks.len(), 2);
    assert_eq!(locks[0].0.label, "alice");
    assert_eq!(locks[0].0.lock_type, LockType::Password);
    assert_eq!(locks[0].1, "password (PBKDF2, 1000 iterations)");
    assert_eq!(locks[1].0.index, 1);
    assert_eq!(locks[1].1, "symmetric_key");
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_leaves_no_output() -> Result<()> {
    let tmp = TempDir::new()?;
    let inputs = setup_inputs(&tmp)?;
    let container = tmp.path().join("guarded.cdoc");

    let ops = ContainerFileOps::new(test_config(), Arc::new(NoSecrets));
    ops.encrypt_files(&container, vec![Recipient::password("me", "right")], &inputs)
        .await?;

    let reader = ContainerFileOps::new(test_config(), Arc::new(LabelSecrets::new().with("me", "wrong")));
    let out_dir = tmp.path().join("out");
    let result = reader.decrypt_to_dir(&container, 0, &out_dir).await;
    assert!(result.is_err());
    assert_eq!(fs::read_dir(&out_dir)?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_encryption_does_not_create_container() -> Result<()> {
    let tmp = TempDir::new()?;
    let inputs = setup_inputs(&tmp)?;
    let container = tmp.path().join("never.cdoc");

    let ops = ContainerFileOps::new(test_config(), Arc::new(NoSecrets));
    let result = ops.encrypt_files(&container, Vec::new(), &inputs).await;
    assert!(result.is_err());
    assert!(!container.exists());

    let missing = vec![tmp.path().join("does-not-exist.txt")];
    assert!(ops
        .encrypt_files(&container, vec![Recipient::password("me", "pw")], &missing)
        .await
        .is_err());
    assert!(!container.exists());
    Ok(())
}

#[tokio::test]
async fn test_not_a_container_is_rejected() -> Result<()> {
    let tmp = TempDir::new()?;
    let bogus = tmp.path().join("bogus.cdoc");
    fs::write(&bogus, b"definitely not a container")?;

    let ops = ContainerFileOps::new(test_config(), Arc::new(NoSecrets));
    let err = ops.list_locks(&bogus).await.unwrap_err();
    assert!(err.to_string().contains("Parse error"));
    Ok(())
}
