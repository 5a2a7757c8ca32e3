//! Landing-zone storage: content hashing, backups, layout and zone state.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod layout;
pub mod state;

pub use layout::{LandingZone, ZoneFileKind, SCRIPT_EXTENSIONS};
pub use state::{
    list_new_and_changed_files, scan_zone, start_develop, update_operational, PublishOptions,
    PublishReport, StartState, WriteLock, ZoneError, START_STATE_FILE, WRITE_LOCK_FILE,
};

pub const CRATE_NAME: &str = "dp-storage";

/// Suffix instruments use while a file is still being written.
pub const INWRITE_SUFFIX: &str = ".inwrite";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Relative path rendered with `/` separators, the key format of zone listings.
pub fn rel_key(rel_path: &Path) -> String {
    rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write bytes through a temp file and an atomic rename.
pub async fn write_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredBackup {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub broken: bool,
}

/// Timestamped copies of every file the dispatcher handled.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backup_relative_path(
        &self,
        rel_path: &Path,
        stamped_at: DateTime<Local>,
        broken: bool,
        collision: usize,
    ) -> PathBuf {
        let file_name = rel_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stamp = stamped_at.format("%Y%m%d-%H%M%S-%6f");
        let mut name = format!("{file_name}.{stamp}");
        if collision > 0 {
            name.push_str(&format!("-{collision}"));
        }
        if broken {
            name.push_str("-broken");
        }
        match rel_path.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Copy `zone_root/rel_path` into the backup tree under a timestamped name.
    pub async fn store(
        &self,
        zone_root: &Path,
        rel_path: &Path,
        broken: bool,
        stamped_at: DateTime<Local>,
    ) -> anyhow::Result<StoredBackup> {
        let source = zone_root.join(rel_path);
        let bytes = fs::read(&source)
            .await
            .with_context(|| format!("reading {} for backup", source.display()))?;

        let mut collision = 0usize;
        loop {
            let relative_path = self.backup_relative_path(rel_path, stamped_at, broken, collision);
            let absolute_path = self.root.join(&relative_path);
            if fs::try_exists(&absolute_path)
                .await
                .with_context(|| format!("checking backup path {}", absolute_path.display()))?
            {
                collision += 1;
                continue;
            }
            write_atomic(&absolute_path, &bytes).await?;
            return Ok(StoredBackup {
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                broken,
            });
        }
    }
}
