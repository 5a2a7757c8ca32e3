//! Start-state manifests, the write lock, checkout and publish between zones.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::layout::ZoneFileKind;
use crate::{hash_file, rel_key, INWRITE_SUFFIX};

pub const START_STATE_FILE: &str = ".start_state";
pub const WRITE_LOCK_FILE: &str = ".write_lock";

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("{0} has no start state file; it is not a development zone")]
    NoStartState(PathBuf),
    #[error("write lock {0} exists; another update is in progress")]
    Locked(PathBuf),
    #[error("development zone diverged; missing in operational zone: {}", .missing.join(", "))]
    Diverged { missing: Vec<String> },
    #[error("new files already exist in operational zone (use force to overwrite): {}", .existing.join(", "))]
    AlreadyExists { existing: Vec<String> },
    #[error("development zone {0} already exists and is not empty")]
    DevelopmentExists(PathBuf),
}

/// Hash manifest of a zone's baseline contents, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartState {
    pub files: BTreeMap<String, String>,
}

impl StartState {
    pub fn path_in(zone_root: &Path) -> PathBuf {
        zone_root.join(START_STATE_FILE)
    }

    pub fn exists_in(zone_root: &Path) -> bool {
        Self::path_in(zone_root).is_file()
    }

    pub fn read(zone_root: &Path) -> anyhow::Result<Self> {
        let path = Self::path_in(zone_root);
        if !path.is_file() {
            return Err(ZoneError::NoStartState(zone_root.to_path_buf()).into());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Persist the manifest and leave it read-only.
    pub fn write(&self, zone_root: &Path) -> anyhow::Result<()> {
        let path = Self::path_in(zone_root);
        if path.exists() {
            set_readonly(&path, false)?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing start state")?;
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        set_readonly(&path, true)
    }
}

fn set_readonly(path: &Path, readonly: bool) -> anyhow::Result<()> {
    let mut permissions = std::fs::metadata(path)
        .with_context(|| format!("reading permissions of {}", path.display()))?
        .permissions();
    permissions.set_readonly(readonly);
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("setting permissions of {}", path.display()))
}

fn is_zone_content(rel: &Path) -> bool {
    let hidden = rel
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    let inwrite = rel.to_string_lossy().ends_with(INWRITE_SUFFIX);
    !hidden && !inwrite
}

/// Hash every regular file of a zone, skipping hidden and in-write files.
pub fn scan_zone(zone_root: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(zone_root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", zone_root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(zone_root) else {
            continue;
        };
        if !is_zone_content(rel) {
            continue;
        }
        let hash = hash_file(entry.path())
            .with_context(|| format!("hashing {}", entry.path().display()))?;
        files.insert(rel_key(rel), hash);
    }
    Ok(files)
}

/// Files of a development zone that are absent from, or differ from, its start state.
pub fn list_new_and_changed_files(development: &Path) -> anyhow::Result<Vec<String>> {
    let start_state = StartState::read(development)?;
    let current = scan_zone(development)?;
    Ok(current
        .into_iter()
        .filter(|(rel, hash)| start_state.files.get(rel) != Some(hash))
        .map(|(rel, _)| rel)
        .collect())
}

/// Exclusive sentinel guarding publish operations; removed on drop.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
}

impl WriteLock {
    pub fn acquire(zone_root: &Path) -> anyhow::Result<Self> {
        let path = zone_root.join(WRITE_LOCK_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Self { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ZoneError::Locked(path).into())
            }
            Err(err) => Err(err).with_context(|| format!("creating {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove write lock");
        }
    }
}

/// Clone the operational zone into a fresh development zone and record its start state.
pub fn start_develop(operational: &Path, development: &Path) -> anyhow::Result<StartState> {
    if development.exists()
        && std::fs::read_dir(development)
            .with_context(|| format!("reading {}", development.display()))?
            .next()
            .is_some()
    {
        return Err(ZoneError::DevelopmentExists(development.to_path_buf()).into());
    }
    std::fs::create_dir_all(development)
        .with_context(|| format!("creating {}", development.display()))?;

    let mut state = StartState::default();
    for (rel, hash) in scan_zone(operational)? {
        if ZoneFileKind::classify(Path::new(&rel)).is_raw() {
            continue;
        }
        let target = development.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::copy(operational.join(&rel), &target)
            .with_context(|| format!("copying {rel} into development zone"))?;
        state.files.insert(rel, hash);
    }
    state.write(development)?;
    info!(
        operational = %operational.display(),
        development = %development.display(),
        files = state.files.len(),
        "development zone checked out"
    );
    Ok(state)
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub force: bool,
    pub copy_raw_files: bool,
    pub copy_delay: Duration,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            force: false,
            copy_raw_files: false,
            copy_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub copied: Vec<String>,
    pub skipped_raw: Vec<String>,
}

/// Order files so the operational observer sees dependencies first.
fn publish_order(mut files: Vec<String>) -> Vec<String> {
    files.sort_by(|a, b| {
        let ka = ZoneFileKind::classify(Path::new(a));
        let kb = ZoneFileKind::classify(Path::new(b));
        let ext_a = Path::new(a).extension().map(|e| e.to_os_string());
        let ext_b = Path::new(b).extension().map(|e| e.to_os_string());
        ka.publish_rank()
            .cmp(&kb.publish_rank())
            .then_with(|| {
                if ka.is_script() && kb.is_script() {
                    ext_a.cmp(&ext_b)
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .then_with(|| a.cmp(b))
    });
    files
}

/// Publish new and changed files of a development zone into the operational zone.
pub async fn update_operational(
    development: &Path,
    operational: &Path,
    options: &PublishOptions,
) -> anyhow::Result<PublishReport> {
    let mut start_state = StartState::read(development)?;
    let lock = WriteLock::acquire(operational)?;

    let missing = start_state
        .files
        .keys()
        .filter(|rel| !operational.join(rel.as_str()).is_file())
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(ZoneError::Diverged { missing }.into());
    }

    let current = scan_zone(development)?;
    let changed = current
        .iter()
        .filter(|(rel, hash)| start_state.files.get(*rel) != Some(*hash))
        .map(|(rel, _)| rel.clone())
        .collect::<Vec<_>>();

    if !options.force {
        let existing = changed
            .iter()
            .filter(|rel| !start_state.files.contains_key(*rel))
            .filter(|rel| operational.join(rel.as_str()).exists())
            .cloned()
            .collect::<Vec<_>>();
        if !existing.is_empty() {
            return Err(ZoneError::AlreadyExists { existing }.into());
        }
    }

    let mut report = PublishReport::default();
    for rel in publish_order(changed) {
        if ZoneFileKind::classify(Path::new(&rel)).is_raw() && !options.copy_raw_files {
            report.skipped_raw.push(rel);
            continue;
        }
        copy_into_zone(&development.join(&rel), &operational.join(&rel)).await?;
        info!(file = %rel, "published");
        if let Some(hash) = current.get(&rel) {
            start_state.files.insert(rel.clone(), hash.clone());
        }
        report.copied.push(rel);
        if !options.copy_delay.is_zero() {
            tokio::time::sleep(options.copy_delay).await;
        }
    }

    start_state.write(development)?;
    drop(lock);
    Ok(report)
}

/// Copy under an in-write name and rename so watchers see a single arrival.
async fn copy_into_zone(source: &Path, target: &Path) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut staging = target.as_os_str().to_owned();
    staging.push(INWRITE_SUFFIX);
    let staging = PathBuf::from(staging);
    fs::copy(source, &staging)
        .await
        .with_context(|| format!("copying {} -> {}", source.display(), staging.display()))?;
    fs::rename(&staging, target)
        .await
        .with_context(|| format!("renaming {} -> {}", staging.display(), target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, content).expect("write");
    }

    fn no_delay() -> PublishOptions {
        PublishOptions {
            copy_delay: Duration::ZERO,
            ..PublishOptions::default()
        }
    }

    fn operational_fixture(root: &Path) {
        write(root, "data/parameters.yaml", "- {name: temp, unit: C}\n");
        write(root, "data/acme/source_type.yaml", "name: acme\n");
        write(root, "data/acme/sensor-1/source.yaml", "name: sensor-1\n");
        write(root, "data/acme/sensor-1/conversion.py", "def convert(i, o): pass\n");
        write(root, "data/acme/sensor-1/raw_data/data-1.raw", "h\n1\n");
    }

    #[test]
    fn checkout_records_hashes_and_skips_raw_files() {
        let op = tempdir().expect("op");
        let dev = tempdir().expect("dev");
        operational_fixture(op.path());
        let dev_root = dev.path().join("develop");

        let state = start_develop(op.path(), &dev_root).expect("checkout");
        assert_eq!(state.files.len(), 4);
        assert!(!dev_root.join("data/acme/sensor-1/raw_data/data-1.raw").exists());
        for (rel, hash) in &state.files {
            assert_eq!(&hash_file(&dev_root.join(rel)).expect("hash"), hash);
        }
        assert!(StartState::path_in(&dev_root)
            .metadata()
            .expect("meta")
            .permissions()
            .readonly());
        assert!(list_new_and_changed_files(&dev_root).expect("diff").is_empty());
    }

    #[tokio::test]
    async fn noop_publish_copies_nothing() {
        let op = tempdir().expect("op");
        let dev = tempdir().expect("dev");
        operational_fixture(op.path());
        let dev_root = dev.path().join("develop");
        start_develop(op.path(), &dev_root).expect("checkout");

        let report = update_operational(&dev_root, op.path(), &no_delay())
            .await
            .expect("publish");
        assert!(report.copied.is_empty());
        assert!(!op.path().join(WRITE_LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn publish_copies_in_dependency_order_and_rebases_start_state() {
        let op = tempdir().expect("op");
        let dev = tempdir().expect("dev");
        operational_fixture(op.path());
        let dev_root = dev.path().join("develop");
        start_develop(op.path(), &dev_root).expect("checkout");

        write(&dev_root, "data/acme/sensor-2/raw_data/data-9.raw", "h\n");
        write(&dev_root, "data/acme/sensor-2/conversion.r", "convert <- 1\n");
        write(&dev_root, "data/acme/sensor-2/source.yaml", "name: sensor-2\n");
        write(&dev_root, "data/parameters.yaml", "- {name: temp, unit: K}\n");
        write(&dev_root, "sites/roof/site.yaml", "name: roof\n");

        let report = update_operational(&dev_root, op.path(), &no_delay())
            .await
            .expect("publish");
        assert_eq!(
            report.copied,
            vec![
                "sites/roof/site.yaml",
                "data/parameters.yaml",
                "data/acme/sensor-2/source.yaml",
                "data/acme/sensor-2/conversion.r",
            ]
        );
        assert_eq!(report.skipped_raw, vec!["data/acme/sensor-2/raw_data/data-9.raw"]);
        assert_eq!(
            std::fs::read_to_string(op.path().join("data/parameters.yaml")).expect("read"),
            "- {name: temp, unit: K}\n"
        );
        let remaining = list_new_and_changed_files(&dev_root).expect("diff");
        assert_eq!(remaining, vec!["data/acme/sensor-2/raw_data/data-9.raw"]);
    }

    #[tokio::test]
    async fn diverged_zone_is_refused_naming_missing_file() {
        let op = tempdir().expect("op");
        let dev = tempdir().expect("dev");
        operational_fixture(op.path());
        let dev_root = dev.path().join("develop");
        start_develop(op.path(), &dev_root).expect("checkout");
        write(&dev_root, "data/acme/sensor-3/source.yaml", "name: sensor-3\n");
        std::fs::remove_file(op.path().join("data/acme/source_type.yaml")).expect("rm");

        let err = update_operational(&dev_root, op.path(), &no_delay())
            .await
            .expect_err("diverged");
        let zone_err = err.downcast_ref::<ZoneError>().expect("zone error");
        assert!(matches!(zone_err, ZoneError::Diverged { .. }));
        assert!(err.to_string().contains("data/acme/source_type.yaml"));
        assert!(!op.path().join("data/acme/sensor-3/source.yaml").exists());
    }

    #[tokio::test]
    async fn existing_lock_aborts_publish() {
        let op = tempdir().expect("op");
        let dev = tempdir().expect("dev");
        operational_fixture(op.path());
        let dev_root = dev.path().join("develop");
        start_develop(op.path(), &dev_root).expect("checkout");
        let _held = WriteLock::acquire(op.path()).expect("lock");

        let err = update_operational(&dev_root, op.path(), &no_delay())
            .await
            .expect_err("locked");
        assert!(matches!(
            err.downcast_ref::<ZoneError>(),
            Some(ZoneError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn new_file_already_in_operational_needs_force() {
        let op = tempdir().expect("op");
        let dev = tempdir().expect("dev");
        operational_fixture(op.path());
        let dev_root = dev.path().join("develop");
        start_develop(op.path(), &dev_root).expect("checkout");
        write(&dev_root, "sites/roof/site.yaml", "name: roof\n");
        write(op.path(), "sites/roof/site.yaml", "name: roof-old\n");

        let err = update_operational(&dev_root, op.path(), &no_delay())
            .await
            .expect_err("exists");
        assert!(matches!(
            err.downcast_ref::<ZoneError>(),
            Some(ZoneError::AlreadyExists { .. })
        ));

        let forced = PublishOptions {
            force: true,
            ..no_delay()
        };
        let report = update_operational(&dev_root, op.path(), &forced)
            .await
            .expect("forced publish");
        assert_eq!(report.copied, vec!["sites/roof/site.yaml"]);
    }
}
