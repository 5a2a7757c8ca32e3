//! Watches the landing zone and turns filesystem notifications into `FileEvent`s.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use dp_core::{FileEvent, FileEventKind};
use dp_storage::{hash_file, LandingZone, ZoneFileKind, INWRITE_SUFFIX, WRITE_LOCK_FILE};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::queue::EventSender;

/// inotify reports close-after-write, so a created file is reported once complete.
const WAITS_FOR_CLOSE: bool = cfg!(target_os = "linux");

/// inotify reports one move as `From`, `To` and `Both`, all carrying the same cookie.
const PAIRS_RENAMES: bool = cfg!(target_os = "linux");

/// Sources of unfinished moves kept before the table is reset.
const PENDING_RENAMES: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Translation of raw notifications; shared between watcher callbacks.
pub struct EventFilter {
    zone: LandingZone,
    hashes: Mutex<HashMap<PathBuf, String>>,
    pending_creates: Mutex<HashSet<PathBuf>>,
    renames: Mutex<HashMap<usize, MoveSource>>,
}

/// Source of a move whose `To` half has not arrived yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveSource {
    Inwrite,
    /// Already reported as illegal.
    Visible,
    Hidden,
}

impl EventFilter {
    pub fn new(zone: LandingZone) -> Self {
        Self {
            zone,
            hashes: Mutex::new(HashMap::new()),
            pending_creates: Mutex::new(HashSet::new()),
            renames: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(rel)` for paths the dispatcher may see, `None` for ignored ones.
    fn relevant(&self, path: &Path) -> Option<PathBuf> {
        let rel = self.zone.relative(path)?;
        let name = file_name(&rel);
        if name == WRITE_LOCK_FILE {
            return None;
        }
        if name.ends_with(INWRITE_SUFFIX) {
            return None;
        }
        if rel
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            return None;
        }
        Some(rel)
    }

    fn log_write_lock(&self, event: &Event) {
        let touches_lock = event
            .paths
            .iter()
            .any(|p| file_name(p) == WRITE_LOCK_FILE && self.zone.relative(p).is_some());
        if !touches_lock {
            return;
        }
        match event.kind {
            EventKind::Create(_) => info!("write lock created, publish in progress"),
            EventKind::Remove(_) => info!("write lock removed, publish finished"),
            _ => {}
        }
    }

    /// Emit the event only if the content hash changed since the last one.
    fn changed(&self, kind: FileEventKind, rel: PathBuf) -> Option<FileEvent> {
        let absolute = self.zone.absolute(&rel);
        if absolute.is_dir() {
            return None;
        }
        let digest = match hash_file(&absolute) {
            Ok(digest) => digest,
            Err(err) => {
                debug!(path = %rel.display(), %err, "file vanished before hashing");
                return None;
            }
        };
        let mut hashes = lock(&self.hashes);
        if hashes.get(&rel) == Some(&digest) {
            debug!(path = %rel.display(), "content unchanged, event suppressed");
            return None;
        }
        hashes.insert(rel.clone(), digest);
        Some(FileEvent {
            kind,
            rel_path: rel,
            detected_at: Utc::now(),
        })
    }

    fn forget(&self, rel: &Path) {
        lock(&self.hashes).remove(rel);
        lock(&self.pending_creates).remove(rel);
    }

    fn illegal(&self, rel: PathBuf) -> FileEvent {
        self.forget(&rel);
        FileEvent {
            kind: FileEventKind::Illegal,
            rel_path: rel,
            detected_at: Utc::now(),
        }
    }

    /// Record the hash of a file enqueued without a notification.
    pub fn remember(&self, rel: &Path) {
        if let Ok(digest) = hash_file(&self.zone.absolute(rel)) {
            lock(&self.hashes).insert(rel.to_path_buf(), digest);
        }
    }

    pub fn translate(&self, event: &Event) -> Vec<FileEvent> {
        self.log_write_lock(event);
        let mut out = Vec::new();
        match event.kind {
            EventKind::Create(CreateKind::Folder) => {}
            EventKind::Create(_) => {
                for rel in event.paths.iter().filter_map(|p| self.relevant(p)) {
                    if WAITS_FOR_CLOSE {
                        lock(&self.pending_creates).insert(rel);
                    } else {
                        out.extend(self.changed(FileEventKind::Created, rel));
                    }
                }
            }
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for rel in event.paths.iter().filter_map(|p| self.relevant(p)) {
                    let created = lock(&self.pending_creates).remove(&rel);
                    let kind = if created {
                        FileEventKind::Created
                    } else {
                        FileEventKind::Modified
                    };
                    out.extend(self.changed(kind, rel));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => {
                out.extend(self.renamed(mode, &event.paths, event.tracker()))
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                if !WAITS_FOR_CLOSE {
                    for rel in event.paths.iter().filter_map(|p| self.relevant(p)) {
                        out.extend(self.changed(FileEventKind::Modified, rel));
                    }
                }
            }
            EventKind::Remove(RemoveKind::Folder) => {}
            EventKind::Remove(_) => {
                for rel in event.paths.iter().filter_map(|p| self.relevant(p)) {
                    if ZoneFileKind::classify(&rel).is_raw() {
                        // Raw files are consumed by the dispatcher itself.
                        debug!(path = %rel.display(), "raw file removed");
                        self.forget(&rel);
                    } else {
                        out.push(self.illegal(rel));
                    }
                }
            }
            _ => {}
        }
        out
    }

    fn renamed(&self, mode: RenameMode, paths: &[PathBuf], tracker: Option<usize>) -> Vec<FileEvent> {
        if PAIRS_RENAMES {
            if let Some(cookie) = tracker {
                return self.paired_rename(mode, paths, cookie);
            }
        }
        let from_inwrite = |p: &Path| file_name(p).ends_with(INWRITE_SUFFIX);
        match (mode, paths) {
            (RenameMode::Both, [from, to]) => {
                let mut out = Vec::new();
                if from_inwrite(from) || self.zone.relative(from).is_none() {
                    if let Some(rel) = self.relevant(to) {
                        out.extend(self.changed(FileEventKind::Created, rel));
                    }
                } else if let Some(rel) = self.relevant(from) {
                    out.push(self.illegal(rel));
                }
                out
            }
            (RenameMode::From, [from]) => match self.relevant(from) {
                Some(rel) => vec![self.illegal(rel)],
                None => Vec::new(),
            },
            (RenameMode::To, [to]) => self
                .relevant(to)
                .and_then(|rel| self.changed(FileEventKind::Created, rel))
                .into_iter()
                .collect(),
            _ => paths
                .iter()
                .filter_map(|p| self.relevant(p))
                .filter_map(|rel| {
                    if self.zone.absolute(&rel).exists() {
                        self.changed(FileEventKind::Created, rel)
                    } else {
                        Some(self.illegal(rel))
                    }
                })
                .collect(),
        }
    }

    /// A move out of a visible path is illegal on its `From` half; its `To` half
    /// is a new file only when the source was `*.inwrite` or outside the zone.
    fn paired_rename(&self, mode: RenameMode, paths: &[PathBuf], cookie: usize) -> Vec<FileEvent> {
        match (mode, paths) {
            (RenameMode::From, [from]) => {
                let visible = self.relevant(from);
                let source = match &visible {
                    Some(_) => MoveSource::Visible,
                    None if file_name(from).ends_with(INWRITE_SUFFIX) => MoveSource::Inwrite,
                    None => MoveSource::Hidden,
                };
                {
                    let mut renames = lock(&self.renames);
                    if renames.len() >= PENDING_RENAMES {
                        renames.clear();
                    }
                    renames.insert(cookie, source);
                }
                visible.map(|rel| self.illegal(rel)).into_iter().collect()
            }
            (RenameMode::To, [to]) => {
                let source = lock(&self.renames).remove(&cookie);
                let Some(rel) = self.relevant(to) else {
                    return Vec::new();
                };
                match source {
                    Some(MoveSource::Inwrite) | None => {
                        self.changed(FileEventKind::Created, rel).into_iter().collect()
                    }
                    Some(MoveSource::Visible) => {
                        debug!(path = %rel.display(), "destination of an illegal move, not dispatched");
                        Vec::new()
                    }
                    Some(MoveSource::Hidden) => vec![self.illegal(rel)],
                }
            }
            _ => Vec::new(),
        }
    }
}

/// Keeps the watcher alive; dropping it stops observation.
pub struct ZoneObserver {
    watcher: RecommendedWatcher,
    filter: Arc<EventFilter>,
    root: PathBuf,
}

impl ZoneObserver {
    pub fn start(zone: LandingZone, sender: EventSender) -> Result<Self> {
        let root = zone.root().to_path_buf();
        let filter = Arc::new(EventFilter::new(zone));
        let callback_filter = Arc::clone(&filter);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for file_event in callback_filter.translate(&event) {
                        debug!(kind = %file_event.kind, path = %file_event.rel_path.display(), "enqueue");
                        sender.push_blocking(file_event);
                    }
                }
                Err(err) => warn!(%err, "watch error"),
            },
            Config::default(),
        )
        .context("creating filesystem watcher")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", root.display()))?;
        info!(root = %root.display(), "observing landing zone");
        Ok(Self {
            watcher,
            filter,
            root,
        })
    }

    pub fn filter(&self) -> Arc<EventFilter> {
        Arc::clone(&self.filter)
    }

    pub fn stop(mut self) {
        if let Err(err) = self.watcher.unwatch(&self.root) {
            debug!(%err, "unwatch failed");
        }
        info!(root = %self.root.display(), "observer stopped");
    }
}

/// Digits embedded in a file name, e.g. `20200101` for `data-20200101.raw`.
fn embedded_timestamp(rel: &Path) -> String {
    file_name(rel).chars().filter(char::is_ascii_digit).collect()
}

/// Existing raw files, oldest embedded timestamp first.
pub fn bootstrap_files(zone: &LandingZone) -> Vec<PathBuf> {
    let mut raws: Vec<PathBuf> = WalkDir::new(zone.root())
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| zone.relative(entry.path()))
        .filter(|rel| ZoneFileKind::classify(rel).is_raw())
        .filter(|rel| {
            !rel.components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        })
        .collect();
    raws.sort_by(|a, b| {
        let (ta, tb) = (embedded_timestamp(a), embedded_timestamp(b));
        ta.len().cmp(&tb.len()).then(ta.cmp(&tb)).then(a.cmp(b))
    });
    raws
}

/// Enqueue a synthetic `created` event for every raw file already in the zone.
pub async fn bootstrap(zone: &LandingZone, filter: &EventFilter, sender: &EventSender) -> usize {
    let files = bootstrap_files(zone);
    let count = files.len();
    for rel in files {
        filter.remember(&rel);
        sender
            .push(FileEvent {
                kind: FileEventKind::Created,
                rel_path: rel,
                detected_at: Utc::now(),
            })
            .await;
    }
    if count > 0 {
        info!(count, "bootstrap enqueued existing raw files");
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, text: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, text).expect("write");
        path
    }

    fn created(path: &Path) -> Event {
        if WAITS_FOR_CLOSE {
            Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path.to_path_buf())
        } else {
            Event::new(EventKind::Create(CreateKind::File)).add_path(path.to_path_buf())
        }
    }

    /// The notifications the platform backend sends for one move.
    fn moved(from: &Path, to: &Path, cookie: usize) -> Vec<Event> {
        let name = |mode| Event::new(EventKind::Modify(ModifyKind::Name(mode)));
        if PAIRS_RENAMES {
            vec![
                name(RenameMode::From).add_path(from.to_path_buf()).set_tracker(cookie),
                name(RenameMode::To).add_path(to.to_path_buf()).set_tracker(cookie),
                name(RenameMode::Both)
                    .add_path(from.to_path_buf())
                    .add_path(to.to_path_buf())
                    .set_tracker(cookie),
            ]
        } else {
            vec![name(RenameMode::Both)
                .add_path(from.to_path_buf())
                .add_path(to.to_path_buf())]
        }
    }

    fn translate_all(filter: &EventFilter, events: &[Event]) -> Vec<FileEvent> {
        events.iter().flat_map(|e| filter.translate(e)).collect()
    }

    /// Run `action` against a live observer and collect what it enqueues.
    #[cfg(target_os = "linux")]
    async fn observe(root: &Path, action: impl FnOnce()) -> Vec<(FileEventKind, PathBuf)> {
        use std::time::Duration;

        use prometheus::IntGauge;

        use crate::queue::event_queue;

        let gauge = IntGauge::new("observer_test_depth", "test").expect("gauge");
        let (tx, mut rx) = event_queue(64, gauge);
        let observer = ZoneObserver::start(LandingZone::new(root), tx).expect("observer");
        action();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            seen.push((event.kind, event.rel_path));
        }
        observer.stop();
        seen
    }

    #[test]
    fn unchanged_content_is_reported_once() {
        let dir = tempdir().expect("tempdir");
        let filter = EventFilter::new(LandingZone::new(dir.path()));
        let path = write(dir.path(), "data/a/raw_data/data-1.raw", "h\n1\n");

        if WAITS_FOR_CLOSE {
            let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
            assert!(filter.translate(&create).is_empty());
        }
        let first = filter.translate(&created(&path));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, FileEventKind::Created);
        assert_eq!(first[0].rel_path, PathBuf::from("data/a/raw_data/data-1.raw"));
        assert!(filter.translate(&created(&path)).is_empty());

        std::fs::write(&path, "h\n2\n").expect("rewrite");
        let again = filter.translate(&created(&path));
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].kind, FileEventKind::Modified);
    }

    #[test]
    fn hidden_and_inwrite_files_are_ignored() {
        let dir = tempdir().expect("tempdir");
        let filter = EventFilter::new(LandingZone::new(dir.path()));
        let hidden = write(dir.path(), "data/.cache", "x");
        let inwrite = write(dir.path(), "data/a/raw_data/data-1.raw.inwrite", "x");
        let lock = write(dir.path(), WRITE_LOCK_FILE, "");
        for path in [hidden, inwrite, lock] {
            assert!(filter.translate(&created(&path)).is_empty());
        }
    }

    #[test]
    fn rename_from_inwrite_creates_destination() {
        let dir = tempdir().expect("tempdir");
        let filter = EventFilter::new(LandingZone::new(dir.path()));
        let to = write(dir.path(), "data/a/raw_data/data-1.raw", "h\n1\n");
        let from = dir.path().join("data/a/raw_data/data-1.raw.inwrite");
        let events = translate_all(&filter, &moved(&from, &to, 7));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Created);
        assert_eq!(events[0].rel_path, PathBuf::from("data/a/raw_data/data-1.raw"));
    }

    #[test]
    fn moves_and_deletes_are_illegal() {
        let dir = tempdir().expect("tempdir");
        let filter = EventFilter::new(LandingZone::new(dir.path()));
        let to = write(dir.path(), "data/b/raw_data/data-1.raw", "h\n1\n");
        let from = dir.path().join("data/a/raw_data/data-1.raw");
        let events = translate_all(&filter, &moved(&from, &to, 9));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Illegal);
        assert_eq!(events[0].rel_path, PathBuf::from("data/a/raw_data/data-1.raw"));

        let script = write(dir.path(), "data/b/conversion.py", "");
        let delete = Event::new(EventKind::Remove(RemoveKind::File)).add_path(script);
        let events = filter.translate(&delete);
        assert_eq!(events[0].kind, FileEventKind::Illegal);
        assert_eq!(events[0].rel_path, PathBuf::from("data/b/conversion.py"));

        let consumed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(to);
        assert!(filter.translate(&consumed).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn hidden_file_moved_into_view_is_illegal() {
        let dir = tempdir().expect("tempdir");
        let filter = EventFilter::new(LandingZone::new(dir.path()));
        let to = write(dir.path(), "data/a/raw_data/data-4.raw", "h\n4\n");
        let from = dir.path().join("data/a/raw_data/.data-4.raw.tmp");
        let events = translate_all(&filter, &moved(&from, &to, 13));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Illegal);
        assert_eq!(events[0].rel_path, PathBuf::from("data/a/raw_data/data-4.raw"));
    }

    #[test]
    fn move_in_from_outside_the_zone_is_created() {
        let dir = tempdir().expect("tempdir");
        let filter = EventFilter::new(LandingZone::new(dir.path()));
        let to = write(dir.path(), "data/a/raw_data/data-3.raw", "h\n3\n");
        let arrival = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(to)
            .set_tracker(11);
        let events = filter.translate(&arrival);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FileEventKind::Created);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread")]
    async fn moving_a_raw_file_inside_the_zone_is_one_illegal_event() {
        let dir = tempdir().expect("tempdir");
        let from = write(dir.path(), "data/a/raw_data/data-1.raw", "h\n1\n");
        std::fs::create_dir_all(dir.path().join("data/b/raw_data")).expect("mkdir");
        let to = dir.path().join("data/b/raw_data/data-1.raw");

        let seen = observe(dir.path(), || std::fs::rename(&from, &to).expect("rename")).await;

        assert_eq!(
            seen,
            vec![(FileEventKind::Illegal, PathBuf::from("data/a/raw_data/data-1.raw"))]
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread")]
    async fn publishing_through_inwrite_is_one_created_event() {
        let dir = tempdir().expect("tempdir");
        let from = write(dir.path(), "data/a/raw_data/data-2.raw.inwrite", "h\n2\n");
        let to = dir.path().join("data/a/raw_data/data-2.raw");

        let seen = observe(dir.path(), || std::fs::rename(&from, &to).expect("rename")).await;

        assert_eq!(
            seen,
            vec![(FileEventKind::Created, PathBuf::from("data/a/raw_data/data-2.raw"))]
        );
    }

    #[test]
    fn bootstrap_orders_raw_files_by_embedded_timestamp() {
        let dir = tempdir().expect("tempdir");
        write(dir.path(), "data/a/s1/raw_data/data-20200103.raw", "h\n");
        write(dir.path(), "data/a/raw_data/data-20200101.raw", "h\n");
        write(dir.path(), "data/a/s2/raw_data/data-20200102.raw", "h\n");
        write(dir.path(), "data/a/conversion.py", "");
        let files = bootstrap_files(&LandingZone::new(dir.path()));
        let names: Vec<String> = files.iter().map(|p| file_name(p)).collect();
        assert_eq!(
            names,
            vec!["data-20200101.raw", "data-20200102.raw", "data-20200103.raw"]
        );
    }
}
