//! Routes each landing-zone event to the raw, metadata or script handler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{Local, Utc};
use dp_conversion::{ConversionJob, ConversionRunner};
use dp_core::{FileEvent, FileEventKind, PipelineError, Signal, Step};
use dp_storage::{BackupStore, LandingZone, StoredBackup, ZoneFileKind};
use futures::{pin_mut, StreamExt};
use sqlx::SqlitePool;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::committer::SignalCommitter;
use crate::metadata::MetadataRegistry;
use crate::metrics::DispatchMetrics;

pub const DEFAULT_APPEAR_TIMEOUT: Duration = Duration::from_secs(1);
const APPEAR_POLL: Duration = Duration::from_millis(50);

/// What happened to one event.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub rel_path: PathBuf,
    pub kind: Option<ZoneFileKind>,
    pub errors: Vec<PipelineError>,
    pub signals_committed: usize,
    pub backup: Option<StoredBackup>,
    /// The raw file was removed from the landing zone.
    pub deleted: bool,
}

impl DispatchReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Dispatcher {
    zone: LandingZone,
    backups: BackupStore,
    pool: SqlitePool,
    runner: ConversionRunner,
    metadata: MetadataRegistry,
    metrics: Arc<DispatchMetrics>,
    appear_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        zone: LandingZone,
        backups: BackupStore,
        pool: SqlitePool,
        runner: ConversionRunner,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            zone,
            backups,
            pool,
            runner,
            metadata: MetadataRegistry::default(),
            metrics,
            appear_timeout: DEFAULT_APPEAR_TIMEOUT,
        }
    }

    pub fn with_appear_timeout(mut self, timeout: Duration) -> Self {
        self.appear_timeout = timeout;
        self
    }

    pub fn runner(&self) -> &ConversionRunner {
        &self.runner
    }

    pub async fn shutdown(&mut self) {
        self.runner.shutdown().await;
    }

    pub async fn dispatch(&mut self, event: &FileEvent) -> DispatchReport {
        let span = info_span!("dispatch", path = %event.rel_path.display(), kind = %event.kind);
        self.dispatch_inner(event).instrument(span).await
    }

    async fn dispatch_inner(&mut self, event: &FileEvent) -> DispatchReport {
        let rel = event.rel_path.clone();
        let kind = ZoneFileKind::classify(&rel);
        let mut report = DispatchReport {
            rel_path: rel.clone(),
            kind: Some(kind),
            ..DispatchReport::default()
        };

        if event.kind == FileEventKind::Illegal {
            let error = PipelineError::invalid_operation(format!(
                "{} was moved or deleted inside the landing zone; only additions and modifications are allowed",
                rel.display()
            ));
            error!(%error, "illegal landing-zone operation");
            report.errors.push(error);
            return report;
        }

        if !self.wait_until_visible(&rel).await {
            let error = PipelineError::io(format!(
                "{} did not appear within {:?}",
                rel.display(),
                self.appear_timeout
            ));
            warn!(%error, "file not visible");
            report.errors.push(error);
            return report;
        }

        match kind {
            ZoneFileKind::GenericRaw | ZoneFileKind::SourceRaw => {
                self.dispatch_raw(event, &mut report).await;
            }
            kind if kind.is_metadata() => {
                report.errors = self.metadata.handle(&self.pool, &self.zone, &rel).await;
                for error in &report.errors {
                    error!(%error, "metadata file rejected");
                }
                report.backup = self.backup(&rel, false).await;
            }
            kind if kind.is_script() => {
                info!("conversion script changed");
                report.backup = self.backup(&rel, false).await;
            }
            _ => {
                info!(kind = ?kind, "no handler for file, ignored");
            }
        }
        report
    }

    async fn wait_until_visible(&self, rel: &Path) -> bool {
        let absolute = self.zone.absolute(rel);
        let deadline = Instant::now() + self.appear_timeout;
        loop {
            if tokio::fs::try_exists(&absolute).await.unwrap_or(false) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(APPEAR_POLL).await;
        }
    }

    async fn backup(&self, rel: &Path, broken: bool) -> Option<StoredBackup> {
        match self
            .backups
            .store(self.zone.root(), rel, broken, Local::now())
            .await
        {
            Ok(stored) => {
                info!(backup = %stored.relative_path.display(), broken, "backup stored");
                Some(stored)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "backup failed");
                None
            }
        }
    }

    fn conversion_job(&self, rel: &Path) -> Result<ConversionJob, PipelineError> {
        let candidates = self.zone.conversion_script_candidates(rel);
        match candidates.as_slice() {
            [script] => Ok(ConversionJob {
                script: self.zone.absolute(script),
                raw: self.zone.absolute(rel),
                source: LandingZone::script_source_name(script),
            }),
            [] => Err(PipelineError::invalid_operation(format!(
                "no conversion script found for {}",
                rel.display()
            ))),
            several => Err(PipelineError::invalid_operation(format!(
                "{} conversion scripts match {}: {}",
                several.len(),
                rel.display(),
                several
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    async fn convert(&mut self, job: &ConversionJob, errors: &mut Vec<PipelineError>) -> Vec<Signal> {
        let mut signals = Vec::new();
        let steps = self.runner.run(job);
        pin_mut!(steps);
        while let Some(step) = steps.next().await {
            match step {
                Step::Progress(message) => debug!(%message, "conversion"),
                Step::Failure(error) => {
                    error!(%error, "conversion failed");
                    errors.push(error);
                }
                Step::Done(done) => signals = done,
            }
        }
        signals
    }

    async fn commit(&mut self, signals: Vec<Signal>, errors: &mut Vec<PipelineError>) -> usize {
        let mut committer = SignalCommitter::new(self.pool.clone());
        let steps = committer.commit(signals);
        pin_mut!(steps);
        let mut inserted = 0;
        while let Some(step) = steps.next().await {
            match step {
                Step::Progress(message) => info!(%message, "commit"),
                Step::Failure(error) => {
                    error!(%error, "signal rejected");
                    errors.push(error);
                }
                Step::Done(summary) => inserted = summary.inserted,
            }
        }
        inserted
    }

    async fn dispatch_raw(&mut self, event: &FileEvent, report: &mut DispatchReport) {
        let rel = report.rel_path.clone();
        let absolute = self.zone.absolute(&rel);
        let modified_at = tokio::fs::metadata(&absolute)
            .await
            .and_then(|m| m.modified())
            .ok();

        let waited = (Utc::now() - event.detected_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.event_to_dispatch_seconds.set(waited);

        match self.conversion_job(&rel) {
            Ok(job) => {
                info!(script = %job.script.display(), source = ?job.source, "converting raw file");
                let started = Instant::now();
                let signals = self.convert(&job, &mut report.errors).await;
                self.metrics
                    .conversion_seconds
                    .set(started.elapsed().as_secs_f64());

                if report.errors.is_empty() && !signals.is_empty() {
                    let started = Instant::now();
                    report.signals_committed = self.commit(signals, &mut report.errors).await;
                    self.metrics
                        .commit_seconds
                        .set(started.elapsed().as_secs_f64());
                }
            }
            Err(error) => {
                error!(%error, "cannot convert raw file");
                report.errors.push(error);
            }
        }

        let broken = !report.errors.is_empty();
        report.backup = self.backup(&rel, broken).await;
        if broken {
            self.metrics.broken_files.inc();
            warn!(errors = report.errors.len(), "raw file kept in landing zone");
        } else if report.backup.is_some() {
            match tokio::fs::remove_file(&absolute).await {
                Ok(()) => report.deleted = true,
                Err(err) => error!(%err, "cannot remove dispatched raw file"),
            }
        }

        self.metrics
            .signals_processed
            .inc_by(report.signals_committed as u64);
        if let Some(modified_at) = modified_at {
            let latency = SystemTime::now()
                .duration_since(modified_at)
                .unwrap_or_default()
                .as_secs_f64();
            self.metrics.end_to_end_latency_seconds.set(latency);
        }
        self.metrics.dispatched_files.inc();
        info!(
            signals = report.signals_committed,
            broken,
            deleted = report.deleted,
            "raw file dispatched"
        );
    }
}
