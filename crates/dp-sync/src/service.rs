//! Top-level service: pid file, OS signals, main loop and ordered shutdown.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dp_conversion::{InterpreterFactory, Language};
use dp_storage::{BackupStore, LandingZone};
use futures::FutureExt;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::metrics::DispatchMetrics;
use crate::observer::{self, ZoneObserver};
use crate::queue::event_queue;
use crate::{db, DataPoolConfig};

/// How long the main loop waits on the queue before re-checking the stop flag.
const QUEUE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("pid file {0} exists; is another instance running?")]
    AlreadyRunning(PathBuf),
    #[error("cannot create pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database unavailable: {0:#}")]
    Database(anyhow::Error),
    #[error("startup failed: {0:#}")]
    Startup(anyhow::Error),
}

/// Exists for exactly as long as the service runs.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self, ServiceError> {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    ServiceError::AlreadyRunning(path.to_path_buf())
                } else {
                    ServiceError::PidFile {
                        path: path.to_path_buf(),
                        source,
                    }
                }
            })?;
        writeln!(file, "{}", std::process::id()).map_err(|source| ServiceError::PidFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "cannot remove pid file");
        }
    }
}

/// Flags shared between the main loop, signal handlers and tests.
#[derive(Debug)]
pub struct ServiceState {
    still_running: AtomicBool,
    dispatching: AtomicBool,
    started: DateTime<Utc>,
    interpreter_pids: Mutex<BTreeMap<Language, u32>>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            still_running: AtomicBool::new(true),
            dispatching: AtomicBool::new(false),
            started: Utc::now(),
            interpreter_pids: Mutex::new(BTreeMap::new()),
        }
    }
}

impl ServiceState {
    pub fn request_stop(&self) {
        self.still_running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.still_running.load(Ordering::SeqCst)
    }

    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn interpreter_pids(&self) -> BTreeMap<Language, u32> {
        self.interpreter_pids
            .lock()
            .map(|pids| pids.clone())
            .unwrap_or_default()
    }

    fn set_interpreter_pids(&self, pids: BTreeMap<Language, u32>) {
        if let Ok(mut guard) = self.interpreter_pids.lock() {
            *guard = pids;
        }
    }
}

pub struct Service {
    config: DataPoolConfig,
    factory: Arc<dyn InterpreterFactory>,
    state: Arc<ServiceState>,
    metrics: Arc<DispatchMetrics>,
}

impl Service {
    pub fn new(config: DataPoolConfig) -> Result<Self, ServiceError> {
        let factory: Arc<dyn InterpreterFactory> = Arc::new(config.subprocess_factory());
        let metrics = DispatchMetrics::new().map_err(ServiceError::Startup)?;
        Ok(Self {
            config,
            factory,
            state: Arc::new(ServiceState::default()),
            metrics: Arc::new(metrics),
        })
    }

    pub fn with_interpreters(mut self, factory: Arc<dyn InterpreterFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn state(&self) -> Arc<ServiceState> {
        Arc::clone(&self.state)
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until a stop is requested; `serve_http` runs alongside and must end
    /// once its token is cancelled.
    pub async fn run_with<F, Fut>(self, serve_http: F) -> Result<(), ServiceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let pid_file = PidFile::create(&self.config.pid_file)?;
        info!(pid = std::process::id(), path = %pid_file.path().display(), "service starting");

        let pool = db::connect(&self.config.database_url)
            .await
            .map_err(ServiceError::Database)?;
        db::ping(&pool).await.map_err(ServiceError::Database)?;
        db::migrate(&pool).await.map_err(ServiceError::Database)?;

        let zone = LandingZone::new(&self.config.landing_zone);
        std::fs::create_dir_all(zone.root()).map_err(|err| {
            ServiceError::Startup(anyhow::anyhow!(
                "cannot create landing zone {}: {err}",
                zone.root().display()
            ))
        })?;

        let (sender, mut receiver) =
            event_queue(self.config.queue_capacity, self.metrics.queue_depth.clone());
        let zone_observer =
            ZoneObserver::start(zone.clone(), sender.clone()).map_err(ServiceError::Startup)?;
        if self.config.bootstrap {
            let zone = zone.clone();
            let filter = zone_observer.filter();
            let sender = sender.clone();
            tokio::spawn(async move {
                observer::bootstrap(&zone, &filter, &sender).await;
            });
        }
        drop(sender);

        let token = CancellationToken::new();
        let http = tokio::spawn(serve_http(token.clone()));
        let signals = spawn_signal_handlers(
            Arc::clone(&self.state),
            Arc::clone(&self.metrics),
            token.clone(),
        )
        .map_err(ServiceError::Startup)?;

        let runner = self.config.runner(Arc::clone(&self.factory));
        let mut dispatcher = Dispatcher::new(
            zone,
            BackupStore::new(&self.config.backup_dir),
            pool.clone(),
            runner,
            Arc::clone(&self.metrics),
        );
        info!(
            zone = %self.config.landing_zone.display(),
            backup = %self.config.backup_dir.display(),
            "dispatcher ready"
        );

        while self.state.is_running() {
            let event = match tokio::time::timeout(QUEUE_POLL, receiver.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => continue,
            };
            self.state.dispatching.store(true, Ordering::SeqCst);
            let outcome = AssertUnwindSafe(dispatcher.dispatch(&event))
                .catch_unwind()
                .await;
            self.state.dispatching.store(false, Ordering::SeqCst);
            if outcome.is_err() {
                error!(
                    path = %event.rel_path.display(),
                    kind = %event.kind,
                    "dispatch panicked; event dropped"
                );
            }
            self.state
                .set_interpreter_pids(dispatcher.runner().interpreter_pids());
        }

        info!("shutting down");
        token.cancel();
        match http.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %format!("{err:#}"), "http server failed"),
            Err(err) => error!(%err, "http server task aborted"),
        }
        zone_observer.stop();
        dispatcher.shutdown().await;
        pool.close().await;
        signals.abort();
        drop(pid_file);
        info!("service stopped");
        Ok(())
    }
}

fn spawn_signal_handlers(
    state: Arc<ServiceState>,
    metrics: Arc<DispatchMetrics>,
    token: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = terminate.recv() => {
                    info!("SIGTERM received");
                    state.request_stop();
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received");
                    state.request_stop();
                }
                _ = interrupt.recv() => {
                    info!("SIGINT received");
                    state.request_stop();
                }
                _ = user1.recv() => {
                    info!(
                        queue_depth = metrics.queue_depth.get(),
                        dispatching = state.is_dispatching(),
                        interpreters = ?state.interpreter_pids(),
                        started = %state.started(),
                        "state dump"
                    );
                }
            }
        }
    }))
}
