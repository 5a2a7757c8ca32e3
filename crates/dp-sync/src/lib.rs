//! Dispatcher service: configuration, database, observer, dispatch loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dp_conversion::{
    ConversionRunner, InterpreterConfig, InterpreterFactory, Language, SubprocessFactory,
    DEFAULT_BLOCK_SIZE, DEFAULT_CALL_LIMIT,
};

pub mod committer;
pub mod db;
pub mod dispatcher;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod observer;
pub mod queue;
pub mod service;

pub use committer::{CommitSummary, SignalCommitter, MAX_BATCH_ERRORS};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use logging::{init_tracing, LogRing};
pub use metadata::MetadataRegistry;
pub use metrics::DispatchMetrics;
pub use observer::{EventFilter, ZoneObserver};
pub use queue::{event_queue, EventReceiver, EventSender};
pub use service::{PidFile, Service, ServiceError, ServiceState};

pub const CRATE_NAME: &str = "dp-sync";

#[derive(Debug, Clone)]
pub struct DataPoolConfig {
    pub database_url: String,
    pub landing_zone: PathBuf,
    pub backup_dir: PathBuf,
    pub pid_file: PathBuf,
    pub http_port: u16,
    pub queue_capacity: usize,
    pub block_size: usize,
    pub call_limit: u64,
    pub memory_limit_mb: u64,
    pub call_timeout: Option<Duration>,
    pub bootstrap: bool,
    pub matlab_exe: String,
    pub julia_exe: String,
    pub r_exe: String,
    pub python_exe: String,
}

impl DataPoolConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        Self {
            database_url: text("DATABASE_URL", "sqlite://datapool.db?mode=rwc"),
            landing_zone: path("DP_LANDING_ZONE", "./landing_zone"),
            backup_dir: path("DP_BACKUP_DIR", "./backup_landing_zone"),
            pid_file: path("DP_PID_FILE", "./datapool.pid"),
            http_port: lookup("DP_HTTP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            queue_capacity: lookup("DP_QUEUE_CAPACITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            block_size: lookup("DP_BLOCK_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BLOCK_SIZE),
            call_limit: lookup("DP_CALL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CALL_LIMIT),
            memory_limit_mb: lookup("DP_MEMORY_LIMIT_MB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            call_timeout: lookup("DP_CALL_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            bootstrap: lookup("DP_BOOTSTRAP")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            matlab_exe: text("DP_MATLAB_EXE", "matlab"),
            julia_exe: text("DP_JULIA_EXE", "julia"),
            r_exe: text("DP_R_EXE", "Rscript"),
            python_exe: text("DP_PYTHON_EXE", "python3"),
        }
    }

    pub fn interpreter_config(&self) -> InterpreterConfig {
        InterpreterConfig {
            memory_limit_mb: self.memory_limit_mb,
            call_timeout: self.call_timeout,
            ..InterpreterConfig::default()
        }
    }

    /// Conversion runner over `factory` with the configured block size and call budget.
    pub fn runner(&self, factory: Arc<dyn InterpreterFactory>) -> ConversionRunner {
        ConversionRunner::new(factory, self.block_size).with_call_limit(self.call_limit)
    }

    /// Real interpreter subprocesses with the configured executables.
    pub fn subprocess_factory(&self) -> SubprocessFactory {
        SubprocessFactory::new(self.interpreter_config())
            .with_program(Language::Matlab, &self.matlab_exe)
            .with_program(Language::Julia, &self.julia_exe)
            .with_program(Language::R, &self.r_exe)
            .with_program(Language::Python, &self.python_exe)
    }
}
