//! A persistent interpreter subprocess talking the framing protocol over stdio.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::framing::{Markers, Response, ResponseParser};
use crate::language::Language;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("could not start {language} interpreter `{program}`: {source}")]
    Spawn {
        language: Language,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{language} interpreter did not reach a prompt: {reason}")]
    Startup { language: Language, reason: String },
    #[error("{language} interpreter closed its output stream")]
    Closed { language: Language },
    #[error("{language} interpreter call timed out after {after:?}")]
    Timeout { language: Language, after: Duration },
    #[error("i/o with {language} interpreter failed: {source}")]
    Io {
        language: Language,
        #[source]
        source: std::io::Error,
    },
    #[error("conversion script failed with exit code {exit_code}:\n{trace}")]
    ScriptFailed { exit_code: i32, trace: String },
    #[error("{0}")]
    InvalidScript(String),
}

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Executable; the language default when `None`.
    pub program: Option<String>,
    pub markers: Markers,
    /// Resident memory budget in megabytes before a restart.
    pub memory_limit_mb: u64,
    pub startup_timeout: Duration,
    pub call_timeout: Option<Duration>,
    /// How long to wait for output left over by a timed-out call.
    pub drain_timeout: Duration,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: None,
            markers: Markers::default(),
            memory_limit_mb: 500,
            startup_timeout: Duration::from_secs(120),
            call_timeout: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl InterpreterConfig {
    pub fn program_for(&self, language: Language) -> String {
        self.program
            .clone()
            .unwrap_or_else(|| language.default_program().to_string())
    }
}

pub struct InterpreterSession {
    language: Language,
    markers: Markers,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    pid: u32,
    commands: u64,
    stale_responses: usize,
}

impl InterpreterSession {
    /// Spawn the interpreter and wait until it answers a no-op command.
    pub async fn spawn(language: Language, config: &InterpreterConfig) -> Result<Self, BridgeError> {
        let program = config.program_for(language);
        let mut child = Command::new(&program)
            .args(language.launch_args(&config.markers))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                language,
                program: program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Startup {
            language,
            reason: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Startup {
            language,
            reason: "stdout not captured".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%language, pid, stderr = %line, "interpreter stderr");
                }
            });
        }

        let mut session = Self {
            language,
            markers: config.markers.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            pid,
            commands: 0,
            stale_responses: 0,
        };

        match session
            .execute(language.noop(), Some(config.startup_timeout))
            .await
        {
            Ok(response) if response.succeeded() => {}
            Ok(response) => {
                return Err(BridgeError::Startup {
                    language,
                    reason: response.error.join("\n"),
                })
            }
            Err(err) => {
                return Err(BridgeError::Startup {
                    language,
                    reason: err.to_string(),
                })
            }
        }
        session.commands = 0;
        info!(%language, pid, program = %program, "interpreter started");
        Ok(session)
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn commands(&self) -> u64 {
        self.commands
    }

    pub fn has_stale_output(&self) -> bool {
        self.stale_responses > 0
    }

    /// Run one snippet and collect its framed response.
    ///
    /// On timeout the subprocess keeps running; its late response is recorded as stale.
    pub async fn execute(
        &mut self,
        snippet: &str,
        timeout: Option<Duration>,
    ) -> Result<Response, BridgeError> {
        let language = self.language;
        let wrapped = language.wrap(snippet, &self.markers);
        let submission = language.submission(&wrapped, &self.markers);
        self.stdin
            .write_all(submission.as_bytes())
            .await
            .map_err(|source| BridgeError::Io { language, source })?;
        self.stdin
            .flush()
            .await
            .map_err(|source| BridgeError::Io { language, source })?;
        self.commands += 1;

        match timeout {
            Some(after) => match tokio::time::timeout(after, self.read_response()).await {
                Ok(result) => result,
                Err(_) => {
                    self.stale_responses += 1;
                    Err(BridgeError::Timeout { language, after })
                }
            },
            None => self.read_response().await,
        }
    }

    async fn read_response(&mut self) -> Result<Response, BridgeError> {
        let language = self.language;
        let mut parser = ResponseParser::new(self.markers.clone());
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|source| BridgeError::Io { language, source })?;
            let Some(line) = line else {
                return Err(BridgeError::Closed { language });
            };
            if parser.feed(&line) {
                let response = parser.finish();
                for error_line in &response.error {
                    warn!(%language, pid = self.pid, "{error_line}");
                }
                return Ok(response);
            }
        }
    }

    /// Consume responses left behind by timed-out calls; `false` if they never arrive.
    pub async fn drain_stale(&mut self, within: Duration) -> bool {
        while self.stale_responses > 0 {
            match tokio::time::timeout(within, self.read_response()).await {
                Ok(Ok(_)) => self.stale_responses -= 1,
                _ => return false,
            }
        }
        true
    }

    pub async fn is_alive(&mut self, within: Duration) -> bool {
        if self.has_stale_output() && !self.drain_stale(within).await {
            return false;
        }
        let before = self.commands;
        let alive = matches!(
            self.execute(self.language.noop(), Some(within)).await,
            Ok(response) if response.succeeded()
        );
        self.commands = before;
        alive
    }

    /// Resident set size in megabytes, where the platform exposes it.
    pub fn resident_memory_mb(&self) -> Option<u64> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", self.pid)).ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line
            .trim_start_matches("VmRSS:")
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse()
            .ok()?;
        Some(kb / 1024)
    }

    pub async fn terminate(mut self) {
        if let Err(err) = self.stdin.shutdown().await {
            debug!(language = %self.language, pid = self.pid, %err, "closing interpreter stdin failed");
        }
        if let Err(err) = self.child.kill().await {
            debug!(language = %self.language, pid = self.pid, %err, "interpreter already gone");
        }
        info!(language = %self.language, pid = self.pid, "interpreter terminated");
    }
}
