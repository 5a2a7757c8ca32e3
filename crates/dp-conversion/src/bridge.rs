//! Interpreter bridges: restartable sessions behind the `ScriptInterpreter` seam.
//!
//! A bridge restarts its own session on memory pressure or stale output; the
//! per-interpreter call budget belongs to `ConversionRunner`, which replaces
//! whole interpreters through an `InterpreterFactory`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::framing::Response;
use crate::language::Language;
use crate::session::{BridgeError, InterpreterConfig, InterpreterSession};

/// Something that can run `convert(input, output)` from a conversion script.
#[async_trait]
pub trait ScriptInterpreter: Send + Sync {
    fn language(&self) -> Language;

    /// Process id of the backing subprocess, if any.
    fn pid(&self) -> Option<u32>;

    async fn run_script(
        &mut self,
        script: &Path,
        input: &Path,
        output: &Path,
    ) -> Result<(), BridgeError>;

    async fn shutdown(&mut self);
}

#[async_trait]
pub trait InterpreterFactory: Send + Sync {
    async fn create(&self, language: Language) -> Result<Box<dyn ScriptInterpreter>, BridgeError>;
}

/// Reject scripts whose file name does not match the language's convention.
pub fn check_script_name(language: Language, script: &Path) -> Result<(), BridgeError> {
    let required = language.required_script_name();
    let actual = script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if actual.eq_ignore_ascii_case(&required) {
        Ok(())
    } else {
        Err(BridgeError::InvalidScript(format!(
            "{language} conversion scripts must be named {required}, got {}",
            script.display()
        )))
    }
}

pub struct InterpreterBridge {
    language: Language,
    config: InterpreterConfig,
    session: Option<InterpreterSession>,
    restarts: u64,
}

impl InterpreterBridge {
    pub async fn start(language: Language, config: InterpreterConfig) -> Result<Self, BridgeError> {
        let session = InterpreterSession::spawn(language, &config).await?;
        Ok(Self {
            language,
            config,
            session: Some(session),
            restarts: 0,
        })
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Start the replacement before stopping the old process.
    pub async fn restart(&mut self) -> Result<(), BridgeError> {
        let fresh = InterpreterSession::spawn(self.language, &self.config).await?;
        if let Some(old) = self.session.replace(fresh) {
            debug!(language = %self.language, commands = old.commands(), "stopping replaced session");
            old.terminate().await;
        }
        self.restarts += 1;
        Ok(())
    }

    async fn ensure_ready(&mut self) -> Result<(), BridgeError> {
        let reason = match &mut self.session {
            None => Some("no running session".to_string()),
            Some(session) => {
                if session.has_stale_output() && !session.drain_stale(self.config.drain_timeout).await {
                    Some("stale output after timeout".to_string())
                } else {
                    over_budget(&self.config, session)
                }
            }
        };
        if let Some(reason) = reason {
            info!(language = %self.language, %reason, "restarting interpreter");
            self.restart().await?;
        }
        Ok(())
    }

    pub async fn execute(&mut self, snippet: &str) -> Result<Response, BridgeError> {
        self.ensure_ready().await?;
        let timeout = self.config.call_timeout;
        let language = self.language;
        let session = self
            .session
            .as_mut()
            .ok_or(BridgeError::Closed { language })?;
        let response = session.execute(snippet, timeout).await?;
        if response.succeeded() {
            Ok(response)
        } else {
            Err(BridgeError::ScriptFailed {
                exit_code: response.exit_code,
                trace: response.error.join("\n"),
            })
        }
    }
}

fn over_budget(config: &InterpreterConfig, session: &InterpreterSession) -> Option<String> {
    match session.resident_memory_mb() {
        Some(mb) if mb > config.memory_limit_mb => Some(format!(
            "resident memory {mb} MB above {} MB",
            config.memory_limit_mb
        )),
        _ => None,
    }
}

#[async_trait]
impl ScriptInterpreter for InterpreterBridge {
    fn language(&self) -> Language {
        self.language
    }

    fn pid(&self) -> Option<u32> {
        self.session.as_ref().map(InterpreterSession::pid)
    }

    async fn run_script(
        &mut self,
        script: &Path,
        input: &Path,
        output: &Path,
    ) -> Result<(), BridgeError> {
        check_script_name(self.language, script)?;
        let snippet = self.language.run_script_snippet(script, input, output);
        match self.execute(&snippet).await {
            Ok(_) => Ok(()),
            Err(err @ BridgeError::Closed { .. }) => {
                warn!(language = %self.language, "interpreter died during call");
                self.session = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.terminate().await;
        }
    }
}

/// Spawns real interpreter subprocesses, one configuration per language.
#[derive(Debug, Clone, Default)]
pub struct SubprocessFactory {
    base: InterpreterConfig,
    programs: HashMap<Language, String>,
}

impl SubprocessFactory {
    pub fn new(base: InterpreterConfig) -> Self {
        Self {
            base,
            programs: HashMap::new(),
        }
    }

    pub fn with_program(mut self, language: Language, program: impl Into<String>) -> Self {
        self.programs.insert(language, program.into());
        self
    }

    pub fn config_for(&self, language: Language) -> InterpreterConfig {
        let mut config = self.base.clone();
        if let Some(program) = self.programs.get(&language) {
            config.program = Some(program.clone());
        }
        config
    }
}

#[async_trait]
impl InterpreterFactory for SubprocessFactory {
    async fn create(&self, language: Language) -> Result<Box<dyn ScriptInterpreter>, BridgeError> {
        let bridge = InterpreterBridge::start(language, self.config_for(language)).await?;
        Ok(Box::new(bridge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_names_follow_language_convention() {
        assert!(check_script_name(Language::Matlab, Path::new("/z/data/a/conversion.m")).is_ok());
        let err = check_script_name(Language::Matlab, Path::new("/z/data/a/convert_it.m"))
            .expect_err("bad name");
        assert!(err.to_string().contains("conversion.m"));
    }

    #[test]
    fn factory_overrides_program_per_language() {
        let factory = SubprocessFactory::new(InterpreterConfig::default())
            .with_program(Language::Python, "/opt/py/bin/python3");
        assert_eq!(
            factory.config_for(Language::Python).program_for(Language::Python),
            "/opt/py/bin/python3"
        );
        assert_eq!(
            factory.config_for(Language::R).program_for(Language::R),
            "Rscript"
        );
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let config = InterpreterConfig {
            program: Some("/nonexistent/datapool-interpreter".to_string()),
            ..InterpreterConfig::default()
        };
        let err = match InterpreterBridge::start(Language::Python, config).await {
            Ok(_) => panic!("spawn should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }
}
