//! In-process interpreters that need no external runtime.
//!
//! `PassThroughInterpreter` copies the input block to the output file unchanged, which
//! is what an identity conversion script does. A block containing a line that starts
//! with [`RAISE_MARKER`] fails like a script raising an exception. Each interpreter
//! keeps one pid for its whole life, so a new pid means the factory built a new one.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::{check_script_name, InterpreterFactory, ScriptInterpreter};
use crate::language::Language;
use crate::session::BridgeError;

pub const RAISE_MARKER: &str = "RAISE";

static NEXT_PID: AtomicU32 = AtomicU32::new(100_000);

fn fresh_pid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
pub struct PassThroughInterpreter {
    language: Language,
    pid: Option<u32>,
    total_calls: Arc<AtomicU64>,
}

impl PassThroughInterpreter {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            pid: Some(fresh_pid()),
            total_calls: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl ScriptInterpreter for PassThroughInterpreter {
    fn language(&self) -> Language {
        self.language
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn run_script(
        &mut self,
        script: &Path,
        input: &Path,
        output: &Path,
    ) -> Result<(), BridgeError> {
        let language = self.language;
        check_script_name(language, script)?;
        if self.pid.is_none() {
            return Err(BridgeError::Closed { language });
        }
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let text = tokio::fs::read(input)
            .await
            .map_err(|source| BridgeError::Io { language, source })?;
        let raises = String::from_utf8_lossy(&text)
            .lines()
            .any(|line| line.starts_with(RAISE_MARKER));
        if raises {
            return Err(BridgeError::ScriptFailed {
                exit_code: 1,
                trace: format!(
                    "Traceback (most recent call last):\n  File \"{}\", in convert\nValueError: conversion refused input",
                    script.display()
                ),
            });
        }
        tokio::fs::write(output, text)
            .await
            .map_err(|source| BridgeError::Io { language, source })
    }

    async fn shutdown(&mut self) {
        self.pid = None;
    }
}

/// Hands out [`PassThroughInterpreter`]s and counts the interpreters and calls.
#[derive(Debug, Clone, Default)]
pub struct PassThroughFactory {
    created: Arc<AtomicU64>,
    total_calls: Arc<AtomicU64>,
}

impl PassThroughFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpreters built so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterpreterFactory for PassThroughFactory {
    async fn create(&self, language: Language) -> Result<Box<dyn ScriptInterpreter>, BridgeError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut interpreter = PassThroughInterpreter::new(language);
        interpreter.total_calls = Arc::clone(&self.total_calls);
        Ok(Box::new(interpreter))
    }
}
