//! Runs a conversion script over a raw file block by block.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::stream;
use dp_core::{PipelineError, Signal, Step};
use futures::{pin_mut, Stream, StreamExt};
use tracing::{debug, info};

use crate::bridge::{check_script_name, InterpreterFactory, ScriptInterpreter};
use crate::language::Language;
use crate::session::BridgeError;
use crate::uniform::UniformTable;

pub const DEFAULT_BLOCK_SIZE: usize = 20_000;
pub const MIN_BLOCK_SIZE: usize = 1_000;
/// Script calls an interpreter serves before the runner replaces it.
pub const DEFAULT_CALL_LIMIT: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionJob {
    pub script: PathBuf,
    pub raw: PathBuf,
    /// Source named by the script's folder; `None` for source-type generic scripts.
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub messages: Vec<String>,
    pub signals: usize,
    pub failed: bool,
}

pub struct ConversionRunner {
    factory: Arc<dyn InterpreterFactory>,
    interpreters: HashMap<Language, Box<dyn ScriptInterpreter>>,
    calls: HashMap<Language, u64>,
    call_limit: u64,
    block_size: usize,
}

fn split_lines(bytes: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = bytes
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Drop leading blank lines and the repeated header of a later block.
fn strip_block_header(text: &str) -> &str {
    let trimmed = text.trim_start_matches(['\n', '\r', ' ', '\t']);
    match trimmed.find('\n') {
        Some(end) => &trimmed[end + 1..],
        None => "",
    }
}

impl ConversionRunner {
    pub fn new(factory: Arc<dyn InterpreterFactory>, block_size: usize) -> Self {
        Self {
            factory,
            interpreters: HashMap::new(),
            calls: HashMap::new(),
            call_limit: DEFAULT_CALL_LIMIT,
            block_size: block_size.max(MIN_BLOCK_SIZE),
        }
    }

    pub fn with_call_limit(mut self, call_limit: u64) -> Self {
        self.call_limit = call_limit.max(1);
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn call_limit(&self) -> u64 {
        self.call_limit
    }

    pub fn interpreter_pids(&self) -> BTreeMap<Language, u32> {
        self.interpreters
            .iter()
            .filter_map(|(language, interpreter)| interpreter.pid().map(|pid| (*language, pid)))
            .collect()
    }

    /// The interpreter for the next call, replaced through the factory once its
    /// call budget is spent. The replacement starts before the old one stops.
    async fn interpreter(
        &mut self,
        language: Language,
    ) -> Result<&mut Box<dyn ScriptInterpreter>, BridgeError> {
        let served = self.calls.get(&language).copied().unwrap_or(0);
        let spent = served >= self.call_limit;
        if spent || !self.interpreters.contains_key(&language) {
            let created = self.factory.create(language).await?;
            info!(%language, pid = ?created.pid(), "interpreter ready");
            if let Some(mut old) = self.interpreters.insert(language, created) {
                info!(%language, calls = served, limit = self.call_limit, "call limit reached, old interpreter stopped");
                old.shutdown().await;
            }
            self.calls.insert(language, 0);
        }
        *self.calls.entry(language).or_default() += 1;
        self.interpreters
            .get_mut(&language)
            .ok_or(BridgeError::Closed { language })
    }

    /// Convert a raw file into one uniform table, one interpreter call per block.
    pub fn convert<'a>(
        &'a mut self,
        job: &'a ConversionJob,
    ) -> impl Stream<Item = Step<UniformTable>> + 'a {
        stream! {
            let Some(language) = Language::for_script(&job.script) else {
                yield Step::Failure(PipelineError::invalid_operation(format!(
                    "no interpreter for script {}", job.script.display()
                )));
                return;
            };
            if let Err(err) = check_script_name(language, &job.script) {
                yield Step::Failure(PipelineError::invalid_operation(err.to_string()));
                return;
            }

            let bytes = match tokio::fs::read(&job.raw).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield Step::Failure(PipelineError::io(format!(
                        "cannot read raw file {}: {err}", job.raw.display()
                    )));
                    return;
                }
            };
            let lines = split_lines(&bytes);
            let Some((header, data)) = lines.split_first() else {
                yield Step::Failure(PipelineError::format(format!(
                    "raw file {} has no header line", job.raw.display()
                )));
                return;
            };
            if data.is_empty() {
                yield Step::progress(format!("{} holds no data rows", job.raw.display()));
                yield Step::Done(UniformTable::default());
                return;
            }

            let scratch = match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(err) => {
                    yield Step::Failure(PipelineError::io(format!("cannot create scratch directory: {err}")));
                    return;
                }
            };
            let block_size = self.block_size;
            let blocks = data.len().div_ceil(block_size);

            let mut buffer = String::new();
            for (index, block) in data.chunks(block_size).enumerate() {
                let input = scratch.path().join(format!("input_{index}.raw"));
                let output = scratch.path().join(format!("output_{index}.csv"));
                let mut content = Vec::with_capacity(header.len() + block.len() * 64);
                content.extend_from_slice(header);
                content.push(b'\n');
                for line in block {
                    content.extend_from_slice(line);
                    content.push(b'\n');
                }
                if let Err(err) = tokio::fs::write(&input, &content).await {
                    yield Step::Failure(PipelineError::io(format!(
                        "cannot write {}: {err}", input.display()
                    )));
                    return;
                }

                debug!(block = index, lines = block.len(), "running conversion block");
                let interpreter = match self.interpreter(language).await {
                    Ok(interpreter) => interpreter,
                    Err(err) => {
                        yield Step::Failure(PipelineError::invalid_operation(err.to_string()));
                        return;
                    }
                };
                if let Err(err) = interpreter.run_script(&job.script, &input, &output).await {
                    yield Step::Failure(PipelineError::invalid_operation(err.to_string()));
                    return;
                }

                let converted = match tokio::fs::read(&output).await {
                    Ok(converted) => converted,
                    Err(err) => {
                        yield Step::Failure(PipelineError::io(format!(
                            "conversion script wrote no readable output {}: {err}", output.display()
                        )));
                        return;
                    }
                };
                if !converted.is_ascii() {
                    yield Step::Failure(PipelineError::format(format!(
                        "output of block {} of {} contains non-ASCII bytes", index + 1, blocks
                    )));
                    return;
                }
                let text = String::from_utf8_lossy(&converted);
                if index == 0 {
                    buffer.push_str(&text);
                } else {
                    buffer.push_str(strip_block_header(&text));
                }
                if !buffer.ends_with('\n') {
                    buffer.push('\n');
                }
                yield Step::progress(format!("converted block {} of {}", index + 1, blocks));
            }

            match UniformTable::parse(&buffer) {
                Ok(table) => yield Step::Done(table),
                Err(err) => yield Step::Failure(err),
            }
        }
    }

    /// Production entry point: progress, at most one failure, then the signals.
    pub fn run<'a>(
        &'a mut self,
        job: &'a ConversionJob,
    ) -> impl Stream<Item = Step<Vec<Signal>>> + 'a {
        stream! {
            let converted = self.convert(job);
            pin_mut!(converted);
            let mut table = None;
            while let Some(step) = converted.next().await {
                match step {
                    Step::Progress(message) => yield Step::Progress(message),
                    Step::Failure(err) => {
                        yield Step::Failure(err);
                        return;
                    }
                    Step::Done(done) => table = Some(done),
                }
            }
            let Some(table) = table else {
                yield Step::Failure(PipelineError::invalid_operation("conversion ended without result"));
                return;
            };
            if table.is_empty() {
                yield Step::Done(Vec::new());
                return;
            }
            match table.to_signals(job.source.as_deref()) {
                Ok(signals) => {
                    yield Step::progress(format!("{} signals converted", signals.len()));
                    yield Step::Done(signals);
                }
                Err(errors) => {
                    for err in errors {
                        yield Step::Failure(err);
                    }
                }
            }
        }
    }

    /// Operator entry point: collect every message and optionally keep the converted table.
    pub async fn check(&mut self, job: &ConversionJob, output_csv: Option<&Path>) -> CheckReport {
        let mut report = CheckReport::default();
        let mut table = None;
        {
            let converted = self.convert(job);
            pin_mut!(converted);
            while let Some(step) = converted.next().await {
                match step {
                    Step::Progress(message) => report.messages.push(message),
                    Step::Failure(err) => {
                        report.failed = true;
                        report.messages.push(err.to_string());
                    }
                    Step::Done(done) => table = Some(done),
                }
            }
        }
        let Some(table) = table else {
            return report;
        };

        if let Some(path) = output_csv {
            match table.write_csv(path).await {
                Ok(()) => report
                    .messages
                    .push(format!("wrote {} rows to {}", table.len(), path.display())),
                Err(err) => {
                    report.failed = true;
                    report.messages.push(format!("{err:#}"));
                }
            }
        }
        if table.is_empty() {
            report.messages.push("no rows converted".to_string());
            return report;
        }
        match table.to_signals(job.source.as_deref()) {
            Ok(signals) => {
                report.signals = signals.len();
                report
                    .messages
                    .push(format!("{} signals passed the row checks", signals.len()));
            }
            Err(errors) => {
                report.failed = true;
                report
                    .messages
                    .extend(errors.into_iter().map(|e| e.to_string()));
            }
        }
        report
    }

    pub async fn shutdown(&mut self) {
        for (language, mut interpreter) in self.interpreters.drain() {
            debug!(%language, "shutting down interpreter");
            interpreter.shutdown().await;
        }
        self.calls.clear();
    }
}
