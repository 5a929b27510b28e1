use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use super::compile::{BINARY_NAME, BUILD_DIR_PREFIX, EXPORT_NAME, LOADER_NAME};
use super::process::{capture_pipe, collect_pipe, exit_code, isolate_process_group, terminate};
use super::scratch::{ScratchDir, setup_scratch_root};
use super::{Artifact, CompletionTuning, ExecutionLimits, ExecutionOutcome};

/// The fixed host-side runner; per-run settings travel in [`WrapperConfig`]
const WRAPPER_SOURCE: &str = include_str!("wrapper.js");
const WRAPPER_NAME: &str = "wrapper.js";
const CONFIG_NAME: &str = "run.json";

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";
/// How long the wrapper may take to exit after reporting completion
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Settings handed to the wrapper program as a JSON document
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WrapperConfig {
    pub loader_path: PathBuf,
    pub export_name: String,
    pub stdin: String,
    pub max_output_bytes: usize,
    pub poll_interval_ms: u64,
    pub quiescence_ms: u64,
    pub fallback_ms: u64,
}

/// Why the wrapper considered the program finished
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    /// The module's exit hook fired
    Exit,
    Abort,
    /// Output went quiet for the quiescence window
    Quiescence,
    /// The wrapper's own deadline passed
    Fallback,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub code: i32,
    pub reason: CompletionReason,
    #[serde(default)]
    pub memory_kb: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    /// The wrapper dropped output past the ceiling
    #[serde(default)]
    pub truncated: bool,
}

/// One line of the wrapper's stdout
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WrapperEvent {
    Stdout { data: String },
    Stderr { data: String },
    Exit(ExitReport),
}

/// Output collected from the wrapper, bounded by the output ceiling
#[derive(Debug, Default)]
struct Capture {
    stdout: String,
    stderr: String,
    limit: usize,
    truncated: bool,
    exit: Option<ExitReport>,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Consumes wrapper events until the exit report or end of stream
    async fn read_events<R: AsyncRead + Unpin>(&mut self, pipe: R) -> std::io::Result<()> {
        let mut lines = BufReader::new(pipe).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WrapperEvent>(&line) {
                Ok(WrapperEvent::Stdout { data }) => self.push_stdout(&data),
                Ok(WrapperEvent::Stderr { data }) => self.push_stderr(&data),
                Ok(WrapperEvent::Exit(report)) => {
                    self.truncated |= report.truncated;
                    self.exit = Some(report);
                    break;
                }
                // Something bypassed the wrapper; keep it as program output
                Err(_) => {
                    self.push_stdout(&line);
                    self.push_stdout("\n");
                }
            }
        }
        Ok(())
    }

    fn room(&self) -> usize {
        self.limit
            .saturating_sub(self.stdout.len() + self.stderr.len())
    }

    fn push_stdout(&mut self, text: &str) {
        let room = self.room();
        let kept = prefix_within(text, room);
        if kept.len() < text.len() {
            self.truncated = true;
        }
        self.stdout.push_str(kept);
    }

    fn push_stderr(&mut self, text: &str) {
        let room = self.room();
        self.stderr.push_str(prefix_within(text, room));
    }

    fn memory_kb(&self) -> u64 {
        self.exit.as_ref().and_then(|e| e.memory_kb).unwrap_or(0)
    }
}

/// Longest prefix of `text` no longer than `max` bytes, on a char boundary
fn prefix_within(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Runs compiled artifacts in a fresh host-runtime process per execution
///
/// Only artifacts sitting in a build directory directly under the scratch
/// root are accepted; anything else is rejected before a process starts.
pub struct RunSandbox {
    host_runtime: PathBuf,
    limits: ExecutionLimits,
    tuning: CompletionTuning,
    scratch_root: PathBuf,
}

impl RunSandbox {
    pub fn build(
        host_runtime: PathBuf,
        limits: ExecutionLimits,
        tuning: CompletionTuning,
        scratch_root: Option<&Path>,
    ) -> Result<Self> {
        let scratch_root = setup_scratch_root(scratch_root)?;
        let scratch_root = fs::canonicalize(&scratch_root)
            .with_context(|| format!("Failed to resolve {}", scratch_root.display()))?;
        Ok(Self {
            host_runtime,
            limits,
            tuning,
            scratch_root,
        })
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Executes `artifact` with `stdin`; never returns an error
    pub async fn execute(&self, artifact: &Artifact, stdin: &str) -> ExecutionOutcome {
        let start_time = Instant::now();

        if stdin.len() > self.limits.max_output_bytes {
            return ExecutionOutcome::rejected(
                format!(
                    "input is too large ({} bytes, limit {} bytes)",
                    stdin.len(),
                    self.limits.max_output_bytes
                ),
                start_time.elapsed(),
            );
        }

        let loader = match self.resolve_artifact(artifact) {
            Ok(loader) => loader,
            Err(reason) => {
                log::warn!(target: "cppbox::run", "Artifact rejected: {reason}");
                return ExecutionOutcome::rejected(reason, start_time.elapsed());
            }
        };

        match self.execute_in_host(&loader, stdin, start_time).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(target: "cppbox::run", "Execution failed: {e:#}");
                ExecutionOutcome::finished(
                    String::new(),
                    format!("execution error: {e:#}"),
                    1,
                    start_time.elapsed(),
                    0,
                )
            }
        }
    }

    /// Canonical loader path of an artifact built under this sandbox's root
    fn resolve_artifact(&self, artifact: &Artifact) -> std::result::Result<PathBuf, String> {
        let (Some(loader), Some(binary)) = (
            artifact.loader_path.as_deref(),
            artifact.binary_path.as_deref(),
        ) else {
            return Err(
                "artifact has no files on disk; it was not produced by a real build".to_string(),
            );
        };

        let (Ok(loader), Ok(binary)) = (fs::canonicalize(loader), fs::canonicalize(binary)) else {
            return Err(format!(
                "artifact files not found (wasm: {}, js: {})",
                binary.display(),
                loader.display()
            ));
        };
        if !loader.is_file() || !binary.is_file() {
            return Err("artifact paths are not regular files".to_string());
        }

        let build_dir = loader.parent();
        let is_build_dir = build_dir
            .and_then(Path::file_name)
            .and_then(OsStr::to_str)
            .is_some_and(|name| name.starts_with(&format!("{BUILD_DIR_PREFIX}-")));
        let accepted = is_build_dir
            && loader.file_name() == Some(OsStr::new(LOADER_NAME))
            && binary.file_name() == Some(OsStr::new(BINARY_NAME))
            && binary.parent() == build_dir
            && build_dir.and_then(Path::parent) == Some(self.scratch_root.as_path());
        if !accepted {
            return Err(format!(
                "artifact {} was not produced by this build service",
                loader.display()
            ));
        }
        Ok(loader)
    }

    async fn execute_in_host(
        &self,
        loader: &Path,
        stdin: &str,
        start_time: Instant,
    ) -> Result<ExecutionOutcome> {
        // Removed on every path when the guard goes out of scope
        let scratch = ScratchDir::create(&self.scratch_root, "run")?;
        let wrapper_path = scratch.join(WRAPPER_NAME);
        let config_path = scratch.join(CONFIG_NAME);

        let config = WrapperConfig {
            loader_path: std::path::absolute(loader)?,
            export_name: EXPORT_NAME.to_string(),
            stdin: stdin.to_string(),
            max_output_bytes: self.limits.max_output_bytes,
            poll_interval_ms: millis(self.tuning.poll_interval),
            quiescence_ms: millis(self.tuning.quiescence),
            fallback_ms: millis(self.tuning.fallback),
        };
        fs::write(&wrapper_path, WRAPPER_SOURCE)
            .with_context(|| format!("Failed to write {}", wrapper_path.display()))?;
        fs::write(&config_path, serde_json::to_vec(&config)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        let mut cmd = Command::new(&self.host_runtime);
        cmd.arg(format!("--max-old-space-size={}", self.limits.max_memory_mb))
            .arg(&wrapper_path)
            .arg(&config_path)
            .current_dir(loader.parent().unwrap_or(scratch.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", self.host_runtime.display()))?;
        log::debug!(
            target: "cppbox::run",
            "Started wrapper (pid {:?}) for {}",
            child.id(),
            loader.display()
        );

        let events = child.stdout.take().context("wrapper stdout was not captured")?;
        let raw_stderr = capture_pipe(child.stderr.take(), self.limits.max_output_bytes);
        let mut capture = Capture::new(self.limits.max_output_bytes);

        let read_result = timeout(self.limits.max_execution_time, capture.read_events(events)).await;

        let status = match read_result {
            Err(_) => {
                terminate(&mut child).await;
                let _ = collect_pipe(raw_stderr).await;
                log::warn!(
                    target: "cppbox::run",
                    "Execution exceeded {} ms and was killed",
                    self.limits.max_execution_time.as_millis()
                );
                let stderr = format!(
                    "{}\nerror: execution time limit exceeded ({} ms)",
                    capture.stderr,
                    self.limits.max_execution_time.as_millis()
                );
                let memory_kb = capture.memory_kb();
                return Ok(ExecutionOutcome::timed_out(
                    capture.stdout,
                    stderr.trim_start().to_string(),
                    start_time.elapsed(),
                    memory_kb,
                ));
            }
            Ok(read) => {
                if let Err(e) = read {
                    log::warn!(target: "cppbox::run", "Failed to read wrapper output: {e}");
                }
                match timeout(EXIT_GRACE, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        terminate(&mut child).await;
                        None
                    }
                }
            }
        };
        let raw_stderr = collect_pipe(raw_stderr).await;
        let execution_time = start_time.elapsed();

        Ok(self.classify(capture, status.map(exit_code), raw_stderr, execution_time))
    }

    fn classify(
        &self,
        mut capture: Capture,
        process_code: Option<i32>,
        raw_stderr: String,
        execution_time: Duration,
    ) -> ExecutionOutcome {
        if capture.truncated {
            capture.stdout.push_str(TRUNCATION_MARKER);
        }
        let memory_kb = capture.memory_kb();

        let Some(report) = capture.exit.take() else {
            // The wrapper died before reporting, e.g. the loader failed to parse
            let code = process_code.filter(|c| *c != 0).unwrap_or(1);
            log::warn!(target: "cppbox::run", "Wrapper exited without a report (code {code})");
            let mut stderr = capture.stderr;
            stderr.push_str(&raw_stderr);
            return ExecutionOutcome::finished(capture.stdout, stderr, code, execution_time, 0);
        };

        log::info!(
            target: "cppbox::run",
            "Program finished by {:?} with code {} in {} ms",
            report.reason,
            report.code,
            execution_time.as_millis()
        );

        let mut stderr = capture.stderr;
        match report.reason {
            CompletionReason::Fallback => {
                stderr.push_str(&format!(
                    "error: program did not finish within {} ms",
                    self.tuning.fallback.as_millis()
                ));
                return ExecutionOutcome::timed_out(
                    capture.stdout,
                    stderr,
                    execution_time,
                    memory_kb,
                );
            }
            CompletionReason::Abort | CompletionReason::Error => {
                if let Some(message) = &report.message {
                    stderr.push_str(&format!("program aborted: {message}\n"));
                }
                stderr.push_str(&raw_stderr);
            }
            CompletionReason::Exit | CompletionReason::Quiescence => {}
        }

        ExecutionOutcome::finished(
            capture.stdout,
            stderr,
            report.code,
            execution_time,
            memory_kb,
        )
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
