mod compile;
mod emscripten_runner;
mod execute;
mod mock_runner;
mod process;
mod runner;
mod scratch;
mod validate;

pub use compile::BuildService;
pub use emscripten_runner::EmscriptenRunner;
pub use execute::{
    CompletionReason, ExitReport, RunSandbox, TRUNCATION_MARKER, WrapperConfig, WrapperEvent,
};
pub use mock_runner::{MOCK_WASM_HEADER, MockRunner};
pub use runner::{BuildRunner, RunnerKind};
pub use scratch::ScratchDir;
pub use validate::{SourceValidator, ValidationError};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::toolchain::ToolchainDescriptor;

/// Exit code reported when an execution is stopped by its time budget
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when an execution is refused before spawning anything
pub const EXIT_REJECTED: i32 = -1;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LanguageStandard {
    #[serde(rename = "c++11")]
    #[value(name = "c++11")]
    Cpp11,
    #[serde(rename = "c++14")]
    #[value(name = "c++14")]
    Cpp14,
    #[default]
    #[serde(rename = "c++17")]
    #[value(name = "c++17")]
    Cpp17,
    #[serde(rename = "c++20")]
    #[value(name = "c++20")]
    Cpp20,
}

impl LanguageStandard {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpp11 => "c++11",
            Self::Cpp14 => "c++14",
            Self::Cpp17 => "c++17",
            Self::Cpp20 => "c++20",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OptimizationLevel {
    #[default]
    #[value(name = "O0")]
    O0,
    #[value(name = "O1")]
    O1,
    #[value(name = "O2")]
    O2,
    #[value(name = "O3")]
    O3,
}

impl OptimizationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::O0 => "O0",
            Self::O1 => "O1",
            Self::O2 => "O2",
            Self::O3 => "O3",
        }
    }
}

/// Compiler settings for a single request
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    #[serde(default)]
    pub standard: LanguageStandard,
    #[serde(default)]
    pub optimization: OptimizationLevel,
    #[serde(default)]
    pub warnings: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub includes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libraries: Option<Vec<String>>,
}

/// A compiled program: the wasm binary plus, for real builds, the files on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub binary: Vec<u8>,
    pub binary_path: Option<PathBuf>,
    pub loader_path: Option<PathBuf>,
}

/// Result of compilation process
///
/// `success` and the presence of `artifact` always agree; build one through
/// [`CompileOutcome::succeeded`] or [`CompileOutcome::failed`].
#[derive(Debug, Clone)]
pub struct CompileOutcome {
    success: bool,
    artifact: Option<Artifact>,
    diagnostics: Option<String>,
    warnings: Option<String>,
    compile_time: Duration,
}

impl CompileOutcome {
    pub fn succeeded(artifact: Artifact, warnings: Option<String>, compile_time: Duration) -> Self {
        Self {
            success: true,
            artifact: Some(artifact),
            diagnostics: None,
            warnings: warnings.filter(|w| !w.trim().is_empty()),
            compile_time,
        }
    }

    pub fn failed(
        diagnostics: impl Into<String>,
        warnings: Option<String>,
        compile_time: Duration,
    ) -> Self {
        Self {
            success: false,
            artifact: None,
            diagnostics: Some(diagnostics.into()),
            warnings: warnings.filter(|w| !w.trim().is_empty()),
            compile_time,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn into_artifact(self) -> Option<Artifact> {
        self.artifact
    }

    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }

    pub fn warnings(&self) -> Option<&str> {
        self.warnings.as_deref()
    }

    pub fn compile_time(&self) -> Duration {
        self.compile_time
    }
}

/// Result of a single program execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    exit_code: i32,
    pub execution_time: Duration,
    /// Rough estimate, never used for enforcement
    pub memory_usage_kb: u64,
    terminated: bool,
}

impl ExecutionOutcome {
    pub fn finished(
        stdout: String,
        stderr: String,
        exit_code: i32,
        execution_time: Duration,
        memory_usage_kb: u64,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            execution_time,
            memory_usage_kb,
            terminated: false,
        }
    }

    /// Stopped by a budget; the exit code is always [`EXIT_TIMEOUT`]
    pub fn timed_out(
        stdout: String,
        stderr: String,
        execution_time: Duration,
        memory_usage_kb: u64,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: EXIT_TIMEOUT,
            execution_time,
            memory_usage_kb,
            terminated: true,
        }
    }

    /// Refused before any process was spawned
    pub fn rejected(reason: impl Into<String>, execution_time: Duration) -> Self {
        Self::finished(
            String::new(),
            reason.into(),
            EXIT_REJECTED,
            execution_time,
            0,
        )
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }
}

/// Budgets applied to every execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_memory_mb: u32,
    pub max_execution_time: Duration,
    pub max_output_bytes: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 64,
            max_execution_time: Duration::from_millis(5_000),
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Tunables of the completion heuristic inside the wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionTuning {
    pub poll_interval: Duration,
    pub quiescence: Duration,
    pub fallback: Duration,
}

impl Default for CompletionTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            quiescence: Duration::from_millis(200),
            fallback: Duration::from_millis(2_000),
        }
    }
}

/// Creates a build runner for the located toolchain
///
/// A usable toolchain yields an [`EmscriptenRunner`]; an unavailable one, or
/// `force_mock` in the configuration, yields a [`MockRunner`] so callers keep
/// the same contract without a compiler installed.
pub fn create_build_runner(
    toolchain: Arc<ToolchainDescriptor>,
    config: &Config,
) -> Result<Arc<dyn BuildRunner>> {
    if toolchain.available && !config.toolchain.force_mock {
        log::info!(
            target: "cppbox::gateway",
            "Creating EmscriptenRunner ({} toolchain {}, {})",
            toolchain.source,
            toolchain.version,
            toolchain.compiler.display()
        );
        let runner = EmscriptenRunner::build(toolchain, config)?;
        Ok(Arc::new(runner))
    } else {
        if config.toolchain.force_mock {
            log::info!(target: "cppbox::gateway", "Creating MockRunner (mock mode forced)");
        } else {
            log::info!(
                target: "cppbox::gateway",
                "Creating MockRunner (toolchain unavailable: {})",
                toolchain.problems.join("; ")
            );
        }
        let runner = MockRunner::build(config);
        Ok(Arc::new(runner))
    }
}
