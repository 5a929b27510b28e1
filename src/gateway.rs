use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::sandbox::{
    Artifact, BuildRunner, CompileOptions, CompileOutcome, ExecutionOutcome, MockRunner,
    RunnerKind, create_build_runner,
};
use crate::toolchain::{ToolchainDescriptor, ToolchainLocator};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub available: bool,
    pub using_bundled_toolchain: bool,
    pub errors: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    pub source_code: String,
    #[serde(default)]
    pub options: CompileOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompileResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasm_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub js_path: Option<PathBuf>,
    /// Base64 of the wasm module
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wasm_binary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<String>,
    pub compile_time_ms: u64,
}

impl From<CompileOutcome> for CompileResponse {
    fn from(outcome: CompileOutcome) -> Self {
        let success = outcome.success();
        let errors = outcome.diagnostics().map(str::to_string);
        let warnings = outcome.warnings().map(str::to_string);
        let compile_time_ms = as_millis(outcome.compile_time());
        let artifact = outcome.into_artifact();
        Self {
            success,
            wasm_path: artifact.as_ref().and_then(|a| a.binary_path.clone()),
            js_path: artifact.as_ref().and_then(|a| a.loader_path.clone()),
            wasm_binary: artifact.map(|a| BASE64.encode(a.binary)),
            errors,
            warnings,
            compile_time_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub wasm_path: Option<PathBuf>,
    #[serde(default)]
    pub js_path: Option<PathBuf>,
    #[serde(default)]
    pub wasm_binary: Option<String>,
    #[serde(default)]
    pub stdin: String,
}

impl ExecuteRequest {
    /// Reuses the artifact reported by a successful compile
    pub fn for_compiled(compiled: &CompileResponse, stdin: impl Into<String>) -> Self {
        Self {
            wasm_path: compiled.wasm_path.clone(),
            js_path: compiled.js_path.clone(),
            wasm_binary: compiled.wasm_binary.clone(),
            stdin: stdin.into(),
        }
    }

    fn to_artifact(&self) -> Result<Artifact> {
        if self.wasm_path.is_none() && self.js_path.is_none() && self.wasm_binary.is_none() {
            anyhow::bail!("no artifact supplied: expected wasmPath/jsPath or wasmBinary");
        }
        let binary = match &self.wasm_binary {
            Some(encoded) => BASE64
                .decode(encoded)
                .context("wasmBinary is not valid base64")?,
            None => Vec::new(),
        };
        Ok(Artifact {
            binary,
            binary_path: self.wasm_path.clone(),
            loader_path: self.js_path.clone(),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    #[serde(rename = "memoryUsageKB")]
    pub memory_usage_kb: u64,
    pub terminated: bool,
}

impl From<ExecutionOutcome> for ExecuteResponse {
    fn from(outcome: ExecutionOutcome) -> Self {
        Self {
            exit_code: outcome.exit_code(),
            terminated: outcome.terminated(),
            execution_time_ms: as_millis(outcome.execution_time),
            memory_usage_kb: outcome.memory_usage_kb,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CleanupResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Single entry point for availability, compile, execute and cleanup requests
///
/// The backend is picked lazily on first use and kept until [`cleanup`],
/// after which the next request probes the toolchain again. No method
/// returns an error; every failure is a field of the response.
///
/// [`cleanup`]: RequestGateway::cleanup
pub struct RequestGateway {
    config: Config,
    locator: Arc<ToolchainLocator>,
    runner: Mutex<Option<Arc<dyn BuildRunner>>>,
}

impl RequestGateway {
    pub fn new(config: Config, locator: Arc<ToolchainLocator>) -> Self {
        Self {
            config,
            locator,
            runner: Mutex::new(None),
        }
    }

    /// Builds a gateway with its own locator from `config`
    pub fn from_config(config: Config) -> Self {
        let locator = Arc::new(ToolchainLocator::new(config.toolchain.clone()));
        Self::new(config, locator)
    }

    pub fn locator(&self) -> &ToolchainLocator {
        &self.locator
    }

    pub async fn check_availability(&self) -> AvailabilityResponse {
        match self.descriptor().await {
            Ok(descriptor) => AvailabilityResponse {
                available: descriptor.available,
                using_bundled_toolchain: descriptor.available && descriptor.is_bundled(),
                errors: descriptor.problems.clone(),
            },
            Err(e) => AvailabilityResponse {
                available: false,
                using_bundled_toolchain: false,
                errors: vec![format!("{e:#}")],
            },
        }
    }

    pub async fn compile(&self, request: &CompileRequest) -> CompileResponse {
        let runner = self.runner().await;
        log::debug!(
            target: "cppbox::gateway",
            "compile: {} bytes via {:?}",
            request.source_code.len(),
            runner.kind()
        );
        runner
            .compile(&request.source_code, &request.options)
            .await
            .into()
    }

    pub async fn execute(&self, request: &ExecuteRequest) -> ExecuteResponse {
        let artifact = match request.to_artifact() {
            Ok(artifact) => artifact,
            Err(e) => {
                log::info!(target: "cppbox::gateway", "execute rejected: {e:#}");
                return ExecutionOutcome::rejected(format!("{e:#}"), Duration::ZERO).into();
            }
        };
        let runner = self.runner().await;
        runner.execute(&artifact, &request.stdin).await.into()
    }

    /// Tears down the active backend and forgets the located toolchain
    pub async fn cleanup(&self) -> CleanupResponse {
        let runner = self.runner.lock().await.take();
        self.locator.clear();

        let Some(runner) = runner else {
            return CleanupResponse {
                success: true,
                error: None,
            };
        };
        match runner.cleanup().await {
            Ok(()) => {
                log::info!(target: "cppbox::gateway", "Cleaned up {:?} runner", runner.kind());
                CleanupResponse {
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                log::error!(target: "cppbox::gateway", "Cleanup failed: {e:#}");
                CleanupResponse {
                    success: false,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    /// Kind of the active backend, initializing it if needed
    pub async fn runner_kind(&self) -> RunnerKind {
        self.runner().await.kind()
    }

    async fn runner(&self) -> Arc<dyn BuildRunner> {
        let mut slot = self.runner.lock().await;
        if let Some(runner) = slot.as_ref() {
            return Arc::clone(runner);
        }

        let runner = match self
            .descriptor()
            .await
            .and_then(|descriptor| create_build_runner(descriptor, &self.config))
        {
            Ok(runner) => runner,
            Err(e) => {
                log::error!(
                    target: "cppbox::gateway",
                    "Failed to set up the toolchain backend, using mock: {e:#}"
                );
                Arc::new(MockRunner::build(&self.config))
            }
        };
        *slot = Some(Arc::clone(&runner));
        runner
    }

    /// Discovery touches the filesystem and may run `--version`
    async fn descriptor(&self) -> Result<Arc<ToolchainDescriptor>> {
        let locator = Arc::clone(&self.locator);
        tokio::task::spawn_blocking(move || locator.locate())
            .await
            .context("toolchain discovery did not complete")
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
