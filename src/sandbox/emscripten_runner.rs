use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::Config;
use crate::toolchain::ToolchainDescriptor;

use super::runner::{BuildRunner, RunnerKind};
use super::{Artifact, BuildService, CompileOptions, CompileOutcome, ExecutionOutcome, RunSandbox};

/// Real backend: em++ for builds, the host runtime for execution
pub struct EmscriptenRunner {
    builder: BuildService,
    sandbox: RunSandbox,
}

impl EmscriptenRunner {
    pub fn build(toolchain: Arc<ToolchainDescriptor>, config: &Config) -> Result<Self> {
        let host_runtime = toolchain
            .host_runtime
            .clone()
            .context("toolchain has no host runtime")?;
        let builder = BuildService::build(toolchain, &config.build, config.scratch_dir.as_deref())?;
        // Runs share the build root so `cleanup` covers both
        let sandbox = RunSandbox::build(
            host_runtime,
            config.execution.limits(),
            config.execution.tuning(),
            Some(builder.scratch_root()),
        )?;
        Ok(Self { builder, sandbox })
    }
}

#[async_trait]
impl BuildRunner for EmscriptenRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Emscripten
    }

    async fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutcome {
        self.builder.compile(source, options).await
    }

    async fn execute(&self, artifact: &Artifact, stdin: &str) -> ExecutionOutcome {
        self.sandbox.execute(artifact, stdin).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.builder.cleanup()
    }
}
