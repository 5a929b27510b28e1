use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::{Artifact, CompileOptions, CompileOutcome, ExecutionOutcome};

/// Which implementation sits behind a [`BuildRunner`]
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Emscripten,
    Mock,
}

/// Trait for the compile-and-run backends
///
/// This trait abstracts the two operations a request needs, so the gateway
/// works the same against a real Emscripten toolchain and against the
/// simulated backend used when no toolchain is installed. Neither operation
/// returns an error: failures are folded into the outcome values.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Validates and compiles a single C++ translation unit
    async fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutcome;

    /// Runs a previously compiled artifact with the given standard input
    async fn execute(&self, artifact: &Artifact, stdin: &str) -> ExecutionOutcome;

    /// Releases everything the runner holds on disk
    async fn cleanup(&self) -> Result<()>;
}
