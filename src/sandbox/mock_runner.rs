use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;

use super::runner::{BuildRunner, RunnerKind};
use super::{Artifact, CompileOptions, CompileOutcome, ExecutionOutcome, SourceValidator};

/// `\0asm` magic followed by binary format version 1
pub const MOCK_WASM_HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

const MOCK_WARNING: &str = "mock compiler: warnings were requested but no real compiler is installed";
const MOCK_NOTE: &str = "(This is a mock execution - the compiler toolchain is not installed)";
const MOCK_MEMORY_KB: u64 = 512;
/// Mock compiles take this many latency units
const COMPILE_LATENCY_FACTOR: u32 = 3;

/// Simulated backend used when no toolchain is available
///
/// Validation is identical to the real backend, so rejected sources produce
/// the same diagnostics in both modes.
pub struct MockRunner {
    validator: SourceValidator,
    latency: Duration,
    max_input_bytes: usize,
}

impl MockRunner {
    pub fn build(config: &Config) -> Self {
        Self {
            validator: SourceValidator::new(config.build.max_source_size.as_usize()),
            latency: config.mock.latency.into(),
            max_input_bytes: config.execution.max_output_size.as_usize(),
        }
    }
}

#[async_trait]
impl BuildRunner for MockRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Mock
    }

    async fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutcome {
        let start_time = Instant::now();

        if let Err(e) = self
            .validator
            .validate(source)
            .and_then(|()| self.validator.validate_options(options))
        {
            log::info!(target: "cppbox::build", "Rejected source (mock): {e}");
            return CompileOutcome::failed(e.to_string(), None, start_time.elapsed());
        }

        tokio::time::sleep(self.latency * COMPILE_LATENCY_FACTOR).await;

        let warnings = options.warnings.then(|| MOCK_WARNING.to_string());
        log::debug!(target: "cppbox::build", "Mock compile finished");
        CompileOutcome::succeeded(
            Artifact {
                binary: MOCK_WASM_HEADER.to_vec(),
                binary_path: None,
                loader_path: None,
            },
            warnings,
            start_time.elapsed(),
        )
    }

    async fn execute(&self, _artifact: &Artifact, stdin: &str) -> ExecutionOutcome {
        let start_time = Instant::now();

        if stdin.len() > self.max_input_bytes {
            return ExecutionOutcome::rejected(
                format!(
                    "input is too large ({} bytes, limit {} bytes)",
                    stdin.len(),
                    self.max_input_bytes
                ),
                start_time.elapsed(),
            );
        }

        tokio::time::sleep(self.latency).await;

        let mut stdout = String::from("Hello, World!\n");
        if !stdin.is_empty() {
            stdout.push_str(&format!("Input: {stdin}\n"));
        }
        stdout.push_str(MOCK_NOTE);
        stdout.push('\n');

        ExecutionOutcome::finished(
            stdout,
            String::new(),
            0,
            start_time.elapsed(),
            MOCK_MEMORY_KB,
        )
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
