use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::BuildConfig;
use crate::toolchain::ToolchainDescriptor;

use super::process::{capture_pipe, collect_pipe, exit_code, isolate_process_group, terminate};
use super::scratch::{ScratchDir, setup_scratch_root};
use super::{Artifact, CompileOptions, CompileOutcome, SourceValidator};

const SOURCE_NAME: &str = "main.cpp";
/// Prefix of every build directory under the scratch root
pub(super) const BUILD_DIR_PREFIX: &str = "build";
pub(super) const LOADER_NAME: &str = "main.js";
pub(super) const BINARY_NAME: &str = "main.wasm";
/// Export name the run wrapper expects from the loader module
pub const EXPORT_NAME: &str = "EmscriptenModule";
/// Upper bound on captured compiler output per stream
const DIAGNOSTIC_LIMIT: usize = 256 * 1024;

/// Flags every build gets: wasm output, a modularized node loader, a virtual
/// filesystem for stdio, and the C++ runtime.
const TARGET_FLAGS: &[&str] = &[
    "-sWASM=1",
    "-sALLOW_MEMORY_GROWTH=1",
    "-sMODULARIZE=1",
    "-sEXPORT_NAME=EmscriptenModule",
    "-sENVIRONMENT=node",
    "-sEXPORTED_FUNCTIONS=[\"_main\"]",
    "-sFILESYSTEM=1",
    "-sFORCE_FILESYSTEM=1",
    "-sINVOKE_RUN=1",
    "-sEXIT_RUNTIME=1",
    "-sDISABLE_EXCEPTION_CATCHING=0",
    "-lstdc++",
];

/// Paths used during compilation
#[derive(Debug)]
struct CompilationPaths {
    source: PathBuf,
    loader: PathBuf,
    binary: PathBuf,
}

impl CompilationPaths {
    fn in_dir(dir: &Path) -> Self {
        Self {
            source: dir.join(SOURCE_NAME),
            loader: dir.join(LOADER_NAME),
            binary: dir.join(BINARY_NAME),
        }
    }
}

/// What the compiler process did
enum CompilerExit {
    Finished {
        code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        stdout: String,
        stderr: String,
    },
    SpawnFailed(std::io::Error),
}

/// Turns C++ source into a wasm module plus its node loader
///
/// Each call gets its own scratch directory. Failed builds remove theirs
/// immediately; successful ones keep it so the artifact survives until it is
/// run, and [`BuildService::cleanup`] removes everything.
pub struct BuildService {
    toolchain: Arc<ToolchainDescriptor>,
    validator: SourceValidator,
    scratch_root: PathBuf,
    compile_timeout: Duration,
}

impl BuildService {
    pub fn build(
        toolchain: Arc<ToolchainDescriptor>,
        config: &BuildConfig,
        scratch_root: Option<&Path>,
    ) -> Result<Self> {
        let scratch_root = setup_scratch_root(scratch_root)?;
        log::debug!(
            target: "cppbox::build",
            "BuildService using scratch root {}",
            scratch_root.display()
        );
        Ok(Self {
            toolchain,
            validator: SourceValidator::new(config.max_source_size.as_usize()),
            scratch_root,
            compile_timeout: config.compile_timeout.into(),
        })
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Compiles `source` and reports the outcome; never returns an error
    pub async fn compile(&self, source: &str, options: &CompileOptions) -> CompileOutcome {
        let start_time = Instant::now();

        if let Err(e) = self
            .validator
            .validate(source)
            .and_then(|()| self.validator.validate_options(options))
        {
            log::info!(target: "cppbox::build", "Rejected source: {e}");
            return CompileOutcome::failed(e.to_string(), None, start_time.elapsed());
        }

        match self.compile_validated(source, options, start_time).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!(target: "cppbox::build", "Compilation setup failed: {e:#}");
                CompileOutcome::failed(
                    format!("compilation failed: {e:#}"),
                    None,
                    start_time.elapsed(),
                )
            }
        }
    }

    async fn compile_validated(
        &self,
        source: &str,
        options: &CompileOptions,
        start_time: Instant,
    ) -> Result<CompileOutcome> {
        // Dropping the guard on any early return removes the directory
        let scratch = ScratchDir::create(&self.scratch_root, BUILD_DIR_PREFIX)?;
        let paths = CompilationPaths::in_dir(scratch.path());
        fs::write(&paths.source, source)
            .with_context(|| format!("Failed to write {}", paths.source.display()))?;

        let args = self.build_args(&paths.source, &paths.loader, options);
        let exit = self.execute_compile_command(&args, scratch.path()).await;
        let compile_time = start_time.elapsed();

        let (stdout, stderr) = match exit {
            CompilerExit::Finished {
                code: 0,
                stdout,
                stderr,
            } => (stdout, stderr),
            CompilerExit::Finished {
                code,
                stdout,
                stderr,
            } => {
                log::info!(target: "cppbox::build", "Compiler exited with code {code}");
                let diagnostics = if stderr.trim().is_empty() {
                    format!("compilation failed (exit code {code})")
                } else {
                    stderr
                };
                return Ok(CompileOutcome::failed(diagnostics, Some(stdout), compile_time));
            }
            CompilerExit::TimedOut { stdout, stderr } => {
                log::warn!(
                    target: "cppbox::build",
                    "Compilation exceeded {} ms and was killed",
                    self.compile_timeout.as_millis()
                );
                let diagnostics = format!(
                    "{stderr}\ncompilation timed out after {} ms",
                    self.compile_timeout.as_millis()
                );
                return Ok(CompileOutcome::failed(
                    diagnostics.trim_start().to_string(),
                    Some(stdout),
                    compile_time,
                ));
            }
            CompilerExit::SpawnFailed(e) => {
                log::error!(
                    target: "cppbox::build",
                    "Failed to spawn {}: {e}",
                    self.toolchain.compiler.display()
                );
                return Ok(CompileOutcome::failed(
                    format!(
                        "failed to start compiler {}: {e}",
                        self.toolchain.compiler.display()
                    ),
                    None,
                    compile_time,
                ));
            }
        };

        let binary_exists = paths.binary.is_file();
        let loader_exists = paths.loader.is_file();
        if !binary_exists || !loader_exists {
            log::error!(
                target: "cppbox::build",
                "Compiler succeeded but outputs are missing (wasm: {binary_exists}, js: {loader_exists})"
            );
            return Ok(CompileOutcome::failed(
                format!(
                    "compiler produced no artifact (wasm: {binary_exists}, js: {loader_exists})"
                ),
                Some(stderr),
                compile_time,
            ));
        }

        let binary = fs::read(&paths.binary)
            .with_context(|| format!("Failed to read {}", paths.binary.display()))?;

        let dir = scratch.retain();
        log::info!(
            target: "cppbox::build",
            "Compiled {} bytes of wasm in {} ms, kept in {}",
            binary.len(),
            compile_time.as_millis(),
            dir.display()
        );

        Ok(CompileOutcome::succeeded(
            Artifact {
                binary,
                binary_path: Some(paths.binary),
                loader_path: Some(paths.loader),
            },
            Some(stderr),
            compile_time,
        ))
    }

    /// Builds the compiler argument vector, program first
    pub fn build_args(
        &self,
        source: &Path,
        loader: &Path,
        options: &CompileOptions,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.toolchain.compiler.clone().into_os_string(),
            source.as_os_str().to_owned(),
            "-o".into(),
            loader.as_os_str().to_owned(),
            format!("-std={}", options.standard.as_str()).into(),
            format!("-{}", options.optimization.as_str()).into(),
        ];

        if options.warnings {
            args.push("-Wall".into());
            args.push("-Wextra".into());
        }
        if options.debug {
            args.push("-g".into());
        }

        args.extend(TARGET_FLAGS.iter().map(OsString::from));

        for include in options.includes.iter().flatten() {
            args.push(format!("-I{include}").into());
        }
        for lib in options.libraries.iter().flatten() {
            args.push(format!("-l{lib}").into());
        }

        args
    }

    /// Runs the compiler under the compile budget
    async fn execute_compile_command(&self, args: &[OsString], work_dir: &Path) -> CompilerExit {
        let (program, rest) = match args.split_first() {
            Some(split) => split,
            None => {
                return CompilerExit::SpawnFailed(std::io::Error::other("empty compile command"));
            }
        };

        // .bat wrappers only run through the command interpreter
        let mut cmd = if cfg!(windows) && Path::new(program).extension().is_some_and(|e| e == "bat")
        {
            let mut cmd = Command::new("cmd.exe");
            cmd.arg("/c").arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(rest)
            .envs(self.toolchain.environment().iter().map(|(k, v)| (k, v)))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        log::debug!(target: "cppbox::build", "Running {:?}", args);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return CompilerExit::SpawnFailed(e),
        };
        let stdout = capture_pipe(child.stdout.take(), DIAGNOSTIC_LIMIT);
        let stderr = capture_pipe(child.stderr.take(), DIAGNOSTIC_LIMIT);

        match timeout(self.compile_timeout, child.wait()).await {
            Ok(Ok(status)) => CompilerExit::Finished {
                code: exit_code(status),
                stdout: collect_pipe(stdout).await,
                stderr: collect_pipe(stderr).await,
            },
            Ok(Err(e)) => {
                terminate(&mut child).await;
                CompilerExit::SpawnFailed(e)
            }
            Err(_) => {
                terminate(&mut child).await;
                CompilerExit::TimedOut {
                    stdout: collect_pipe(stdout).await,
                    stderr: collect_pipe(stderr).await,
                }
            }
        }
    }

    /// Removes every scratch directory this service created
    pub fn cleanup(&self) -> Result<()> {
        if self.scratch_root.exists() {
            fs::remove_dir_all(&self.scratch_root).with_context(|| {
                format!("Failed to remove {}", self.scratch_root.display())
            })?;
            log::info!(
                target: "cppbox::build",
                "Removed scratch root {}",
                self.scratch_root.display()
            );
        }
        Ok(())
    }
}
