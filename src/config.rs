use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::sandbox::{
    CompileOptions, CompletionTuning, ExecutionLimits, LanguageStandard, OptimizationLevel,
};

#[derive(Parser)]
#[command(name = "cppbox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', global = true)]
    pub config_path: Option<PathBuf>,

    /// Always answer with the mock engine, even if a toolchain is installed
    #[arg(long = "mock", global = true, default_value_t = false)]
    pub force_mock: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand)]
pub enum CliCommand {
    /// Report whether a compiler toolchain and host runtime were found
    Check,
    /// Compile a C++ source file and print the outcome as JSON
    Compile {
        /// C++ source file
        source: PathBuf,
        #[command(flatten)]
        options: CompileArgs,
    },
    /// Compile a C++ source file and run it
    Run {
        /// C++ source file
        source: PathBuf,
        /// Text fed to the program's standard input
        #[arg(long, conflicts_with = "stdin_file")]
        stdin: Option<String>,
        /// File whose content is fed to the program's standard input
        #[arg(long)]
        stdin_file: Option<PathBuf>,
        #[command(flatten)]
        options: CompileArgs,
    },
    /// Answer JSON-lines requests on stdin/stdout
    Serve,
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    #[arg(long = "std", value_enum, default_value_t = LanguageStandard::Cpp17)]
    pub standard: LanguageStandard,
    #[arg(short = 'O', long = "opt", value_enum, default_value_t = OptimizationLevel::O0)]
    pub optimization: OptimizationLevel,
    /// Enable -Wall -Wextra
    #[arg(long, short = 'W', default_value_t = false)]
    pub warnings: bool,
    /// Emit debug info
    #[arg(long, short = 'g', default_value_t = false)]
    pub debug: bool,
    /// Additional include directory
    #[arg(short = 'I', long = "include")]
    pub includes: Vec<String>,
    /// Additional library to link
    #[arg(short = 'l', long = "lib")]
    pub libraries: Vec<String>,
}

impl From<CompileArgs> for CompileOptions {
    fn from(args: CompileArgs) -> Self {
        Self {
            standard: args.standard,
            optimization: args.optimization,
            warnings: args.warnings,
            debug: args.debug,
            includes: (!args.includes.is_empty()).then_some(args.includes),
            libraries: (!args.libraries.is_empty()).then_some(args.libraries),
        }
    }
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };
        config.toolchain.force_mock |= self.force_mock;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub toolchain: ToolchainConfig,
    pub build: BuildConfig,
    pub execution: ExecutionConfig,
    pub mock: MockConfig,
    /// Root for per-call scratch directories; defaults to the user cache dir
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Extra roots probed for a packaged toolchain, before the default ones
    pub bundle_roots: Vec<PathBuf>,
    /// Skip the built-in bundle roots
    pub skip_default_roots: bool,
    /// Explicit compiler executable, bypasses discovery
    pub compiler: Option<PathBuf>,
    /// Explicit host runtime (node) executable
    pub host_runtime: Option<PathBuf>,
    /// Look for `em++` and `node` on PATH
    pub search_system_path: bool,
    pub force_mock: bool,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            bundle_roots: Vec::new(),
            skip_default_roots: false,
            compiler: None,
            host_runtime: None,
            search_system_path: true,
            force_mock: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BuildConfig {
    pub compile_timeout: MilliSecond,
    pub max_source_size: ByteSize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compile_timeout: MilliSecond(30_000),
            max_source_size: ByteSize(100 * 1024),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_memory_mb: u32,
    pub max_execution_time: MilliSecond,
    pub max_output_size: ByteSize,
    /// How often the wrapper checks for output quiescence
    pub poll_interval: MilliSecond,
    /// Silence after the last output event that counts as completion
    pub quiescence: MilliSecond,
    /// Wrapper-internal deadline that forces completion
    pub fallback: MilliSecond,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 64,
            max_execution_time: MilliSecond(5_000),
            max_output_size: ByteSize(1024 * 1024),
            poll_interval: MilliSecond(50),
            quiescence: MilliSecond(200),
            fallback: MilliSecond(2_000),
        }
    }
}

impl ExecutionConfig {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_memory_mb: self.max_memory_mb,
            max_execution_time: self.max_execution_time.into(),
            max_output_bytes: self.max_output_size.as_usize(),
        }
    }

    pub fn tuning(&self) -> CompletionTuning {
        CompletionTuning {
            poll_interval: self.poll_interval.into(),
            quiescence: self.quiescence.into(),
            fallback: self.fallback.into(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MockConfig {
    /// Base unit of the artificial mock delays
    pub latency: MilliSecond,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            latency: MilliSecond(100),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(ms: MilliSecond) -> Self {
        Duration::from_millis(ms.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}
