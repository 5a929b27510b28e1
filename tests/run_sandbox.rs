#![cfg(unix)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use cppbox::sandbox::{
    Artifact, CompletionTuning, EXIT_REJECTED, EXIT_TIMEOUT, ExecutionLimits, MOCK_WASM_HEADER,
    RunSandbox,
};

use common::{find_on_path, write_script};

struct Fixture {
    dir: tempfile::TempDir,
    artifact: Artifact,
}

impl Fixture {
    /// An artifact whose loader is `loader_source`
    fn new(loader_source: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("runs").join("build-fixture");
        fs::create_dir_all(&build).unwrap();
        let loader = build.join("main.js");
        let binary = build.join("main.wasm");
        fs::write(&loader, loader_source).unwrap();
        fs::write(&binary, MOCK_WASM_HEADER).unwrap();
        Self {
            dir,
            artifact: Artifact {
                binary: MOCK_WASM_HEADER.to_vec(),
                binary_path: Some(binary),
                loader_path: Some(loader),
            },
        }
    }

    fn runs_root(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    /// Wrapper directories left under the scratch root
    fn run_dirs(&self) -> usize {
        fs::read_dir(self.runs_root())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .is_ok_and(|e| e.file_name().to_string_lossy().starts_with("run-"))
            })
            .count()
    }

    fn sandbox(&self, host_runtime: PathBuf, limits: ExecutionLimits) -> RunSandbox {
        self.sandbox_with_tuning(host_runtime, limits, CompletionTuning::default())
    }

    fn sandbox_with_tuning(
        &self,
        host_runtime: PathBuf,
        limits: ExecutionLimits,
        tuning: CompletionTuning,
    ) -> RunSandbox {
        RunSandbox::build(host_runtime, limits, tuning, Some(&self.runs_root())).unwrap()
    }

    fn fake_runtime(&self, body: &str) -> PathBuf {
        write_script(self.dir.path(), "node", body)
    }
}

fn limits(max_execution_ms: u64, max_output_bytes: usize) -> ExecutionLimits {
    ExecutionLimits {
        max_memory_mb: 64,
        max_execution_time: Duration::from_millis(max_execution_ms),
        max_output_bytes,
    }
}

#[tokio::test]
async fn test_clean_exit_reports_output() {
    let fixture = Fixture::new("");
    let runtime = fixture.fake_runtime(
        r#"printf '%s\n' '{"type":"stdout","data":"hi\n"}' '{"type":"stderr","data":"note\n"}' '{"type":"exit","code":0,"reason":"exit","memoryKb":2048}'"#,
    );
    let sandbox = fixture.sandbox(runtime, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.stdout, "hi\n");
    assert_eq!(outcome.stderr, "note\n");
    assert_eq!(outcome.exit_code(), 0);
    assert!(!outcome.terminated());
    assert_eq!(outcome.memory_usage_kb, 2048);

    // The wrapper directory is gone once the call returns
    assert_eq!(fixture.run_dirs(), 0);
}

#[tokio::test]
async fn test_wrapper_receives_config_and_stdin() {
    let fixture = Fixture::new("");
    let runtime = fixture.fake_runtime(
        r#"
case "$1" in --max-old-space-size=64) ;; *) exit 9 ;; esac
[ -f "$2" ] || exit 10
grep -q '"stdin":"1 2 3"' "$3" || exit 11
grep -q '"exportName":"EmscriptenModule"' "$3" || exit 12
printf '%s\n' '{"type":"exit","code":0,"reason":"exit"}'
"#,
    );
    let sandbox = fixture.sandbox(runtime, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "1 2 3").await;
    assert_eq!(outcome.exit_code(), 0, "stderr: {}", outcome.stderr);
}

#[tokio::test]
async fn test_time_budget_kills_the_program() {
    let fixture = Fixture::new("");
    let runtime = fixture.fake_runtime(
        r#"printf '%s\n' '{"type":"stdout","data":"partial\n"}'
sleep 30"#,
    );
    let sandbox = fixture.sandbox(runtime, limits(300, 1024));

    let started = Instant::now();
    let outcome = sandbox.execute(&fixture.artifact, "").await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(outcome.terminated());
    assert_eq!(outcome.exit_code(), EXIT_TIMEOUT);
    assert_eq!(outcome.stdout, "partial\n");
    assert!(outcome.stderr.contains("time limit exceeded"));
    assert_eq!(fixture.run_dirs(), 0);
}

#[tokio::test]
async fn test_fallback_completion_counts_as_timeout() {
    let fixture = Fixture::new("");
    let runtime = fixture
        .fake_runtime(r#"printf '%s\n' '{"type":"exit","code":124,"reason":"fallback"}'"#);
    let sandbox = fixture.sandbox(runtime, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert!(outcome.terminated());
    assert_eq!(outcome.exit_code(), EXIT_TIMEOUT);
}

#[tokio::test]
async fn test_output_is_truncated() {
    let fixture = Fixture::new("");
    let runtime = fixture.fake_runtime(
        r#"printf '%s\n' '{"type":"stdout","data":"0123456789"}' '{"type":"stdout","data":"0123456789"}' '{"type":"exit","code":0,"reason":"exit"}'"#,
    );
    let sandbox = fixture.sandbox(runtime, limits(5_000, 16));

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.stdout, "0123456789012345\n[output truncated]");
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn test_crash_without_report_keeps_stderr() {
    let fixture = Fixture::new("");
    let runtime = fixture.fake_runtime("echo 'SyntaxError: Unexpected token' >&2\nexit 3");
    let sandbox = fixture.sandbox(runtime, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.exit_code(), 3);
    assert!(!outcome.terminated());
    assert!(outcome.stderr.contains("SyntaxError"));
}

#[tokio::test]
async fn test_abort_carries_message() {
    let fixture = Fixture::new("");
    let runtime = fixture.fake_runtime(
        r#"printf '%s\n' '{"type":"exit","code":1,"reason":"abort","message":"Aborted(OOM)"}'"#,
    );
    let sandbox = fixture.sandbox(runtime, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.stderr.contains("Aborted(OOM)"));
}

#[tokio::test]
async fn test_rejections_spawn_nothing() {
    let fixture = Fixture::new("");
    let marker = fixture.dir.path().join("spawned");
    let runtime = fixture.fake_runtime(&format!("touch '{}'", marker.display()));
    let sandbox = fixture.sandbox(runtime, limits(5_000, 8));

    // Input above the ceiling
    let outcome = sandbox.execute(&fixture.artifact, "123456789").await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);
    assert!(!outcome.terminated());

    // No loader on disk
    let missing = Artifact {
        binary: MOCK_WASM_HEADER.to_vec(),
        binary_path: Some(Path::new("/nonexistent/main.wasm").to_path_buf()),
        loader_path: Some(Path::new("/nonexistent/main.js").to_path_buf()),
    };
    let outcome = sandbox.execute(&missing, "").await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);
    assert!(outcome.stderr.contains("not found"));

    // Mock artifact without files
    let bare = Artifact {
        binary: MOCK_WASM_HEADER.to_vec(),
        binary_path: None,
        loader_path: None,
    };
    let outcome = sandbox.execute(&bare, "").await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);

    assert!(!marker.exists());
}

#[tokio::test]
async fn test_foreign_loader_is_never_run() {
    let fixture = Fixture::new("");
    let marker = fixture.dir.path().join("spawned");
    let runtime = fixture.fake_runtime(&format!("touch '{}'", marker.display()));
    let sandbox = fixture.sandbox(runtime, ExecutionLimits::default());
    let binary = fixture.artifact.binary_path.clone();

    // A script the caller wrote anywhere on disk
    let evil = fixture.dir.path().join("evil.js");
    fs::write(&evil, "require('fs').writeFileSync('pwned', '');").unwrap();
    let outside = Artifact {
        loader_path: Some(evil),
        ..fixture.artifact.clone()
    };
    let outcome = sandbox.execute(&outside, "").await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);
    assert!(!outcome.terminated());
    assert!(outcome.stderr.contains("not produced by this build service"));

    // Right directory, wrong file name
    let renamed = fixture.runs_root().join("build-fixture").join("other.js");
    fs::write(&renamed, "").unwrap();
    let outcome = sandbox
        .execute(
            &Artifact {
                loader_path: Some(renamed),
                ..fixture.artifact.clone()
            },
            "",
        )
        .await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);

    // Loader and binary from different builds
    let sibling = fixture.runs_root().join("build-sibling");
    fs::create_dir(&sibling).unwrap();
    fs::write(sibling.join("main.wasm"), MOCK_WASM_HEADER).unwrap();
    let outcome = sandbox
        .execute(
            &Artifact {
                binary_path: Some(sibling.join("main.wasm")),
                ..fixture.artifact.clone()
            },
            "",
        )
        .await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);

    // A build directory outside the scratch root
    let stray = fixture.dir.path().join("build-stray");
    fs::create_dir(&stray).unwrap();
    fs::write(stray.join("main.js"), "").unwrap();
    fs::write(stray.join("main.wasm"), MOCK_WASM_HEADER).unwrap();
    let outcome = sandbox
        .execute(
            &Artifact {
                binary: MOCK_WASM_HEADER.to_vec(),
                binary_path: Some(stray.join("main.wasm")),
                loader_path: Some(stray.join("main.js")),
            },
            "",
        )
        .await;
    assert_eq!(outcome.exit_code(), EXIT_REJECTED);

    assert!(!marker.exists());
    assert!(binary.unwrap().exists());
}

#[tokio::test]
async fn test_missing_runtime_is_an_execution_error() {
    let fixture = Fixture::new("");
    let sandbox = fixture.sandbox(
        fixture.dir.path().join("no-such-node"),
        ExecutionLimits::default(),
    );

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.exit_code(), 1);
    assert!(outcome.stderr.contains("execution error"));
}

// The loaders below stand in for modularized Emscripten output

const LOADER_ECHO: &str = r#"
module.exports = function (Module) {
  return new Promise((resolve) => {
    let bytes = [];
    let c;
    while ((c = Module.stdin()) !== null) {
      bytes.push(c);
    }
    Module.print('hi');
    Module.print('read ' + Buffer.from(bytes).toString('utf8').trim());
    Module.onExit(0);
    resolve(Module);
  });
};
"#;

const LOADER_SILENT_AFTER_OUTPUT: &str = r#"
module.exports = {
  EmscriptenModule: function (Module) {
    Module.print('done');
    return Promise.resolve(Module);
  },
};
"#;

const LOADER_SPIN: &str = r#"
module.exports = function (Module) {
  Module.print('spinning');
  for (;;) {}
};
"#;

const LOADER_EXIT_CODE: &str = r#"
module.exports = function (Module) {
  Module.printErr('bad input');
  Module.quit(3);
  return Promise.resolve(Module);
};
"#;

const LOADER_NEVER_SETTLES: &str = r#"
module.exports = function (Module) {
  Module.print('waiting');
  setInterval(() => {}, 1000);
  return new Promise(() => {});
};
"#;

const LOADER_CHATTY: &str = r#"
module.exports = function (Module) {
  for (let i = 0; i < 5; i++) {
    Module.print('0123456789');
  }
  Module.onExit(0);
  return Promise.resolve(Module);
};
"#;

fn node() -> Option<PathBuf> {
    let node = find_on_path("node");
    if node.is_none() {
        eprintln!("node not found on PATH, skipping");
    }
    node
}

#[tokio::test]
async fn test_node_exit_hook_and_stdin() {
    let Some(node) = node() else { return };
    let fixture = Fixture::new(LOADER_ECHO);
    let sandbox = fixture.sandbox(node, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "7 8").await;
    assert_eq!(outcome.stdout, "hi\nread 7 8\n", "stderr: {}", outcome.stderr);
    assert_eq!(outcome.exit_code(), 0);
    assert!(!outcome.terminated());
    assert!(outcome.memory_usage_kb > 0);
}

#[tokio::test]
async fn test_node_quiescence_completes() {
    let Some(node) = node() else { return };
    let fixture = Fixture::new(LOADER_SILENT_AFTER_OUTPUT);
    let sandbox = fixture.sandbox(node, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.stdout, "done\n");
    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.execution_time < Duration::from_secs(2));
}

#[tokio::test]
async fn test_node_fallback_timer_is_a_timeout() {
    let Some(node) = node() else { return };
    let fixture = Fixture::new(LOADER_NEVER_SETTLES);
    // A long silence window leaves the fallback timer to end the run
    let tuning = CompletionTuning {
        poll_interval: Duration::from_millis(50),
        quiescence: Duration::from_secs(30),
        fallback: Duration::from_millis(500),
    };
    let sandbox = fixture.sandbox_with_tuning(node, limits(10_000, 1024), tuning);

    let started = Instant::now();
    let outcome = sandbox.execute(&fixture.artifact, "").await;
    let elapsed = started.elapsed();

    assert!(outcome.terminated(), "stderr: {}", outcome.stderr);
    assert_eq!(outcome.exit_code(), EXIT_TIMEOUT);
    assert_eq!(outcome.stdout, "waiting\n");
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(fixture.run_dirs(), 0);
}

#[tokio::test]
async fn test_node_output_ceiling() {
    let Some(node) = node() else { return };
    let fixture = Fixture::new(LOADER_CHATTY);
    let sandbox = fixture.sandbox(node, limits(5_000, 16));

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.stdout, "0123456789\n01234\n[output truncated]");
    assert_eq!(outcome.exit_code(), 0);
    assert!(!outcome.terminated());
}

#[tokio::test]
async fn test_node_quit_code_and_stderr() {
    let Some(node) = node() else { return };
    let fixture = Fixture::new(LOADER_EXIT_CODE);
    let sandbox = fixture.sandbox(node, ExecutionLimits::default());

    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(outcome.stderr, "bad input\n");
}

#[tokio::test]
async fn test_node_busy_loop_hits_budget() {
    let Some(node) = node() else { return };
    let fixture = Fixture::new(LOADER_SPIN);
    let sandbox = fixture.sandbox(node, limits(1_000, 1024));

    let started = Instant::now();
    let outcome = sandbox.execute(&fixture.artifact, "").await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(outcome.terminated());
    assert_eq!(outcome.exit_code(), EXIT_TIMEOUT);
    assert_eq!(outcome.stdout, "spinning\n");
}
