#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cppbox::config::{Config, MilliSecond};

/// A compiler that writes a loader and a wasm header next to `-o`
pub const COMPILER_OK: &str = r#"
out=""
prev=""
for arg in "$@"; do
  [ "$prev" = "-o" ] && out="$arg"
  prev="$arg"
done
echo "module.exports = function () {};" > "$out"
printf '\000asm\001\000\000\000' > "${out%.js}.wasm"
echo "main.cpp:3:9: warning: unused variable 'x'" >&2
"#;

/// A host runtime that reports "hi" and a clean exit
pub const RUNTIME_HI: &str = r#"
printf '%s\n' '{"type":"stdout","data":"hi\n"}' '{"type":"exit","code":0,"reason":"exit","memoryKb":1024}'
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config pointing at fake `em++` and `node` scripts inside `dir`
pub fn fake_config(dir: &Path, compiler_body: &str, runtime_body: &str) -> Config {
    let mut config = Config::default();
    config.toolchain.compiler = Some(write_script(dir, "em++", compiler_body));
    config.toolchain.host_runtime = Some(write_script(dir, "node", runtime_body));
    config.toolchain.skip_default_roots = true;
    config.toolchain.search_system_path = false;
    config.scratch_dir = Some(dir.join("scratch"));
    config
}

/// Config that can never find a toolchain
pub fn empty_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.toolchain.skip_default_roots = true;
    config.toolchain.search_system_path = false;
    config.mock.latency = MilliSecond(20);
    config.scratch_dir = Some(dir.join("scratch"));
    config
}

/// `name` on PATH, if present
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

pub fn dir_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
