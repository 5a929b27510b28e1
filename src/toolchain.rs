use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::ToolchainConfig;

const ENV_BUNDLE_ROOT: &str = "CPPBOX_EMSCRIPTEN_ROOT";
const VERSION_FILE: &str = "emscripten-version.txt";

#[cfg(windows)]
const COMPILER_NAMES: &[&str] = &["em++.bat"];
#[cfg(not(windows))]
const COMPILER_NAMES: &[&str] = &["em++", "em++.sh"];

#[cfg(windows)]
const HOST_RUNTIME_NAME: &str = "node.exe";
#[cfg(not(windows))]
const HOST_RUNTIME_NAME: &str = "node";

/// Where a toolchain was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolchainSource {
    Bundled,
    Alternate,
    System,
    Override,
    None,
}

impl fmt::Display for ToolchainSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bundled => "bundled",
            Self::Alternate => "alternate",
            Self::System => "system",
            Self::Override => "configured",
            Self::None => "no",
        };
        f.write_str(name)
    }
}

/// A discovered compiler toolchain
///
/// Built once by [`ToolchainLocator::locate`] and never mutated. When
/// `available` is false the path fields are empty and `problems` says why.
#[derive(Debug, Clone)]
pub struct ToolchainDescriptor {
    pub platform: String,
    pub arch: String,
    pub compiler: PathBuf,
    pub c_driver: Option<PathBuf>,
    pub archiver: Option<PathBuf>,
    pub runtime_root: PathBuf,
    pub host_runtime: Option<PathBuf>,
    pub available: bool,
    pub version: String,
    pub source: ToolchainSource,
    pub problems: Vec<String>,
    env: Vec<(String, OsString)>,
}

impl ToolchainDescriptor {
    fn unavailable(platform: String, arch: String, problems: Vec<String>) -> Self {
        Self {
            platform,
            arch,
            compiler: PathBuf::new(),
            c_driver: None,
            archiver: None,
            runtime_root: PathBuf::new(),
            host_runtime: None,
            available: false,
            version: "unknown".to_string(),
            source: ToolchainSource::None,
            problems,
            env: Vec::new(),
        }
    }

    /// Variables to merge over the ambient environment of toolchain processes
    pub fn environment(&self) -> &[(String, OsString)] {
        &self.env
    }

    pub fn is_bundled(&self) -> bool {
        self.source == ToolchainSource::Bundled
    }
}

/// Finds the toolchain for this platform and caches the answer
///
/// Discovery never fails: the worst case is a descriptor with
/// `available == false`.
pub struct ToolchainLocator {
    config: ToolchainConfig,
    cache: Mutex<Option<Arc<ToolchainDescriptor>>>,
    probes: AtomicUsize,
}

impl ToolchainLocator {
    pub fn new(config: ToolchainConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(None),
            probes: AtomicUsize::new(0),
        }
    }

    /// Returns the cached descriptor, running discovery on first use
    pub fn locate(&self) -> Arc<ToolchainDescriptor> {
        let mut cache = self.cache.lock();
        if let Some(descriptor) = cache.as_ref() {
            return Arc::clone(descriptor);
        }

        self.probes.fetch_add(1, Ordering::SeqCst);
        let descriptor = Arc::new(self.discover());
        if descriptor.available {
            log::info!(
                target: "cppbox::toolchain",
                "Found {} toolchain {} at {} (host runtime {})",
                descriptor.source,
                descriptor.version,
                descriptor.compiler.display(),
                descriptor
                    .host_runtime
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        } else {
            log::warn!(
                target: "cppbox::toolchain",
                "No usable toolchain: {}",
                descriptor.problems.join("; ")
            );
        }
        *cache = Some(Arc::clone(&descriptor));
        descriptor
    }

    /// Drops the cached descriptor; the next [`locate`](Self::locate) probes again
    pub fn clear(&self) {
        *self.cache.lock() = None;
    }

    /// Number of discovery passes run so far
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn discover(&self) -> ToolchainDescriptor {
        let arch = arch_name().to_string();
        let Some(platform) = platform_name() else {
            return ToolchainDescriptor::unavailable(
                std::env::consts::OS.to_string(),
                arch,
                vec![format!("unsupported platform: {}", std::env::consts::OS)],
            );
        };
        let platform = platform.to_string();

        let mut problems = Vec::new();
        let Some((source, compiler, runtime_root)) =
            self.find_compiler(&platform, &arch, &mut problems)
        else {
            problems.push("Emscripten SDK not available".to_string());
            return ToolchainDescriptor::unavailable(platform, arch, problems);
        };

        if source != ToolchainSource::System {
            #[cfg(unix)]
            ensure_executable_tree(&runtime_root, &compiler);
        }

        let host_runtime = self.find_host_runtime(&runtime_root);
        if host_runtime.is_none() {
            problems.push(format!("host runtime `{HOST_RUNTIME_NAME}` not found"));
        }

        let compiler_dir = compiler.parent().map(Path::to_path_buf).unwrap_or_default();
        let c_driver = companion(&compiler, "emcc");
        let archiver = companion(&compiler, "emar");
        let version = detect_version(&compiler, source);
        let env = derive_environment(&compiler_dir, &runtime_root, host_runtime.as_deref(), source);

        ToolchainDescriptor {
            platform,
            arch,
            available: host_runtime.is_some(),
            compiler,
            c_driver,
            archiver,
            runtime_root,
            host_runtime,
            version,
            source,
            problems,
            env,
        }
    }

    fn find_compiler(
        &self,
        platform: &str,
        arch: &str,
        problems: &mut Vec<String>,
    ) -> Option<(ToolchainSource, PathBuf, PathBuf)> {
        if let Some(compiler) = &self.config.compiler {
            if is_executable(compiler) {
                let root = compiler.parent().map(Path::to_path_buf).unwrap_or_default();
                return Some((ToolchainSource::Override, absolute(compiler), absolute(&root)));
            }
            problems.push(format!(
                "configured compiler {} is not executable",
                compiler.display()
            ));
        }

        let roots = self.bundle_roots();

        // Packaged tree matched against platform and arch
        for root in &roots {
            for dir in [root.join(format!("{platform}-{arch}")), root.join(platform)] {
                if let Some(compiler) = find_in_dir(&dir) {
                    return Some((ToolchainSource::Bundled, absolute(&compiler), absolute(&dir)));
                }
            }
        }

        // emsdk-style install layouts
        let mut alternates: Vec<PathBuf> = roots
            .iter()
            .flat_map(|root| [root.join("emsdk"), root.clone()])
            .collect();
        if let Some(emsdk) = std::env::var_os("EMSDK") {
            alternates.push(PathBuf::from(emsdk));
        }
        for sdk in &alternates {
            let dir = sdk.join("upstream").join("emscripten");
            if let Some(compiler) = find_in_dir(&dir) {
                return Some((ToolchainSource::Alternate, absolute(&compiler), absolute(sdk)));
            }
        }

        if self.config.search_system_path {
            for name in COMPILER_NAMES {
                if let Some(compiler) = find_in_path(name) {
                    let root = compiler
                        .parent()
                        .and_then(Path::parent)
                        .map(Path::to_path_buf)
                        .unwrap_or_default();
                    return Some((ToolchainSource::System, compiler, root));
                }
            }
        }

        None
    }

    fn bundle_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.config.bundle_roots.clone();
        if self.config.skip_default_roots {
            return roots;
        }

        if let Some(root) = std::env::var_os(ENV_BUNDLE_ROOT) {
            roots.push(PathBuf::from(root));
        }
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            roots.push(exe_dir.join("resources").join("emscripten"));
            roots.push(exe_dir.join("..").join("resources").join("emscripten"));
            roots.push(exe_dir.join("..").join("lib").join("cppbox").join("emscripten"));
        }
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "cppbox") {
            roots.push(proj_dirs.data_local_dir().join("emscripten"));
        }
        roots
    }

    fn find_host_runtime(&self, runtime_root: &Path) -> Option<PathBuf> {
        if let Some(runtime) = &self.config.host_runtime {
            return is_executable(runtime).then(|| absolute(runtime));
        }

        // emsdk keeps node under node/<version>/bin
        let node_root = runtime_root.join("node");
        for version_dir in sorted_subdirs(&node_root).into_iter().rev() {
            for candidate in [
                version_dir.join("bin").join(HOST_RUNTIME_NAME),
                version_dir.join(HOST_RUNTIME_NAME),
            ] {
                if is_executable(&candidate) {
                    return Some(candidate);
                }
            }
        }

        if self.config.search_system_path {
            return find_in_path(HOST_RUNTIME_NAME);
        }
        None
    }
}

fn platform_name() -> Option<&'static str> {
    match std::env::consts::OS {
        "windows" => Some("win32"),
        "macos" => Some("darwin"),
        "linux" => Some("linux"),
        _ => None,
    }
}

fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "x32",
        other => other,
    }
}

fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    COMPILER_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn find_in_path(prog: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(prog))
        .find(|candidate| candidate.is_file() && is_executable(candidate))
}

/// Sibling tool with the same suffix as the compiler, e.g. `em++.bat` -> `emar.bat`
fn companion(compiler: &Path, tool: &str) -> Option<PathBuf> {
    let name = compiler.file_name()?.to_string_lossy();
    let suffix = name.strip_prefix("em++").unwrap_or("");
    let candidate = compiler.with_file_name(format!("{tool}{suffix}"));
    candidate.is_file().then_some(candidate)
}

fn detect_version(compiler: &Path, source: ToolchainSource) -> String {
    let compiler_dir = compiler.parent().unwrap_or(Path::new(""));
    for file in [
        compiler_dir.join(VERSION_FILE),
        compiler_dir.join("..").join(VERSION_FILE),
    ] {
        if let Ok(text) = fs::read_to_string(&file) {
            let version = text.trim().trim_matches('"').to_string();
            if !version.is_empty() {
                return version;
            }
        }
    }

    match source {
        ToolchainSource::Bundled => "bundled".to_string(),
        ToolchainSource::System | ToolchainSource::Alternate => Command::new(compiler)
            .arg("--version")
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| {
                String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .next()
                    .map(|line| line.trim().to_string())
            })
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        _ => "unknown".to_string(),
    }
}

fn derive_environment(
    compiler_dir: &Path,
    runtime_root: &Path,
    host_runtime: Option<&Path>,
    source: ToolchainSource,
) -> Vec<(String, OsString)> {
    let mut env = Vec::new();

    let mut path_entries = vec![compiler_dir.to_path_buf()];
    if let Some(runtime_dir) = host_runtime.and_then(Path::parent) {
        path_entries.push(runtime_dir.to_path_buf());
    }
    if let Some(ambient) = std::env::var_os("PATH") {
        path_entries.extend(std::env::split_paths(&ambient));
    }
    match std::env::join_paths(path_entries) {
        Ok(path) => env.push(("PATH".to_string(), path)),
        Err(e) => log::warn!(target: "cppbox::toolchain", "Unable to build PATH: {e}"),
    }

    if matches!(source, ToolchainSource::Bundled | ToolchainSource::Alternate) {
        env.push(("EMSDK".to_string(), runtime_root.as_os_str().to_owned()));
    }
    if let Some(node) = host_runtime {
        env.push(("EMSDK_NODE".to_string(), node.as_os_str().to_owned()));
    }
    if let Some(python) = find_bundled_python(runtime_root) {
        env.push(("EMSDK_PYTHON".to_string(), python.into_os_string()));
    }
    env
}

fn find_bundled_python(runtime_root: &Path) -> Option<PathBuf> {
    let names: &[&str] = if cfg!(windows) {
        &["python.exe"]
    } else {
        &["python3", "python"]
    };
    for version_dir in sorted_subdirs(&runtime_root.join("python")).into_iter().rev() {
        for name in names {
            for candidate in [version_dir.join("bin").join(name), version_dir.join(name)] {
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Archive extraction may drop execute bits; restore them on the known bin dirs
#[cfg(unix)]
fn ensure_executable_tree(root: &Path, compiler: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    let mut files: Vec<PathBuf> = vec![compiler.to_path_buf()];
    for tool in ["emcc", "emar"] {
        if let Some(path) = companion(compiler, tool) {
            files.push(path);
        }
    }
    for bin in [
        root.join("bin"),
        root.join("llvm").join("bin"),
        root.join("upstream").join("bin"),
    ] {
        if let Ok(entries) = fs::read_dir(&bin) {
            files.extend(entries.flatten().map(|e| e.path()).filter(|p| p.is_file()));
        }
    }

    for file in files {
        let Ok(meta) = fs::metadata(&file) else {
            continue;
        };
        if meta.permissions().mode() & 0o111 == 0o111 {
            continue;
        }
        if let Err(e) = fs::set_permissions(&file, fs::Permissions::from_mode(0o755)) {
            log::warn!(
                target: "cppbox::toolchain",
                "Failed to set execute permission on {}: {e}",
                file.display()
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_and_arch_names() {
        if cfg!(target_os = "linux") {
            assert_eq!(platform_name(), Some("linux"));
        }
        if cfg!(target_arch = "x86_64") {
            assert_eq!(arch_name(), "x64");
        }
    }

    #[test]
    fn test_unavailable_descriptor_shape() {
        let descriptor =
            ToolchainDescriptor::unavailable("linux".into(), "x64".into(), vec!["nope".into()]);
        assert!(!descriptor.available);
        assert_eq!(descriptor.version, "unknown");
        assert_eq!(descriptor.source, ToolchainSource::None);
        assert!(descriptor.environment().is_empty());
    }

    #[test]
    fn test_companion_keeps_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("em++.sh"), "").unwrap();
        fs::write(dir.path().join("emar.sh"), "").unwrap();
        let archiver = companion(&dir.path().join("em++.sh"), "emar").unwrap();
        assert_eq!(archiver.file_name().unwrap(), "emar.sh");
        assert!(companion(&dir.path().join("em++.sh"), "emcc").is_none());
    }

    #[test]
    fn test_empty_search_is_unavailable() {
        let locator = ToolchainLocator::new(ToolchainConfig {
            skip_default_roots: true,
            search_system_path: false,
            ..Default::default()
        });
        // EMSDK may point at a real install on developer machines
        if std::env::var_os("EMSDK").is_some() {
            return;
        }
        let descriptor = locator.locate();
        assert!(!descriptor.available);
        assert!(!descriptor.problems.is_empty());
    }

    #[cfg(unix)]
    fn touch(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt as _;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(unix)]
    fn locator_for(root: &Path) -> ToolchainLocator {
        ToolchainLocator::new(ToolchainConfig {
            bundle_roots: vec![root.to_path_buf()],
            skip_default_roots: true,
            search_system_path: false,
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[test]
    fn test_bundled_tree_is_found_and_repaired() {
        let Some(platform) = platform_name() else {
            return;
        };
        let root = tempfile::tempdir().unwrap();
        let tree = root.path().join(format!("{platform}-{}", arch_name()));
        // Extracted without execute bits
        touch(&tree.join("em++"), 0o644);
        touch(&tree.join("emar"), 0o644);
        touch(&tree.join("node/v20.18.0/bin/node"), 0o755);

        let descriptor = locator_for(root.path()).locate();
        assert!(descriptor.available, "{:?}", descriptor.problems);
        assert!(descriptor.is_bundled());
        assert_eq!(descriptor.version, "bundled");
        assert_eq!(descriptor.compiler, tree.join("em++"));
        assert_eq!(descriptor.archiver.as_deref(), Some(tree.join("emar").as_path()));
        assert!(is_executable(&descriptor.compiler));
        assert!(
            descriptor
                .environment()
                .iter()
                .any(|(key, value)| key == "EMSDK_NODE" && value.to_string_lossy().ends_with("bin/node"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_emsdk_layout_needs_host_runtime() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("emsdk/upstream/emscripten/em++"), 0o755);
        fs::write(
            root.path().join("emsdk/upstream/emscripten").join(VERSION_FILE),
            "\"3.1.61\"\n",
        )
        .unwrap();

        let descriptor = locator_for(root.path()).locate();
        assert_eq!(descriptor.source, ToolchainSource::Alternate);
        assert_eq!(descriptor.version, "3.1.61");
        // No node next to the SDK and PATH search is off
        assert!(!descriptor.available);
        assert!(descriptor.problems.iter().any(|p| p.contains("host runtime")));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_is_cached_until_cleared() {
        let root = tempfile::tempdir().unwrap();
        let locator = locator_for(root.path());

        let first = locator.locate();
        let second = locator.locate();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(locator.probe_count(), 1);

        locator.clear();
        locator.locate();
        assert_eq!(locator.probe_count(), 2);
    }
}
