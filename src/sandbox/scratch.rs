use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::Local;

// Scratch root permissions
#[cfg(unix)]
const SCRATCH_ROOT_PERMISSIONS: u32 = 0o700;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Resolves and creates the root that holds every per-call scratch directory
///
/// Without an explicit root, `<user cache dir>/cppbox/scratch-<pid>` is used,
/// so two processes never share a root and `cleanup` only removes its own.
pub fn setup_scratch_root(configured: Option<&Path>) -> Result<PathBuf> {
    let root = match configured {
        Some(path) => path.to_path_buf(),
        None => {
            use directories::ProjectDirs;

            let proj_dirs = ProjectDirs::from("", "", "cppbox")
                .ok_or_else(|| anyhow!("Unable to find user directory"))?;
            proj_dirs
                .cache_dir()
                .join(format!("scratch-{}", std::process::id()))
        }
    };

    fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create scratch root {}", root.display()))?;
    let root = std::path::absolute(&root)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&root, fs::Permissions::from_mode(SCRATCH_ROOT_PERMISSIONS))?;
    }

    Ok(root)
}

/// A uniquely named directory that is removed when dropped
///
/// Call [`ScratchDir::retain`] to keep it past the guard's lifetime.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    retained: bool,
}

impl ScratchDir {
    /// Creates a fresh directory under `root`, never reusing an existing one
    pub fn create(root: &Path, prefix: &str) -> Result<Self> {
        let token = format!(
            "{prefix}-{}-{}-{:06}",
            Local::now().format("%y%m%d-%H%M%S"),
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = root.join(token);
        // `create_dir` fails on an existing path, which keeps names single-use
        fs::create_dir(&path)
            .with_context(|| format!("Failed to create scratch dir {}", path.display()))?;
        Ok(Self {
            path,
            retained: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Disarms the guard and hands back the path
    pub fn retain(mut self) -> PathBuf {
        self.retained = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.retained {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::warn!(
                "Failed to remove scratch dir {}: {e}",
                self.path.display()
            );
        }
    }
}
