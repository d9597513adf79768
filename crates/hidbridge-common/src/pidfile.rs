//! Pid-file registration for supervised helper processes.
//!
//! The server-side launcher reads `HIDBRIDGE_HELPER_PIDFILE` to find and
//! reap orphaned helpers. The guard removes the file again when dropped on
//! any exit path.

use std::path::PathBuf;

use tracing::{info, warn};

/// Guard that owns the registered pid file for this process.
#[derive(Debug)]
pub struct PidFile {
    path: Option<PathBuf>,
}

impl PidFile {
    /// Write the current pid to the path named by `HIDBRIDGE_HELPER_PIDFILE`.
    /// Failures are logged, never fatal: a missing pid file only degrades
    /// orphan cleanup.
    pub fn register() -> Self {
        let raw = std::env::var("HIDBRIDGE_HELPER_PIDFILE").unwrap_or_default();
        let raw = raw.trim();
        if raw.is_empty() {
            return Self { path: None };
        }

        let path = PathBuf::from(raw);
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                if let Err(err) = std::fs::create_dir_all(dir) {
                    warn!("pidfile mkdir failed: {err}");
                    return Self { path: None };
                }
            }
        }

        let pid = std::process::id();
        if let Err(err) = std::fs::write(&path, pid.to_string()) {
            warn!("pidfile write failed: {err}");
            return Self { path: None };
        }
        info!("pidfile: {} pid={pid}", path.display());
        Self { path: Some(path) }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("pidfile remove failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test so the shared env var is never touched concurrently.
    #[test]
    fn pid_file_lifecycle() {
        std::env::remove_var("HIDBRIDGE_HELPER_PIDFILE");
        let guard = PidFile::register();
        assert!(guard.path.is_none(), "unset env registers nothing");
        drop(guard);

        let dir = std::env::temp_dir().join(format!("hidbridge-pidfile-{}", std::process::id()));
        let path = dir.join("helper.pid");
        std::env::set_var("HIDBRIDGE_HELPER_PIDFILE", &path);
        {
            let _guard = PidFile::register();
            let content = std::fs::read_to_string(&path).unwrap();
            assert_eq!(content, std::process::id().to_string());
        }
        assert!(!path.exists(), "pid file removed on drop");
        std::env::remove_var("HIDBRIDGE_HELPER_PIDFILE");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
