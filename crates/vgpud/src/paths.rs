use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "VGPUD_CONFIG_DIR";
pub const ENV_RUNTIME_DIR: &str = "VGPUD_RUNTIME_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "vgpud";
const APPLICATION: &str = "vgpud";
const CONFIG_FILE: &str = "vgpud.toml";
const SOCKET_FILE: &str = "vgpud.sock";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    runtime_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;

        let config_dir = env_override(ENV_CONFIG_DIR)
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());
        let runtime_dir = resolve_runtime_dir(&project_dirs)
            .context("failed to resolve vgpud runtime directory")?;

        Ok(Self {
            config_dir,
            runtime_dir,
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(SOCKET_FILE)
    }
}

fn resolve_runtime_dir(project_dirs: &ProjectDirs) -> Result<PathBuf> {
    if let Some(value) = env_override(ENV_RUNTIME_DIR) {
        return Ok(value);
    }
    if let Some(dir) = project_dirs.runtime_dir() {
        return Ok(dir.to_path_buf());
    }
    Ok(env::temp_dir().join(APPLICATION))
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.as_os_str().is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    struct EnvGuard {
        key: &'static str,
        previous: Option<OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &Path) -> Self {
            let previous = env::var_os(key);
            env::set_var(key, value);
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = self.previous.take() {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _guard = env_lock().lock().unwrap();
        let root = TempDir::new().unwrap();
        let config_dir = root.path().join("config");
        let runtime_dir = root.path().join("run");

        let _config_guard = EnvGuard::set(ENV_CONFIG_DIR, &config_dir);
        let _runtime_guard = EnvGuard::set(ENV_RUNTIME_DIR, &runtime_dir);

        let paths = AppPaths::discover().unwrap();
        assert_eq!(paths.config_dir(), config_dir.as_path());
        assert_eq!(paths.config_file(), config_dir.join("vgpud.toml"));
        assert_eq!(paths.socket_path(), runtime_dir.join("vgpud.sock"));
    }
}
