use std::path::{Path, PathBuf};

pub const CLIENT_EXECUTABLE_NAME: &str = "sunny.exe";

const BUNDLE_DIR_ENV: &str = "SUNNY_MANAGER_BUNDLE";

#[derive(Clone, Debug)]
pub struct AppDirs {
    base: PathBuf,
}

impl AppDirs {
    pub fn detect() -> Self {
        let base = std::env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self { base }
    }

    pub fn at(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn core_directory(&self) -> PathBuf {
        self.base.join("core")
    }

    pub fn config_directory(&self) -> PathBuf {
        self.base.join("config")
    }

    pub fn tunnels_file(&self) -> PathBuf {
        self.config_directory().join("tunnels.json")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_directory().join("settings.json")
    }

    pub fn last_selection_file(&self) -> PathBuf {
        self.config_directory().join(".last_selection")
    }

    pub fn client_executable(&self) -> PathBuf {
        self.core_directory().join(CLIENT_EXECUTABLE_NAME)
    }

    pub fn bundled_client_executable(&self) -> Option<PathBuf> {
        let bundle = std::env::var_os(BUNDLE_DIR_ENV)?;
        Some(
            PathBuf::from(bundle)
                .join("core")
                .join(CLIENT_EXECUTABLE_NAME),
        )
    }

    /// Canonical install path when present, then the bundled copy for
    /// self-contained packages. Returns the canonical path either way so
    /// error messages can name where the file belongs.
    pub fn locate_client(&self) -> (PathBuf, bool) {
        let canonical = self.client_executable();
        if canonical.exists() {
            log::info!("[paths] client found on disk: {}", canonical.display());
            return (canonical, true);
        }
        if let Some(bundled) = self.bundled_client_executable()
            && bundled.exists()
        {
            log::info!("[paths] client found in bundle: {}", bundled.display());
            return (bundled, true);
        }
        log::warn!("[paths] {} not found", canonical.display());
        (canonical, false)
    }

    pub fn ensure(&self) {
        for directory in [self.core_directory(), self.config_directory()] {
            if let Err(error) = std::fs::create_dir_all(&directory) {
                log::warn!(
                    "[paths] failed to create directory {}: {error}",
                    directory.display()
                );
            }
        }
        self.migrate_legacy_files();
    }

    // Early releases kept everything next to the executable. Move those
    // files into core/ and config/ unless the new location is already taken.
    fn migrate_legacy_files(&self) {
        let moves = [
            (self.base.join("tunnels.json"), self.tunnels_file()),
            (self.base.join("settings.json"), self.settings_file()),
            (self.base.join(".last_selection"), self.last_selection_file()),
            (
                self.base.join(CLIENT_EXECUTABLE_NAME),
                self.client_executable(),
            ),
        ];

        for (old_path, new_path) in moves {
            if new_path.exists() || !old_path.exists() {
                continue;
            }
            let moved = std::fs::rename(&old_path, &new_path)
                .or_else(|_| std::fs::copy(&old_path, &new_path).map(|_| ()));
            match moved {
                Ok(()) => log::info!(
                    "[paths] migrated {} -> {}",
                    old_path.display(),
                    new_path.display()
                ),
                Err(error) => log::warn!(
                    "[paths] failed to migrate {}: {error}",
                    old_path.display()
                ),
            }
        }
    }
}

/// Write-to-temporary-then-rename so a crash mid-write never corrupts the
/// destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, contents)?;
    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}
