use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/// Application paths following OS conventions
#[derive(Clone, Debug)]
pub struct AppPaths {
    /// Configuration directory (config.toml)
    pub config: PathBuf,
    /// Data directory (gallery, archive, models)
    pub data: PathBuf,
    /// Cache directory (temp captures, temp audio)
    pub cache: PathBuf,
}

impl AppPaths {
    /// Resolve OS-specific paths for Emberwatch
    ///
    /// # Platform Paths
    ///
    /// ## Linux
    /// - Config: `~/.config/Emberwatch/`
    /// - Data: `~/.local/share/Emberwatch/` → gallery/, archive/, models/
    /// - Cache: `~/.cache/Emberwatch/` → tmp_capture/, tmp_audio/
    ///
    /// ## macOS
    /// - Config: `~/Library/Preferences/Emberwatch/`
    /// - Data: `~/Library/Application Support/Emberwatch/`
    /// - Cache: `~/Library/Caches/Emberwatch/`
    ///
    /// ## Windows
    /// - Config: `%APPDATA%\Emberwatch\config\`
    /// - Data: `%LOCALAPPDATA%\Emberwatch\`
    /// - Cache: `%LOCALAPPDATA%\Emberwatch\Cache\`
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "LotusEmberLabs", "Emberwatch")
            .context("Failed to determine project directories")?;

        Ok(Self {
            config: proj_dirs.config_dir().to_path_buf(),
            data: proj_dirs.data_dir().to_path_buf(),
            cache: proj_dirs.cache_dir().to_path_buf(),
        })
    }

    /// Root every directory under a single base (used by `--data-dir` and tests)
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config: root.join("config"),
            data: root.join("data"),
            cache: root.join("cache"),
        }
    }

    /// Create all necessary directories with subdirectories
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.config).context("Failed to create config directory")?;

        fs::create_dir_all(&self.data).context("Failed to create data directory")?;
        fs::create_dir_all(self.faces_dir()).context("Failed to create faces directory")?;
        fs::create_dir_all(self.descriptors_dir())
            .context("Failed to create descriptors directory")?;
        fs::create_dir_all(self.archive_dir()).context("Failed to create archive directory")?;
        fs::create_dir_all(self.models_dir()).context("Failed to create models directory")?;

        fs::create_dir_all(&self.cache).context("Failed to create cache directory")?;
        fs::create_dir_all(self.capture_dir())
            .context("Failed to create tmp_capture directory")?;
        fs::create_dir_all(self.tmp_audio_dir())
            .context("Failed to create tmp_audio directory")?;

        log::info!("Application directories initialized");
        log::debug!("  Config: {}", self.config.display());
        log::debug!("  Data:   {}", self.data.display());
        log::debug!("  Cache:  {}", self.cache.display());

        Ok(())
    }

    /// Get path to config file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Gallery root: durable record, reference images, descriptor cache
    pub fn gallery_dir(&self) -> PathBuf {
        self.data.join("gallery")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.gallery_dir().join("faces")
    }

    pub fn descriptors_dir(&self) -> PathBuf {
        self.gallery_dir().join("descriptors")
    }

    /// Side-channel archive of original and cropped face images
    pub fn archive_dir(&self) -> PathBuf {
        self.data.join("archive")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data.join("models")
    }

    /// Default location of the face embedding model
    pub fn embedder_model_file(&self) -> PathBuf {
        self.models_dir().join("face").join("arcface-112.onnx")
    }

    /// Temporary reference captures for in-progress enrollment sessions
    pub fn capture_dir(&self) -> PathBuf {
        self.cache.join("tmp_capture")
    }

    /// Temporary WAV clips handed to the transcriber
    pub fn tmp_audio_dir(&self) -> PathBuf {
        self.cache.join("tmp_audio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_creation() {
        let paths = AppPaths::new().expect("Failed to create paths");

        assert!(!paths.config.as_os_str().is_empty());
        assert!(!paths.data.as_os_str().is_empty());
        assert!(!paths.cache.as_os_str().is_empty());
    }

    #[test]
    fn test_rooted_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::with_root(dir.path());
        paths.ensure_directories().unwrap();

        assert!(paths.faces_dir().is_dir());
        assert!(paths.descriptors_dir().is_dir());
        assert!(paths.capture_dir().is_dir());
        assert!(paths.tmp_audio_dir().is_dir());
        assert!(paths.faces_dir().starts_with(paths.gallery_dir()));
        assert_eq!(paths.config_file(), dir.path().join("config").join("config.toml"));
    }
}
