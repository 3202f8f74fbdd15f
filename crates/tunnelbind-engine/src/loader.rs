//! Engine artifact loading
//!
//! For each candidate artifact the bundled file next to the executable is
//! preferred; if it does not exist the separately installed package is used.
//! The actual loading is delegated to an [`ArtifactLoader`].

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::platform::{candidate_artifacts, Artifact, Platform};
use crate::Engine;

/// Environment variable overriding the installed-engine directory
pub const ENGINE_DIR_ENV: &str = "TUNNELBIND_ENGINE_DIR";

/// Fatal, load-time errors. The process cannot use the engine after one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("unsupported OS: {os}, architecture: {arch}")]
    UnsupportedOs { os: String, arch: String },

    #[error("unsupported architecture on {os}: {arch}")]
    UnsupportedArch { os: String, arch: String },

    /// The last underlying load error, verbatim
    #[error("{0}")]
    Load(String),

    #[error("failed to load native engine")]
    NotLoaded,
}

/// Where an artifact is loaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// A file shipped next to the executable
    Bundled(PathBuf),
    /// A separately installed engine package
    Installed { package: String, path: PathBuf },
}

impl ArtifactSource {
    pub fn path(&self) -> &Path {
        match self {
            ArtifactSource::Bundled(path) => path,
            ArtifactSource::Installed { path, .. } => path,
        }
    }
}

/// Turns a resolved artifact into a usable engine
pub trait ArtifactLoader: Send + Sync + Debug {
    fn load(&self, artifact: &Artifact, source: &ArtifactSource) -> Result<Arc<dyn Engine>, String>;
}

/// Resolves and loads the engine artifact for a platform
#[derive(Debug, Clone)]
pub struct EngineLoader {
    bundled_dir: PathBuf,
    installed_dir: PathBuf,
    loader: Arc<dyn ArtifactLoader>,
}

impl EngineLoader {
    /// Use the executable's directory for bundled artifacts and
    /// [`ENGINE_DIR_ENV`] (or the user data directory) for installed ones.
    pub fn new(loader: Arc<dyn ArtifactLoader>) -> Self {
        Self {
            bundled_dir: default_bundled_dir(),
            installed_dir: default_installed_dir(),
            loader,
        }
    }

    pub fn with_bundled_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundled_dir = dir.into();
        self
    }

    pub fn with_installed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.installed_dir = dir.into();
        self
    }

    /// Where `artifact` would be loaded from
    pub fn resolve(&self, artifact: &Artifact) -> ArtifactSource {
        let bundled = self.bundled_dir.join(artifact.file_name());
        if bundled.exists() {
            ArtifactSource::Bundled(bundled)
        } else {
            let package = artifact.package_name();
            let path = self
                .installed_dir
                .join(&package)
                .join(artifact.file_name());
            ArtifactSource::Installed { package, path }
        }
    }

    /// Load the engine for `platform`. No retries.
    pub fn load(&self, platform: &Platform) -> Result<Arc<dyn Engine>, LoadError> {
        let candidates = candidate_artifacts(platform)?;
        let mut last_error = None;

        for artifact in &candidates {
            let source = self.resolve(artifact);
            debug!(
                "Loading engine artifact {} from {}",
                artifact.name,
                source.path().display()
            );
            match self.loader.load(artifact, &source) {
                Ok(engine) => {
                    info!("Loaded engine artifact {} for {}", artifact.name, platform);
                    return Ok(engine);
                }
                Err(e) => {
                    debug!("Failed to load engine artifact {}: {}", artifact.name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => LoadError::Load(e),
            None => LoadError::NotLoaded,
        })
    }
}

fn default_bundled_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_installed_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENGINE_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .map(|d| d.join("tunnelbind").join("engines"))
        .unwrap_or_else(|| PathBuf::from("."))
}
