use std::sync::Arc;
use tunnelbind_engine::{Artifact, ArtifactLoader, ArtifactSource, Engine};

use crate::{EmbeddedConfig, EmbeddedEngine};

/// Loads the statically linked engine for every artifact.
///
/// The artifact's file does not need to exist: the engine is part of this
/// binary, so resolution only determines the reported artifact name.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedLoader {
    config: EmbeddedConfig,
}

impl EmbeddedLoader {
    pub fn new(config: EmbeddedConfig) -> Self {
        Self { config }
    }
}

impl ArtifactLoader for EmbeddedLoader {
    fn load(
        &self,
        artifact: &Artifact,
        source: &ArtifactSource,
    ) -> Result<Arc<dyn Engine>, String> {
        tracing::debug!(
            "Linking embedded engine for {} ({})",
            artifact.name,
            source.path().display()
        );
        Ok(Arc::new(EmbeddedEngine::with_config(
            artifact.name,
            self.config.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelbind_engine::{EngineLoader, Libc, Platform};

    #[test]
    fn test_loads_for_any_supported_platform() {
        let loader = EngineLoader::new(Arc::new(EmbeddedLoader::default()));
        let engine = loader
            .load(&Platform::new("linux", "aarch64", Some(Libc::Musl)))
            .unwrap();
        assert_eq!(engine.artifact(), "linux-arm64-musl");
    }
}
