use std::sync::{Arc, OnceLock};
use tracing::debug;
use tunnelbind_embedded::EmbeddedLoader;
use tunnelbind_engine::{Engine, EngineLoader, LoadError, Platform};

static ENGINE: OnceLock<Result<Arc<dyn Engine>, LoadError>> = OnceLock::new();

/// The process-wide engine, loaded on first use.
///
/// Both success and failure are memoized: a failed load is reported again on
/// every call and never retried.
pub fn engine() -> Result<Arc<dyn Engine>, LoadError> {
    ENGINE
        .get_or_init(|| {
            let platform = Platform::current();
            debug!("Loading engine for {}", platform);
            EngineLoader::new(Arc::new(EmbeddedLoader::default())).load(&platform)
        })
        .clone()
}

/// Use `engine` instead of loading one. Fails, returning `engine`, when an
/// engine (or a load failure) is already in place.
pub fn install_engine(engine: Arc<dyn Engine>) -> Result<(), Arc<dyn Engine>> {
    ENGINE
        .set(Ok(engine.clone()))
        .map_err(|_| engine)
}
