use async_trait::async_trait;
use std::sync::Arc;
use tunnelbind_engine::{Engine, EngineError, EngineResult, LogLevel, Session, SessionBuilder};

use crate::session::EmbeddedSession;
use crate::{report, EmbeddedConfig};

/// The in-process engine
#[derive(Debug, Clone)]
pub struct EmbeddedEngine {
    artifact: String,
    config: EmbeddedConfig,
}

impl EmbeddedEngine {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self::with_config(artifact, EmbeddedConfig::default())
    }

    pub fn with_config(artifact: impl Into<String>, config: EmbeddedConfig) -> Self {
        Self {
            artifact: artifact.into(),
            config,
        }
    }

    pub fn config(&self) -> &EmbeddedConfig {
        &self.config
    }
}

impl Engine for EmbeddedEngine {
    fn artifact(&self) -> &str {
        &self.artifact
    }

    fn session_builder(&self) -> Box<dyn SessionBuilder> {
        Box::new(EmbeddedSessionBuilder {
            config: self.config.clone(),
            authtoken: None,
            metadata: None,
        })
    }
}

#[derive(Debug)]
pub struct EmbeddedSessionBuilder {
    config: EmbeddedConfig,
    authtoken: Option<String>,
    metadata: Option<String>,
}

#[async_trait]
impl SessionBuilder for EmbeddedSessionBuilder {
    fn authtoken(&mut self, token: String) {
        self.authtoken = Some(token);
    }

    fn metadata(&mut self, metadata: String) {
        self.metadata = Some(metadata);
    }

    async fn connect(&self) -> EngineResult<Arc<dyn Session>> {
        let token = match self.authtoken.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err(EngineError::MissingAuthtoken),
        };

        if let Some(accepted) = &self.config.accepted_authtokens {
            if !accepted.iter().any(|t| t == token) {
                return Err(EngineError::AuthenticationFailed(
                    "authtoken rejected".to_string(),
                ));
            }
        }

        let session = EmbeddedSession::new(self.config.clone(), self.metadata.clone());
        report(
            LogLevel::Info,
            "tunnelbind_embedded::session",
            format!("session established: {}", session.id()),
        );
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_authtoken() {
        let engine = EmbeddedEngine::new("test");
        let builder = engine.session_builder();
        assert!(matches!(
            builder.connect().await,
            Err(EngineError::MissingAuthtoken)
        ));

        let mut builder = engine.session_builder();
        builder.authtoken("   ".to_string());
        assert!(matches!(
            builder.connect().await,
            Err(EngineError::MissingAuthtoken)
        ));
    }

    #[tokio::test]
    async fn test_connect_checks_accepted_tokens() {
        let engine = EmbeddedEngine::with_config(
            "test",
            EmbeddedConfig {
                accepted_authtokens: Some(vec!["good".to_string()]),
                ..Default::default()
            },
        );

        let mut builder = engine.session_builder();
        builder.authtoken("bad".to_string());
        assert!(matches!(
            builder.connect().await,
            Err(EngineError::AuthenticationFailed(_))
        ));

        let mut builder = engine.session_builder();
        builder.authtoken("good".to_string());
        let session = builder.connect().await.unwrap();
        assert!(session.id().starts_with("ses_"));
    }
}
