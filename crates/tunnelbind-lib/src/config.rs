use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tunnelbind_engine::{TunnelClass, AUTHTOKEN_ENV};

use crate::{Error, Result};

/// Settings for the default session and tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Authentication credential; falls back to the environment when unset
    pub authtoken: Option<String>,
    /// Opaque session metadata
    pub metadata: Option<String>,
    /// Class of the default tunnel
    #[serde(serialize_with = "serialize_class", deserialize_with = "deserialize_class")]
    pub class: TunnelClass,
}

impl SessionConfig {
    /// Read the credential from the environment
    pub fn from_env() -> Result<Self> {
        let authtoken = std::env::var(AUTHTOKEN_ENV)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(Error::MissingAuthtoken)?;

        Ok(Self {
            authtoken: Some(authtoken),
            ..Default::default()
        })
    }

    pub fn with_authtoken(mut self, authtoken: impl Into<String>) -> Self {
        self.authtoken = Some(authtoken.into());
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_class(mut self, class: TunnelClass) -> Self {
        self.class = class;
        self
    }
}

fn serialize_class<S: Serializer>(
    class: &TunnelClass,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(class.as_str())
}

fn deserialize_class<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<TunnelClass, D::Error> {
    let name = String::deserialize(deserializer)?;
    name.parse().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_class_is_http() {
        let config = SessionConfig::default();
        assert_eq!(config.class, TunnelClass::Http);
        assert!(config.authtoken.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let config = SessionConfig::default()
            .with_authtoken("tok")
            .with_metadata("meta")
            .with_class(TunnelClass::Tcp);
        assert_eq!(config.authtoken.as_deref(), Some("tok"));
        assert_eq!(config.metadata.as_deref(), Some("meta"));
        assert_eq!(config.class, TunnelClass::Tcp);
    }

    #[test]
    fn test_yaml_class_names() {
        let config: SessionConfig = serde_yaml::from_str("class: tls\nmetadata: edge\n").unwrap();
        assert_eq!(config.class, TunnelClass::Tls);
        assert_eq!(config.metadata.as_deref(), Some("edge"));

        let err = serde_yaml::from_str::<SessionConfig>("class: udp\n").unwrap_err();
        assert!(err.to_string().contains("udp"));

        let yaml = serde_yaml::to_string(&SessionConfig::default()).unwrap();
        assert!(yaml.contains("class: http"));
    }
}
