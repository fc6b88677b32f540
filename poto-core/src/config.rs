//! Application configuration.
//!
//! Resolution order, lowest to highest priority: built-in defaults, a YAML
//! file (`poto.yaml` by convention), then `POTO_*` environment variables.

use std::path::Path;
use std::time::Duration;

use poto_codec::CodecLimits;
use serde::Deserialize;

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Load(String),
    Invalid { key: &'static str, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Load(msg) => write!(f, "Config load error: {msg}"),
            ConfigError::Invalid { key, message } => {
                write!(f, "Invalid config value for '{key}': {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which session backend the server assembles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackendKind {
    Memory,
    Cookie,
}

/// Recognized options of the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PotoConfig {
    /// Derives the session signing and encryption keys.
    pub secret: String,
    /// Key for bearer token signature and verification. Falls back to
    /// `secret` when empty.
    pub jwt_secret: String,
    /// Ceiling for session record idle age, in milliseconds.
    pub session_max_age_ms: u64,
    /// Codec recursion ceiling.
    pub max_depth: usize,
    /// Codec string ceiling in bytes.
    pub max_string_len: usize,
    /// Codec blob/buffer ceiling in bytes.
    pub max_blob_bytes: usize,
    pub session_backend: SessionBackendKind,
    /// Emit the `Secure` attribute on the session cookie.
    pub cookie_secure: bool,
}

impl Default for PotoConfig {
    fn default() -> Self {
        let defaults = CodecLimits::default();
        Self {
            secret: "poto-development-secret".to_string(),
            jwt_secret: String::new(),
            session_max_age_ms: 24 * 60 * 60 * 1000,
            max_depth: defaults.max_depth,
            max_string_len: defaults.max_string_len,
            max_blob_bytes: defaults.max_blob_bytes,
            session_backend: SessionBackendKind::Memory,
            cookie_secure: false,
        }
    }
}

impl PotoConfig {
    /// Parse a YAML document, with defaults for omitted keys.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PotoConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file if it exists, then overlay `POTO_*`
    /// environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Load(e.to_string()))?;
            Self::from_yaml_str(&content)?
        } else {
            Self::default()
        };
        config.overlay_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `POTO_*` environment variables onto this configuration.
    pub fn overlay_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("POTO_SECRET") {
            self.secret = v;
        }
        if let Ok(v) = std::env::var("POTO_JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("POTO_SESSION_MAX_AGE_MS") {
            self.session_max_age_ms = parse_env("POTO_SESSION_MAX_AGE_MS", &v)?;
        }
        if let Ok(v) = std::env::var("POTO_MAX_DEPTH") {
            self.max_depth = parse_env("POTO_MAX_DEPTH", &v)?;
        }
        if let Ok(v) = std::env::var("POTO_MAX_STRING_LEN") {
            self.max_string_len = parse_env("POTO_MAX_STRING_LEN", &v)?;
        }
        if let Ok(v) = std::env::var("POTO_MAX_BLOB_BYTES") {
            self.max_blob_bytes = parse_env("POTO_MAX_BLOB_BYTES", &v)?;
        }
        if let Ok(v) = std::env::var("POTO_SESSION_BACKEND") {
            self.session_backend = match v.as_str() {
                "memory" => SessionBackendKind::Memory,
                "cookie" => SessionBackendKind::Cookie,
                other => {
                    return Err(ConfigError::Invalid {
                        key: "POTO_SESSION_BACKEND",
                        message: format!("expected `memory` or `cookie`, got {other:?}"),
                    })
                }
            };
        }
        if let Ok(v) = std::env::var("POTO_COOKIE_SECURE") {
            self.cookie_secure = matches!(v.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid {
                key: "secret",
                message: "must not be empty".into(),
            });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "maxDepth",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// The bearer token key: `jwtSecret`, falling back to `secret`.
    pub fn jwt_secret(&self) -> &str {
        if self.jwt_secret.is_empty() {
            &self.secret
        } else {
            &self.jwt_secret
        }
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_millis(self.session_max_age_ms)
    }

    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            max_depth: self.max_depth,
            max_string_len: self.max_string_len,
            max_blob_bytes: self.max_blob_bytes,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        key,
        message: format!("unparseable value {raw:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ceilings() {
        let config = PotoConfig::default();
        assert_eq!(config.session_max_age_ms, 86_400_000);
        assert_eq!(config.max_depth, 20);
        assert_eq!(config.max_string_len, 10 * 1024 * 1024);
        assert_eq!(config.max_blob_bytes, 50 * 1024 * 1024);
        assert_eq!(config.session_backend, SessionBackendKind::Memory);
    }

    #[test]
    fn yaml_overrides_and_defaults_compose() {
        let config = PotoConfig::from_yaml_str(
            "secret: s3cret\nsessionBackend: cookie\nmaxDepth: 5\n",
        )
        .unwrap();
        assert_eq!(config.secret, "s3cret");
        assert_eq!(config.session_backend, SessionBackendKind::Cookie);
        assert_eq!(config.max_depth, 5);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_blob_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn jwt_secret_falls_back_to_secret() {
        let mut config = PotoConfig::default();
        assert_eq!(config.jwt_secret(), "poto-development-secret");
        config.jwt_secret = "jwt-only".into();
        assert_eq!(config.jwt_secret(), "jwt-only");
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(PotoConfig::from_yaml_str("secret: \"\"\n").is_err());
    }
}
