//! Registry credential resolution.
//!
//! Credentials come from the standard docker config file
//! (`$DOCKER_CONFIG/config.json`, default `~/.docker/config.json`). The same
//! document model renders the auth blob copied into dind sandboxes so
//! `docker login` state inside the sandbox matches the host.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};

/// Legacy alias Docker Hub credentials are stored under
const DOCKER_HUB_ALIAS: &str = "https://index.docker.io/v1/";

/// A username/password pair for one registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Registry username
    pub username: String,
    /// Registry password or token
    pub password: String,
}

impl Credential {
    /// The `Authorization: Basic` header value for this credential
    pub fn basic_auth(&self) -> String {
        let joined = format!("{}:{}", self.username, self.password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(joined)
        )
    }
}

/// One entry of the docker config `auths` map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthEntry {
    /// Registry username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Registry password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Base64 `username:password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl AuthEntry {
    fn credential(&self, registry: &str) -> Result<Credential> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(Credential {
                username: username.clone(),
                password: password.clone(),
            });
        }
        let auth = self
            .auth
            .as_deref()
            .ok_or_else(|| Error::auth(registry, "auth entry carries no credentials"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth)
            .map_err(|e| Error::auth(registry, format!("invalid auth encoding: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| Error::auth(registry, format!("invalid auth encoding: {e}")))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::auth(registry, "auth entry is not user:pass"))?;
        Ok(Credential {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// The docker config file, reduced to the `auths` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Per-registry auth entries
    #[serde(default)]
    pub auths: BTreeMap<String, AuthEntry>,
}

/// Resolves per-registry credentials from the default docker keychain.
///
/// Resolution failures (unreadable or malformed config) are authentication
/// errors, distinct from network failures; a missing file simply yields
/// anonymous access.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    config: DockerConfig,
}

impl Keychain {
    /// Load the default keychain.
    ///
    /// Honors `DOCKER_CONFIG`; a missing config file is not an error.
    pub fn default_keychain() -> Result<Self> {
        let path = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir).join("config.json"),
            None => match dirs::home_dir() {
                Some(home) => home.join(".docker").join("config.json"),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            debug!(path = %path.display(), "no docker config; anonymous registry access");
            return Ok(Self::default());
        }
        let raw = std::fs::read(&path)
            .map_err(|e| Error::auth("keychain", format!("read {}: {e}", path.display())))?;
        let config: DockerConfig = serde_json::from_slice(&raw)
            .map_err(|e| Error::auth("keychain", format!("parse {}: {e}", path.display())))?;
        Ok(Self { config })
    }

    /// Build a keychain from an in-memory config (tests, generated blobs)
    pub fn from_config(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Resolve credentials for a registry host, if any are configured.
    pub fn resolve(&self, registry: &str) -> Result<Option<Credential>> {
        let candidates: &[&str] = if registry == "docker.io" || registry == "registry-1.docker.io" {
            &["docker.io", "registry-1.docker.io", DOCKER_HUB_ALIAS, "index.docker.io"]
        } else {
            &[]
        };
        if let Some(entry) = self.config.auths.get(registry) {
            return entry.credential(registry).map(Some);
        }
        for key in candidates {
            if let Some(entry) = self.config.auths.get(*key) {
                return entry.credential(registry).map(Some);
            }
        }
        Ok(None)
    }

    /// Render the in-container auth document for the given registries.
    ///
    /// The output is the standard `config.json` shape,
    /// `{"auths": {"<registry>": {"username", "password", "auth"}}}`,
    /// including only registries with resolvable credentials.
    pub fn render_config_json(&self, registries: &[String]) -> Result<String> {
        let mut auths = BTreeMap::new();
        for registry in registries {
            if let Some(credential) = self.resolve(registry)? {
                let joined = format!("{}:{}", credential.username, credential.password);
                auths.insert(
                    registry.clone(),
                    AuthEntry {
                        username: Some(credential.username),
                        password: Some(credential.password),
                        auth: Some(base64::engine::general_purpose::STANDARD.encode(joined)),
                    },
                );
            }
        }
        Ok(serde_json::to_string(&DockerConfig { auths })?)
    }
}

/// Registry mirror configuration carried into dind and k3s sandboxes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryMirrors {
    /// Mirror endpoints by upstream registry
    pub mirrors: HashMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keychain_with(registry: &str, entry: AuthEntry) -> Keychain {
        let mut auths = BTreeMap::new();
        auths.insert(registry.to_string(), entry);
        Keychain::from_config(DockerConfig { auths })
    }

    #[test]
    fn test_resolve_username_password() {
        let keychain = keychain_with(
            "ghcr.io",
            AuthEntry {
                username: Some("octo".into()),
                password: Some("s3cret".into()),
                auth: None,
            },
        );
        let credential = keychain.resolve("ghcr.io").unwrap().unwrap();
        assert_eq!(credential.username, "octo");
        assert_eq!(credential.password, "s3cret");
    }

    #[test]
    fn test_resolve_base64_auth_field() {
        let keychain = keychain_with(
            "ghcr.io",
            AuthEntry {
                username: None,
                password: None,
                auth: Some(base64::engine::general_purpose::STANDARD.encode("octo:s3cret")),
            },
        );
        let credential = keychain.resolve("ghcr.io").unwrap().unwrap();
        assert_eq!(credential.username, "octo");
        assert_eq!(credential.password, "s3cret");
    }

    #[test]
    fn test_resolve_docker_hub_alias() {
        let keychain = keychain_with(
            DOCKER_HUB_ALIAS,
            AuthEntry {
                username: Some("hub".into()),
                password: Some("pw".into()),
                auth: None,
            },
        );
        assert!(keychain.resolve("docker.io").unwrap().is_some());
        assert!(keychain.resolve("registry-1.docker.io").unwrap().is_some());
        assert!(keychain.resolve("ghcr.io").unwrap().is_none());
    }

    #[test]
    fn test_malformed_auth_is_auth_error() {
        let keychain = keychain_with(
            "ghcr.io",
            AuthEntry {
                username: None,
                password: None,
                auth: Some("%%%not-base64%%%".into()),
            },
        );
        let err = keychain.resolve("ghcr.io").unwrap_err();
        assert_eq!(err.category(), "auth");
    }

    #[test]
    fn test_render_config_json_shape() {
        let keychain = keychain_with(
            "registry.example.com",
            AuthEntry {
                username: Some("u".into()),
                password: Some("p".into()),
                auth: None,
            },
        );
        let rendered = keychain
            .render_config_json(&["registry.example.com".to_string(), "unknown.io".to_string()])
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        let entry = &value["auths"]["registry.example.com"];
        assert_eq!(entry["username"], "u");
        assert_eq!(entry["password"], "p");
        assert_eq!(
            entry["auth"],
            base64::engine::general_purpose::STANDARD.encode("u:p")
        );
        assert!(value["auths"].get("unknown.io").is_none());
    }

    #[test]
    fn test_basic_auth_header() {
        let credential = Credential {
            username: "u".into(),
            password: "p".into(),
        };
        assert_eq!(
            credential.basic_auth(),
            format!("Basic {}", base64::engine::general_purpose::STANDARD.encode("u:p"))
        );
    }
}
