//! OCI registry client.
//!
//! Speaks the distribution API directly over HTTP: manifests and indices by
//! tag or digest, blob upload with cross-repo mounting, and bearer-token
//! auth resolved from the default keychain. Everything pushed by this crate
//! is pushed by computed digest, so the returned reference uniquely
//! identifies the artifact.

pub mod auth;

use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageConfiguration, ImageIndex, ImageManifest,
    MediaType,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use auth::Keychain;

/// Media types accepted when fetching a manifest
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

const INDEX_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

const IMAGE_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// Whether a media type names a multi-platform index
pub fn is_index_media_type(media_type: &str) -> bool {
    INDEX_MEDIA_TYPES.contains(&media_type)
}

/// Whether a media type names a single-platform image manifest
pub fn is_image_media_type(media_type: &str) -> bool {
    IMAGE_MEDIA_TYPES.contains(&media_type)
}

/// A registry location plus either a tag or a digest.
///
/// After composition, entities are always identified by digest; tags only
/// identify inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry host (and optional port)
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Tag, when the reference was tag-addressed
    pub tag: Option<String>,
    /// Digest (`sha256:<hex>`), when content-addressed
    pub digest: Option<String>,
}

impl Reference {
    /// Parse a reference of the form `registry/repo[:tag][@sha256:hex]`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::invalid_config("empty image reference"));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => {
                if !digest.starts_with("sha256:") {
                    return Err(Error::invalid_config(format!(
                        "reference {input:?} carries an unsupported digest algorithm"
                    )));
                }
                (rest, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // A ':' after the last '/' separates the tag from the name.
        let (name, tag) = match rest.rfind('/') {
            Some(slash) => match rest[slash..].find(':') {
                Some(colon) => {
                    let at = slash + colon;
                    (&rest[..at], Some(rest[at + 1..].to_string()))
                }
                None => (rest, None),
            },
            None => match rest.find(':') {
                Some(colon) => (&rest[..colon], Some(rest[colon + 1..].to_string())),
                None => (rest, None),
            },
        };

        let (registry, repository) = match name.split_once('/') {
            Some((head, tail)) if head.contains('.') || head.contains(':') || head == "localhost" => {
                (head.to_string(), tail.to_string())
            }
            _ => {
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{name}")
                };
                ("docker.io".to_string(), repository)
            }
        };

        if repository.is_empty() {
            return Err(Error::invalid_config(format!(
                "reference {input:?} names no repository"
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The same repository, addressed purely by the given digest
    #[must_use]
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    /// The identity used when pulling: digest wins over tag, default `latest`
    pub fn identifier(&self) -> String {
        if let Some(digest) = &self.digest {
            digest.clone()
        } else if let Some(tag) = &self.tag {
            tag.clone()
        } else {
            "latest".to_string()
        }
    }

    /// Hostname the distribution API lives on
    pub fn api_host(&self) -> &str {
        if self.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    /// Base URL of the distribution API for this reference
    pub fn api_base(&self) -> String {
        let scheme = if self.registry.starts_with("localhost")
            || self.registry.starts_with("127.0.0.1")
            || self.registry.starts_with("::1")
        {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}/v2/{}", self.api_host(), self.repository)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compute the `sha256:<hex>` digest of a byte payload
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Raw manifest bytes together with their wire identity
#[derive(Debug, Clone)]
pub struct RawManifest {
    /// The manifest document exactly as served
    pub bytes: Vec<u8>,
    /// Media type reported by the registry
    pub media_type: String,
    /// Digest of the document
    pub digest: String,
}

impl RawManifest {
    /// Descriptor for this manifest as stored
    pub fn descriptor(&self) -> Result<Descriptor> {
        descriptor(&self.media_type, &self.digest, self.bytes.len() as u64)
    }
}

pub(crate) fn descriptor(media_type: &str, digest: &str, size: u64) -> Result<Descriptor> {
    let digest: Digest = digest
        .parse()
        .map_err(|e| Error::invalid_config(format!("invalid digest {digest:?}: {e}")))?;
    DescriptorBuilder::default()
        .media_type(MediaType::from(media_type))
        .digest(digest)
        .size(size)
        .build()
        .map_err(|e| Error::invalid_config(format!("descriptor: {e}")))
}

#[derive(Debug, Clone)]
struct Challenge {
    scheme: String,
    params: HashMap<String, String>,
}

fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, rest) = header.split_once(' ')?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Client for the OCI distribution API.
///
/// Safe for concurrent use; bearer tokens are cached per repository/scope.
pub struct RegistryClient {
    http: reqwest::Client,
    keychain: Keychain,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    /// Create a client backed by the default keychain
    pub fn new() -> Result<Self> {
        Ok(Self::with_keychain(Keychain::default_keychain()?))
    }

    /// Create a client with an explicit keychain
    pub fn with_keychain(keychain: Keychain) -> Self {
        Self {
            http: reqwest::Client::new(),
            keychain,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the descriptor for a reference.
    ///
    /// Fails with [`Error::NotFound`] when the registry has no such
    /// manifest, [`Error::Auth`] when credentials are missing or rejected,
    /// and [`Error::Transport`] for anything else.
    pub async fn get(&self, reference: &Reference) -> Result<Descriptor> {
        self.manifest(reference).await?.descriptor()
    }

    /// Fetch a manifest document verbatim.
    pub async fn manifest(&self, reference: &Reference) -> Result<RawManifest> {
        let url = format!("{}/manifests/{}", reference.api_base(), reference.identifier());
        let response = self
            .send(reference, false, Method::GET, &url, None, Some(MANIFEST_ACCEPT))
            .await?;
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        let digest = header_digest.unwrap_or_else(|| sha256_digest(&bytes));
        trace!(reference = %reference, digest = %digest, media_type = %media_type, "fetched manifest");
        Ok(RawManifest {
            bytes,
            media_type,
            digest,
        })
    }

    /// Fetch and decode a single-platform image manifest.
    pub async fn image(&self, reference: &Reference) -> Result<(ImageManifest, RawManifest)> {
        let raw = self.manifest(reference).await?;
        if !is_image_media_type(&raw.media_type) {
            return Err(Error::UnsupportedMediaType {
                media_type: raw.media_type,
            });
        }
        let manifest: ImageManifest = serde_json::from_slice(&raw.bytes)?;
        Ok((manifest, raw))
    }

    /// Fetch and decode a multi-platform index.
    pub async fn index(&self, reference: &Reference) -> Result<(ImageIndex, RawManifest)> {
        let raw = self.manifest(reference).await?;
        if !is_index_media_type(&raw.media_type) {
            return Err(Error::UnsupportedMediaType {
                media_type: raw.media_type,
            });
        }
        let index: ImageIndex = serde_json::from_slice(&raw.bytes)?;
        Ok((index, raw))
    }

    /// Fetch an image's config document.
    pub async fn config(
        &self,
        reference: &Reference,
        manifest: &ImageManifest,
    ) -> Result<ImageConfiguration> {
        let blob = self
            .pull_blob(reference, &manifest.config().digest().to_string())
            .await?;
        Ok(serde_json::from_slice(&blob)?)
    }

    /// Download a blob by digest.
    pub async fn pull_blob(&self, reference: &Reference, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/blobs/{digest}", reference.api_base());
        let response = self
            .send(reference, false, Method::GET, &url, None, None)
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Whether a blob already exists in the repository.
    pub async fn blob_exists(&self, reference: &Reference, digest: &str) -> Result<bool> {
        let url = format!("{}/blobs/{digest}", reference.api_base());
        match self
            .send(reference, false, Method::HEAD, &url, None, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Upload a blob, returning its digest.
    pub async fn push_blob(&self, reference: &Reference, data: Vec<u8>) -> Result<String> {
        let digest = sha256_digest(&data);
        if self.blob_exists(reference, &digest).await? {
            return Ok(digest);
        }
        let start = format!("{}/blobs/uploads/", reference.api_base());
        let response = self
            .send(reference, true, Method::POST, &start, None, None)
            .await?;
        let location = upload_location(reference, &response)?;
        let sep = if location.contains('?') { '&' } else { '?' };
        let put = format!("{location}{sep}digest={digest}");
        self.send_with(
            reference,
            true,
            Method::PUT,
            &put,
            Some(data),
            None,
            Some("application/octet-stream"),
        )
        .await?;
        debug!(reference = %reference, digest = %digest, "pushed blob");
        Ok(digest)
    }

    /// Make a blob available in `target`'s repository, mounting it from
    /// `source` when the registry supports cross-repo mounts and copying
    /// it otherwise.
    pub async fn mount_blob(
        &self,
        target: &Reference,
        source: &Reference,
        digest: &str,
    ) -> Result<()> {
        if target.registry == source.registry {
            let url = format!(
                "{}/blobs/uploads/?mount={digest}&from={}",
                target.api_base(),
                source.repository
            );
            let response = self
                .send(target, true, Method::POST, &url, None, None)
                .await?;
            if response.status() == StatusCode::CREATED {
                return Ok(());
            }
            // 202 means the registry declined the mount and opened a
            // regular upload session instead.
        }
        let blob = self.pull_blob(source, digest).await?;
        self.push_blob(target, blob).await?;
        Ok(())
    }

    /// Push raw manifest bytes under the given identifier (tag or digest).
    pub async fn push_manifest(
        &self,
        reference: &Reference,
        identifier: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String> {
        let digest = sha256_digest(&bytes);
        let url = format!("{}/manifests/{identifier}", reference.api_base());
        self.send_with(
            reference,
            true,
            Method::PUT,
            &url,
            Some(bytes),
            None,
            Some(media_type),
        )
        .await?;
        debug!(reference = %reference, digest = %digest, "pushed manifest");
        Ok(digest)
    }

    /// Serialize and push an image manifest by computed digest; the returned
    /// reference is content-addressed.
    pub async fn write_image_by_digest(
        &self,
        repo: &Reference,
        manifest: &ImageManifest,
    ) -> Result<Reference> {
        let media_type = manifest
            .media_type()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string());
        let bytes = serde_json::to_vec(manifest)?;
        let digest = sha256_digest(&bytes);
        self.push_manifest(repo, &digest, &media_type, bytes).await?;
        Ok(repo.with_digest(digest))
    }

    /// Serialize and push an index by computed digest.
    pub async fn write_index_by_digest(
        &self,
        repo: &Reference,
        index: &ImageIndex,
    ) -> Result<Reference> {
        let media_type = index
            .media_type()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "application/vnd.oci.image.index.v1+json".to_string());
        let bytes = serde_json::to_vec(index)?;
        let digest = sha256_digest(&bytes);
        self.push_manifest(repo, &digest, &media_type, bytes).await?;
        Ok(repo.with_digest(digest))
    }

    async fn send(
        &self,
        reference: &Reference,
        push: bool,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        accept: Option<&str>,
    ) -> Result<reqwest::Response> {
        self.send_with(reference, push, method, url, body, accept, None)
            .await
    }

    async fn send_with(
        &self,
        reference: &Reference,
        push: bool,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        accept: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let scope_key = format!("{}/{}/{}", reference.api_host(), reference.repository, push);
        let mut headers = HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(ACCEPT, HeaderValue::from_str(accept).unwrap_or(HeaderValue::from_static("*/*")));
        }
        if let Some(content_type) = content_type {
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
        }

        let build = |auth: Option<String>| {
            let mut request = self.http.request(method.clone(), url).headers(headers.clone());
            if let Some(auth) = auth {
                request = request.header(AUTHORIZATION, auth);
            }
            if let Some(body) = body.clone() {
                request = request.body(body);
            }
            request
        };

        let cached = self.tokens.lock().await.get(&scope_key).cloned();
        let response = build(cached.clone()).send().await?;
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let authorization = self.authorize(reference, push, &response, &scope_key).await?;
            build(Some(authorization)).send().await?
        } else {
            response
        };

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(Error::not_found(format!("{method} {url}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::auth(
                reference.registry.clone(),
                format!("{method} {url} returned {status}"),
            )),
            _ => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::transport(
                    reference.api_host().to_string(),
                    format!("{method} {url} returned {status}: {detail}"),
                ))
            }
        }
    }

    async fn authorize(
        &self,
        reference: &Reference,
        push: bool,
        response: &reqwest::Response,
        scope_key: &str,
    ) -> Result<String> {
        let challenge = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| {
                Error::auth(reference.registry.clone(), "unparseable auth challenge")
            })?;

        let credential = self.keychain.resolve(&reference.registry)?;

        let authorization = match challenge.scheme.as_str() {
            "basic" => credential
                .map(|c| c.basic_auth())
                .ok_or_else(|| {
                    Error::auth(reference.registry.clone(), "registry requires credentials")
                })?,
            "bearer" => {
                let realm = challenge.params.get("realm").ok_or_else(|| {
                    Error::auth(reference.registry.clone(), "bearer challenge without realm")
                })?;
                let scope = challenge.params.get("scope").cloned().unwrap_or_else(|| {
                    let action = if push { "pull,push" } else { "pull" };
                    format!("repository:{}:{action}", reference.repository)
                });
                let mut request = self.http.get(realm).query(&[("scope", scope.as_str())]);
                if let Some(service) = challenge.params.get("service") {
                    request = request.query(&[("service", service.as_str())]);
                }
                if let Some(credential) = &credential {
                    request = request.header(AUTHORIZATION, credential.basic_auth());
                }
                let token_response = request.send().await?;
                if !token_response.status().is_success() {
                    return Err(Error::auth(
                        reference.registry.clone(),
                        format!("token endpoint returned {}", token_response.status()),
                    ));
                }
                let token: TokenResponse = token_response.json().await?;
                let token = token
                    .token
                    .or(token.access_token)
                    .ok_or_else(|| Error::auth(reference.registry.clone(), "empty token"))?;
                format!("Bearer {token}")
            }
            other => {
                return Err(Error::auth(
                    reference.registry.clone(),
                    format!("unsupported auth scheme {other:?}"),
                ))
            }
        };

        self.tokens
            .lock()
            .await
            .insert(scope_key.to_string(), authorization.clone());
        Ok(authorization)
    }
}

fn upload_location(reference: &Reference, response: &reqwest::Response) -> Result<String> {
    let location = response
        .headers()
        .get("Location")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            Error::transport(
                reference.api_host().to_string(),
                "upload session without Location header",
            )
        })?;
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(location.to_string())
    } else {
        let base = reference.api_base();
        // api_base ends with /v2/<repo>; Location is server-rooted.
        let root = base
            .split("/v2/")
            .next()
            .unwrap_or(&base)
            .to_string();
        Ok(format!("{root}{location}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse_full() {
        let reference = Reference::parse("ghcr.io/acme/tools/base:1.2.3").unwrap();
        assert_eq!(reference.registry, "ghcr.io");
        assert_eq!(reference.repository, "acme/tools/base");
        assert_eq!(reference.tag.as_deref(), Some("1.2.3"));
        assert!(reference.digest.is_none());
        assert_eq!(reference.to_string(), "ghcr.io/acme/tools/base:1.2.3");
    }

    #[test]
    fn test_reference_parse_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let reference = Reference::parse(&format!("ghcr.io/acme/base@{digest}")).unwrap();
        assert_eq!(reference.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(reference.identifier(), digest);
    }

    #[test]
    fn test_reference_parse_registry_with_port() {
        let reference = Reference::parse("localhost:5000/test/image:dev").unwrap();
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "test/image");
        assert!(reference.api_base().starts_with("http://localhost:5000/v2/"));
    }

    #[test]
    fn test_reference_parse_bare_name_defaults_to_docker_hub() {
        let reference = Reference::parse("alpine:3.20").unwrap();
        assert_eq!(reference.registry, "docker.io");
        assert_eq!(reference.repository, "library/alpine");
        assert_eq!(reference.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn test_reference_with_digest_drops_tag() {
        let reference = Reference::parse("ghcr.io/acme/base:latest").unwrap();
        let digest = format!("sha256:{}", "b".repeat(64));
        let pinned = reference.with_digest(digest.clone());
        assert!(pinned.tag.is_none());
        assert_eq!(pinned.identifier(), digest);
    }

    #[test]
    fn test_reference_rejects_empty_and_bad_digest() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("ghcr.io/a@md5:abc").is_err());
    }

    #[test]
    fn test_sha256_digest() {
        // sha256 of the empty string is well known.
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_parse_challenge_bearer() {
        let challenge = parse_challenge(
            "Bearer realm=\"https://auth.example.com/token\",service=\"registry.example.com\",scope=\"repository:a/b:pull\"",
        )
        .unwrap();
        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(
            challenge.params.get("realm").unwrap(),
            "https://auth.example.com/token"
        );
        assert_eq!(challenge.params.get("service").unwrap(), "registry.example.com");
        assert_eq!(challenge.params.get("scope").unwrap(), "repository:a/b:pull");
    }

    #[test]
    fn test_parse_challenge_basic() {
        let challenge = parse_challenge("Basic realm=\"registry\"").unwrap();
        assert_eq!(challenge.scheme, "basic");
    }

    #[test]
    fn test_media_type_classification() {
        assert!(is_index_media_type("application/vnd.oci.image.index.v1+json"));
        assert!(is_index_media_type(
            "application/vnd.docker.distribution.manifest.list.v2+json"
        ));
        assert!(is_image_media_type("application/vnd.oci.image.manifest.v1+json"));
        assert!(!is_image_media_type("application/vnd.oci.image.index.v1+json"));
        assert!(!is_index_media_type("text/plain"));
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let digest = format!("sha256:{}", "c".repeat(64));
        let descriptor =
            descriptor("application/vnd.oci.image.layer.v1.tar+gzip", &digest, 42).unwrap();
        assert_eq!(descriptor.size(), 42);
        assert_eq!(descriptor.digest().to_string(), digest);
    }
}
