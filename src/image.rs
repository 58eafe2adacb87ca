//! Image composition: append test payload layers onto a harness base image.
//!
//! The composer fetches a base reference, applies mutations in order to each
//! image it resolves to (one for a plain manifest, every child for an
//! index), pushes the results by digest into the target repository, and
//! returns a content-addressed reference to the composition.

use flate2::write::GzEncoder;
use flate2::Compression;
use oci_spec::image::{
    DescriptorBuilder, ImageIndex, ImageIndexBuilder, ImageManifest, ImageManifestBuilder,
    MediaType,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::{
    descriptor, is_image_media_type, is_index_media_type, sha256_digest, RawManifest, Reference,
    RegistryClient,
};

const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// One layer to append: a gzipped tar plus its two digests
#[derive(Debug, Clone)]
pub struct Layer {
    /// Gzipped tar bytes as pushed to the registry
    pub data: Vec<u8>,
    /// Digest of the compressed blob
    pub digest: String,
    /// Digest of the uncompressed tar, recorded in the config rootfs
    pub diff_id: String,
}

impl Layer {
    /// Build a layer from an already-gzipped tar and its uncompressed form
    pub fn from_tar_gz(compressed: Vec<u8>, uncompressed: &[u8]) -> Self {
        let digest = sha256_digest(&compressed);
        let diff_id = sha256_digest(uncompressed);
        Self {
            data: compressed,
            digest,
            diff_id,
        }
    }

    /// Build a layer holding the given files, each at an absolute path.
    pub fn from_files(files: &[(String, Vec<u8>)]) -> Result<Self> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let components = crate::content::clean_target(path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_mtime(0);
            builder.append_data(&mut header, components.join("/"), data.as_slice())?;
        }
        let uncompressed = builder.into_inner()?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&uncompressed)?;
        let compressed = encoder.finish()?;
        Ok(Self::from_tar_gz(compressed, &uncompressed))
    }
}

/// The append mutation: layers plus config overrides.
///
/// Fields left empty leave the base untouched; an entirely empty spec is the
/// identity mutation and composes to the base's own digest.
#[derive(Debug, Clone, Default)]
pub struct AppendSpec {
    /// Layers appended on top of the base, in order
    pub layers: Vec<Layer>,
    /// Environment variables; payload values win on duplicate keys
    pub envs: BTreeMap<String, String>,
    /// Replacement command, applied when non-empty
    pub cmd: Vec<String>,
    /// Replacement entrypoint, applied when non-empty
    pub entrypoint: Vec<String>,
    /// Working directory override
    pub working_dir: Option<String>,
    /// User override
    pub user: Option<String>,
}

impl AppendSpec {
    /// Whether this spec changes nothing
    pub fn is_identity(&self) -> bool {
        self.layers.is_empty()
            && self.envs.is_empty()
            && self.cmd.is_empty()
            && self.entrypoint.is_empty()
            && self.working_dir.is_none()
            && self.user.is_none()
    }
}

/// One mutation applied to an image during composition
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Append payload layers and merge config
    Append(AppendSpec),
    /// Set manifest annotations; existing keys are overwritten
    Annotations(BTreeMap<String, String>),
}

impl Mutation {
    fn is_identity(&self) -> bool {
        match self {
            Self::Append(spec) => spec.is_identity(),
            Self::Annotations(annotations) => annotations.is_empty(),
        }
    }
}

/// Composes test images against a registry.
pub struct Composer {
    client: Arc<RegistryClient>,
}

impl Composer {
    /// Create a composer over a registry client
    pub fn new(client: Arc<RegistryClient>) -> Self {
        Self { client }
    }

    /// Append payload layers and config onto `base`, pushing the result into
    /// `target_repo` and returning a digest reference.
    pub async fn append(
        &self,
        base: &Reference,
        target_repo: &Reference,
        spec: &AppendSpec,
    ) -> Result<Reference> {
        self.mutate(base, target_repo, &[Mutation::Append(spec.clone())])
            .await
    }

    /// Apply mutations in order to every image `base` resolves to.
    ///
    /// An index base mutates each child image, preserving per-manifest
    /// metadata and manifest order in the rebuilt index. Media types other
    /// than image manifests and indices fail with
    /// [`Error::UnsupportedMediaType`]. Applying only identity mutations
    /// composes to the base's own digest.
    pub async fn mutate(
        &self,
        base: &Reference,
        target_repo: &Reference,
        mutations: &[Mutation],
    ) -> Result<Reference> {
        let raw = self.client.manifest(base).await?;

        if mutations.iter().all(Mutation::is_identity) {
            debug!(base = %base, "identity mutation; composition is the base itself");
            return Ok(base.with_digest(raw.digest));
        }

        if is_index_media_type(&raw.media_type) {
            self.mutate_index(base, target_repo, mutations, &raw).await
        } else if is_image_media_type(&raw.media_type) {
            let manifest: ImageManifest = serde_json::from_slice(&raw.bytes)?;
            self.mutate_image(base, target_repo, mutations, &manifest)
                .await
        } else {
            Err(Error::UnsupportedMediaType {
                media_type: raw.media_type.clone(),
            })
        }
    }

    async fn mutate_index(
        &self,
        base: &Reference,
        target_repo: &Reference,
        mutations: &[Mutation],
        raw: &RawManifest,
    ) -> Result<Reference> {
        let index: ImageIndex = serde_json::from_slice(&raw.bytes)?;

        let mut manifests = Vec::with_capacity(index.manifests().len());
        for child in index.manifests() {
            let child_type = child.media_type().to_string();
            if !is_image_media_type(&child_type) {
                return Err(Error::UnsupportedMediaType {
                    media_type: child_type,
                });
            }
            let child_ref = base.with_digest(child.digest().to_string());
            let (child_manifest, _) = self.client.image(&child_ref).await?;
            let pushed = self
                .mutate_image(&child_ref, target_repo, mutations, &child_manifest)
                .await?;
            let pushed_digest = pushed
                .digest
                .clone()
                .ok_or_else(|| Error::invalid_config("composed child missing digest"))?;
            let pushed_raw = self.client.manifest(&pushed).await?;

            let digest: oci_spec::image::Digest = pushed_digest.parse().map_err(|e| {
                Error::invalid_config(format!("invalid digest {pushed_digest:?}: {e}"))
            })?;
            let mut builder = DescriptorBuilder::default()
                .media_type(child.media_type().clone())
                .digest(digest)
                .size(pushed_raw.bytes.len() as u64);
            if let Some(platform) = child.platform() {
                builder = builder.platform(platform.clone());
            }
            if let Some(annotations) = child.annotations() {
                builder = builder.annotations(annotations.clone());
            }
            if let Some(urls) = child.urls() {
                builder = builder.urls(urls.clone());
            }
            if let Some(artifact_type) = child.artifact_type() {
                builder = builder.artifact_type(artifact_type.clone());
            }
            manifests.push(
                builder
                    .build()
                    .map_err(|e| Error::invalid_config(format!("index descriptor: {e}")))?,
            );
        }

        let mut builder = ImageIndexBuilder::default()
            .schema_version(index.schema_version())
            .manifests(manifests);
        if let Some(media_type) = index.media_type() {
            builder = builder.media_type(media_type.clone());
        }
        if let Some(annotations) = index.annotations() {
            builder = builder.annotations(annotations.clone());
        }
        let rebuilt = builder
            .build()
            .map_err(|e| Error::invalid_config(format!("index rebuild: {e}")))?;

        self.client.write_index_by_digest(target_repo, &rebuilt).await
    }

    async fn mutate_image(
        &self,
        base: &Reference,
        target_repo: &Reference,
        mutations: &[Mutation],
        manifest: &ImageManifest,
    ) -> Result<Reference> {
        // The composed manifest references every base layer, so each must be
        // resolvable from the target repository.
        for layer in manifest.layers() {
            self.client
                .mount_blob(target_repo, base, &layer.digest().to_string())
                .await?;
        }

        let config_blob = self
            .client
            .pull_blob(base, &manifest.config().digest().to_string())
            .await?;
        let mut config: Value = serde_json::from_slice(&config_blob)?;

        let manifest_media_type = manifest
            .media_type()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string());
        let layer_media_type = if manifest_media_type == DOCKER_MANIFEST {
            DOCKER_LAYER_GZIP
        } else {
            OCI_LAYER_GZIP
        };

        let mut layers = manifest.layers().clone();
        let mut annotations = manifest.annotations().clone().unwrap_or_default();

        for mutation in mutations {
            match mutation {
                Mutation::Append(spec) => {
                    merge_config(&mut config, spec);
                    for layer in &spec.layers {
                        self.client
                            .push_blob(target_repo, layer.data.clone())
                            .await?;
                        layers.push(descriptor(
                            layer_media_type,
                            &layer.digest,
                            layer.data.len() as u64,
                        )?);
                    }
                }
                Mutation::Annotations(extra) => {
                    for (key, value) in extra {
                        annotations.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = self.client.push_blob(target_repo, config_bytes.clone()).await?;
        let config_descriptor = descriptor(
            &manifest.config().media_type().to_string(),
            &config_digest,
            config_bytes.len() as u64,
        )?;

        let mut builder = ImageManifestBuilder::default()
            .schema_version(manifest.schema_version())
            .media_type(MediaType::from(manifest_media_type.as_str()))
            .config(config_descriptor)
            .layers(layers);
        if !annotations.is_empty() {
            builder = builder.annotations(annotations);
        }
        let rebuilt = builder
            .build()
            .map_err(|e| Error::invalid_config(format!("manifest rebuild: {e}")))?;

        self.client.write_image_by_digest(target_repo, &rebuilt).await
    }
}

/// Apply the append spec's config merge rules to a raw config document.
///
/// Environment variables are concatenated as `KEY=VALUE` with payload values
/// replacing base entries on duplicate keys; a non-empty entrypoint replaces
/// the base entrypoint; a non-empty cmd replaces the base cmd; working
/// directory and user override when set; appended layer diff-ids extend the
/// rootfs.
fn merge_config(config: &mut Value, spec: &AppendSpec) {
    if !config.is_object() {
        *config = json!({});
    }
    let root = config.as_object_mut().unwrap();
    let container_config = root.entry("config").or_insert_with(|| json!({}));
    if !container_config.is_object() {
        *container_config = json!({});
    }
    let container_config = container_config.as_object_mut().unwrap();

    if !spec.envs.is_empty() {
        let mut env: Vec<String> = container_config
            .get("Env")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for (key, value) in &spec.envs {
            let rendered = format!("{key}={value}");
            match env.iter().position(|e| e.split('=').next() == Some(key)) {
                Some(at) => env[at] = rendered,
                None => env.push(rendered),
            }
        }
        container_config.insert("Env".to_string(), json!(env));
    }

    if !spec.entrypoint.is_empty() {
        container_config.insert("Entrypoint".to_string(), json!(spec.entrypoint));
    }
    if !spec.cmd.is_empty() {
        container_config.insert("Cmd".to_string(), json!(spec.cmd));
    }
    if let Some(working_dir) = &spec.working_dir {
        container_config.insert("WorkingDir".to_string(), json!(working_dir));
    }
    if let Some(user) = &spec.user {
        container_config.insert("User".to_string(), json!(user));
    }

    if !spec.layers.is_empty() {
        let rootfs = root
            .entry("rootfs")
            .or_insert_with(|| json!({"type": "layers", "diff_ids": []}));
        if let Some(diff_ids) = rootfs
            .as_object_mut()
            .and_then(|r| r.get_mut("diff_ids"))
            .and_then(Value::as_array_mut)
        {
            for layer in &spec.layers {
                diff_ids.push(json!(layer.diff_id));
            }
        }
        let history = root.entry("history").or_insert_with(|| json!([]));
        if let Some(history) = history.as_array_mut() {
            for _ in &spec.layers {
                history.push(json!({"created_by": "imagetest: appended payload layer"}));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_env(pairs: &[(&str, &str)]) -> AppendSpec {
        AppendSpec {
            envs: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..AppendSpec::default()
        }
    }

    #[test]
    fn test_identity_spec() {
        assert!(AppendSpec::default().is_identity());
        assert!(!spec_with_env(&[("A", "1")]).is_identity());
        assert!(Mutation::Append(AppendSpec::default()).is_identity());
        assert!(Mutation::Annotations(BTreeMap::new()).is_identity());
    }

    #[test]
    fn test_merge_env_concatenates_and_overrides() {
        let mut config = json!({
            "config": {"Env": ["PATH=/usr/bin", "A=base"]}
        });
        merge_config(&mut config, &spec_with_env(&[("A", "payload"), ("B", "2")]));
        let env: Vec<&str> = config["config"]["Env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(env, vec!["PATH=/usr/bin", "A=payload", "B=2"]);
    }

    #[test]
    fn test_merge_entrypoint_and_cmd_replace_only_when_nonempty() {
        let mut config = json!({
            "config": {"Entrypoint": ["/init"], "Cmd": ["serve"]}
        });
        merge_config(&mut config, &AppendSpec::default());
        assert_eq!(config["config"]["Entrypoint"][0], "/init");
        assert_eq!(config["config"]["Cmd"][0], "serve");

        let spec = AppendSpec {
            entrypoint: vec!["/bin/sh".into(), "-c".into()],
            cmd: vec!["run-tests".into()],
            ..AppendSpec::default()
        };
        merge_config(&mut config, &spec);
        assert_eq!(config["config"]["Entrypoint"][0], "/bin/sh");
        assert_eq!(config["config"]["Cmd"][0], "run-tests");
    }

    #[test]
    fn test_merge_working_dir_and_user() {
        let mut config = json!({"config": {"WorkingDir": "/", "User": "root"}});
        let spec = AppendSpec {
            working_dir: Some("/work".into()),
            user: Some("65532".into()),
            ..AppendSpec::default()
        };
        merge_config(&mut config, &spec);
        assert_eq!(config["config"]["WorkingDir"], "/work");
        assert_eq!(config["config"]["User"], "65532");
    }

    #[test]
    fn test_merge_preserves_untouched_fields() {
        let mut config = json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Labels": {"a": "b"}},
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        merge_config(&mut config, &spec_with_env(&[("A", "1")]));
        assert_eq!(config["architecture"], "amd64");
        assert_eq!(config["config"]["Labels"]["a"], "b");
    }

    #[test]
    fn test_layer_digests_extend_rootfs() {
        let layer =
            Layer::from_files(&[("/tests/run.sh".to_string(), b"#!/bin/sh".to_vec())]).unwrap();
        let mut config = json!({
            "rootfs": {"type": "layers", "diff_ids": ["sha256:base"]},
            "history": []
        });
        let spec = AppendSpec {
            layers: vec![layer.clone()],
            ..AppendSpec::default()
        };
        merge_config(&mut config, &spec);
        let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
        assert_eq!(diff_ids.len(), 2);
        assert_eq!(diff_ids[1], layer.diff_id);
        assert_eq!(config["history"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_layer_from_files_digests() {
        let layer = Layer::from_files(&[("/t/a".to_string(), b"aaa".to_vec())]).unwrap();
        assert!(layer.digest.starts_with("sha256:"));
        assert!(layer.diff_id.starts_with("sha256:"));
        assert_ne!(layer.digest, layer.diff_id);
        assert_eq!(layer.digest, sha256_digest(&layer.data));

        // The compressed blob must decompress back to the tar the diff-id names.
        let mut decoder = flate2::read::GzDecoder::new(layer.data.as_slice());
        let mut uncompressed = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut uncompressed).unwrap();
        assert_eq!(sha256_digest(&uncompressed), layer.diff_id);
    }

    #[test]
    fn test_layer_relative_path_rejected() {
        assert!(Layer::from_files(&[("relative".to_string(), Vec::new())]).is_err());
    }
}
