use std::path::{Path, PathBuf};

use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};

use super::reference::Reference;
use super::{
    host_platform, normalize_platform, EnsuredImage, ImageConfig, ImageError, ImageService,
    PullMode, PullOptions,
};

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const CONTAINERD_NAME_ANNOTATION: &str = "io.containerd.image.name";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

type Result<T> = std::result::Result<T, ImageError>;

/// Resolves images from an OCI image layout directory. It holds whatever
/// was imported into it and cannot fetch anything itself.
#[derive(Debug, Clone)]
pub struct LayoutImageStore {
    root: PathBuf,
    snapshotter: String,
}

impl LayoutImageStore {
    pub fn new<P: Into<PathBuf>>(root: P, snapshotter: &str) -> Self {
        Self {
            root: root.into(),
            snapshotter: snapshotter.to_owned(),
        }
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        match digest.split_once(':') {
            Some((alg, hex)) if !alg.is_empty() && !hex.is_empty() && !hex.contains('/') => {
                Ok(self.root.join("blobs").join(alg).join(hex))
            }
            _ => Err(ImageError::Digest(digest.to_owned())),
        }
    }

    fn load_index(&self, path: &Path) -> Result<ImageIndex> {
        ImageIndex::from_file(path).map_err(|err| ImageError::Content {
            path: path.to_path_buf(),
            source: err,
        })
    }

    fn find_descriptor(&self, reference: &Reference) -> Result<Option<Descriptor>> {
        let index_path = self.root.join("index.json");
        if !index_path.exists() {
            return Ok(None);
        }
        let index = self.load_index(&index_path)?;
        let full = reference.to_string();
        let familiar = reference.familiar_name();

        let found = index.manifests().iter().find(|desc| {
            desc.annotations()
                .as_ref()
                .map(|annotations| {
                    [REF_NAME_ANNOTATION, CONTAINERD_NAME_ANNOTATION]
                        .iter()
                        .filter_map(|key| annotations.get(*key))
                        .any(|name| *name == full || *name == familiar)
                })
                .unwrap_or(false)
        });
        Ok(found.cloned())
    }

    /// Follows nested indexes down to the manifest for `platform`.
    fn select_manifest(
        &self,
        desc: Descriptor,
        reference: &str,
        platform: &str,
    ) -> Result<Descriptor> {
        if !is_index(desc.media_type()) {
            return Ok(desc);
        }
        let index = self.load_index(&self.blob_path(desc.digest())?)?;
        let candidate = index
            .manifests()
            .iter()
            .find(|m| {
                m.platform()
                    .as_ref()
                    .map(|p| {
                        let mut name = format!("{}/{}", p.os(), p.architecture());
                        if let Some(variant) = p.variant() {
                            name = format!("{name}/{variant}");
                        }
                        name == platform
                            || platform.starts_with(&format!("{name}/"))
                            || name.starts_with(&format!("{platform}/"))
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| ImageError::PlatformNotFound {
                reference: reference.to_owned(),
                platform: platform.to_owned(),
            })?;
        self.select_manifest(candidate, reference, platform)
    }

    fn load_config(&self, manifest: &ImageManifest) -> Result<ImageConfig> {
        let path = self.blob_path(manifest.config().digest())?;
        let image_config = ImageConfiguration::from_file(&path)
            .map_err(|err| ImageError::Content { path, source: err })?;
        let Some(config) = image_config.config() else {
            return Ok(ImageConfig::default());
        };

        Ok(ImageConfig {
            entrypoint: config.entrypoint().clone().unwrap_or_default(),
            cmd: config.cmd().clone().unwrap_or_default(),
            env: config.env().clone().unwrap_or_default(),
            labels: config.labels().clone().unwrap_or_default(),
            user: config.user().clone().filter(|u| !u.is_empty()),
            working_dir: config.working_dir().clone().filter(|w| !w.is_empty()),
            stop_signal: config.stop_signal().clone().filter(|s| !s.is_empty()),
            volumes: config.volumes().clone().unwrap_or_default(),
        })
    }
}

fn is_index(media_type: &MediaType) -> bool {
    matches!(media_type, MediaType::ImageIndex) || media_type.to_string() == DOCKER_MANIFEST_LIST
}

impl ImageService for LayoutImageStore {
    #[tracing::instrument(level = "debug", skip(self, opts))]
    fn ensure_image(&self, raw: &str, opts: &PullOptions) -> Result<EnsuredImage> {
        let reference = Reference::parse(raw)?;
        if opts.mode == PullMode::Always {
            return Err(ImageError::PullUnsupported(reference.to_string()));
        }
        let platform = match &opts.platform {
            Some(p) => normalize_platform(p)?,
            None => host_platform(),
        };

        let desc = self
            .find_descriptor(&reference)?
            .ok_or_else(|| ImageError::NotFound(reference.to_string()))?;
        let manifest_desc = self.select_manifest(desc, &reference.to_string(), &platform)?;
        let manifest_path = self.blob_path(manifest_desc.digest())?;
        let manifest = ImageManifest::from_file(&manifest_path).map_err(|err| ImageError::Content {
            path: manifest_path,
            source: err,
        })?;
        let config = self.load_config(&manifest)?;
        tracing::debug!(reference = %reference, digest = %manifest_desc.digest(), "image resolved");

        Ok(EnsuredImage {
            reference: reference.to_string(),
            digest: manifest_desc.digest().to_string(),
            config,
            snapshotter: self.snapshotter.clone(),
            platform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::fs;

    struct Layout {
        dir: tempfile::TempDir,
        counter: u32,
    }

    impl Layout {
        fn new() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            fs::create_dir_all(dir.path().join("blobs/sha256"))?;
            fs::write(
                dir.path().join("oci-layout"),
                r#"{"imageLayoutVersion":"1.0.0"}"#,
            )?;
            Ok(Self { dir, counter: 0 })
        }

        fn blob(&mut self, value: serde_json::Value) -> Result<(String, usize)> {
            self.counter += 1;
            let digest = format!("sha256:{:064x}", self.counter);
            let data = serde_json::to_vec(&value)?;
            fs::write(
                self.dir.path().join("blobs/sha256").join(&digest[7..]),
                &data,
            )?;
            Ok((digest, data.len()))
        }

        fn image(&mut self, cmd: &[&str]) -> Result<(String, usize)> {
            let (config_digest, config_size) = self.blob(json!({
                "architecture": "amd64",
                "os": "linux",
                "config": {
                    "Cmd": cmd,
                    "Env": ["PATH=/usr/bin:/bin"],
                    "Labels": {"org.example": "yes"},
                    "Volumes": {"/data": {}}
                },
                "rootfs": {"type": "layers", "diff_ids": []},
                "history": []
            }))?;
            self.blob(json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "digest": config_digest,
                    "size": config_size
                },
                "layers": []
            }))
        }

        fn index(&self, manifests: serde_json::Value) -> Result<()> {
            fs::write(
                self.dir.path().join("index.json"),
                serde_json::to_vec(&json!({"schemaVersion": 2, "manifests": manifests}))?,
            )?;
            Ok(())
        }

        fn store(&self) -> LayoutImageStore {
            LayoutImageStore::new(self.dir.path(), "overlayfs")
        }
    }

    #[test]
    fn test_resolve_by_ref_name() -> Result<()> {
        let mut layout = Layout::new()?;
        let (digest, size) = layout.image(&["/bin/sh"])?;
        layout.index(json!([{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": digest,
            "size": size,
            "annotations": {REF_NAME_ANNOTATION: "docker.io/library/alpine:latest"}
        }]))?;

        let store = layout.store();
        let image = store.ensure_image("alpine", &PullOptions::default())?;
        assert_eq!(image.reference, "docker.io/library/alpine:latest");
        assert_eq!(image.digest, digest);
        assert_eq!(image.config.cmd, vec!["/bin/sh"]);
        assert_eq!(image.config.labels["org.example"], "yes");
        assert_eq!(image.config.volumes, vec!["/data"]);
        assert_eq!(image.snapshotter, "overlayfs");
        Ok(())
    }

    #[test]
    fn test_resolve_nested_index_by_platform() -> Result<()> {
        let mut layout = Layout::new()?;
        let (amd, amd_size) = layout.image(&["amd"])?;
        let (arm, arm_size) = layout.image(&["arm"])?;
        let (nested, nested_size) = layout.blob(json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": amd,
                    "size": amd_size,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": arm,
                    "size": arm_size,
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
                }
            ]
        }))?;
        layout.index(json!([{
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "digest": nested,
            "size": nested_size,
            "annotations": {REF_NAME_ANNOTATION: "alpine:latest"}
        }]))?;

        let store = layout.store();
        let opts = |p: &str| PullOptions {
            mode: PullMode::Missing,
            platform: Some(p.to_owned()),
        };
        let amd_image = store.ensure_image("alpine", &opts("linux/amd64"))?;
        assert_eq!(amd_image.config.cmd, vec!["amd"]);
        let arm_image = store.ensure_image("alpine", &opts("linux/arm64"))?;
        assert_eq!(arm_image.config.cmd, vec!["arm"]);
        assert!(matches!(
            store.ensure_image("alpine", &opts("linux/s390x")),
            Err(ImageError::PlatformNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_missing_image_and_pull_always() -> Result<()> {
        let layout = Layout::new()?;
        let store = layout.store();
        assert!(matches!(
            store.ensure_image("alpine", &PullOptions::default()),
            Err(ImageError::NotFound(_))
        ));
        let always = PullOptions {
            mode: PullMode::Always,
            platform: None,
        };
        assert!(matches!(
            store.ensure_image("alpine", &always),
            Err(ImageError::PullUnsupported(_))
        ));
        Ok(())
    }
}
