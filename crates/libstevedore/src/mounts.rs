//! Volume, bind and tmpfs mounts of a new container.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{Mount, MountBuilder};
use serde::{Deserialize, Serialize};

use crate::utils::PathBufExt;
use crate::volumestore::{VolumeStoreError, VolumeStoreGuard};

const PROPAGATIONS: [&str; 6] = [
    "rprivate", "private", "rshared", "shared", "rslave", "slave",
];
const DEFAULT_PROPAGATION: &str = "rprivate";

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("invalid volume specification {0:?}")]
    InvalidSpec(String),
    #[error("mount destination {0:?} is not an absolute path")]
    NotAbsolute(String),
    #[error("duplicate mount point {0:?}")]
    DuplicateDestination(PathBuf),
    #[error("bind source path does not exist: {0:?}")]
    BindSourceMissing(PathBuf),
    #[error("invalid mount option {option:?} in {spec:?}")]
    InvalidOption { spec: String, option: String },
    #[error(transparent)]
    Volume(#[from] VolumeStoreError),
    #[error(transparent)]
    Oci(#[from] oci_spec::OciSpecError),
}

type Result<T> = std::result::Result<T, MountError>;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

/// The user facing description of one mount, as shown by `inspect`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    #[serde(rename = "type")]
    pub kind: MountKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub mode: String,
    pub rw: bool,
    #[serde(default)]
    pub propagation: String,
}

/// Mounts generated for one container.
#[derive(Debug, Default)]
pub struct GeneratedMounts {
    pub mounts: Vec<Mount>,
    pub mount_points: Vec<MountPoint>,
    /// Names of the volumes created for this container only.
    pub anonymous_volumes: Vec<String>,
}

#[derive(Debug, Default)]
struct MountOptions {
    read_only: bool,
    propagation: Option<String>,
}

fn parse_options(spec: &str, raw: &str) -> Result<MountOptions> {
    let mut parsed = MountOptions::default();
    for option in raw.split(',').filter(|o| !o.is_empty()) {
        match option {
            "ro" => parsed.read_only = true,
            "rw" => parsed.read_only = false,
            "z" | "Z" => {}
            p if PROPAGATIONS.contains(&p) => parsed.propagation = Some(p.to_owned()),
            other => {
                return Err(MountError::InvalidOption {
                    spec: spec.to_owned(),
                    option: other.to_owned(),
                })
            }
        }
    }
    Ok(parsed)
}

fn destination(spec: &str, raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(MountError::NotAbsolute(raw.to_owned()));
    }
    let normalized = path.normalize();
    if normalized == Path::new("/") {
        return Err(MountError::InvalidSpec(spec.to_owned()));
    }
    Ok(normalized)
}

fn bind_mount(source: &Path, destination: &Path, options: &MountOptions) -> Result<Mount> {
    let mut opts = vec![
        "rbind".to_owned(),
        options
            .propagation
            .clone()
            .unwrap_or_else(|| DEFAULT_PROPAGATION.to_owned()),
    ];
    if options.read_only {
        opts.push("ro".to_owned());
    }
    Ok(MountBuilder::default()
        .destination(destination)
        .typ("bind")
        .source(source)
        .options(opts)
        .build()?)
}

struct Generator<'g, 's> {
    guard: &'g VolumeStoreGuard<'s>,
    destinations: HashSet<PathBuf>,
    generated: GeneratedMounts,
}

impl Generator<'_, '_> {
    fn claim(&mut self, destination: &Path) -> Result<()> {
        if !self.destinations.insert(destination.to_path_buf()) {
            return Err(MountError::DuplicateDestination(destination.to_path_buf()));
        }
        Ok(())
    }

    fn push_volume(
        &mut self,
        name: &str,
        anonymous: bool,
        destination: PathBuf,
        mode: &str,
        options: &MountOptions,
    ) -> Result<()> {
        let volume = if anonymous {
            let volume = self.guard.create_anonymous()?;
            self.generated.anonymous_volumes.push(volume.name.clone());
            volume
        } else {
            self.guard.create(name, HashMap::new(), false)?
        };
        self.generated
            .mounts
            .push(bind_mount(&volume.mountpoint, &destination, options)?);
        self.generated.mount_points.push(MountPoint {
            kind: MountKind::Volume,
            name: Some(volume.name),
            source: volume.mountpoint,
            destination,
            mode: mode.to_owned(),
            rw: !options.read_only,
            propagation: options.propagation.clone().unwrap_or_default(),
        });
        Ok(())
    }

    fn volume(&mut self, spec: &str) -> Result<()> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, dest, raw_opts) = match parts.as_slice() {
            [dest] => (None, *dest, ""),
            [source, dest] => (Some(*source), *dest, ""),
            [source, dest, opts] => (Some(*source), *dest, *opts),
            _ => return Err(MountError::InvalidSpec(spec.to_owned())),
        };
        let dest = destination(spec, dest)?;
        let options = parse_options(spec, raw_opts)?;
        self.claim(&dest)?;

        match source {
            None => self.push_volume("", true, dest, raw_opts, &options),
            Some(src) if src.starts_with('/') || src.starts_with('.') => {
                let src = fs::canonicalize(src)
                    .map_err(|_| MountError::BindSourceMissing(PathBuf::from(src)))?;
                let mount = bind_mount(&src, &dest, &options)?;
                self.generated.mounts.push(mount);
                self.generated.mount_points.push(MountPoint {
                    kind: MountKind::Bind,
                    name: None,
                    source: src,
                    destination: dest,
                    mode: raw_opts.to_owned(),
                    rw: !options.read_only,
                    propagation: options
                        .propagation
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PROPAGATION.to_owned()),
                });
                Ok(())
            }
            Some("") => Err(MountError::InvalidSpec(spec.to_owned())),
            Some(name) => self.push_volume(name, false, dest, raw_opts, &options),
        }
    }

    fn tmpfs(&mut self, spec: &str) -> Result<()> {
        let (dest, raw_opts) = spec.split_once(':').unwrap_or((spec, ""));
        let dest = destination(spec, dest)?;
        self.claim(&dest)?;

        let mut opts = vec![
            "nosuid".to_owned(),
            "noexec".to_owned(),
            "nodev".to_owned(),
        ];
        let extra = raw_opts.split(',').filter(|o| !o.is_empty());
        opts.extend(extra.map(str::to_owned));
        let rw = !opts.iter().any(|o| o == "ro");
        self.generated.mounts.push(
            MountBuilder::default()
                .destination(dest.clone())
                .typ("tmpfs")
                .source("tmpfs")
                .options(opts)
                .build()?,
        );
        self.generated.mount_points.push(MountPoint {
            kind: MountKind::Tmpfs,
            name: None,
            source: PathBuf::new(),
            destination: dest,
            mode: raw_opts.to_owned(),
            rw,
            propagation: String::new(),
        });
        Ok(())
    }
}

/// Builds the mounts of `-v`, `--tmpfs` and the image's `VOLUME`s. Named
/// and anonymous volumes are created in the store as a side effect, which
/// is why the caller must hold the volume lock.
pub fn generate_mounts(
    guard: &VolumeStoreGuard<'_>,
    volumes: &[String],
    tmpfs: &[String],
    image_volumes: &[String],
) -> Result<GeneratedMounts> {
    let mut generator = Generator {
        guard,
        destinations: HashSet::new(),
        generated: GeneratedMounts::default(),
    };
    for spec in volumes {
        generator.volume(spec)?;
    }
    for spec in tmpfs {
        generator.tmpfs(spec)?;
    }
    for raw in image_volumes {
        let dest = destination(raw, raw)?;
        if generator.destinations.contains(&dest) {
            continue;
        }
        generator.claim(&dest)?;
        generator.push_volume("", true, dest, "", &MountOptions::default())?;
    }
    tracing::debug!(
        mounts = generator.generated.mounts.len(),
        anonymous = generator.generated.anonymous_volumes.len(),
        "mounts generated"
    );
    Ok(generator.generated)
}
