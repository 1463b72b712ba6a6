//! User, group and umask options.
use std::fs;
use std::path::{Path, PathBuf};

use super::{opt, SpecError, SpecOpt};

/// A passwd or group database entry: name, numeric ID and, for passwd,
/// the primary group.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    id: u32,
    gid: Option<u32>,
    members: Vec<String>,
}

fn read_db(rootfs: &Path, file: &str) -> Result<Vec<Entry>, SpecError> {
    let path = rootfs.join(file);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(SpecError::RootfsFile { path, source: err }),
    };
    let is_passwd = file.ends_with("passwd");
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            let id = fields.get(2)?.parse().ok()?;
            let (gid, members) = if is_passwd {
                (fields.get(3).and_then(|g| g.parse().ok()), Vec::new())
            } else {
                let members = fields
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                (None, members)
            };
            Some(Entry {
                name: fields[0].to_owned(),
                id,
                gid,
                members,
            })
        })
        .collect())
}

/// Resolved numeric identity of the container process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

/// Resolves `user[:group]` and supplementary groups.
///
/// Numeric values are taken as is. Names need the container's root
/// filesystem to be available (`rootfs`); `root` always resolves to 0.
pub fn resolve_identity(
    user: Option<&str>,
    group_add: &[String],
    rootfs: Option<&Path>,
) -> Result<Identity, SpecError> {
    let spec = user.filter(|u| !u.is_empty()).unwrap_or("0");
    let (user_part, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };
    let invalid = || SpecError::User(spec.to_owned());

    let passwd = match rootfs {
        Some(rootfs) => read_db(rootfs, "etc/passwd")?,
        None => Vec::new(),
    };
    let groups = match rootfs {
        Some(rootfs) => read_db(rootfs, "etc/group")?,
        None => Vec::new(),
    };

    let user_entry = passwd
        .iter()
        .find(|e| e.name == user_part || e.id.to_string() == user_part);
    let (uid, user_name) = match (user_part.parse::<u32>(), user_entry) {
        (Ok(uid), entry) => (uid, entry.map(|e| e.name.clone())),
        (Err(_), Some(entry)) => (entry.id, Some(entry.name.clone())),
        (Err(_), None) if user_part == "root" => (0, Some("root".to_owned())),
        (Err(_), None) => return Err(invalid()),
    };

    let lookup_group = |g: &str| -> Result<u32, SpecError> {
        if let Ok(gid) = g.parse::<u32>() {
            return Ok(gid);
        }
        if g == "root" {
            return Ok(0);
        }
        groups
            .iter()
            .find(|e| e.name == g)
            .map(|e| e.id)
            .ok_or_else(|| SpecError::User(g.to_owned()))
    };

    let gid = match group_part {
        Some(g) => lookup_group(g)?,
        None => user_entry.and_then(|e| e.gid).unwrap_or(0),
    };

    let mut additional_gids: Vec<u32> = Vec::new();
    if let Some(name) = &user_name {
        additional_gids.extend(
            groups
                .iter()
                .filter(|g| g.members.iter().any(|m| m == name) && g.id != gid)
                .map(|g| g.id),
        );
    }
    for g in group_add {
        additional_gids.push(lookup_group(g)?);
    }
    additional_gids.sort_unstable();
    additional_gids.dedup();

    Ok(Identity {
        uid,
        gid,
        additional_gids,
    })
}

pub fn parse_umask(umask: &str) -> Result<u32, SpecError> {
    u32::from_str_radix(umask, 8)
        .ok()
        .filter(|v| *v <= 0o777)
        .ok_or_else(|| SpecError::Invalid {
            option: "umask",
            value: umask.to_owned(),
        })
}

pub fn with_identity(identity: Identity, umask: Option<u32>) -> SpecOpt {
    opt(move |spec| {
        let mut process = spec.process().clone().unwrap_or_default();
        let mut user = process.user().clone();
        user.set_uid(identity.uid);
        user.set_gid(identity.gid);
        if !identity.additional_gids.is_empty() {
            user.set_additional_gids(Some(identity.additional_gids));
        }
        if umask.is_some() {
            user.set_umask(umask);
        }
        process.set_user(user);
        spec.set_process(Some(process));
        Ok(())
    })
}

/// Root filesystem used to resolve names, if one is available on disk.
pub fn rootfs_for_lookup(explicit: Option<&PathBuf>) -> Option<&Path> {
    explicit
        .map(PathBuf::as_path)
        .filter(|p| p.join("etc").is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::generate;
    use anyhow::Result;

    fn rootfs() -> Result<tempfile::TempDir> {
        let tmp = tempfile::tempdir()?;
        fs::create_dir_all(tmp.path().join("etc"))?;
        fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nnginx:x:101:101:nginx:/var/cache/nginx:/sbin/nologin\n",
        )?;
        fs::write(
            tmp.path().join("etc/group"),
            "root:x:0:\nnginx:x:101:\nwww:x:33:nginx\naudio:x:29:\n",
        )?;
        Ok(tmp)
    }

    #[test]
    fn test_numeric_without_rootfs() -> Result<()> {
        assert_eq!(resolve_identity(None, &[], None)?, Identity::default());
        let id = resolve_identity(Some("1000:1001"), &["27".to_owned()], None)?;
        let expected = Identity {
            uid: 1000,
            gid: 1001,
            additional_gids: vec![27],
        };
        assert_eq!(id, expected);
        assert_eq!(resolve_identity(Some("root"), &[], None)?.uid, 0);
        assert!(matches!(
            resolve_identity(Some("nginx"), &[], None),
            Err(SpecError::User(_))
        ));
        Ok(())
    }

    #[test]
    fn test_names_from_rootfs() -> Result<()> {
        let tmp = rootfs()?;
        let id = resolve_identity(Some("nginx"), &["audio".to_owned()], Some(tmp.path()))?;
        assert_eq!(id.uid, 101);
        assert_eq!(id.gid, 101);
        assert_eq!(id.additional_gids, vec![29, 33]);

        let id = resolve_identity(Some("nginx:www"), &[], Some(tmp.path()))?;
        assert_eq!(id.gid, 33);
        assert!(resolve_identity(Some("nginx:nogroup"), &[], Some(tmp.path())).is_err());
        Ok(())
    }

    #[test]
    fn test_umask() -> Result<()> {
        assert_eq!(parse_umask("022")?, 0o22);
        assert!(parse_umask("8").is_err());
        assert!(parse_umask("1777").is_err());

        let identity = Identity {
            uid: 5,
            gid: 6,
            additional_gids: vec![7],
        };
        let spec = generate(vec![with_identity(identity, Some(0o27))])?;
        let user = spec.process().as_ref().unwrap().user();
        assert_eq!(user.uid(), 5);
        assert_eq!(user.gid(), 6);
        assert_eq!(user.umask(), Some(0o27));
        assert_eq!(user.additional_gids().as_deref(), Some(&[7][..]));
        Ok(())
    }
}
