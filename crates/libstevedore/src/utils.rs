//! Utility functionality

use std::fs::{self, DirBuilder};
use std::io::Write;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use nix::sys::stat::Mode;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ValidationError;

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]+$").expect("name pattern is a valid regex")
});

static NAMESPACE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("namespace pattern is a valid regex")
});

/// Length of the abbreviated ID shown to users.
pub const SHORT_ID_LEN: usize = 12;

/// Generates a random 64 character lowercase hex container ID.
pub fn generate_id() -> String {
    (0..32).map(|_| format!("{:02x}", fastrand::u8(..))).collect()
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Checks a container or volume name against the Docker naming rule.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::Name(name.to_owned()))
    }
}

pub fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    if NAMESPACE_REGEX.is_match(namespace) {
        Ok(())
    } else {
        Err(ValidationError::Namespace(namespace.to_owned()))
    }
}

/// Parses a human readable size such as `512m` or `1g` into bytes.
pub fn parse_size(input: &str) -> Result<u64, ValidationError> {
    let invalid = || ValidationError::Size(input.to_owned());
    let lower = input.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1 << 20),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1 << 30),
        Some('t') => (&trimmed[..trimmed.len() - 1], 1 << 40),
        Some(_) => (trimmed, 1),
        None => return Err(invalid()),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Merges `overrides` into `base` keeping the order of first appearance.
/// Entries without `=` in `overrides` are dropped, as the calling
/// environment is not forwarded into containers.
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for entry in base.iter().chain(overrides.iter()) {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        match merged.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_owned(),
            None => merged.push((key.to_owned(), value.to_owned())),
        }
    }
    merged
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum MkdirWithModeError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("metadata doesn't match the expected attributes")]
    MetadataMismatch,
}

/// Creates the specified directory and all parent directories with the
/// specified permissions, then checks that the leaf is owned by `owner`.
pub fn create_dir_all_with_mode<P: AsRef<Path>>(
    path: P,
    owner: u32,
    mode: Mode,
) -> Result<(), MkdirWithModeError> {
    let path = path.as_ref();
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(mode.bits())
            .create(path)?;
    }

    let metadata = path.metadata()?;
    if metadata.is_dir()
        && metadata.st_uid() == owner
        && metadata.st_mode() & mode.bits() == mode.bits()
    {
        Ok(())
    } else {
        Err(MkdirWithModeError::MetadataMismatch)
    }
}

/// Creates a fresh directory restricted to the owner. Fails if the leaf
/// already exists; missing parents are created.
pub fn create_private_dir(path: &Path) -> Result<(), MkdirWithModeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    DirBuilder::new()
        .mode(Mode::S_IRWXU.bits())
        .create(path)?;
    Ok(())
}

/// Writes `contents` to a temporary sibling and renames it over `path`, so
/// concurrent readers observe either the old or the new file.
pub fn atomic_write<P: AsRef<Path>>(path: P, contents: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp-{:08x}",
        file_name.to_string_lossy(),
        fastrand::u32(..)
    ));
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Removes a directory tree, treating a missing directory as success.
pub fn remove_dir_all_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

pub trait PathBufExt {
    fn normalize(&self) -> PathBuf;
}

impl PathBufExt for Path {
    /// Normalizes a path. In contrast to canonicalize the path does not need to exist.
    fn normalize(&self) -> PathBuf {
        let mut ret = PathBuf::new();
        for component in self.components() {
            match component {
                Component::Prefix(..) | Component::CurDir => {}
                Component::RootDir => ret.push(component.as_os_str()),
                Component::ParentDir => {
                    ret.pop();
                }
                Component::Normal(c) => ret.push(c),
            }
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        assert_ne!(id, generate_id());
        assert_eq!(short_id(&id).len(), SHORT_ID_LEN);
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web").is_ok());
        assert!(validate_name("web_1.prod-a").is_ok());
        assert!(validate_name("w").is_err());
        assert!(validate_name("-web").is_err());
        assert!(validate_name("we/b").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("64kb").unwrap(), 64 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("12x").is_err());
    }

    #[test]
    fn test_merge_env() {
        let base = vec!["PATH=/bin".to_string(), "A=1".to_string()];
        let overrides = vec!["A=2".to_string(), "B=x=y".to_string(), "C".to_string()];
        assert_eq!(
            merge_env(&base, &overrides),
            vec![
                "PATH=/bin".to_string(),
                "A=2".to_string(),
                "B=x=y".to_string(),
            ]
        );
    }

    #[test]
    fn test_create_private_dir() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("a/b/c");
        create_private_dir(&dir)?;
        let mode = fs::metadata(&dir)?.permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert!(
            create_private_dir(&dir).is_err(),
            "existing directory must be rejected"
        );
        Ok(())
    }

    #[test]
    fn test_atomic_write_replaces() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("file");
        atomic_write(&path, b"one")?;
        atomic_write(&path, b"two")?;
        assert_eq!(fs::read_to_string(&path)?, "two");
        assert_eq!(fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_remove_dir_all_if_exists() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("gone");
        remove_dir_all_if_exists(&dir)?;
        fs::create_dir(&dir)?;
        remove_dir_all_if_exists(&dir)?;
        assert!(!dir.exists());
        Ok(())
    }

    #[test]
    fn test_normalize() {
        assert_eq!(Path::new("/a/./b/../c").normalize(), PathBuf::from("/a/c"));
        assert_eq!(Path::new("/../a").normalize(), PathBuf::from("/a"));
    }
}
