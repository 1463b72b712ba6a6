use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use libstevedore::utils::create_dir_all_with_mode;
use nix::sys::stat::Mode;
use nix::unistd::getuid;

const ROOTLESS_ENV: &str = "STEVEDORE_USE_ROOTLESS";

/// Whether the data root has to live somewhere the current user owns.
pub fn rootless_required() -> bool {
    if !getuid().is_root() {
        return true;
    }
    matches!(std::env::var(ROOTLESS_ENV).as_deref(), Ok("true"))
}

/// Picks the data root and makes sure it exists and is private to the
/// current user. An explicitly configured path always wins.
pub fn determine(data_root: Option<PathBuf>) -> Result<PathBuf> {
    let uid = getuid().as_raw();

    if let Some(path) = data_root {
        if !path.exists() {
            create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)
                .with_context(|| format!("failed to create data root {}", path.display()))?;
        }
        let path = path.canonicalize()?;
        return Ok(path);
    }

    if !rootless_required() {
        let path = get_default_data_root();
        create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)
            .with_context(|| format!("failed to create data root {}", path.display()))?;
        return Ok(path);
    }

    // see https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
    if let Ok(path) = std::env::var("XDG_DATA_HOME") {
        let path = Path::new(&path).join("stevedore");
        if create_dir_all_with_mode(&path, uid, Mode::S_IRWXU).is_ok() {
            return Ok(path);
        }
    }

    if let Ok(path) = std::env::var("HOME") {
        if let Ok(resolved) = fs::canonicalize(path) {
            let data_dir = resolved.join(".local/share/stevedore");
            if create_dir_all_with_mode(&data_dir, uid, Mode::S_IRWXU).is_ok() {
                return Ok(data_dir);
            }
        }
    }

    let tmp_dir = get_default_tmp_data_root(uid);
    if create_dir_all_with_mode(&tmp_dir, uid, Mode::S_IRWXU).is_ok() {
        return Ok(tmp_dir);
    }

    bail!("could not find a storage location with suitable permissions for the current user");
}

#[cfg(not(test))]
fn get_default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/stevedore")
}

#[cfg(test)]
fn get_default_data_root() -> PathBuf {
    std::env::temp_dir().join("default_stevedore_data_root")
}

#[cfg(not(test))]
fn get_default_tmp_data_root(uid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/stevedore-{uid}"))
}

#[cfg(test)]
fn get_default_tmp_data_root(uid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("stevedore_tmp_data_root_{uid}"))
}

#[cfg(test)]
mod tests {
    use std::fs::Permissions;
    use std::os::unix::fs::PermissionsExt;

    use anyhow::{Context, Result};
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_user_specified() -> Result<()> {
        // A missing directory is created and returned as an absolute path.
        let tmp = tempfile::tempdir()?;
        let specified_path = tmp.path().join("provided_path");
        let non_abs_path = specified_path.join("../provided_path");
        let path = determine(Some(non_abs_path)).context("failed with specified path")?;
        assert_eq!(path, fs::canonicalize(&specified_path)?);
        assert_eq!(
            fs::metadata(&path)?.permissions().mode() & 0o777,
            Mode::S_IRWXU.bits()
        );
        Ok(())
    }

    #[test]
    fn test_user_specified_exists() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let specified_path = tmp.path().join("provided_path");
        fs::create_dir(&specified_path).context("failed to create dir")?;
        let non_abs_path = specified_path.join("../provided_path");
        let path = determine(Some(non_abs_path)).context("failed with specified path")?;
        assert_eq!(path, fs::canonicalize(&specified_path)?);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_determine_rootless() -> Result<()> {
        std::env::set_var(ROOTLESS_ENV, "true");
        let home = std::env::var_os("HOME");
        let xdg = std::env::var_os("XDG_DATA_HOME");

        // XDG_DATA_HOME
        let tmp = tempfile::tempdir()?;
        let xdg_dir = tmp.path().join("xdg_data");
        std::env::set_var("XDG_DATA_HOME", &xdg_dir);
        let path = determine(None).context("failed with $XDG_DATA_HOME path")?;
        assert_eq!(path, xdg_dir.join("stevedore"));
        assert!(path.exists());

        // An unusable XDG_DATA_HOME falls through to HOME.
        fs::remove_dir_all(xdg_dir.join("stevedore"))?;
        fs::set_permissions(&xdg_dir, Permissions::from_mode(Mode::S_IRUSR.bits()))
            .context("failed to set invalid permissions")?;
        let home_path = tmp.path().join("home");
        fs::create_dir_all(&home_path)?;
        std::env::set_var("HOME", &home_path);
        let result = determine(None);
        fs::set_permissions(&xdg_dir, Permissions::from_mode(Mode::S_IRWXU.bits()))?;

        match home {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
        match xdg {
            Some(xdg) => std::env::set_var("XDG_DATA_HOME", xdg),
            None => std::env::remove_var("XDG_DATA_HOME"),
        }
        std::env::remove_var(ROOTLESS_ENV);

        let path = result.context("failed with $HOME path")?;
        if getuid().is_root() {
            // root ignores the read-only permission and keeps using XDG_DATA_HOME
            assert_eq!(path, xdg_dir.join("stevedore"));
        } else {
            assert_eq!(
                path,
                fs::canonicalize(&home_path)?.join(".local/share/stevedore")
            );
        }
        Ok(())
    }
}
