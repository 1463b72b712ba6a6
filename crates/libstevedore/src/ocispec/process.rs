//! Process options: command resolution, environment, working directory
//! and systemd mode.
use std::path::PathBuf;
use std::str::FromStr;

use nix::sys::signal::Signal;
use oci_spec::runtime::MountBuilder;

use super::{opt, SpecError, SpecOpt};
use crate::error::ValidationError;
use crate::image::ImageConfig;
use crate::utils;

pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";
/// The signal systemd expects for an orderly shutdown.
pub const SYSTEMD_STOP_SIGNAL: &str = "SIGRTMIN+3";

const INIT_PATHS: [&str; 3] = ["/sbin/init", "/usr/sbin/init", "/usr/local/sbin/init"];
const SYSTEMD_TMPFS: [&str; 4] = ["/run", "/run/lock", "/tmp", "/var/lib/journal"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemdMode {
    #[default]
    False,
    /// Systemd mode when the command is a known init binary.
    True,
    Always,
}

impl FromStr for SystemdMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "false" => Ok(Self::False),
            "true" => Ok(Self::True),
            "always" => Ok(Self::Always),
            _ => Err(ValidationError::Option {
                option: "systemd",
                value: s.to_owned(),
            }),
        }
    }
}

/// Accepts `SIGTERM`, `TERM`, `15` and the real-time forms `SIGRTMIN+n`
/// and `SIGRTMAX-n`.
pub fn validate_signal(signal: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::Signal(signal.to_owned());
    if let Ok(num) = signal.parse::<i32>() {
        return if (1..=64).contains(&num) { Ok(()) } else { Err(invalid()) };
    }
    let upper = signal.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") { upper } else { format!("SIG{upper}") };
    for (prefix, max) in [("SIGRTMIN", 30), ("SIGRTMAX", 30)] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if rest.is_empty() {
                return Ok(());
            }
            let offset = rest
                .strip_prefix(if prefix == "SIGRTMIN" { '+' } else { '-' })
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(invalid)?;
            return if offset <= max { Ok(()) } else { Err(invalid()) };
        }
    }
    Signal::from_str(&name).map(|_| ()).map_err(|_| invalid())
}

/// Picks the signal that stops the container: the request, then the image,
/// then `SIGTERM`. Systemd mode always uses `SIGRTMIN+3`.
pub fn resolve_stop_signal(requested: Option<&str>, image: Option<&str>, systemd: bool) -> String {
    if systemd {
        return SYSTEMD_STOP_SIGNAL.to_owned();
    }
    requested
        .or(image)
        .unwrap_or(DEFAULT_STOP_SIGNAL)
        .to_owned()
}

/// Resolves the process arguments.
///
/// Without an entrypoint override the image entrypoint is kept; its CMD is
/// used only when no arguments were given. An override (even an empty one)
/// discards both the image entrypoint and CMD.
pub fn resolve_args(
    entrypoint: Option<&[String]>,
    args: &[String],
    image: Option<&ImageConfig>,
) -> Result<Vec<String>, SpecError> {
    let resolved: Vec<String> = match entrypoint {
        None => {
            let image_entrypoint = image.map(|c| c.entrypoint.as_slice()).unwrap_or_default();
            let image_cmd = image.map(|c| c.cmd.as_slice()).unwrap_or_default();
            let cmd = if args.is_empty() { image_cmd } else { args };
            image_entrypoint.iter().chain(cmd).cloned().collect()
        }
        Some(entrypoint) => entrypoint.iter().chain(args).cloned().collect(),
    };
    if resolved.is_empty() {
        return Err(SpecError::NoCommand);
    }
    Ok(resolved)
}

/// Whether the container runs systemd as its init.
pub fn is_systemd(mode: SystemdMode, args: &[String]) -> bool {
    match mode {
        SystemdMode::False => false,
        SystemdMode::Always => true,
        SystemdMode::True => args
            .first()
            .map(|first| INIT_PATHS.contains(&first.as_str()))
            .unwrap_or(false),
    }
}

pub fn with_args(args: Vec<String>) -> SpecOpt {
    opt(move |spec| {
        let mut process = spec.process().clone().unwrap_or_default();
        process.set_args(Some(args));
        spec.set_process(Some(process));
        Ok(())
    })
}

/// Image environment overridden by the request, with `PATH` defaulted.
pub fn with_env(image_env: Vec<String>, env: Vec<String>, tty: bool) -> SpecOpt {
    opt(move |spec| {
        let mut base = vec![DEFAULT_PATH_ENV.to_owned()];
        if tty {
            base.push("TERM=xterm".to_owned());
        }
        let merged = utils::merge_env(&utils::merge_env(&base, &image_env), &env);
        let mut process = spec.process().clone().unwrap_or_default();
        process.set_env(Some(merged));
        spec.set_process(Some(process));
        Ok(())
    })
}

pub fn with_cwd(workdir: Option<String>) -> Result<SpecOpt, SpecError> {
    let cwd = PathBuf::from(workdir.unwrap_or_else(|| "/".to_owned()));
    if !cwd.is_absolute() {
        return Err(SpecError::Invalid {
            option: "workdir",
            value: cwd.to_string_lossy().into_owned(),
        });
    }
    Ok(opt(move |spec| {
        let mut process = spec.process().clone().unwrap_or_default();
        process.set_cwd(cwd);
        spec.set_process(Some(process));
        Ok(())
    }))
}

/// Prepares the spec for systemd running as PID 1.
///
/// `privileged` conflicts with systemd mode unless host devices are kept
/// out of the container.
pub fn systemd_opts(
    privileged: bool,
    without_host_devices: bool,
) -> Result<Vec<SpecOpt>, SpecError> {
    if privileged && !without_host_devices {
        return Err(SpecError::SystemdPrivileged);
    }

    let mut mounts = Vec::new();
    for dest in SYSTEMD_TMPFS {
        mounts.push(
            MountBuilder::default()
                .destination(dest)
                .typ("tmpfs")
                .source("tmpfs")
                .options(vec![
                    "nosuid".to_owned(),
                    "nodev".to_owned(),
                    "noexec".to_owned(),
                ])
                .build()?,
        );
    }
    mounts.push(
        MountBuilder::default()
            .destination("/sys/fs/cgroup")
            .typ("cgroup")
            .source("cgroup")
            .options(vec![
                "nosuid".to_owned(),
                "noexec".to_owned(),
                "nodev".to_owned(),
                "relatime".to_owned(),
                "rw".to_owned(),
            ])
            .build()?,
    );

    Ok(vec![
        super::with_mounts(mounts),
        opt(|spec| {
            let mut process = spec.process().clone().unwrap_or_default();
            let mut env = process.env().clone().unwrap_or_default();
            env.push("container=stevedore".to_owned());
            process.set_env(Some(env));
            spec.set_process(Some(process));
            Ok(())
        }),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::generate;
    use std::path::Path;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageConfig {
        ImageConfig {
            entrypoint: strings(entrypoint),
            cmd: strings(cmd),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_args_image_defaults() {
        let img = image(&["/entry"], &["--serve"]);
        assert_eq!(
            resolve_args(None, &[], Some(&img)).unwrap(),
            strings(&["/entry", "--serve"])
        );
    }

    #[test]
    fn test_resolve_args_positional_replaces_cmd() {
        let img = image(&["/entry"], &["--serve"]);
        assert_eq!(
            resolve_args(None, &strings(&["--debug"]), Some(&img)).unwrap(),
            strings(&["/entry", "--debug"])
        );
    }

    #[test]
    fn test_resolve_args_entrypoint_override() {
        let img = image(&["/entry"], &["--serve"]);
        let ep = strings(&["/bin/sh"]);
        assert_eq!(
            resolve_args(Some(&ep), &[], Some(&img)).unwrap(),
            strings(&["/bin/sh"])
        );
        assert_eq!(
            resolve_args(Some(&ep), &strings(&["-c", "ls"]), Some(&img)).unwrap(),
            strings(&["/bin/sh", "-c", "ls"])
        );
        assert_eq!(
            resolve_args(Some(&[]), &strings(&["ls"]), Some(&img)).unwrap(),
            strings(&["ls"])
        );
    }

    #[test]
    fn test_resolve_args_nothing_to_run() {
        assert!(matches!(resolve_args(None, &[], None), Err(SpecError::NoCommand)));
        let img = image(&["/entry"], &["--serve"]);
        assert!(matches!(
            resolve_args(Some(&[]), &[], Some(&img)),
            Err(SpecError::NoCommand)
        ));
        assert_eq!(
            resolve_args(None, &strings(&["/bin/true"]), None).unwrap(),
            strings(&["/bin/true"])
        );
    }

    #[test]
    fn test_is_systemd() {
        assert!(is_systemd(SystemdMode::Always, &strings(&["/bin/sh"])));
        assert!(is_systemd(SystemdMode::True, &strings(&["/sbin/init"])));
        let init = strings(&["/usr/local/sbin/init", "--log-level=debug"]);
        assert!(is_systemd(SystemdMode::True, &init));
        assert!(!is_systemd(SystemdMode::True, &strings(&["/bin/sh"])));
        assert!(!is_systemd(SystemdMode::False, &strings(&["/sbin/init"])));
    }

    #[test]
    fn test_systemd_opts() {
        assert!(matches!(systemd_opts(true, false), Err(SpecError::SystemdPrivileged)));
        assert!(systemd_opts(true, true).is_ok());

        let spec = generate(systemd_opts(false, false).unwrap()).unwrap();
        let mounts = spec.mounts().as_ref().unwrap();
        for dest in SYSTEMD_TMPFS {
            assert!(
                mounts.iter().any(|m| m.destination() == Path::new(dest)),
                "{dest}"
            );
        }
        let cgroup = mounts
            .iter()
            .find(|m| m.destination() == &PathBuf::from("/sys/fs/cgroup"))
            .unwrap();
        let options = cgroup.options().as_ref().unwrap();
        assert!(options.contains(&"rw".to_owned()));
        assert!(!options.contains(&"ro".to_owned()));
    }

    #[test]
    fn test_validate_signal() {
        let valid = [
            "SIGTERM",
            "TERM",
            "kill",
            "9",
            "SIGRTMIN+3",
            "RTMIN",
            "SIGRTMAX-2",
        ];
        for ok in valid {
            assert!(validate_signal(ok).is_ok(), "{ok}");
        }
        for bad in ["SIGNOPE", "0", "65", "SIGRTMIN-1", "SIGRTMIN+99", ""] {
            assert!(validate_signal(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_resolve_stop_signal() {
        assert_eq!(resolve_stop_signal(None, None, false), "SIGTERM");
        assert_eq!(resolve_stop_signal(None, Some("SIGQUIT"), false), "SIGQUIT");
        assert_eq!(
            resolve_stop_signal(Some("SIGINT"), Some("SIGQUIT"), false),
            "SIGINT"
        );
        assert_eq!(
            resolve_stop_signal(Some("SIGINT"), None, true),
            SYSTEMD_STOP_SIGNAL
        );
    }

    #[test]
    fn test_env_and_cwd() {
        let spec = generate(vec![
            with_env(
                strings(&["PATH=/img", "A=1"]),
                strings(&["A=2", "B=3"]),
                false,
            ),
            with_cwd(Some("/srv".to_owned())).unwrap(),
        ])
        .unwrap();
        let process = spec.process().as_ref().unwrap();
        assert_eq!(
            process.env().clone().unwrap(),
            strings(&["PATH=/img", "A=2", "B=3"])
        );
        assert_eq!(process.cwd(), &PathBuf::from("/srv"));
        assert!(with_cwd(Some("relative".to_owned())).is_err());
    }
}
