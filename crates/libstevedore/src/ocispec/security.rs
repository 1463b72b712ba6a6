//! Capabilities, privileged mode and `--security-opt` handling.
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use oci_spec::runtime::{
    Capability, LinuxCapabilitiesBuilder, LinuxDeviceCgroupBuilder, LinuxSeccomp,
};

use super::{opt, SpecError, SpecOpt};

const DEFAULT_CAPABILITIES: [&str; 14] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "FSETID",
    "FOWNER",
    "MKNOD",
    "NET_RAW",
    "SETGID",
    "SETUID",
    "SETFCAP",
    "SETPCAP",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "KILL",
    "AUDIT_WRITE",
];

const ALL_CAPABILITIES: [&str; 41] = [
    "AUDIT_CONTROL",
    "AUDIT_READ",
    "AUDIT_WRITE",
    "BLOCK_SUSPEND",
    "BPF",
    "CHECKPOINT_RESTORE",
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "IPC_LOCK",
    "IPC_OWNER",
    "KILL",
    "LEASE",
    "LINUX_IMMUTABLE",
    "MAC_ADMIN",
    "MAC_OVERRIDE",
    "MKNOD",
    "NET_ADMIN",
    "NET_BIND_SERVICE",
    "NET_BROADCAST",
    "NET_RAW",
    "PERFMON",
    "SETFCAP",
    "SETGID",
    "SETPCAP",
    "SETUID",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_CHROOT",
    "SYS_MODULE",
    "SYS_NICE",
    "SYS_PACCT",
    "SYS_PTRACE",
    "SYS_RAWIO",
    "SYS_RESOURCE",
    "SYS_TIME",
    "SYS_TTY_CONFIG",
    "SYSLOG",
    "WAKE_ALARM",
];

/// Normalizes `cap_net_admin`/`NET_ADMIN` to `NET_ADMIN`.
fn normalize_cap(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    upper.strip_prefix("CAP_").unwrap_or(&upper).to_owned()
}

fn parse_cap(name: &str) -> Result<Capability, SpecError> {
    let normalized = normalize_cap(name);
    serde_json::from_value(serde_json::Value::String(format!("CAP_{normalized}")))
        .map_err(|_| SpecError::UnknownCapability(name.to_owned()))
}

/// Computes the capability set from the defaults (or every capability when
/// privileged), the additions and the drops. `ALL` works on both sides.
pub fn capability_names(
    privileged: bool,
    cap_add: &[String],
    cap_drop: &[String],
) -> Result<Vec<String>, SpecError> {
    let all = || ALL_CAPABILITIES.iter().map(|c| c.to_string());
    let mut caps: Vec<String> = if privileged {
        all().collect()
    } else {
        DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect()
    };

    let adds: Vec<String> = cap_add.iter().map(|c| normalize_cap(c)).collect();
    let drops: Vec<String> = cap_drop.iter().map(|c| normalize_cap(c)).collect();
    for cap in adds.iter().chain(drops.iter()) {
        if cap != "ALL" && !ALL_CAPABILITIES.contains(&cap.as_str()) {
            return Err(SpecError::UnknownCapability(cap.clone()));
        }
    }

    if !privileged {
        if adds.iter().any(|c| c == "ALL") {
            caps = all().collect();
        } else {
            for cap in &adds {
                if !caps.contains(cap) {
                    caps.push(cap.clone());
                }
            }
        }
    }
    if drops.iter().any(|c| c == "ALL") {
        caps.retain(|c| adds.contains(c) && !privileged);
    } else {
        caps.retain(|c| !drops.contains(c));
    }
    caps.sort();
    Ok(caps)
}

pub fn with_capabilities(names: Vec<String>) -> Result<SpecOpt, SpecError> {
    let caps: HashSet<Capability> = names
        .iter()
        .map(|name| parse_cap(name))
        .collect::<Result<_, _>>()?;
    Ok(opt(move |spec| {
        let mut process = spec.process().clone().unwrap_or_default();
        process.set_capabilities(Some(
            LinuxCapabilitiesBuilder::default()
                .bounding(caps.clone())
                .effective(caps.clone())
                .permitted(caps)
                .build()?,
        ));
        spec.set_process(Some(process));
        Ok(())
    }))
}

/// Parsed `--security-opt` values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityOptions {
    pub no_new_privileges: bool,
    pub apparmor_profile: Option<String>,
    pub seccomp_unconfined: bool,
    pub seccomp_profile: Option<PathBuf>,
    pub privileged_without_host_devices: bool,
}

impl SecurityOptions {
    pub fn parse(opts: &[String]) -> Result<Self, SpecError> {
        let mut parsed = Self::default();
        for raw in opts {
            let (key, value) = match raw.split_once(['=', ':']) {
                Some((k, v)) => (k, Some(v)),
                None => (raw.as_str(), None),
            };
            match (key, value) {
                ("no-new-privileges", None) | ("no-new-privileges", Some("true")) => {
                    parsed.no_new_privileges = true
                }
                ("no-new-privileges", Some("false")) => parsed.no_new_privileges = false,
                ("apparmor", Some(profile)) if !profile.is_empty() => {
                    parsed.apparmor_profile = Some(profile.to_owned())
                }
                ("seccomp", Some("unconfined")) => parsed.seccomp_unconfined = true,
                ("seccomp", Some(path)) if !path.is_empty() => {
                    parsed.seccomp_profile = Some(PathBuf::from(path))
                }
                ("privileged-without-host-devices", None) => {
                    parsed.privileged_without_host_devices = true
                }
                ("label", Some(_)) => {
                    tracing::warn!(opt = raw, "SELinux labels are not supported, ignoring");
                }
                _ => return Err(SpecError::SecurityOpt(raw.clone())),
            }
        }
        Ok(parsed)
    }
}

pub fn security_opts(
    options: &SecurityOptions,
    privileged: bool,
) -> Result<Vec<SpecOpt>, SpecError> {
    let mut opts = Vec::new();

    let seccomp = match &options.seccomp_profile {
        Some(path) => {
            let file = fs::File::open(path).map_err(|err| SpecError::RootfsFile {
                path: path.clone(),
                source: err,
            })?;
            let profile: LinuxSeccomp = serde_json::from_reader(file)
                .map_err(|_| SpecError::SecurityOpt(format!("seccomp={}", path.display())))?;
            Some(profile)
        }
        None => None,
    };
    if seccomp.is_some() || options.seccomp_unconfined || privileged {
        let unconfined = options.seccomp_unconfined || privileged;
        opts.push(opt(move |spec| {
            let mut linux = spec.linux().clone().unwrap_or_default();
            linux.set_seccomp(if unconfined { None } else { seccomp });
            spec.set_linux(Some(linux));
            Ok(())
        }));
    }

    let no_new_privileges = options.no_new_privileges;
    let apparmor = if privileged {
        None
    } else {
        options
            .apparmor_profile
            .clone()
            .filter(|p| p != "unconfined")
    };
    opts.push(opt(move |spec| {
        let mut process = spec.process().clone().unwrap_or_default();
        if no_new_privileges {
            process.set_no_new_privileges(Some(true));
        }
        process.set_apparmor_profile(apparmor);
        spec.set_process(Some(process));
        Ok(())
    }));

    if privileged {
        let with_devices = !options.privileged_without_host_devices;
        opts.push(opt(move |spec| {
            let mut linux = spec.linux().clone().unwrap_or_default();
            linux.set_masked_paths(Some(Vec::new()));
            linux.set_readonly_paths(Some(Vec::new()));
            if with_devices {
                let mut resources = linux.resources().clone().unwrap_or_default();
                resources.set_devices(Some(vec![LinuxDeviceCgroupBuilder::default()
                    .allow(true)
                    .access("rwm")
                    .build()?]));
                linux.set_resources(Some(resources));
            }
            spec.set_linux(Some(linux));

            if let Some(mut mounts) = spec.mounts().clone() {
                for mount in mounts.iter_mut() {
                    if mount.destination().starts_with("/sys") {
                        if let Some(options) = mount.options().clone() {
                            let options = options
                                .into_iter()
                                .map(|o| if o == "ro" { "rw".to_owned() } else { o })
                                .collect();
                            mount.set_options(Some(options));
                        }
                    }
                }
                spec.set_mounts(Some(mounts));
            }
            Ok(())
        }));
    }

    Ok(opts)
}

pub fn with_readonly_rootfs(read_only: bool) -> SpecOpt {
    opt(move |spec| {
        if let Some(mut root) = spec.root().clone() {
            root.set_readonly(Some(read_only));
            spec.set_root(Some(root));
        }
        Ok(())
    })
}
