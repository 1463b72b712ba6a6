//! Platform options: cgroups, resources and namespace plumbing.
use std::collections::HashMap;
use std::path::PathBuf;

use oci_spec::runtime::{
    LinuxCpuBuilder, LinuxMemoryBuilder, LinuxNamespaceBuilder, LinuxNamespaceType,
    LinuxPidsBuilder, Spec,
};

use super::{opt, SpecError, SpecOpt};
use crate::config::CgroupManager;
use crate::container::request::Resources;
use crate::utils;

const CPU_PERIOD: u64 = 100_000;

/// The cgroup path of a container for the configured cgroup manager.
pub fn cgroups_path(
    manager: CgroupManager,
    parent: Option<&str>,
    namespace: &str,
    id: &str,
) -> Option<PathBuf> {
    match manager {
        CgroupManager::Cgroupfs => {
            let parent = match parent {
                Some(p) if !p.is_empty() => p.trim_end_matches('/').to_owned(),
                _ => format!("/{namespace}"),
            };
            Some(PathBuf::from(format!("{parent}/{id}")))
        }
        CgroupManager::Systemd => {
            let slice = parent.filter(|p| !p.is_empty()).unwrap_or("system.slice");
            Some(PathBuf::from(format!("{slice}:stevedore:{id}")))
        }
        CgroupManager::None => None,
    }
}

pub fn with_cgroups_path(path: Option<PathBuf>) -> SpecOpt {
    opt(move |spec| {
        let mut linux = spec.linux().clone().unwrap_or_default();
        linux.set_cgroups_path(path);
        spec.set_linux(Some(linux));
        Ok(())
    })
}

pub fn with_annotations(annotations: HashMap<String, String>) -> SpecOpt {
    opt(move |spec| {
        if !annotations.is_empty() {
            let mut existing = spec.annotations().clone().unwrap_or_default();
            existing.extend(annotations);
            spec.set_annotations(Some(existing));
        }
        Ok(())
    })
}

pub fn with_terminal(tty: bool) -> SpecOpt {
    opt(move |spec| {
        let mut process = spec.process().clone().unwrap_or_default();
        process.set_terminal(Some(tty));
        spec.set_process(Some(process));
        Ok(())
    })
}

/// Memory, CPU and pids limits. Nothing is set without a cgroup manager.
pub fn with_resources(resources: Resources, manager: CgroupManager) -> Result<SpecOpt, SpecError> {
    let memory = resources
        .memory
        .as_deref()
        .map(|m| {
            utils::parse_size(m).map_err(|_| SpecError::Invalid {
                option: "memory",
                value: m.to_owned(),
            })
        })
        .transpose()?;

    Ok(opt(move |spec| {
        if manager == CgroupManager::None {
            return Ok(());
        }
        let mut linux = spec.linux().clone().unwrap_or_default();
        let mut res = linux.resources().clone().unwrap_or_default();
        if let Some(limit) = memory {
            res.set_memory(Some(LinuxMemoryBuilder::default().limit(limit as i64).build()?));
        }
        if resources.cpus.is_some() || resources.cpu_shares.is_some() {
            let mut cpu = LinuxCpuBuilder::default();
            if let Some(cpus) = resources.cpus {
                let quota = (cpus * CPU_PERIOD as f64) as i64;
                cpu = cpu.quota(quota).period(CPU_PERIOD);
            }
            if let Some(shares) = resources.cpu_shares {
                cpu = cpu.shares(shares);
            }
            res.set_cpu(Some(cpu.build()?));
        }
        if let Some(limit) = resources.pids_limit {
            res.set_pids(Some(LinuxPidsBuilder::default().limit(limit).build()?));
        }
        linux.set_resources(Some(res));
        spec.set_linux(Some(linux));
        Ok(())
    }))
}

/// Sets (or adds) namespace `typ`, joining `path` when given.
pub fn set_namespace(
    spec: &mut Spec,
    typ: LinuxNamespaceType,
    path: Option<PathBuf>,
) -> Result<(), SpecError> {
    let mut linux = spec.linux().clone().unwrap_or_default();
    let mut namespaces = linux.namespaces().clone().unwrap_or_default();
    namespaces.retain(|ns| ns.typ() != typ);
    let mut builder = LinuxNamespaceBuilder::default().typ(typ);
    if let Some(path) = path {
        builder = builder.path(path);
    }
    namespaces.push(builder.build()?);
    linux.set_namespaces(Some(namespaces));
    spec.set_linux(Some(linux));
    Ok(())
}

/// Drops namespace `typ` so the container shares it with the host.
pub fn remove_namespace(spec: &mut Spec, typ: LinuxNamespaceType) {
    let mut linux = spec.linux().clone().unwrap_or_default();
    if let Some(mut namespaces) = linux.namespaces().clone() {
        namespaces.retain(|ns| ns.typ() != typ);
        linux.set_namespaces(Some(namespaces));
    }
    spec.set_linux(Some(linux));
}
