//! # Stevedore
//! A Docker-compatible container client. It creates containers on top of a
//! runtime namespace and keeps the client side state (names, hosts files,
//! volumes) next to it.
mod commands;
mod dataroot;
mod observability;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{crate_version, Parser};
use libstevedore::config::{CgroupManager, GlobalConfig};

use crate::commands::CommandContext;

#[derive(Parser, Debug)]
pub struct GlobalOpts {
    /// Root directory of the persistent state
    #[clap(long, global = true)]
    pub data_root: Option<PathBuf>,
    /// Runtime namespace to operate in
    #[clap(short, long, global = true)]
    pub namespace: Option<String>,
    /// Configuration file, defaults to /etc/stevedore/stevedore.json when present
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Cgroup manager (cgroupfs, systemd or none)
    #[clap(long, global = true)]
    pub cgroup_manager: Option<CgroupManager>,
    #[clap(long, global = true)]
    pub snapshotter: Option<String>,
    /// Enable debug logging, kept for compatibility with --log-level
    #[clap(long, global = true)]
    pub debug: bool,
    /// Log level (error, warn, info, debug or trace)
    #[clap(long, global = true)]
    pub log_level: Option<String>,
    /// Log format (text or json)
    #[clap(long, global = true)]
    pub log_format: Option<String>,
    /// Write logs to this file instead of stderr
    #[clap(long, global = true)]
    pub log: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[clap(version = stevedore_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
enum SubCommand {
    Create(commands::create::Create),
    #[clap(alias = "remove")]
    Rm(commands::rm::Rm),
    Rename(commands::rename::Rename),
    Inspect(commands::inspect::Inspect),
    #[clap(alias = "ls", alias = "list")]
    Ps(commands::ps::Ps),
    #[clap(subcommand)]
    Volume(commands::volume::VolumeCmd),
}

/// output the version in Moby compatible format
#[macro_export]
macro_rules! stevedore_version {
    () => {
        concat!(
            "version ",
            crate_version!(),
            "\ncommit: ",
            crate_version!(),
            "-0-",
            env!("VERGEN_GIT_SHA")
        )
    };
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {e:?}");
    }

    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );

    let config = load_config(&opts.global)?;
    let ctx = CommandContext::new(config)?;

    match opts.subcmd {
        SubCommand::Create(create) => commands::create::create(create, &ctx),
        SubCommand::Rm(rm) => commands::rm::rm(rm, &ctx),
        SubCommand::Rename(rename) => commands::rename::rename(rename, &ctx),
        SubCommand::Inspect(inspect) => commands::inspect::inspect(inspect, &ctx),
        SubCommand::Ps(ps) => commands::ps::ps(ps, &ctx),
        SubCommand::Volume(cmd) => commands::volume::volume(cmd, &ctx),
    }
}

/// Defaults, then the configuration file, then the environment, then the
/// command line.
fn load_config(global: &GlobalOpts) -> Result<GlobalConfig> {
    let mut config = GlobalConfig::load_or_default(global.config.as_deref())
        .context("failed to load configuration")?;
    config.apply_env();

    if let Some(namespace) = &global.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(manager) = global.cgroup_manager {
        config.cgroup_manager = manager;
    }
    if let Some(snapshotter) = &global.snapshotter {
        config.snapshotter = snapshotter.clone();
    }
    config.validate().context("invalid configuration")?;

    let configured = (config.data_root != GlobalConfig::default().data_root)
        .then(|| config.data_root.clone());
    config.data_root = dataroot::determine(global.data_root.clone().or(configured))?;
    tracing::debug!(
        data_root = ?config.data_root,
        namespace = %config.namespace,
        "configuration loaded"
    );
    Ok(config)
}
