//! Manages the named volumes of the namespace
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libstevedore::labels::InternalLabels;
use libstevedore::runtime::Runtime;
use libstevedore::utils::generate_id;
use libstevedore::volumestore::Volume;
use tabwriter::TabWriter;

use super::{parse_key_values, CommandContext};

#[derive(Subcommand, Debug)]
pub enum VolumeCmd {
    /// Create a volume
    Create(VolumeCreate),
    /// List volumes
    #[clap(alias = "list")]
    Ls(VolumeLs),
    /// Remove one or more volumes
    #[clap(alias = "remove")]
    Rm(VolumeRm),
    /// Display detailed information on one or more volumes
    Inspect(VolumeInspect),
}

#[derive(Parser, Debug)]
pub struct VolumeCreate {
    /// Volume name, generated when omitted
    pub name: Option<String>,
    /// Set metadata for a volume
    #[clap(short, long)]
    pub label: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct VolumeLs {
    /// Only display volume names
    #[clap(short, long)]
    pub quiet: bool,
}

#[derive(Parser, Debug)]
pub struct VolumeRm {
    /// Ignore volumes that do not exist
    #[clap(short, long)]
    pub force: bool,
    #[clap(required = true)]
    pub names: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct VolumeInspect {
    #[clap(required = true)]
    pub names: Vec<String>,
}

pub fn volume(cmd: VolumeCmd, ctx: &CommandContext) -> Result<()> {
    match cmd {
        VolumeCmd::Create(args) => {
            let volume = create(args, ctx)?;
            println!("{}", volume.name);
        }
        VolumeCmd::Ls(args) => {
            let volumes = ctx.stores.volumes.list()?;
            let mut stdout = std::io::stdout().lock();
            if args.quiet {
                for volume in &volumes {
                    writeln!(stdout, "{}", volume.name)?;
                }
            } else {
                write!(stdout, "{}", render(&volumes)?)?;
            }
        }
        VolumeCmd::Rm(args) => {
            for name in remove(&args, ctx)? {
                println!("{name}");
            }
        }
        VolumeCmd::Inspect(args) => {
            let (volumes, missing) = inspect(&args.names, ctx)?;
            println!("{}", serde_json::to_string_pretty(&volumes)?);
            if !missing.is_empty() {
                bail!("no such volume: {}", missing.join(", "));
            }
        }
    }
    Ok(())
}

fn create(args: VolumeCreate, ctx: &CommandContext) -> Result<Volume> {
    let labels = parse_key_values("label", &args.label, false)?;
    let (name, anonymous) = match args.name {
        Some(name) => (name, false),
        None => (generate_id(), true),
    };
    let guard = ctx.stores.volumes.lock()?;
    guard
        .create(&name, labels, anonymous)
        .with_context(|| format!("failed to create volume {name}"))
}

/// Names of the volumes mounted by any container of the namespace.
fn volumes_in_use(runtime: &dyn Runtime) -> Result<HashSet<String>> {
    let mut used = HashSet::new();
    for container in runtime.containers()? {
        let internal = match InternalLabels::from_labels(&container.labels) {
            Ok(internal) => internal,
            Err(err) => {
                tracing::warn!(id = %container.id, %err, "failed to read container labels");
                continue;
            }
        };
        used.extend(internal.mount_points.into_iter().filter_map(|m| m.name));
    }
    Ok(used)
}

/// Removes every volume it can and fails afterwards when any could not be
/// removed.
fn remove(args: &VolumeRm, ctx: &CommandContext) -> Result<Vec<String>> {
    let guard = ctx.stores.volumes.lock()?;
    let in_use = volumes_in_use(&ctx.runtime)?;
    let mut removed = Vec::new();
    let mut errors = Vec::new();
    for name in &args.names {
        if in_use.contains(name) {
            errors.push(format!("volume {name} is in use"));
            continue;
        }
        match guard.get(name) {
            Ok(None) if args.force => continue,
            Ok(None) => errors.push(format!("no such volume: {name}")),
            Ok(Some(_)) => match guard.remove(name) {
                Ok(()) => removed.push(name.clone()),
                Err(err) => errors.push(format!("failed to remove volume {name}: {err}")),
            },
            Err(err) => errors.push(format!("{name}: {err}")),
        }
    }
    if !errors.is_empty() {
        for name in &removed {
            println!("{name}");
        }
        bail!("{}", errors.join("\n"));
    }
    Ok(removed)
}

fn inspect(names: &[String], ctx: &CommandContext) -> Result<(Vec<Volume>, Vec<String>)> {
    let guard = ctx.stores.volumes.lock()?;
    let mut volumes = Vec::new();
    let mut missing = Vec::new();
    for name in names {
        match guard.get(name)? {
            Some(volume) => volumes.push(volume),
            None => missing.push(name.clone()),
        }
    }
    Ok((volumes, missing))
}

fn render(volumes: &[Volume]) -> Result<String> {
    let mut content = String::new();
    for volume in volumes {
        let _ = writeln!(content, "local\t{}", volume.name);
    }

    let mut table = Vec::new();
    let mut tab_writer = TabWriter::new(&mut table);
    writeln!(&mut tab_writer, "DRIVER\tVOLUME NAME")?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;
    drop(tab_writer);
    Ok(String::from_utf8(table)?)
}
