use anyhow::{Context, Result};
use clap::Parser;
use libstevedore::container::rename_container;

use super::CommandContext;

/// Rename a container
#[derive(Parser, Debug)]
pub struct Rename {
    pub container: String,
    pub new_name: String,
}

pub fn rename(args: Rename, ctx: &CommandContext) -> Result<()> {
    let backend = ctx.backend();
    let container = backend.walker().resolve_unique(&args.container)?;
    rename_container(&backend, &ctx.stores, &container, &args.new_name)
        .with_context(|| format!("failed to rename container {}", args.container))
}
