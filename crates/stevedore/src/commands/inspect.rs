//! Prints the low level view of containers as JSON
use anyhow::Result;
use clap::Parser;
use libstevedore::container::{inspect_container, Found};

use super::CommandContext;

/// Display detailed information on one or more containers
#[derive(Parser, Debug)]
pub struct Inspect {
    /// Include the OCI runtime spec
    #[clap(long)]
    pub spec: bool,
    #[clap(required = true)]
    pub containers: Vec<String>,
}

pub fn inspect(args: Inspect, ctx: &CommandContext) -> Result<()> {
    let backend = ctx.backend();
    let mut views = Vec::new();
    let result = backend
        .walker()
        .walk_all(&args.containers, true, |found: Found<'_>| -> Result<()> {
            found.ensure_unique()?;
            views.push(inspect_container(backend.runtime, &found.container, args.spec)?);
            Ok(())
        });

    // Docker prints what it could resolve even when some requests failed.
    println!("{}", serde_json::to_string_pretty(&views)?);
    result
}
