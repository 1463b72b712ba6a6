//! Removes containers and the state they own
use anyhow::Result;
use clap::Parser;
use libstevedore::container::{remove_container, Found, RemoveOptions};

use super::CommandContext;

/// Remove one or more containers
#[derive(Parser, Debug)]
pub struct Rm {
    /// Kill a running container before removing it
    #[clap(short, long)]
    pub force: bool,
    /// Remove anonymous volumes associated with the container
    #[clap(short, long)]
    pub volumes: bool,
    #[clap(required = true)]
    pub containers: Vec<String>,
}

pub fn rm(args: Rm, ctx: &CommandContext) -> Result<()> {
    let backend = ctx.backend();
    let opts = RemoveOptions {
        force: args.force,
        volumes: args.volumes,
    };
    backend
        .walker()
        .walk_all(&args.containers, true, |found: Found<'_>| -> Result<()> {
            found.ensure_unique()?;
            remove_container(&backend, &ctx.stores, &found.container, opts)?;
            println!("{}", found.request);
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context;
    use anyhow::Result;
    use libstevedore::container::{
        create_container, ContainerCreateRequest, ContainerName, ImageSource,
    };
    use libstevedore::runtime::Runtime;

    #[test]
    fn test_rm_continues_past_missing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = context(&tmp)?;
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        let mut req = ContainerCreateRequest::new(ImageSource::Rootfs(rootfs));
        req.args = vec!["/init".to_owned()];
        req.name = ContainerName::Explicit("web".to_owned());
        let container = create_container(&ctx.backend(), &ctx.stores, &req)?;

        let err = rm(
            Rm {
                force: false,
                volumes: false,
                containers: vec!["missing".to_owned(), "web".to_owned()],
            },
            &ctx,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(ctx.runtime.containers()?.is_empty());
        assert!(!ctx.config.containers_dir().join(&container.id).exists());
        assert_eq!(ctx.stores.names.lookup("web")?, None);
        Ok(())
    }
}
