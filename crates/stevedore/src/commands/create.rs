//! Handles the creation of a new container
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libstevedore::container::request::Resources;
use libstevedore::container::{create_container, ContainerCreateRequest, ContainerName, ImageSource};
use libstevedore::image::PullMode;
use libstevedore::network::NetworkOptions;
use libstevedore::ocispec::process::SystemdMode;

use super::{parse_key_values, CommandContext};

/// Create a new container
#[derive(Parser, Debug)]
pub struct Create {
    /// Assign a name to the container
    #[clap(long)]
    pub name: Option<String>,
    /// Use an unpacked root filesystem instead of an image. All positional
    /// arguments are then the command.
    #[clap(long)]
    pub rootfs: Option<PathBuf>,
    /// Overwrite the default ENTRYPOINT of the image
    #[clap(long)]
    pub entrypoint: Option<String>,
    /// Set environment variables
    #[clap(short, long = "env")]
    pub env: Vec<String>,
    /// Working directory inside the container
    #[clap(short, long)]
    pub workdir: Option<String>,
    /// Username or UID (format: <name|uid>[:<group|gid>])
    #[clap(short, long)]
    pub user: Option<String>,
    /// Additional groups to join
    #[clap(long)]
    pub group_add: Vec<String>,
    /// Umask of the init process, in octal
    #[clap(long)]
    pub umask: Option<String>,
    /// Allocate a pseudo-TTY
    #[clap(short, long)]
    pub tty: bool,
    /// Keep STDIN open, accepted for compatibility
    #[clap(short, long)]
    pub interactive: bool,
    /// Memory limit
    #[clap(short, long)]
    pub memory: Option<String>,
    /// Number of CPUs
    #[clap(long)]
    pub cpus: Option<f64>,
    /// CPU shares (relative weight)
    #[clap(long)]
    pub cpu_shares: Option<u64>,
    /// Tune container pids limit (set -1 for unlimited)
    #[clap(long, allow_hyphen_values = true)]
    pub pids_limit: Option<i64>,
    /// Optional parent cgroup for the container
    #[clap(long)]
    pub cgroup_parent: Option<String>,
    /// Bind mount a volume
    #[clap(short, long = "volume")]
    pub volume: Vec<String>,
    /// Mount a tmpfs directory
    #[clap(long)]
    pub tmpfs: Vec<String>,
    /// Connect the container to a network (none, host or container:<name|id>)
    #[clap(long, alias = "net")]
    pub network: Vec<String>,
    /// Container host name
    #[clap(long)]
    pub hostname: Option<String>,
    /// Container NIS domain name
    #[clap(long)]
    pub domainname: Option<String>,
    #[clap(long)]
    pub mac_address: Option<String>,
    /// IPv4 address
    #[clap(long)]
    pub ip: Option<String>,
    /// IPv6 address
    #[clap(long)]
    pub ip6: Option<String>,
    /// Publish a container's port(s) to the host
    #[clap(short, long)]
    pub publish: Vec<String>,
    /// Set custom DNS servers
    #[clap(long)]
    pub dns: Vec<String>,
    /// Set custom DNS search domains
    #[clap(long)]
    pub dns_search: Vec<String>,
    /// Set DNS options
    #[clap(long = "dns-option", alias = "dns-opt")]
    pub dns_option: Vec<String>,
    /// Add a custom host-to-IP mapping (host:ip)
    #[clap(long)]
    pub add_host: Vec<String>,
    /// Set meta data on a container
    #[clap(short, long)]
    pub label: Vec<String>,
    /// Add an annotation to the container (passed through to the OCI runtime)
    #[clap(long)]
    pub annotation: Vec<String>,
    /// Restart policy to apply when a container exits
    #[clap(long, default_value = "no")]
    pub restart: String,
    /// Logging driver for the container
    #[clap(long)]
    pub log_driver: Option<String>,
    /// Log driver options
    #[clap(long)]
    pub log_opt: Vec<String>,
    /// Automatically remove the container when it exits
    #[clap(long)]
    pub rm: bool,
    /// Set platform if server is multi-platform capable
    #[clap(long)]
    pub platform: Option<String>,
    /// Pull image before creating (always, missing or never)
    #[clap(long, default_value = "missing")]
    pub pull: PullMode,
    /// Run the container in systemd mode (true, false or always)
    #[clap(long, default_value = "false")]
    pub systemd: SystemdMode,
    /// Give extended privileges to this container
    #[clap(long)]
    pub privileged: bool,
    /// Add Linux capabilities
    #[clap(long)]
    pub cap_add: Vec<String>,
    /// Drop Linux capabilities
    #[clap(long)]
    pub cap_drop: Vec<String>,
    /// Security options
    #[clap(long)]
    pub security_opt: Vec<String>,
    /// Mount the container's root filesystem as read only
    #[clap(long)]
    pub read_only: bool,
    /// Runtime to use for this container
    #[clap(long)]
    pub runtime: Option<String>,
    /// Signal to stop the container
    #[clap(long)]
    pub stop_signal: Option<String>,
    /// IPC mode to use (private, shareable, host or container:<name|id>)
    #[clap(long, default_value = "")]
    pub ipc: String,
    /// File to write the container's init pid to
    #[clap(long)]
    pub pidfile: Option<PathBuf>,
    /// Size of /dev/shm
    #[clap(long)]
    pub shm_size: Option<String>,

    /// Image to create the container from
    #[clap(required_unless_present = "rootfs")]
    pub image: Option<String>,
    /// Command and arguments
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Create {
    fn into_request(self) -> Result<ContainerCreateRequest> {
        if self.interactive {
            tracing::debug!("--interactive has no effect until the container is attached");
        }
        let (source, args) = match (self.rootfs, self.image) {
            (Some(rootfs), image) => {
                let args = image.into_iter().chain(self.args).collect();
                (ImageSource::Rootfs(rootfs), args)
            }
            (None, Some(image)) => (ImageSource::Image(image), self.args),
            (None, None) => anyhow::bail!("an image or --rootfs is required"),
        };

        let mut req = ContainerCreateRequest::new(source);
        req.args = args;
        req.entrypoint = self
            .entrypoint
            .map(|e| if e.is_empty() { Vec::new() } else { vec![e] });
        req.env = self.env;
        req.workdir = self.workdir;
        req.user = self.user;
        req.group_add = self.group_add;
        req.umask = self.umask;
        req.tty = self.tty;
        req.resources = Resources {
            memory: self.memory,
            cpus: self.cpus,
            cpu_shares: self.cpu_shares,
            pids_limit: self.pids_limit,
        };
        req.cgroup_parent = self.cgroup_parent;
        req.volumes = self.volume;
        req.tmpfs = self.tmpfs;
        req.network = NetworkOptions {
            networks: self.network,
            hostname: self.hostname,
            domainname: self.domainname,
            mac_address: self.mac_address,
            ip_address: self.ip,
            ip6_address: self.ip6,
            ports: self.publish,
            dns: self.dns,
            dns_search: self.dns_search,
            dns_options: self.dns_option,
            extra_hosts: self.add_host,
            name: String::new(),
        };
        req.name = match self.name {
            Some(name) => ContainerName::Explicit(name),
            None => ContainerName::Derived,
        };
        req.labels = parse_key_values("label", &self.label, false)?;
        req.annotations = parse_key_values("annotation", &self.annotation, false)?;
        req.restart = self.restart;
        req.log_driver = self.log_driver;
        req.log_opts = parse_key_values("log-opt", &self.log_opt, true)?;
        req.auto_remove = self.rm;
        req.platform = self.platform;
        req.pull = self.pull;
        req.systemd = self.systemd;
        req.privileged = self.privileged;
        req.cap_add = self.cap_add;
        req.cap_drop = self.cap_drop;
        req.security_opt = self.security_opt;
        req.read_only = self.read_only;
        req.runtime = self.runtime;
        req.stop_signal = self.stop_signal;
        req.ipc = self.ipc;
        req.pid_file = self.pidfile;
        req.shm_size = self.shm_size;
        Ok(req)
    }
}

pub fn create(args: Create, ctx: &CommandContext) -> Result<()> {
    let req = args.into_request()?;
    let container = create_container(&ctx.backend(), &ctx.stores, &req)
        .context("failed to create container")?;
    println!("{}", container.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context;
    use anyhow::Result;
    use libstevedore::runtime::Runtime;

    #[derive(Parser, Debug)]
    struct Wrapper {
        #[clap(flatten)]
        create: Create,
    }

    fn parse(args: &[&str]) -> Result<Create> {
        let argv = std::iter::once("create").chain(args.iter().copied());
        Ok(Wrapper::try_parse_from(argv)?.create)
    }

    #[test]
    fn test_into_request() -> Result<()> {
        let req = parse(&[
            "--name", "web", "-e", "A=1", "-l", "tier=front", "-p", "8080:80", "--network", "host",
            "--log-opt", "max-size=10m", "--systemd", "always", "alpine", "sh", "-c", "echo hi",
        ])?
        .into_request()?;

        assert_eq!(req.source, ImageSource::Image("alpine".to_owned()));
        assert_eq!(req.args, vec!["sh", "-c", "echo hi"]);
        assert_eq!(req.name, ContainerName::Explicit("web".to_owned()));
        assert_eq!(req.env, vec!["A=1"]);
        assert_eq!(req.labels["tier"], "front");
        assert_eq!(req.network.ports, vec!["8080:80"]);
        assert_eq!(req.network.networks, vec!["host"]);
        assert_eq!(req.log_opts["max-size"], "10m");
        assert_eq!(req.systemd, SystemdMode::Always);
        assert_eq!(req.pull, PullMode::Missing);
        assert_eq!(req.entrypoint, None);
        Ok(())
    }

    #[test]
    fn test_into_request_rootfs_and_entrypoint() -> Result<()> {
        let args = [
            "--rootfs",
            "/srv/root",
            "--entrypoint",
            "",
            "/bin/init",
            "verbose",
        ];
        let req = parse(&args)?.into_request()?;
        assert_eq!(req.source, ImageSource::Rootfs(PathBuf::from("/srv/root")));
        assert_eq!(req.args, vec!["/bin/init", "verbose"]);
        assert_eq!(req.entrypoint, Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn test_image_required() {
        assert!(parse(&["--name", "web"]).is_err());
        assert!(parse(&["--pull", "sometimes", "alpine"]).is_err());
    }

    #[test]
    fn test_create_from_rootfs() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let ctx = context(&tmp)?;
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        let rootfs = rootfs.to_str().unwrap();
        let req = parse(&["--name", "box", "--rootfs", rootfs, "/init"])?.into_request()?;
        let container = create_container(&ctx.backend(), &ctx.stores, &req)?;
        assert_eq!(ctx.runtime.container(&container.id)?.name(), "box");
        assert_eq!(ctx.stores.names.lookup("box")?, Some(container.id.clone()));
        assert!(ctx.config.containers_dir().join(&container.id).is_dir());
        Ok(())
    }
}
