//! GSFS - Group Share Filesystem
//!
//! Scans the local export, joins or hosts the cluster, then mounts the
//! merged tree in the foreground.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gsfs::broker::SshReader;
use gsfs::config::{Config, Role};
use gsfs::namespace::Namespace;
use gsfs::registry::{MASTER_HOST, UNASSIGNED_HOST};
use gsfs::replication::{join, serve, JoinOutcome, MasterHandle, SlaveHandle};
use gsfs::tree::scan_export;

/// GSFS - Group Share Filesystem
#[derive(Parser)]
#[command(name = "gsfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "/etc/gsfs/config.toml")]
    config: PathBuf,

    /// Run as master, listening on this IP address
    #[arg(short, long, value_name = "ADDR", conflicts_with = "connect")]
    listen: Option<String>,

    /// Run as slave of the master at this IP address
    #[arg(short, long, value_name = "ADDR")]
    connect: Option<String>,

    /// Replication protocol port
    #[arg(short, long)]
    tcp_port: Option<u16>,

    /// Remote-shell port peers use to read from this host
    #[arg(short, long)]
    ssh_port: Option<u16>,

    /// Where to mount the merged tree
    #[arg(short, long)]
    mount_point: Option<PathBuf>,

    /// Local directory to export
    #[arg(short, long)]
    export: Option<PathBuf>,

    /// Working directory for the staged copy of the export
    #[arg(short, long)]
    working_directory: Option<PathBuf>,

    /// Address other hosts use to reach this one
    #[arg(long)]
    advertise: Option<String>,

    /// Let other users access the mount
    #[arg(long)]
    allow_other: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    init_logging(level);

    if let Err(e) = run(cli) {
        if startup_failure(&e) {
            error!("Cannot start, nothing was mounted: {:#}", e);
            std::process::exit(2);
        }
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Check if `e` stems from configuration, export or staging problems
fn startup_failure(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<gsfs::Error>())
        .any(gsfs::Error::is_fatal_at_startup)
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Fold command-line flags into the loaded configuration
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(listen) = &cli.listen {
        config.node.role = Some(Role::Master);
        config.node.address = Some(listen.clone());
    }
    if let Some(master) = &cli.connect {
        config.node.role = Some(Role::Slave);
        config.cluster.master = Some(master.clone());
    }
    if let Some(port) = cli.tcp_port {
        config.node.tcp_port = port;
    }
    if let Some(port) = cli.ssh_port {
        config.node.ssh_port = port;
    }
    if let Some(path) = &cli.mount_point {
        config.mount.path = path.clone();
    }
    if let Some(dir) = &cli.export {
        config.export.dir = dir.clone();
    }
    if let Some(dir) = &cli.working_directory {
        config.export.staging_dir = dir.clone();
    }
    if let Some(advertise) = &cli.advertise {
        config.node.advertise = Some(advertise.clone());
    }
    if cli.allow_other {
        config.mount.allow_other = true;
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    apply_overrides(&mut config, &cli);
    config.validate().context("Invalid configuration")?;

    let role = config.role();
    let local_id = match role {
        Role::Master => MASTER_HOST,
        Role::Slave => UNASSIGNED_HOST,
    };

    let scanned = scan_export(&config.export.dir, &config.export.staging_dir, local_id)
        .context("Failed to prepare the export")?;
    let host = config.local_host(local_id, &scanned.export_dir, &scanned.staging_dir);
    info!("Exporting {} as {}", scanned.export_dir.display(), host.address);

    let reader = Arc::new(SshReader::new(config.broker.clone()));
    let namespace = Arc::new(Namespace::new(scanned.tree, host, scanned.staged_root, reader));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("gsfs-net")
        .enable_all()
        .build()
        .context("Failed to start the network runtime")?;

    let (master, _slave): (Option<MasterHandle>, Option<SlaveHandle>) = match role {
        Role::Master => {
            let address = config.listen_address();
            let handle = runtime
                .block_on(serve(Arc::clone(&namespace), &address))
                .with_context(|| format!("Failed to listen on {}", address))?;
            info!("Master ready on {}", handle.local_addr());
            (Some(handle), None)
        }
        Role::Slave => (None, join_master(&runtime, &namespace, &config)),
    };

    let mountpoint = config.mount.path.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted, unmounting {}", mountpoint.display());
        match std::process::Command::new("fusermount").arg("-u").arg(&mountpoint).status() {
            Ok(s) if s.success() => {}
            Ok(s) => {
                error!("Unmount failed with status: {}", s);
                std::process::exit(1);
            }
            Err(e) => {
                error!("Failed to run fusermount: {}", e);
                std::process::exit(1);
            }
        }
    })
    .context("Failed to install the Ctrl-C handler")?;

    gsfs::fuse::mount(namespace, &config.mount.path, config.mount.allow_other).context("Mount failed")?;
    info!("Unmounted {}", config.mount.path.display());

    if let Some(master) = master {
        master.stop();
    }
    Ok(())
}

/// Join the master, falling back to local-only service on any failure
fn join_master(runtime: &tokio::runtime::Runtime, namespace: &Arc<Namespace>, config: &Config) -> Option<SlaveHandle> {
    let address = config.master_address()?;

    match runtime.block_on(join(Arc::clone(namespace), &address, config.connect_timeout())) {
        Ok(mut session) => {
            match session.wait_blocking() {
                JoinOutcome::Joined(id) => info!("Joined master {} as host {}", address, id),
                JoinOutcome::Disconnected => {
                    warn!("Master {} did not admit this host, serving local files only", address)
                }
            }
            Some(session)
        }
        Err(e) => {
            warn!("Cannot reach master {}: {}; serving local files only", address, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_failure_classification() {
        let staging = anyhow::Error::new(gsfs::Error::Staging("/srv/share/stage lies inside the export".into()))
            .context("Failed to prepare the export");
        assert!(startup_failure(&staging));

        let network = anyhow::Error::new(gsfs::Error::Network("address in use".into()))
            .context("Failed to listen on 10.0.0.1:7700");
        assert!(!startup_failure(&network));

        assert!(!startup_failure(&anyhow::anyhow!("Mount failed")));
    }
}
