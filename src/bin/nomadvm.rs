//! nomadvm CLI - drive the nomad micro-VM driver by hand

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use nomad_vm_driver::{
    CreateOpts, Driver, DriverConfig, Instance, InstanceState, NomadDriver, Platform, DRIVER_NAME,
};

#[derive(Parser)]
#[command(name = "nomadvm")]
#[command(about = "Provision and destroy CI micro-VMs through a nomad cluster")]
#[command(version)]
struct Cli {
    /// Nomad server address
    #[arg(long, global = true, default_value = "http://localhost:4646")]
    address: String,

    /// CA bundle to trust for the scheduler endpoint
    #[arg(long, global = true)]
    ca_cert: Option<PathBuf>,

    /// Client certificate for mutual TLS
    #[arg(long, global = true)]
    client_cert: Option<PathBuf>,

    /// Client key for mutual TLS
    #[arg(long, global = true)]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Image the micro-VM boots from
    #[arg(long, global = true, default_value = "weaveworks/ignite-ubuntu")]
    vm_image: String,

    /// vCPUs per VM
    #[arg(long, global = true, default_value = "2")]
    vm_cpus: String,

    /// Memory per VM in GB
    #[arg(long, global = true, default_value = "4")]
    vm_memory_gb: String,

    /// Disk size per VM
    #[arg(long, global = true, default_value = "10GB")]
    vm_disk_size: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a scheduler client can be constructed
    Ping,
    /// Create a VM instance and print its address
    Create {
        /// Pool name recorded on the instance
        #[arg(long, default_value = "default")]
        pool: String,
        /// OS of the instance (linux or windows)
        #[arg(long, default_value = "")]
        os: String,
        /// Architecture of the instance (amd64 or arm64)
        #[arg(long, default_value = "")]
        arch: String,
        /// File with the startup script to run inside the guest
        #[arg(long)]
        startup_script: Option<PathBuf>,
    },
    /// Destroy a VM instance created earlier
    Destroy {
        /// Instance id returned by create
        id: String,
        /// Node the instance was placed on
        node_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nomad_vm_driver=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let mut builder = DriverConfig::builder()
        .address(&cli.address)
        .vm_image(&cli.vm_image)
        .vm_cpus(&cli.vm_cpus)
        .vm_memory_gb(&cli.vm_memory_gb)
        .vm_disk_size(&cli.vm_disk_size)
        .insecure(cli.insecure);
    if let Some(ca) = &cli.ca_cert {
        builder = builder.ca_cert_path(ca);
    }
    if let Some(cert) = &cli.client_cert {
        builder = builder.client_cert_path(cert);
    }
    if let Some(key) = &cli.client_key {
        builder = builder.client_key_path(key);
    }
    let config = builder.build_validated()?;

    let driver = NomadDriver::new(config)?;
    let ctx = CancellationToken::new();

    match cli.command {
        Commands::Ping => {
            driver.ping(&ctx).await?;
            println!("scheduler client ok: {}", cli.address);
        }
        Commands::Create {
            pool,
            os,
            arch,
            startup_script,
        } => {
            let script = match startup_script {
                Some(path) => std::fs::read_to_string(path)?,
                None => String::new(),
            };
            let opts = CreateOpts {
                platform: Platform::new(os, arch),
                pool_name: pool,
                startup_script: script,
                ..Default::default()
            };

            let instance = driver.create(&ctx, &opts).await?;
            println!(
                "created instance {} on node {} at {}:{}",
                instance.id, instance.node_id, instance.address, instance.port
            );
        }
        Commands::Destroy { id, node_id } => {
            let now = Utc::now();
            let instance = Instance {
                id: id.clone(),
                node_id,
                name: id.clone(),
                address: String::new(),
                port: 0,
                platform: Platform::default(),
                pool: String::new(),
                provider: DRIVER_NAME.to_string(),
                stage: None,
                state: InstanceState::Created,
                ca_cert: None,
                ca_key: None,
                tls_cert: None,
                tls_key: None,
                started_at: now,
                updated_at: now,
            };

            driver.destroy(&ctx, std::slice::from_ref(&instance)).await?;
            println!("destroyed instance {}", id);
        }
    }

    Ok(())
}
