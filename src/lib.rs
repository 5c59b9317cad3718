//! Nomad micro-VM driver
//!
//! A driver that provisions short-lived micro-VMs for CI build stages on a
//! fleet of bare-metal nodes managed by a nomad cluster. It translates
//! "create an instance with this CPU/memory/disk shape" into a pair of
//! cooperating scheduler jobs and hands back an addressable instance.
//!
//! # How it works
//!
//! - **Reservation job** - holds CPU, memory and a dynamic port on some
//!   node for the VM's entire lifetime, so the scheduler cannot
//!   oversubscribe the node.
//! - **Init job** - pinned to the reservation's node; boots the VM with
//!   the reserved port forwarded into the guest and runs the startup
//!   script inside it.
//! - **Destroy job** - pinned to the same node; stops and removes the VM.
//!
//! Job ids are pure functions of the instance id, so destroy recomputes
//! everything from the instance record alone. Every failure path during
//! create deregisters whatever was already registered; no reservation
//! outlives a failed create.
//!
//! # Example
//!
//! ```no_run
//! use nomad_vm_driver::{CreateOpts, Driver, DriverConfig, NomadDriver};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> nomad_vm_driver::Result<()> {
//! let config = DriverConfig::builder()
//!     .address("http://nomad.example.com:4646")
//!     .vm_image("weaveworks/ignite-ubuntu")
//!     .vm_cpus("2")
//!     .vm_memory_gb("4")
//!     .vm_disk_size("10GB")
//!     .build_validated()?;
//!
//! let driver = NomadDriver::new(config)?;
//! let ctx = CancellationToken::new();
//!
//! let instance = driver.create(&ctx, &CreateOpts::default()).await?;
//! println!("VM at {}:{}", instance.address, instance.port);
//!
//! driver.destroy(&ctx, std::slice::from_ref(&instance)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod jobs;
pub mod machine;
pub mod models;
pub mod nomad;
pub mod poller;
pub mod store;

pub use config::{DriverConfig, DriverConfigBuilder};
pub use driver::{Driver, NomadDriver, DRIVER_NAME};
pub use error::{Error, Result};
pub use machine::Machine;
pub use models::{random_instance_id, CreateOpts, Instance, InstanceState, Platform};
pub use nomad::JobStatus;
pub use store::StageOwnerStore;
