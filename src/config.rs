//! Driver configuration with builder pattern

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the nomad VM driver. Immutable after construction.
///
/// The headroom knobs exist because the reservation job must not saturate
/// a node completely: the init and destroy tasks still need a minimal
/// envelope on the same node. The defaults are empirical values for the
/// ignite runtime's footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Scheduler HTTP(S) endpoint, e.g. `https://nomad.example.com:4646`
    pub address: String,
    /// Image the micro-VMs boot from
    pub vm_image: String,
    /// vCPU count, kept as text until create validates it
    pub vm_cpus: String,
    /// Memory in GB, kept as text until create validates it
    pub vm_memory_gb: String,
    /// Disk size string handed to the VM tool, e.g. `10GB`
    pub vm_disk_size: String,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification
    pub insecure: bool,
    /// Swap real job templates for dummy ones (test use only)
    pub noop: bool,
    /// Nominal per-core frequency used to size CPU reservations
    pub machine_frequency_mhz: i64,
    /// CPU left unreserved on the node for init/destroy tasks
    pub cpu_headroom_mhz: i64,
    /// Memory left unreserved on the node for init/destroy tasks
    pub memory_headroom_mb: i64,
    /// Deadline for the reservation job to start running
    pub resource_job_timeout: Duration,
    /// Deadline for the init job to finish
    pub init_timeout: Duration,
    /// Deadline for the destroy job to finish
    pub destroy_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            vm_image: String::new(),
            vm_cpus: "2".to_string(),
            vm_memory_gb: "4".to_string(),
            vm_disk_size: "10GB".to_string(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            insecure: false,
            noop: false,
            machine_frequency_mhz: 5100,
            cpu_headroom_mhz: 109,
            memory_headroom_mb: 53,
            resource_job_timeout: Duration::from_secs(3 * 60),
            init_timeout: Duration::from_secs(5 * 60),
            destroy_timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl DriverConfig {
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.address.is_empty() {
            return Err(crate::Error::validation("scheduler address cannot be empty"));
        }
        if self.vm_image.is_empty() {
            return Err(crate::Error::validation("vm image cannot be empty"));
        }
        if self.machine_frequency_mhz <= 0 {
            return Err(crate::Error::validation(
                "machine frequency must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn vm_image(mut self, image: impl Into<String>) -> Self {
        self.config.vm_image = image.into();
        self
    }

    pub fn vm_cpus(mut self, cpus: impl Into<String>) -> Self {
        self.config.vm_cpus = cpus.into();
        self
    }

    pub fn vm_memory_gb(mut self, mem: impl Into<String>) -> Self {
        self.config.vm_memory_gb = mem.into();
        self
    }

    pub fn vm_disk_size(mut self, size: impl Into<String>) -> Self {
        self.config.vm_disk_size = size.into();
        self
    }

    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.client_key_path = Some(path.into());
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    pub fn noop(mut self, noop: bool) -> Self {
        self.config.noop = noop;
        self
    }

    pub fn machine_frequency_mhz(mut self, mhz: i64) -> Self {
        self.config.machine_frequency_mhz = mhz;
        self
    }

    pub fn cpu_headroom_mhz(mut self, mhz: i64) -> Self {
        self.config.cpu_headroom_mhz = mhz;
        self
    }

    pub fn memory_headroom_mb(mut self, mb: i64) -> Self {
        self.config.memory_headroom_mb = mb;
        self
    }

    pub fn resource_job_timeout(mut self, timeout: Duration) -> Self {
        self.config.resource_job_timeout = timeout;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout = timeout;
        self
    }

    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.config.destroy_timeout = timeout;
        self
    }

    pub fn build(self) -> DriverConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<DriverConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DriverConfig::builder()
            .address("http://localhost:4646")
            .vm_image("weaveworks/ignite-ubuntu")
            .vm_cpus("4")
            .vm_memory_gb("8")
            .vm_disk_size("20GB")
            .insecure(true)
            .build();

        assert_eq!(config.address, "http://localhost:4646");
        assert_eq!(config.vm_cpus, "4");
        assert_eq!(config.vm_memory_gb, "8");
        assert!(config.insecure);
        assert!(!config.noop);
    }

    #[test]
    fn test_config_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.machine_frequency_mhz, 5100);
        assert_eq!(config.cpu_headroom_mhz, 109);
        assert_eq!(config.memory_headroom_mb, 53);
        assert_eq!(config.resource_job_timeout, Duration::from_secs(180));
        assert_eq!(config.init_timeout, Duration::from_secs(300));
        assert_eq!(config.destroy_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_config_validation() {
        let err = DriverConfig::builder().build_validated().unwrap_err();
        assert!(err.is_validation_error());

        let config = DriverConfig::builder()
            .address("http://localhost:4646")
            .vm_image("img")
            .build_validated();
        assert!(config.is_ok());
    }
}
