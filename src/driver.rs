//! Driver facade and the two-phase VM lifecycle
//!
//! Create reserves resources on a node, resolves where the reservation
//! landed, and runs the init job there, with a compensating cleanup for
//! every step so a failed create never leaks a reservation. Destroy
//! deregisters the reservation and then runs the destroy job. All job ids
//! are derived from the instance id, so destroy needs nothing beyond the
//! instance record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::DriverConfig;
use crate::jobs;
use crate::machine::resolve_machine;
use crate::models::{random_instance_id, CreateOpts, Instance, InstanceState};
use crate::nomad::{Client, JobStatus};
use crate::poller::{deregister_job, poll_for_job};
use crate::{Error, Result};

pub const DRIVER_NAME: &str = "nomad";

/// Capability surface the pool manager drives.
///
/// Errors are opaque to the pool manager; it responds to any of them by
/// retrying against a fallback pool.
#[async_trait]
pub trait Driver: Send + Sync {
    fn driver_name(&self) -> &'static str;

    fn can_hibernate(&self) -> bool;

    fn root_dir(&self) -> &str {
        ""
    }

    /// Check that the driver is able to talk to the scheduler.
    async fn ping(&self, ctx: &CancellationToken) -> Result<()>;

    /// Provision a VM and return an addressable instance.
    async fn create(&self, ctx: &CancellationToken, opts: &CreateOpts) -> Result<Instance>;

    /// Tear down instances sequentially, aborting on the first error.
    async fn destroy(&self, ctx: &CancellationToken, instances: &[Instance]) -> Result<()>;

    async fn logs(&self, ctx: &CancellationToken, instance_id: &str) -> Result<String>;

    async fn set_tags(
        &self,
        ctx: &CancellationToken,
        instance: &Instance,
        tags: &HashMap<String, String>,
    ) -> Result<()>;

    async fn hibernate(
        &self,
        ctx: &CancellationToken,
        instance_id: &str,
        pool_name: &str,
    ) -> Result<()>;

    async fn start(
        &self,
        ctx: &CancellationToken,
        instance_id: &str,
        pool_name: &str,
    ) -> Result<String>;
}

/// Driver that provisions micro-VMs through a nomad cluster.
///
/// Cheap to clone; all clones share the same HTTP client.
#[derive(Clone, Debug)]
pub struct NomadDriver {
    config: Arc<DriverConfig>,
    client: Client,
}

impl NomadDriver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::new(
            &config.address,
            config.insecure,
            config.ca_cert_path.as_deref(),
            config.client_cert_path.as_deref(),
            config.client_key_path.as_deref(),
        )?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Parse the configured VM shape, rejecting non-numeric or
    /// non-positive values before anything reaches the scheduler.
    fn vm_shape(&self) -> Result<(i64, i64)> {
        let cpus: i64 = self
            .config
            .vm_cpus
            .parse()
            .map_err(|_| Error::validation("could not convert VM cpus to integer"))?;
        let mem_gb: i64 = self
            .config
            .vm_memory_gb
            .parse()
            .map_err(|_| Error::validation("could not convert VM memory to integer"))?;
        if cpus <= 0 {
            return Err(Error::validation("VM cpus must be positive"));
        }
        if mem_gb <= 0 {
            return Err(Error::validation("VM memory must be positive"));
        }
        Ok((cpus, mem_gb))
    }

    /// Require that no task in the init job's task group failed.
    ///
    /// The init job going dead only means it finished; a failed subtask
    /// means a partial guest, which counts as no guest at all.
    async fn check_task_group_status(&self, job_id: &str, task_group: &str) -> Result<()> {
        let summary = self
            .client
            .job_summary(job_id)
            .await
            .map_err(|_| Error::InitFailure("could not get summary of the job".to_string()))?;

        let group = summary
            .summary
            .get(task_group)
            .ok_or_else(|| {
                Error::InitFailure("could not get summary of the task group".to_string())
            })?;
        if group.failed > 0 {
            return Err(Error::InitFailure("found failed tasks".to_string()));
        }
        Ok(())
    }

    /// Launch a full destroy of a partially created instance on a detached
    /// task, so teardown finishes even if the caller has gone away.
    fn spawn_destroy(&self, instance: Instance) {
        let driver = self.clone();
        tokio::spawn(async move {
            let ctx = CancellationToken::new();
            if let Err(err) = driver.destroy(&ctx, std::slice::from_ref(&instance)).await {
                tracing::error!(
                    instance_id = %instance.id,
                    error = %err,
                    "scheduler: cleanup of partially created instance did not complete"
                );
            }
        });
    }
}

#[async_trait]
impl Driver for NomadDriver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn can_hibernate(&self) -> bool {
        false
    }

    /// The client is constructed eagerly in `new`, so a driver that exists
    /// can reach its configuration; no scheduler round trip is made here.
    async fn ping(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn create(&self, ctx: &CancellationToken, opts: &CreateOpts) -> Result<Instance> {
        let platform = opts.platform.clone().with_defaults()?;
        let (cpus, mem_gb) = self.vm_shape()?;

        let vm = random_instance_id();

        // Reservation job: occupies the node's resources for the VM's whole
        // lifetime so the scheduler cannot oversubscribe it.
        let (resource_job, resource_job_id) = if self.config.noop {
            jobs::resource_job_noop(&vm)
        } else {
            jobs::resource_job(&self.config, cpus, mem_gb, &vm)
        };

        tracing::info!(
            vm = %vm,
            resource_job_id = %resource_job_id,
            "scheduler: finding a node which has available resources ..."
        );

        self.client
            .register_job(&resource_job)
            .await
            .map_err(|err| Error::scheduler(format!("could not register job: {}", err)))?;

        if let Err(err) = poll_for_job(
            &self.client,
            &resource_job_id,
            ctx,
            self.config.resource_job_timeout,
            true,
            &[JobStatus::Running, JobStatus::Dead],
        )
        .await
        {
            tracing::error!(vm = %vm, resource_job_id = %resource_job_id, error = %err, "scheduler: resources did not become available in time");
            return Err(Error::SchedulingTimeout);
        }
        tracing::info!(vm = %vm, "scheduler: found a node with available resources");

        let machine = match resolve_machine(&self.client, &resource_job_id).await {
            Ok(machine) => machine,
            Err(err) => {
                let _ = deregister_job(&self.client, &resource_job_id, true).await;
                return Err(err);
            }
        };

        // Init job runs on the machine the reservation was allocated to.
        let (init_job, init_job_id, init_task_group) = if self.config.noop {
            jobs::init_job_noop(&vm, &machine.node_id)
        } else {
            jobs::init_job(
                &self.config,
                &vm,
                &opts.startup_script,
                machine.port,
                &machine.node_id,
            )
        };

        let now = Utc::now();
        let instance = Instance {
            id: vm.clone(),
            node_id: machine.node_id.clone(),
            name: vm.clone(),
            address: machine.ip.clone(),
            port: machine.port,
            platform,
            pool: opts.pool_name.clone(),
            provider: DRIVER_NAME.to_string(),
            stage: None,
            state: InstanceState::Created,
            ca_cert: opts.ca_cert.clone(),
            ca_key: opts.ca_key.clone(),
            tls_cert: opts.tls_cert.clone(),
            tls_key: opts.tls_key.clone(),
            started_at: now,
            updated_at: now,
        };

        tracing::debug!(
            vm = %vm,
            init_job_id = %init_job_id,
            node_ip = %machine.ip,
            node_port = machine.port,
            "scheduler: submitting VM creation job"
        );

        if let Err(err) = self.client.register_job(&init_job).await {
            let _ = deregister_job(&self.client, &resource_job_id, true).await;
            return Err(Error::scheduler(format!("could not register job: {}", err)));
        }

        tracing::debug!(vm = %vm, "scheduler: successfully submitted job, started polling for job status");

        if let Err(err) = poll_for_job(
            &self.client,
            &init_job_id,
            ctx,
            self.config.init_timeout,
            true,
            &[JobStatus::Dead],
        )
        .await
        {
            // VM may be partially created; tear the whole thing down
            self.spawn_destroy(instance);
            return Err(err);
        }

        if let Err(err) = self
            .check_task_group_status(&init_job_id, &init_task_group)
            .await
        {
            self.spawn_destroy(instance);
            return Err(err);
        }

        Ok(instance)
    }

    async fn destroy(&self, ctx: &CancellationToken, instances: &[Instance]) -> Result<()> {
        for instance in instances {
            let (destroy_job, destroy_job_id) = if self.config.noop {
                jobs::destroy_job_noop(&instance.id, &instance.node_id, random_instance_id())
            } else {
                jobs::destroy_job(&instance.id, &instance.node_id, random_instance_id())
            };
            let resource_job_id = jobs::resource_job_id(&instance.id);

            tracing::debug!(
                instance_id = %instance.id,
                instance_node_id = %instance.node_id,
                job_id = %destroy_job_id,
                resource_job_id = %resource_job_id,
                "scheduler: freeing up resources ..."
            );

            // The reservation may already be gone; the destroy job is the
            // authoritative teardown either way.
            match deregister_job(&self.client, &resource_job_id, true).await {
                Ok(()) => {
                    tracing::debug!(instance_id = %instance.id, resource_job_id = %resource_job_id, "scheduler: freed up resources")
                }
                Err(err) => {
                    tracing::error!(instance_id = %instance.id, resource_job_id = %resource_job_id, error = %err, "scheduler: could not free up resources")
                }
            }

            tracing::info!(instance_id = %instance.id, job_id = %destroy_job_id, "scheduler: submitting destroy job");
            if let Err(err) = self.client.register_job(&destroy_job).await {
                tracing::error!(instance_id = %instance.id, job_id = %destroy_job_id, error = %err, "scheduler: could not register destroy job");
                return Err(Error::scheduler(format!(
                    "could not register destroy job: {}",
                    err
                )));
            }

            tracing::debug!(instance_id = %instance.id, job_id = %destroy_job_id, "scheduler: started polling for destroy job");
            if let Err(err) = poll_for_job(
                &self.client,
                &destroy_job_id,
                ctx,
                self.config.destroy_timeout,
                false,
                &[JobStatus::Dead],
            )
            .await
            {
                tracing::error!(instance_id = %instance.id, job_id = %destroy_job_id, error = %err, "scheduler: could not complete destroy job");
                return Err(Error::DestroyTimeout(err.to_string()));
            }
        }
        Ok(())
    }

    async fn logs(&self, _ctx: &CancellationToken, _instance_id: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn set_tags(
        &self,
        _ctx: &CancellationToken,
        _instance: &Instance,
        _tags: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn hibernate(
        &self,
        _ctx: &CancellationToken,
        _instance_id: &str,
        _pool_name: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn start(
        &self,
        _ctx: &CancellationToken,
        _instance_id: &str,
        _pool_name: &str,
    ) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    fn test_driver(cpus: &str, mem: &str) -> NomadDriver {
        let config = DriverConfig::builder()
            .address("http://localhost:4646")
            .vm_image("weaveworks/ignite-ubuntu")
            .vm_cpus(cpus)
            .vm_memory_gb(mem)
            .build();
        NomadDriver::new(config).unwrap()
    }

    #[test]
    fn test_driver_facade() {
        let driver = test_driver("2", "4");
        assert_eq!(driver.driver_name(), "nomad");
        assert!(!driver.can_hibernate());
        assert_eq!(driver.root_dir(), "");
    }

    #[test]
    fn test_driver_requires_config() {
        let err = NomadDriver::new(DriverConfig::default()).unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_noop_surface() {
        let driver = test_driver("2", "4");
        let ctx = CancellationToken::new();

        assert!(driver.ping(&ctx).await.is_ok());
        assert_eq!(driver.logs(&ctx, "abc").await.unwrap(), "");
        assert_eq!(driver.start(&ctx, "abc", "pool").await.unwrap(), "");
        assert!(driver.hibernate(&ctx, "abc", "pool").await.is_ok());
        assert!(driver.destroy(&ctx, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_non_numeric_shape() {
        let driver = test_driver("two", "4");
        let ctx = CancellationToken::new();
        let err = driver.create(&ctx, &CreateOpts::default()).await.unwrap_err();
        assert!(err.is_validation_error());
        assert!(err.to_string().contains("cpus"));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_cpus() {
        let driver = test_driver("0", "4");
        let ctx = CancellationToken::new();
        let err = driver.create(&ctx, &CreateOpts::default()).await.unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_platform() {
        let driver = test_driver("2", "4");
        let ctx = CancellationToken::new();
        let opts = CreateOpts {
            platform: Platform::new("plan9", ""),
            ..Default::default()
        };
        let err = driver.create(&ctx, &opts).await.unwrap_err();
        assert!(err.is_validation_error());
    }
}
