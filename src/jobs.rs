//! Job templates for the three phases of the VM lifecycle
//!
//! All templates build batch jobs for a single datacenter with a lone task
//! group, running shell commands through `raw_exec` as a privileged user.
//! Job ids are pure functions of the instance id, so destroy can recompute
//! every id without persisting any mapping.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::DriverConfig;
use crate::nomad::{
    Constraint, Job, NetworkResource, Port, RawExecConfig, ReschedulePolicy, Resources,
    RestartPolicy, Task, TaskGroup, TaskLifecycle,
};

/// Path of the VM tool binary on every worker node.
pub const IGNITE_PATH: &str = "/usr/local/bin/ignite";

/// Fixed port the lite-engine listens on inside the guest.
pub const LITE_ENGINE_PORT: u16 = 9079;

/// How long the scheduler keeps tasks alive after losing the client node.
const CLIENT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(4 * 60);

const DESTROY_RETRY_ATTEMPTS: i64 = 3;

/// Smallest envelope the scheduler will place. The reservation job leaves
/// exactly this much headroom so init/destroy tasks can co-locate.
const MIN_CPU_MHZ: i64 = 40;
const MIN_MEMORY_MB: i64 = 20;

const DATACENTER: &str = "dc1";
const RAW_EXEC_DRIVER: &str = "raw_exec";
const SU_COMMAND: &str = "/usr/bin/su";

pub fn resource_job_id(instance_id: &str) -> String {
    format!("init_job_resources_{}", instance_id)
}

pub fn init_job_id(instance_id: &str) -> String {
    format!("init_job_{}", instance_id)
}

pub fn destroy_job_id(instance_id: &str) -> String {
    format!("destroy_job_{}", instance_id)
}

/// Where the prestart task writes the encoded startup script on the host.
pub fn startup_script_host_path(instance_id: &str) -> String {
    format!("/usr/local/bin/{}.sh", instance_id)
}

/// Where the startup script is copied to inside the guest.
pub fn startup_script_vm_path(instance_id: &str) -> String {
    format!("/usr/bin/{}.sh", instance_id)
}

/// Job that reserves CPU, memory and a dynamic port on some node for the
/// VM's whole lifetime.
///
/// The resources requested are shaved by the configured headroom so the
/// node can still place minimum-envelope tasks next to the reservation.
/// The task sleeps through the create phase and then watches the forwarded
/// port; a closed port means the VM died, the task exits non-zero and the
/// scheduler frees the node.
pub fn resource_job(config: &DriverConfig, cpus: i64, mem_gb: i64, vm: &str) -> (Job, String) {
    let id = resource_job_id(vm);
    let port_label = vm.to_string();

    // 2 minute buffer past both create-phase deadlines
    let sleep_time = config.resource_job_timeout + config.init_timeout + Duration::from_secs(120);

    let cpu = config.machine_frequency_mhz * cpus - config.cpu_headroom_mhz;
    let mem = gigs_to_megs(mem_gb) - config.memory_headroom_mb;

    let script = health_check_script(sleep_time, &format!("$NOMAD_PORT_{}", port_label));

    let job = Job {
        id: Some(id.clone()),
        name: Some(id.clone()),
        job_type: Some("batch".to_string()),
        datacenters: vec![DATACENTER.to_string()],
        reschedule: Some(no_reschedule()),
        task_groups: vec![TaskGroup {
            name: Some(format!("init_task_group_resource_{}", vm)),
            count: Some(1),
            networks: vec![NetworkResource {
                dynamic_ports: vec![Port {
                    label: port_label,
                    value: 0,
                }],
            }],
            restart_policy: Some(RestartPolicy { attempts: Some(0) }),
            stop_after_client_disconnect: Some(duration_nanos(CLIENT_DISCONNECT_TIMEOUT)),
            tasks: vec![Task {
                name: "sleep_and_ping".to_string(),
                driver: RAW_EXEC_DRIVER.to_string(),
                config: Some(su_command(&script)),
                resources: Some(Resources {
                    cpu: Some(cpu),
                    memory_mb: Some(mem),
                    networks: Vec::new(),
                }),
                lifecycle: None,
            }],
        }],
        ..Default::default()
    };
    (job, id)
}

/// Job pinned to the reservation's node that boots the VM.
///
/// Four tasks: a prestart hook drops the base64-encoded startup script on
/// the host, the main task starts the VM with the reserved port forwarded
/// to the lite-engine and the script copied in, and two poststop hooks
/// decode-and-run the script inside the guest and clean the host copy up.
pub fn init_job(
    config: &DriverConfig,
    vm: &str,
    startup_script: &str,
    host_port: u16,
    node_id: &str,
) -> (Job, String, String) {
    let id = init_job_id(vm);
    let group = format!("init_task_group_{}", vm);
    let encoded_script = BASE64.encode(startup_script.as_bytes());

    let host_path = startup_script_host_path(vm);
    let vm_path = startup_script_vm_path(vm);

    let run_cmd = format!(
        "{} run {} --name {} --cpus {} --memory {}GB --size {} --ssh --runtime=docker --ports {}:{} --copy-files {}:{}",
        IGNITE_PATH,
        config.vm_image,
        vm,
        config.vm_cpus,
        config.vm_memory_gb,
        config.vm_disk_size,
        host_port,
        LITE_ENGINE_PORT,
        host_path,
        vm_path,
    );

    let job = Job {
        id: Some(id.clone()),
        name: Some(vm.to_string()),
        job_type: Some("batch".to_string()),
        datacenters: vec![DATACENTER.to_string()],
        constraints: vec![node_constraint(node_id)],
        reschedule: Some(no_reschedule()),
        task_groups: vec![TaskGroup {
            name: Some(group.clone()),
            count: Some(1),
            networks: Vec::new(),
            restart_policy: Some(RestartPolicy { attempts: Some(0) }),
            stop_after_client_disconnect: Some(duration_nanos(CLIENT_DISCONNECT_TIMEOUT)),
            tasks: vec![
                Task {
                    name: "create_startup_script_on_host".to_string(),
                    driver: RAW_EXEC_DRIVER.to_string(),
                    config: Some(su_command(&format!(
                        "echo {} >> {}",
                        encoded_script, host_path
                    ))),
                    resources: Some(min_resources()),
                    lifecycle: Some(TaskLifecycle {
                        hook: "prestart".to_string(),
                        sidecar: false,
                    }),
                },
                Task {
                    name: "ignite_run".to_string(),
                    driver: RAW_EXEC_DRIVER.to_string(),
                    config: Some(su_command(&run_cmd)),
                    resources: Some(min_resources()),
                    lifecycle: None,
                },
                Task {
                    name: "ignite_exec".to_string(),
                    driver: RAW_EXEC_DRIVER.to_string(),
                    config: Some(su_command(&format!(
                        "{} exec {} 'cat {} | base64 --decode | bash'",
                        IGNITE_PATH, vm, vm_path
                    ))),
                    resources: Some(min_resources()),
                    lifecycle: Some(TaskLifecycle {
                        hook: "poststop".to_string(),
                        sidecar: false,
                    }),
                },
                Task {
                    name: "cleanup_startup_script_from_host".to_string(),
                    driver: RAW_EXEC_DRIVER.to_string(),
                    config: Some(su_command(&format!("rm {}", host_path))),
                    resources: Some(min_resources()),
                    lifecycle: Some(TaskLifecycle {
                        hook: "poststop".to_string(),
                        sidecar: false,
                    }),
                },
            ],
        }],
        ..Default::default()
    };
    (job, id, group)
}

/// Job pinned to the given node that stops and removes the VM.
///
/// Restarts absorb transient VM tool failures, so a flaky `stop` does not
/// need operator intervention.
pub fn destroy_job(vm: &str, node_id: &str, name: String) -> (Job, String) {
    let id = destroy_job_id(vm);
    let job = Job {
        id: Some(id.clone()),
        name: Some(name),
        job_type: Some("batch".to_string()),
        datacenters: vec![DATACENTER.to_string()],
        constraints: vec![node_constraint(node_id)],
        task_groups: vec![TaskGroup {
            name: Some(format!("delete_task_group_{}", vm)),
            count: Some(1),
            networks: Vec::new(),
            restart_policy: Some(RestartPolicy {
                attempts: Some(DESTROY_RETRY_ATTEMPTS),
            }),
            stop_after_client_disconnect: Some(duration_nanos(CLIENT_DISCONNECT_TIMEOUT)),
            tasks: vec![Task {
                name: "ignite_stop_and_rm".to_string(),
                driver: RAW_EXEC_DRIVER.to_string(),
                config: Some(su_command(&format!(
                    "{} stop {} && {} rm {}",
                    IGNITE_PATH, vm, IGNITE_PATH, vm
                ))),
                resources: Some(min_resources()),
                lifecycle: None,
            }],
        }],
        ..Default::default()
    };
    (job, id)
}

/// Dummy reservation job: same id, port label and shape, trivial command.
pub fn resource_job_noop(vm: &str) -> (Job, String) {
    let id = resource_job_id(vm);
    let job = Job {
        id: Some(id.clone()),
        name: Some(id.clone()),
        job_type: Some("batch".to_string()),
        datacenters: vec![DATACENTER.to_string()],
        reschedule: Some(no_reschedule()),
        task_groups: vec![TaskGroup {
            name: Some(format!("init_task_group_resource_{}", vm)),
            count: Some(1),
            networks: vec![NetworkResource {
                dynamic_ports: vec![Port {
                    label: vm.to_string(),
                    value: 0,
                }],
            }],
            restart_policy: Some(RestartPolicy { attempts: Some(0) }),
            stop_after_client_disconnect: Some(duration_nanos(CLIENT_DISCONNECT_TIMEOUT)),
            tasks: vec![noop_task("sleep_and_ping")],
        }],
        ..Default::default()
    };
    (job, id)
}

/// Dummy init job: same id and group name, a single trivial task.
pub fn init_job_noop(vm: &str, node_id: &str) -> (Job, String, String) {
    let id = init_job_id(vm);
    let group = format!("init_task_group_{}", vm);
    let job = Job {
        id: Some(id.clone()),
        name: Some(vm.to_string()),
        job_type: Some("batch".to_string()),
        datacenters: vec![DATACENTER.to_string()],
        constraints: vec![node_constraint(node_id)],
        reschedule: Some(no_reschedule()),
        task_groups: vec![TaskGroup {
            name: Some(group.clone()),
            count: Some(1),
            networks: Vec::new(),
            restart_policy: Some(RestartPolicy { attempts: Some(0) }),
            stop_after_client_disconnect: Some(duration_nanos(CLIENT_DISCONNECT_TIMEOUT)),
            tasks: vec![noop_task("ignite_run")],
        }],
        ..Default::default()
    };
    (job, id, group)
}

/// Dummy destroy job: same id and constraint, a single trivial task.
pub fn destroy_job_noop(vm: &str, node_id: &str, name: String) -> (Job, String) {
    let id = destroy_job_id(vm);
    let job = Job {
        id: Some(id.clone()),
        name: Some(name),
        job_type: Some("batch".to_string()),
        datacenters: vec![DATACENTER.to_string()],
        constraints: vec![node_constraint(node_id)],
        task_groups: vec![TaskGroup {
            name: Some(format!("delete_task_group_{}", vm)),
            count: Some(1),
            networks: Vec::new(),
            restart_policy: Some(RestartPolicy { attempts: Some(0) }),
            stop_after_client_disconnect: Some(duration_nanos(CLIENT_DISCONNECT_TIMEOUT)),
            tasks: vec![noop_task("ignite_stop_and_rm")],
        }],
        ..Default::default()
    };
    (job, id)
}

/// Liveness program for the reservation task.
///
/// Sleeps through the whole create phase, then checks the forwarded port
/// every 30 seconds. A closed port exits the task non-zero, which turns
/// the reservation dead and releases the node.
fn health_check_script(sleep: Duration, port: &str) -> String {
    format!(
        r#"
#!/usr/bin/bash
echo "sleeping..."
sleep {}
echo "done sleeping"
while true
do
nc -vz localhost {}
if [ $? -eq 1 ]
then
    echo "The port check failed"
    exit 1
fi
echo "Port check passed..."
sleep 30
done"#,
        sleep.as_secs(),
        port
    )
}

fn node_constraint(node_id: &str) -> Constraint {
    Constraint {
        l_target: "${node.unique.id}".to_string(),
        r_target: node_id.to_string(),
        operand: "=".to_string(),
    }
}

fn no_reschedule() -> ReschedulePolicy {
    ReschedulePolicy {
        attempts: Some(0),
        unlimited: Some(false),
    }
}

fn su_command(script: &str) -> RawExecConfig {
    RawExecConfig {
        command: SU_COMMAND.to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

fn min_resources() -> Resources {
    Resources {
        cpu: Some(MIN_CPU_MHZ),
        memory_mb: Some(MIN_MEMORY_MB),
        networks: Vec::new(),
    }
}

fn noop_task(name: &str) -> Task {
    Task {
        name: name.to_string(),
        driver: RAW_EXEC_DRIVER.to_string(),
        config: Some(su_command("echo noop")),
        resources: Some(min_resources()),
        lifecycle: None,
    }
}

fn gigs_to_megs(gigs: i64) -> i64 {
    gigs * 1024
}

fn duration_nanos(d: Duration) -> i64 {
    d.as_nanos() as i64
}
