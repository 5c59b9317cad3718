//! Driver tests against an in-process mock scheduler
//!
//! The mock speaks just enough of the nomad HTTP API for the driver:
//! register/deregister, job info with a scripted status progression,
//! summaries, and allocation/node lookups.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use nomad_vm_driver::{
    jobs, random_instance_id, CreateOpts, Driver, DriverConfig, DriverConfigBuilder, Instance,
    InstanceState, NomadDriver, Platform,
};

const NEVER: u32 = u32::MAX;

/// Scripted behavior of the mock scheduler for one test.
#[derive(Clone)]
struct Behavior {
    /// Info polls before the reservation job reports running
    reservation_polls_until_running: u32,
    /// Failed counter reported in the init job's task group summary
    init_failed_tasks: i64,
    /// Report no allocations for any job
    no_allocations: bool,
    node_http_addr: String,
    dynamic_port: i64,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            reservation_polls_until_running: 1,
            init_failed_tasks: 0,
            no_allocations: false,
            node_http_addr: "10.0.0.5:4646".to_string(),
            dynamic_port: 27017,
        }
    }
}

struct MockState {
    behavior: Behavior,
    /// Job ids in registration order
    registered: Vec<String>,
    /// Live job payloads, removed again on deregistration
    jobs: HashMap<String, Value>,
    /// (job id, purge) in deregistration order
    deregistered: Vec<(String, bool)>,
    info_polls: HashMap<String, u32>,
    index: u64,
}

type Shared = Arc<Mutex<MockState>>;

async fn start_mock(behavior: Behavior) -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(Mutex::new(MockState {
        behavior,
        registered: Vec::new(),
        jobs: HashMap::new(),
        deregistered: Vec::new(),
        info_polls: HashMap::new(),
        index: 0,
    }));

    let app = Router::new()
        .route("/v1/jobs", put(register_job))
        .route("/v1/job/:id", get(job_info).delete(deregister_job))
        .route("/v1/job/:id/summary", get(job_summary))
        .route("/v1/job/:id/allocations", get(job_allocations))
        .route("/v1/allocation/:id", get(allocation_info))
        .route("/v1/node/:id", get(node_info))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn register_job(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let job = body["Job"].clone();
    let id = job["ID"].as_str().unwrap_or_default().to_string();
    let mut s = state.lock();
    s.index += 1;
    s.registered.push(id.clone());
    s.jobs.insert(id, job);
    Json(json!({ "EvalID": "eval-1" }))
}

async fn job_info(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    // emulate the blocking query's latency
    tokio::time::sleep(Duration::from_millis(25)).await;

    let mut s = state.lock();
    let Some(mut job) = s.jobs.get(&id).cloned() else {
        return (StatusCode::NOT_FOUND, "job not found").into_response();
    };

    let polls = {
        let entry = s.info_polls.entry(id.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let status = if id.starts_with("init_job_resources_") {
        if polls >= s.behavior.reservation_polls_until_running {
            "running"
        } else {
            "pending"
        }
    } else if id.starts_with("destroy_job_") || id.starts_with("init_job_") {
        "dead"
    } else {
        "pending"
    };

    job["Status"] = json!(status);
    s.index += 1;
    let index = s.index;
    drop(s);

    (
        [(
            HeaderName::from_static("x-nomad-index"),
            index.to_string(),
        )],
        Json(job),
    )
        .into_response()
}

async fn deregister_job(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let purge = query.get("purge").map(|v| v == "true").unwrap_or(false);
    let mut s = state.lock();
    s.deregistered.push((id.clone(), purge));
    if s.jobs.remove(&id).is_none() {
        return (StatusCode::NOT_FOUND, "job not found for ID").into_response();
    }
    s.index += 1;
    Json(json!({ "EvalID": "eval-1" })).into_response()
}

async fn job_summary(State(state): State<Shared>, Path(id): Path<String>) -> Json<Value> {
    let s = state.lock();
    let vm = id.strip_prefix("init_job_").unwrap_or(id.as_str());
    let mut groups = serde_json::Map::new();
    groups.insert(
        format!("init_task_group_{}", vm),
        json!({ "Complete": 4, "Failed": s.behavior.init_failed_tasks }),
    );
    Json(json!({ "JobID": id, "Summary": groups }))
}

async fn job_allocations(State(state): State<Shared>, Path(_id): Path<String>) -> Json<Value> {
    if state.lock().behavior.no_allocations {
        return Json(json!([]));
    }
    Json(json!([{ "ID": "alloc-1", "NodeID": "n1" }]))
}

async fn allocation_info(State(state): State<Shared>, Path(id): Path<String>) -> Json<Value> {
    let s = state.lock();
    Json(json!({
        "ID": id,
        "NodeID": "n1",
        "Resources": {
            "Networks": [
                { "DynamicPorts": [{ "Label": "vm", "Value": s.behavior.dynamic_port }] }
            ]
        }
    }))
}

async fn node_info(State(state): State<Shared>, Path(id): Path<String>) -> Json<Value> {
    let s = state.lock();
    Json(json!({ "ID": id, "HTTPAddr": s.behavior.node_http_addr }))
}

fn base_config(addr: SocketAddr) -> DriverConfigBuilder {
    DriverConfig::builder()
        .address(format!("http://{}", addr))
        .vm_image("weaveworks/ignite-ubuntu")
        .vm_cpus("2")
        .vm_memory_gb("4")
        .vm_disk_size("10GB")
        .resource_job_timeout(Duration::from_secs(2))
        .init_timeout(Duration::from_secs(3))
        .destroy_timeout(Duration::from_secs(3))
}

fn create_opts() -> CreateOpts {
    CreateOpts {
        platform: Platform::default(),
        pool_name: "test-pool".to_string(),
        startup_script: "echo hello".to_string(),
        ..Default::default()
    }
}

fn fake_instance(id: &str, node_id: &str) -> Instance {
    let now = chrono::Utc::now();
    Instance {
        id: id.to_string(),
        node_id: node_id.to_string(),
        name: id.to_string(),
        address: String::new(),
        port: 0,
        platform: Platform::default(),
        pool: "test-pool".to_string(),
        provider: "nomad".to_string(),
        stage: None,
        state: InstanceState::Created,
        ca_cert: None,
        ca_key: None,
        tls_cert: None,
        tls_key: None,
        started_at: now,
        updated_at: now,
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_create_happy_path() {
    let (addr, state) = start_mock(Behavior {
        reservation_polls_until_running: 2,
        ..Default::default()
    })
    .await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let instance = driver.create(&ctx, &create_opts()).await.unwrap();

    assert_eq!(instance.address, "10.0.0.5");
    assert_eq!(instance.port, 27017);
    assert_eq!(instance.node_id, "n1");
    assert_eq!(instance.state, InstanceState::Created);
    assert_eq!(instance.provider, "nomad");
    assert_eq!(instance.pool, "test-pool");
    assert_eq!(instance.platform.os, "linux");
    assert_eq!(instance.platform.arch, "amd64");

    // create is a transaction: reservation + init registered, in that
    // order, and nothing was torn down
    let s = state.lock();
    assert_eq!(
        s.registered,
        vec![
            jobs::resource_job_id(&instance.id),
            jobs::init_job_id(&instance.id),
        ]
    );
    assert!(s.deregistered.is_empty());

    // the reservation's port label is the instance id, and the init job is
    // pinned to the node the resolver returned
    let reservation = &s.jobs[&jobs::resource_job_id(&instance.id)];
    assert_eq!(
        reservation["TaskGroups"][0]["Networks"][0]["DynamicPorts"][0]["Label"],
        json!(instance.id)
    );
    let init = &s.jobs[&jobs::init_job_id(&instance.id)];
    assert_eq!(init["Constraints"][0]["RTarget"], json!("n1"));
}

#[tokio::test]
async fn test_create_reservation_timeout_deregisters() {
    let (addr, state) = start_mock(Behavior {
        reservation_polls_until_running: NEVER,
        ..Default::default()
    })
    .await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let err = driver.create(&ctx, &create_opts()).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("could not find a node with available resources"));

    // the poller launches the deregistration detached; give it a moment
    let deregistered = wait_until(Duration::from_secs(2), || {
        state
            .lock()
            .deregistered
            .iter()
            .any(|(id, purge)| id.starts_with("init_job_resources_") && *purge)
    })
    .await;
    assert!(deregistered, "reservation was not deregistered after timeout");

    // only the reservation was ever registered
    let s = state.lock();
    assert_eq!(s.registered.len(), 1);
    assert!(s.jobs.is_empty());
}

#[tokio::test]
async fn test_create_no_allocations_deregisters_reservation() {
    let (addr, state) = start_mock(Behavior {
        no_allocations: true,
        ..Default::default()
    })
    .await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let err = driver.create(&ctx, &create_opts()).await.unwrap_err();
    assert!(err.to_string().contains("no allocation found"));

    let s = state.lock();
    assert!(s
        .deregistered
        .iter()
        .any(|(id, purge)| id.starts_with("init_job_resources_") && *purge));
}

#[tokio::test]
async fn test_create_invalid_port_deregisters_reservation() {
    let (addr, state) = start_mock(Behavior {
        dynamic_port: 70000,
        ..Default::default()
    })
    .await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let err = driver.create(&ctx, &create_opts()).await.unwrap_err();
    assert!(err.to_string().contains("not a valid port"));

    let s = state.lock();
    assert!(s
        .deregistered
        .iter()
        .any(|(id, purge)| id.starts_with("init_job_resources_") && *purge));
}

#[tokio::test]
async fn test_create_bad_node_address_deregisters_reservation() {
    let (addr, state) = start_mock(Behavior {
        node_http_addr: "node-hostname:4646".to_string(),
        ..Default::default()
    })
    .await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let err = driver.create(&ctx, &create_opts()).await.unwrap_err();
    assert!(err.to_string().contains("could not parse client machine IP"));

    let s = state.lock();
    assert!(s
        .deregistered
        .iter()
        .any(|(id, purge)| id.starts_with("init_job_resources_") && *purge));
}

#[tokio::test]
async fn test_create_init_failure_destroys_everything() {
    let (addr, state) = start_mock(Behavior {
        init_failed_tasks: 1,
        ..Default::default()
    })
    .await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let err = driver.create(&ctx, &create_opts()).await.unwrap_err();
    assert!(err.to_string().contains("init job failed"));

    // compensation runs detached: reservation deregistered, destroy job
    // registered and polled to dead
    let cleaned = wait_until(Duration::from_secs(2), || {
        let s = state.lock();
        let reservation_gone = s
            .deregistered
            .iter()
            .any(|(id, _)| id.starts_with("init_job_resources_"));
        let destroy_registered = s
            .registered
            .iter()
            .any(|id| id.starts_with("destroy_job_"));
        reservation_gone && destroy_registered
    })
    .await;
    assert!(cleaned, "compensating destroy did not run");
}

#[tokio::test]
async fn test_destroy_after_create_leaves_no_reservation() {
    let (addr, state) = start_mock(Behavior::default()).await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let instance = driver.create(&ctx, &create_opts()).await.unwrap();
    driver
        .destroy(&ctx, std::slice::from_ref(&instance))
        .await
        .unwrap();

    let s = state.lock();
    assert!(s
        .deregistered
        .iter()
        .any(|(id, purge)| *id == jobs::resource_job_id(&instance.id) && *purge));
    assert!(s
        .registered
        .iter()
        .any(|id| *id == jobs::destroy_job_id(&instance.id)));
}

#[tokio::test]
async fn test_destroy_unknown_instance_is_ok() {
    let (addr, state) = start_mock(Behavior::default()).await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();
    let ctx = CancellationToken::new();

    let ghost = fake_instance(&random_instance_id(), "n1");
    driver
        .destroy(&ctx, std::slice::from_ref(&ghost))
        .await
        .unwrap();

    // reservation deregister came back not-found (logged, not fatal) and
    // the destroy job still ran
    let s = state.lock();
    assert!(s
        .deregistered
        .iter()
        .any(|(id, _)| *id == jobs::resource_job_id(&ghost.id)));
    assert!(s
        .registered
        .iter()
        .any(|id| *id == jobs::destroy_job_id(&ghost.id)));
}

#[tokio::test]
async fn test_concurrent_creates_get_disjoint_jobs() {
    let (addr, state) = start_mock(Behavior::default()).await;
    let driver = NomadDriver::new(base_config(addr).build()).unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            let ctx = CancellationToken::new();
            driver.create(&ctx, &create_opts()).await.unwrap()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let instance = handle.await.unwrap();
        assert!(ids.insert(instance.id.clone()), "duplicate instance id");
    }

    let s = state.lock();
    let unique: HashSet<_> = s.registered.iter().collect();
    assert_eq!(unique.len(), 20, "expected 10 reservation + 10 init jobs");
}

#[test]
fn test_generated_identifier_triples_disjoint() {
    let mut triples = HashSet::new();
    for _ in 0..100 {
        let id = random_instance_id();
        assert!(triples.insert((
            jobs::resource_job_id(&id),
            jobs::init_job_id(&id),
            id,
        )));
    }
    assert_eq!(triples.len(), 100);
}

#[tokio::test]
async fn test_create_cancelled_mid_poll() {
    let (addr, state) = start_mock(Behavior {
        reservation_polls_until_running: NEVER,
        ..Default::default()
    })
    .await;
    // generous deadline so only cancellation can end the poll early
    let config = base_config(addr)
        .resource_job_timeout(Duration::from_secs(30))
        .build();
    let driver = NomadDriver::new(config).unwrap();

    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = driver.create(&ctx, &create_opts()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2), "create did not return promptly");
    assert!(!err.to_string().is_empty());

    // cleanup still happens even though the caller went away
    let deregistered = wait_until(Duration::from_secs(2), || {
        state
            .lock()
            .deregistered
            .iter()
            .any(|(id, purge)| id.starts_with("init_job_resources_") && *purge)
    })
    .await;
    assert!(deregistered, "reservation leaked after cancellation");
}
