//! Instance model

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Platform;

/// State of a VM instance as tracked by the pool manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Provisioned and addressable
    Created,
    /// Serving a build stage
    InUse,
    /// Torn down
    Destroyed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Created => write!(f, "Created"),
            InstanceState::InUse => write!(f, "InUse"),
            InstanceState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// A provisioned VM instance.
///
/// Returned from a successful create and handed to the pool manager, which
/// owns persistence from then on. The driver never mutates it afterwards;
/// destroy only needs `id` and `node_id` back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier, 20 lowercase alphanumeric chars
    pub id: String,
    /// Scheduler node the instance landed on
    pub node_id: String,
    pub name: String,
    /// IPv4 address of the host node
    pub address: String,
    /// Host port forwarded into the VM
    pub port: u16,
    pub platform: Platform,
    /// Pool this instance was provisioned for
    pub pool: String,
    /// Driver that provisioned the instance
    pub provider: String,
    /// Stage runtime currently assigned, if any
    pub stage: Option<String>,
    pub state: InstanceState,
    pub ca_cert: Option<Vec<u8>>,
    pub ca_key: Option<Vec<u8>>,
    pub tls_cert: Option<Vec<u8>>,
    pub tls_key: Option<Vec<u8>>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options for creating an instance.
///
/// The startup script is supplied by the caller (cloud-init generation
/// lives upstream) and is executed inside the guest once it boots.
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub platform: Platform,
    pub pool_name: String,
    pub startup_script: String,
    pub ca_cert: Option<Vec<u8>>,
    pub ca_key: Option<Vec<u8>>,
    pub tls_cert: Option<Vec<u8>>,
    pub tls_key: Option<Vec<u8>>,
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 20;

/// Generate a random instance id.
///
/// Ids are drawn uniformly from `[a-z0-9]` so concurrent creates get
/// disjoint job ids and port labels without coordination.
pub fn random_instance_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}
