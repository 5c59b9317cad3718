//! Machine resolution for placed reservation jobs

use std::net::IpAddr;

use crate::nomad::Client;
use crate::{Error, Result};

/// Where a reservation landed: the node, its address, and the host port
/// the scheduler picked for the dynamic port label.
#[derive(Debug, Clone)]
pub struct Machine {
    pub ip: String,
    pub node_id: String,
    pub port: u16,
}

/// Resolve the node and forwarded port of a running reservation job.
///
/// Reads the job's first allocation, the allocation's dynamic port, and
/// the node's HTTP address. Never retries; callers deregister the
/// reservation on any error here.
pub async fn resolve_machine(client: &Client, job_id: &str) -> Result<Machine> {
    let allocations = client.job_allocations(job_id).await?;
    if allocations.is_empty() {
        return Err(Error::Resolution(
            "no allocation found for the job".to_string(),
        ));
    }

    let node_id = allocations[0].node_id.clone();
    let alloc_id = allocations[0].id.clone();
    if node_id.is_empty() || alloc_id.is_empty() {
        return Err(Error::Resolution(
            "could not find an allocation identifier for the job".to_string(),
        ));
    }

    let alloc = client.allocation_info(&alloc_id).await?;

    // Not expected: without a port the scheduler should not have placed
    // the job at all.
    let port = alloc
        .resources
        .as_ref()
        .and_then(|r| r.networks.first())
        .and_then(|n| n.dynamic_ports.first())
        .map(|p| p.value)
        .ok_or_else(|| {
            Error::Resolution("could not allocate network and ports for job".to_string())
        })?;

    if !(1..=65535).contains(&port) {
        return Err(Error::Resolution(format!(
            "port {} generated is not a valid port",
            port
        )));
    }

    let node = client.node_info(&node_id).await?;
    let ip = node
        .http_addr
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string();
    if ip.parse::<IpAddr>().is_err() {
        return Err(Error::Resolution(format!(
            "could not parse client machine IP: {}",
            ip
        )));
    }

    Ok(Machine {
        ip,
        node_id,
        port: port as u16,
    })
}
