//! HTTP client for the nomad scheduler API

use std::path::Path;

use super::types::*;
use crate::{Error, Result};

const NOMAD_INDEX_HEADER: &str = "X-Nomad-Index";

/// Client for the subset of the nomad API the driver consumes.
///
/// Cloning is cheap and the client is safe to share across concurrent
/// create/destroy calls.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    address: String,
}

impl Client {
    /// Build a client for the scheduler at `address`.
    ///
    /// TLS material is optional: a CA bundle to trust, and a client
    /// certificate/key pair for mutual TLS. `insecure` disables server
    /// certificate verification.
    pub fn new(
        address: &str,
        insecure: bool,
        ca_cert_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        if address.is_empty() {
            return Err(Error::validation("scheduler address cannot be empty"));
        }

        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = ca_cert_path {
            let pem = std::fs::read(ca)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (client_cert_path, client_key_path) {
            let mut pem = std::fs::read(cert)?;
            pem.extend(std::fs::read(key)?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Register (submit) a job.
    pub async fn register_job(&self, job: &Job) -> Result<()> {
        let url = format!("{}/v1/jobs", self.address);
        let resp = self
            .http
            .put(&url)
            .json(&JobRegisterRequest { job: job.clone() })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Stop a job; with `purge` the scheduler also gc's it from state.
    pub async fn deregister_job(&self, id: &str, purge: bool) -> Result<()> {
        let url = format!("{}/v1/job/{}", self.address, id);
        let resp = self
            .http
            .delete(&url)
            .query(&[("purge", purge.to_string())])
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Fetch a job with blocking-query semantics.
    ///
    /// Returns once the job's modify index exceeds `q.wait_index` or after
    /// `q.wait_time`. The new index is reported in the returned meta and is
    /// fed back in on the next call.
    pub async fn job_info(&self, id: &str, q: &QueryOptions) -> Result<(Option<Job>, QueryMeta)> {
        let url = format!("{}/v1/job/{}", self.address, id);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("index", q.wait_index.to_string()),
                ("wait", format!("{}ms", q.wait_time.as_millis())),
            ])
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let last_index = resp
            .headers()
            .get(NOMAD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let job: Option<Job> = resp.json().await?;
        Ok((job, QueryMeta { last_index }))
    }

    /// Fetch the per-task-group summary counters of a job.
    pub async fn job_summary(&self, id: &str) -> Result<JobSummary> {
        let url = format!("{}/v1/job/{}/summary", self.address, id);
        let resp = self.http.get(&url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// List the allocations placed for a job.
    pub async fn job_allocations(&self, id: &str) -> Result<Vec<AllocationListStub>> {
        let url = format!("{}/v1/job/{}/allocations", self.address, id);
        let resp = self.http.get(&url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Fetch a single allocation with its resource detail.
    pub async fn allocation_info(&self, alloc_id: &str) -> Result<Allocation> {
        let url = format!("{}/v1/allocation/{}", self.address, alloc_id);
        let resp = self.http.get(&url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Fetch a node by id.
    pub async fn node_info(&self, node_id: &str) -> Result<Node> {
        let url = format!("{}/v1/node/{}", self.address, node_id);
        let resp = self.http.get(&url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::scheduler(format!(
            "unexpected response {}: {}",
            status,
            body.trim()
        )))
    }
}
