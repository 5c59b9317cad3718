//! Long-poll engine for job state
//!
//! The scheduler's blocking queries are the only event source: each
//! iteration waits on the job's modify index and returns early on change.
//! Transient fetch errors are retried on the next iteration; deadline and
//! cancellation are honored at every loop edge.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::nomad::{Client, Job, JobStatus, QueryOptions};
use crate::{Error, Result};

const LONG_POLL_WAIT: Duration = Duration::from_secs(15);

/// Poll a job until it enters one of `terminal_states`, the timeout
/// elapses, or `cancel` fires. A dead job is always terminal.
///
/// When the job never reaches a terminal state and `remove_on_timeout` is
/// set, a detached purge deregistration is launched before returning the
/// error, so the scheduler reclaims the job's resources even though the
/// caller has given up on it.
pub async fn poll_for_job(
    client: &Client,
    id: &str,
    cancel: &CancellationToken,
    timeout: Duration,
    remove_on_timeout: bool,
    terminal_states: &[JobStatus],
) -> Result<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut wait_index: u64 = 0;
    let mut last_job: Option<Job> = None;
    let mut terminal = false;

    loop {
        if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
            break;
        }

        let q = QueryOptions {
            wait_index,
            wait_time: LONG_POLL_WAIT,
        };
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            res = client.job_info(id, &q) => res,
        };

        match fetched {
            Err(err) => {
                tracing::error!(job_id = %id, error = %err, "could not retrieve job information");
                continue;
            }
            Ok((None, _)) => continue,
            Ok((Some(job), meta)) => {
                wait_index = meta.last_index;
                let status = job.job_status();
                let reached =
                    status == JobStatus::Dead || terminal_states.contains(&status);
                if reached {
                    tracing::trace!(job_id = %id, status = %status, "scheduler: job reached a terminal state");
                }
                last_job = Some(job);
                if reached {
                    terminal = true;
                    break;
                }
            }
        }
    }

    let Some(job) = last_job else {
        tracing::error!(job_id = %id, "could not poll for job");
        return Err(Error::scheduler("could not poll for job"));
    };

    if terminal {
        return Ok(job);
    }

    if remove_on_timeout {
        let client = client.clone();
        let job_id = id.to_string();
        tokio::spawn(async move {
            let _ = deregister_job(&client, &job_id, true).await;
        });
    }

    Err(Error::NeverTerminal)
}

/// Stop a job; with `purge` the scheduler gc's it from state as well.
pub async fn deregister_job(client: &Client, id: &str, purge: bool) -> Result<()> {
    tracing::trace!(job_id = %id, purge = purge, "scheduler: trying to deregister job");
    if let Err(err) = client.deregister_job(id, purge).await {
        tracing::error!(job_id = %id, purge = purge, error = %err, "scheduler: could not deregister job");
        return Err(err);
    }
    tracing::info!(job_id = %id, purge = purge, "scheduler: successfully deregistered job");
    Ok(())
}
