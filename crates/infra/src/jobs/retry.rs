//! Retry-by-republish for failed jobs.

use std::time::Duration;

use tracing::{error, info, instrument, warn};

use newsflow_core::Job;
use newsflow_events::{Acknowledger, BrokerResult, Publisher, RetryPolicy};

use super::handler::JobError;

/// What happened to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Republished with `attempts` and the original acked.
    Requeued { attempts: u32, delay: Duration },
    /// Retry budget spent; rejected without requeue.
    Discarded,
    /// The republish failed, so the original went back to the broker as-is.
    ReturnedToBroker,
}

/// Schedules the next attempt of a failed job.
///
/// Publish happens before ack: a crash in between duplicates the job, it
/// never loses it.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    publisher: Publisher,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(publisher: Publisher, policy: RetryPolicy) -> Self {
        Self { publisher, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Settle `ack` for a job that failed with `cause`.
    ///
    /// With attempts left: wait `base_delay × (attempts + 1)`, republish with
    /// `attempts + 1`, then ack. Otherwise discard.
    #[instrument(
        skip(self, ack, cause),
        fields(record_id = %job.record_id(), attempts = job.attempts())
    )]
    pub async fn schedule_retry(
        &self,
        job: &Job,
        ack: Acknowledger,
        cause: &JobError,
    ) -> BrokerResult<RetryOutcome> {
        let failed_attempt = job.attempts().saturating_add(1);

        if !self.policy.should_retry(failed_attempt) {
            error!(
                payload = %ack.delivery().body_lossy(),
                max_attempts = self.policy.max_attempts,
                error = %cause,
                "retry budget exhausted, discarding job"
            );
            ack.reject_discard("retry budget exhausted").await?;
            return Ok(RetryOutcome::Discarded);
        }

        let delay = self.policy.delay_for_attempt(failed_attempt);
        warn!(
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "job failed, retrying after delay"
        );
        tokio::time::sleep(delay).await;

        let next = job.next_attempt();
        match self.publisher.publish_job(&next).await {
            Ok(()) => {
                ack.ack().await?;
                info!(next_attempts = next.attempts(), "job requeued");
                Ok(RetryOutcome::Requeued {
                    attempts: next.attempts(),
                    delay,
                })
            }
            Err(err) => {
                error!(error = %err, "republish failed, returning delivery to broker");
                ack.reject_requeue("republish failed").await?;
                Ok(RetryOutcome::ReturnedToBroker)
            }
        }
    }
}
