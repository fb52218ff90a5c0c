//! Publishing jobs onto the work queue.

use newsflow_core::{ATTEMPTS_HEADER, Job};
use tracing::{debug, instrument};

use crate::connection::BrokerConnection;
use crate::error::BrokerResult;
use crate::message::OutgoingMessage;

/// Publishes persistent job messages through the shared connection.
///
/// Connects lazily: the first publish (or the first one after a close)
/// goes through [`BrokerConnection::connect`].
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: BrokerConnection,
}

impl Publisher {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Publish a raw message to `queue`.
    pub async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()> {
        let channel = self.connection.connect().await?;
        channel.publish(queue, message).await
    }

    /// Publish `job` to the configured work queue.
    ///
    /// First deliveries carry no `attempts` header; retries carry the count.
    #[instrument(skip(self), fields(record_id = %job.record_id(), attempts = job.attempts()))]
    pub async fn publish_job(&self, job: &Job) -> BrokerResult<()> {
        let mut message = OutgoingMessage::persistent(job.encode_body()?);
        if job.attempts() > 0 {
            message = message.with_header(ATTEMPTS_HEADER, job.attempts_header());
        }

        self.publish(self.connection.queue(), message).await?;
        debug!("job published");
        Ok(())
    }
}
