//! Settlement token for a single delivery.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tracing::error;

use crate::error::BrokerResult;
use crate::message::Delivery;
use crate::transport::Channel;

/// Settles one delivery exactly once.
///
/// Every settle method consumes the token, so a delivery cannot be acked
/// twice or acked after a reject. The optional prefetch permit is released
/// only after the broker call returns, which keeps the number of unsettled
/// deliveries within the consumer's prefetch bound.
pub struct Acknowledger {
    channel: Arc<dyn Channel>,
    delivery: Delivery,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl Acknowledger {
    pub fn new(channel: Arc<dyn Channel>, delivery: Delivery) -> Self {
        Self {
            channel,
            delivery,
            permit: None,
            settled: false,
        }
    }

    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Mark the delivery as done.
    pub async fn ack(mut self) -> BrokerResult<()> {
        self.settled = true;
        self.channel.ack(&self.delivery).await
    }

    /// Put the message back on its queue for another consumer.
    pub async fn reject_requeue(mut self, reason: &str) -> BrokerResult<()> {
        self.settled = true;
        self.channel.reject(&self.delivery, true, reason).await
    }

    /// Drop the message for good.
    pub async fn reject_discard(mut self, reason: &str) -> BrokerResult<()> {
        self.settled = true;
        self.channel.reject(&self.delivery, false, reason).await
    }
}

impl Drop for Acknowledger {
    fn drop(&mut self) {
        if !self.settled {
            // The broker will redeliver it once the channel goes away.
            error!(
                delivery_tag = %self.delivery.tag(),
                queue = self.delivery.queue(),
                "delivery dropped without being settled"
            );
        }
    }
}

impl core::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("delivery_tag", self.delivery.tag())
            .field("settled", &self.settled)
            .finish()
    }
}
