use crate::{transport::RawChannel, types::DeliveryTag, Channel, Error, Result};
use std::{fmt, sync::Arc};

/// Acknowledgement handle bound to the channel incarnation a delivery came from.
///
/// Once that channel has been replaced by a reconnection the handle refuses to act and
/// returns [`Error::StaleDelivery`]; the tag can still be settled through
/// [`Channel::ack`] on the current channel.
///
/// [`Error::StaleDelivery`]: ./enum.Error.html#variant.StaleDelivery
/// [`Channel::ack`]: ./struct.Channel.html#method.ack
#[derive(Clone)]
pub struct Acker {
    channel: Channel,
    raw: Arc<dyn RawChannel>,
    generation: u64,
    delivery_tag: DeliveryTag,
}

impl Acker {
    pub(crate) fn new(
        channel: Channel,
        raw: Arc<dyn RawChannel>,
        generation: u64,
        delivery_tag: DeliveryTag,
    ) -> Self {
        Self {
            channel,
            raw,
            generation,
            delivery_tag,
        }
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    /// Whether the channel this delivery came from is still the live one.
    pub fn is_stale(&self) -> bool {
        self.channel.generation() != self.generation || !self.raw.is_open()
    }

    pub async fn ack(&self, multiple: bool) -> Result<()> {
        self.origin()?.ack(self.delivery_tag, multiple).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.origin()?
            .nack(self.delivery_tag, multiple, requeue)
            .await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.origin()?.reject(self.delivery_tag, requeue).await
    }

    fn origin(&self) -> Result<&Arc<dyn RawChannel>> {
        if self.is_stale() {
            return Err(Error::StaleDelivery(self.delivery_tag));
        }
        Ok(&self.raw)
    }
}

impl PartialEq for Acker {
    fn eq(&self, other: &Acker) -> bool {
        Arc::as_ptr(&self.raw).cast::<()>() == Arc::as_ptr(&other.raw).cast::<()>()
            && self.delivery_tag == other.delivery_tag
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("delivery_tag", &self.delivery_tag)
            .field("generation", &self.generation)
            .finish()
    }
}
