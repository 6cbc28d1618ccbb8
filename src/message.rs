use crate::{
    acker::Acker,
    transport::RawDelivery,
    types::{DeliveryTag, FieldTable},
    Error, Result,
};
use std::ops::Deref;

/// A message received from a [`Channel`].
///
/// It has to be settled after processing through its [`Acker`], either directly
/// (`delivery.ack(false)`) or, once its channel was replaced, with
/// [`Channel::ack`] and the delivery tag.
///
/// [`Channel`]: ./struct.Channel.html
/// [`Channel::ack`]: ./struct.Channel.html#method.ack
/// [`Acker`]: ./struct.Acker.html
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message, scoped to the channel that delivered it.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. Empty if the default exchange was used.
    pub exchange: String,

    pub routing_key: String,

    /// Whether this message was delivered before.
    pub redelivered: bool,

    pub headers: FieldTable,

    /// The payload of the message in binary format.
    pub body: Vec<u8>,

    /// The acker used to ack/nack the message
    pub acker: Acker,
}

impl Delivery {
    pub(crate) fn new(delivery: RawDelivery, acker: Acker) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            headers: delivery.headers,
            body: delivery.body,
            acker,
        }
    }
}

impl Deref for Delivery {
    type Target = Acker;

    fn deref(&self) -> &Self::Target {
        &self.acker
    }
}

/// What a [`Publisher`] sends and a [`Subscriber`] hands out.
///
/// A message built locally has no delivery attached, settling it fails with
/// [`Error::NoDelivery`].
///
/// [`Publisher`]: ./struct.Publisher.html
/// [`Subscriber`]: ./struct.Subscriber.html
/// [`Error::NoDelivery`]: ./enum.Error.html#variant.NoDelivery
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    headers: FieldTable,
    body: Vec<u8>,
    redelivered: bool,
    delivery: Option<(DeliveryTag, Acker)>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: FieldTable) {
        self.headers = headers;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// The broker's tag for the delivery this message came from, if any.
    pub fn delivery_tag(&self) -> Option<DeliveryTag> {
        self.delivery.as_ref().map(|(tag, _)| *tag)
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(&self, multiple: bool) -> Result<()> {
        self.acker()?.ack(multiple).await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<()> {
        self.acker()?.nack(multiple, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker()?.reject(requeue).await
    }

    fn acker(&self) -> Result<&Acker> {
        self.delivery
            .as_ref()
            .map(|(_, acker)| acker)
            .ok_or(Error::NoDelivery)
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Self {
            headers: delivery.headers,
            body: delivery.body,
            redelivered: delivery.redelivered,
            delivery: Some((delivery.delivery_tag, delivery.acker)),
        }
    }
}
