//! The surface this crate needs from a broker client.
//!
//! [`LapinDialer`] is the production implementation. The rest of the crate only ever holds
//! `Arc<dyn RawConnection>` / `Arc<dyn RawChannel>` handles and swaps them wholesale when a
//! reconnection loop recovers.
//!
//! [`LapinDialer`]: ../struct.LapinDialer.html

use crate::{
    types::{DeliveryTag, FieldTable},
    Confirmation, Error, Result,
};
use async_trait::async_trait;
use futures_core::Stream;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions};
use std::{pin::Pin, sync::Arc};

/// Yields once when the underlying handle dies unexpectedly.
///
/// A disconnected receiver means the handle was closed on purpose.
pub type CloseNotice = flume::Receiver<Error>;

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<RawDelivery>> + Send>>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn RawConnection>>;
}

#[async_trait]
pub trait RawConnection: Send + Sync {
    fn close_notice(&self) -> CloseNotice;

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait RawChannel: Send + Sync {
    fn close_notice(&self) -> CloseNotice;

    fn is_open(&self) -> bool;

    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    /// Every later publish on this handle gets its confirmation sent here, in publish order.
    fn notify_confirmations(&self, confirmations: flume::Sender<Confirmation>);

    async fn publish(&self, publishing: Publishing<'_>) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct Publishing<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub options: BasicPublishOptions,
    pub persistent: bool,
    pub headers: &'a FieldTable,
    pub body: &'a [u8],
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawDelivery {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub headers: FieldTable,
    pub body: Vec<u8>,
}
