use crate::{
    transport::{
        CloseNotice, DeliveryStream, Dialer, Publishing, RawChannel, RawConnection, RawDelivery,
    },
    types::{DeliveryTag, FieldTable},
    Confirmation, Error, Result,
};
use async_trait::async_trait;
use futures_lite::stream::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    BasicProperties, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::{debug, trace, warn};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

/// Dials the broker with lapin, driven by the current tokio runtime.
#[derive(Clone, Default)]
pub struct LapinDialer {
    properties: ConnectionProperties,
}

impl LapinDialer {
    pub fn new(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

impl fmt::Debug for LapinDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapinDialer").finish()
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn RawConnection>> {
        let properties = self
            .properties
            .clone()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = lapin::Connection::connect(uri, properties).await?;
        let (sender, notice) = flume::bounded(1);
        connection.on_error(move |error| {
            // Only the first error matters, the reconnection loop replaces this connection.
            let _ = sender.try_send(Error::from(error));
        });
        Ok(Arc::new(LapinConnection { connection, notice }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
    notice: CloseNotice,
}

#[async_trait]
impl RawConnection for LapinConnection {
    fn close_notice(&self) -> CloseNotice {
        self.notice.clone()
    }

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>> {
        let channel = self.connection.create_channel().await?;
        let (sender, notice) = flume::bounded(1);
        channel.on_error(move |error| {
            let _ = sender.try_send(Error::from(error));
        });
        Ok(Arc::new(LapinChannel {
            channel,
            notice,
            confirmations: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

struct LapinChannel {
    channel: lapin::Channel,
    notice: CloseNotice,
    confirmations: Mutex<Option<flume::Sender<Confirmation>>>,
}

#[async_trait]
impl RawChannel for LapinChannel {
    fn close_notice(&self) -> CloseNotice {
        self.notice.clone()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn set_qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<()> {
        if prefetch_size != 0 {
            warn!(prefetch_size, "lapin only applies the prefetch count, ignoring size");
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    fn notify_confirmations(&self, confirmations: flume::Sender<Confirmation>) {
        *self.confirmations.lock() = Some(confirmations);
    }

    async fn publish(&self, publishing: Publishing<'_>) -> Result<()> {
        let mut properties = BasicProperties::default().with_headers(publishing.headers.clone());
        if publishing.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }
        let confirm = self
            .channel
            .basic_publish(
                publishing.exchange,
                publishing.routing_key,
                publishing.options,
                publishing.body,
                properties,
            )
            .await?;

        // lapin resolves confirms per publish; forward this one before returning so the
        // receiving side observes them in publish order.
        let confirmations = self.confirmations.lock().clone();
        if let Some(confirmations) = confirmations {
            let confirmation = match confirm.await {
                Ok(LapinConfirmation::Ack(Some(returned))) => {
                    let reply_text = returned.reply_text.as_str();
                    debug!(%reply_text, "message returned as unroutable");
                    Confirmation::Returned
                }
                Ok(LapinConfirmation::Ack(None)) => Confirmation::Ack,
                Ok(LapinConfirmation::Nack(_)) => Confirmation::Nack,
                Ok(LapinConfirmation::NotRequested) => Confirmation::NotRequested,
                Err(error) => {
                    debug!(%error, "publisher confirm lost");
                    Confirmation::NotRequested
                }
            };
            trace!(?confirmation, "forwarding publisher confirm");
            let _ = confirmations.send_async(confirmation).await;
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?;
        Ok(Box::pin(consumer.map(|delivery| {
            delivery.map(RawDelivery::from).map_err(Error::from)
        })))
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

impl From<Delivery> for RawDelivery {
    fn from(delivery: Delivery) -> Self {
        let headers = delivery.properties.headers().clone().unwrap_or_default();
        Self {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            headers,
            body: delivery.data,
        }
    }
}
