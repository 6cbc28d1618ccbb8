use crate::{
    acker::Acker,
    listeners::{Listeners, ReconnectListener},
    message::Delivery,
    options::ChannelOptions,
    status::{State, Status},
    transport::{DeliveryStream, Publishing, RawChannel, RawDelivery},
    types::{DeliveryTag, FieldTable},
    Confirmation, Connection, Error, Lifecycle, Result,
};
use futures_lite::stream::StreamExt;
use lapin::options::BasicConsumeOptions;
use parking_lot::RwLock;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A channel opened on a [`Connection`] that reopens itself.
///
/// Opening obtains a channel from the connection and applies the prefetch settings, any
/// failure there is returned. When the channel later dies (on its own, or because its
/// connection did) it is marked closed and reopened every
/// [`ChannelOptions::reconnect_delay`]. Once it is fully usable again every registered
/// reconnection listener is notified.
///
/// Every operation fails fast with [`Error::ChannelClosed`] while the channel is not open.
///
/// [`Connection`]: ./struct.Connection.html
/// [`ChannelOptions::reconnect_delay`]: ./options/struct.ChannelOptions.html#structfield.reconnect_delay
/// [`Error::ChannelClosed`]: ./enum.Error.html#variant.ChannelClosed
#[derive(Clone)]
pub struct Channel(Arc<Inner>);

struct Inner {
    connection: Connection,
    options: ChannelOptions,
    raw: RwLock<Arc<dyn RawChannel>>,
    generation: AtomicU64,
    status: Status,
    listeners: Listeners,
    connection_lost: ReconnectListener,
    closer: CancellationToken,
    lifecycle: Lifecycle,
}

struct Subscription {
    stream: DeliveryStream,
    raw: Arc<dyn RawChannel>,
    generation: u64,
}

impl Channel {
    pub async fn open(
        connection: &Connection,
        options: ChannelOptions,
        lifecycle: &Lifecycle,
    ) -> Result<Self> {
        let connection_lost = connection.register_loss_listener();
        let raw = Self::establish(connection, &options)
            .await
            .map_err(|error| Error::OpenChannel(Box::new(error)))?;
        let status = Status::default();
        status.set_state(State::Open);
        let channel = Self(Arc::new(Inner {
            connection: connection.clone(),
            options,
            raw: RwLock::new(raw),
            generation: AtomicU64::new(0),
            status,
            listeners: Listeners::default(),
            connection_lost,
            closer: connection.closer().child_token(),
            lifecycle: lifecycle.clone(),
        }));
        debug!(
            prefetch_count = options.prefetch_count,
            prefetch_size = options.prefetch_size,
            "channel opened"
        );
        lifecycle.spawn("channel", channel.clone().run());
        Ok(channel)
    }

    pub fn is_closed(&self) -> bool {
        !self.0.status.open()
    }

    pub fn state(&self) -> State {
        self.0.status.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.0.connection
    }

    /// Closes the channel and stops its reconnection and consume loops for good.
    pub async fn close(&self) -> Result<()> {
        self.terminate().await
    }

    /// Gets notified each time this channel has been reopened after a failure.
    pub fn register_reconnect_listener(&self) -> ReconnectListener {
        self.0.listeners.register()
    }

    pub async fn confirm_select(&self) -> Result<()> {
        self.current()?.confirm_select().await
    }

    pub fn notify_confirmations(&self, confirmations: flume::Sender<Confirmation>) -> Result<()> {
        self.current()?.notify_confirmations(confirmations);
        Ok(())
    }

    pub async fn publish(&self, publishing: Publishing<'_>) -> Result<()> {
        let raw = self.current()?;
        raw.publish(publishing).await
    }

    /// Acknowledges through the channel as it is now, regardless of which incarnation
    /// produced the delivery.
    pub async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()> {
        self.current()?.ack(delivery_tag, multiple).await
    }

    pub async fn nack(&self, delivery_tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        self.current()?.nack(delivery_tag, multiple, requeue).await
    }

    pub async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.current()?.reject(delivery_tag, requeue).await
    }

    /// Starts consuming `queue` and forwards deliveries to the returned receiver.
    ///
    /// The first subscription happens right away and its failure is returned. After that,
    /// whenever the delivery stream ends because the channel went away, the subscription
    /// is retried every reconnect delay until it works again or the channel is closed.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<flume::Receiver<Delivery>> {
        let subscription = self
            .subscribe(queue, consumer_tag, options, arguments.clone())
            .await
            .map_err(|error| Error::Consume(Box::new(error)))?;
        let reopened = self.register_reconnect_listener();
        let (sender, receiver) = flume::bounded(1);
        debug!(%queue, %consumer_tag, "consuming");
        self.0.lifecycle.spawn(
            "consumer",
            self.clone().forward(
                queue.to_owned(),
                consumer_tag.to_owned(),
                options,
                arguments,
                subscription,
                reopened,
                sender,
            ),
        );
        Ok(receiver)
    }

    /// Fires once this channel is closed for good.
    pub(crate) fn closer_signal(&self) -> CancellationToken {
        self.0.closer.clone()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.0.generation.load(Ordering::Acquire)
    }

    fn current(&self) -> Result<Arc<dyn RawChannel>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        Ok(self.0.raw.read().clone())
    }

    async fn establish(
        connection: &Connection,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn RawChannel>> {
        let raw = connection.open_channel().await?;
        if let Err(error) = raw
            .set_qos(options.prefetch_count, options.prefetch_size)
            .await
        {
            let _ = raw.close().await;
            return Err(error);
        }
        Ok(raw)
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Subscription> {
        let raw = self.current()?;
        let generation = self.generation();
        let stream = raw.consume(queue, consumer_tag, options, arguments).await?;
        Ok(Subscription {
            stream,
            raw,
            generation,
        })
    }

    async fn terminate(&self) -> Result<()> {
        if !self.0.status.terminate() {
            return Ok(());
        }
        self.0.closer.cancel();
        debug!("channel closed");
        let raw = self.0.raw.read().clone();
        raw.close().await
    }

    async fn run(self) {
        loop {
            let notice = self.0.raw.read().close_notice();
            // A lost connection takes its channels down without always telling them.
            let error = tokio::select! {
                biased;
                _ = self.0.closer.cancelled() => break,
                reason = notice.recv_async() => match reason {
                    Ok(error) => error,
                    Err(_) => break,
                },
                lost = self.0.connection_lost.recv_async() => match lost {
                    Ok(()) => Error::ConnectionClosed,
                    Err(_) => break,
                },
            };
            if !self.0.status.set_state(State::Closed) {
                break;
            }
            warn!(%error, "channel lost, reopening");
            if !self.reopen().await {
                break;
            }
        }
        if let Err(error) = self.terminate().await {
            debug!(%error, "error while closing channel");
        }
    }

    async fn reopen(&self) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.0.closer.cancelled() => return false,
                _ = tokio::time::sleep(self.0.options.reconnect_delay) => {}
            }
            self.0.status.set_state(State::Connecting);
            // Losses reported so far concern handles we are about to replace.
            while self.0.connection_lost.try_recv().is_ok() {}
            let established = tokio::select! {
                biased;
                _ = self.0.closer.cancelled() => return false,
                established = Self::establish(&self.0.connection, &self.0.options) => established,
            };
            match established {
                Ok(raw) => {
                    *self.0.raw.write() = raw.clone();
                    self.0.generation.fetch_add(1, Ordering::AcqRel);
                    if !self.0.status.set_state(State::Open) {
                        let _ = raw.close().await;
                        return false;
                    }
                    let listeners = self.0.listeners.notify_all();
                    info!(listeners, "channel re-established");
                    return true;
                }
                Err(error) => {
                    self.0.status.set_state(State::Closed);
                    debug!(%error, "channel reopen attempt failed");
                }
            }
        }
    }

    async fn forward(
        self,
        queue: String,
        consumer_tag: String,
        options: BasicConsumeOptions,
        arguments: FieldTable,
        mut subscription: Subscription,
        reopened: ReconnectListener,
        sender: flume::Sender<Delivery>,
    ) {
        loop {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.0.closer.cancelled() => return,
                    // The stream of a dead handle does not always end on its own.
                    notified = reopened.recv_async() => match notified {
                        Ok(()) if self.generation() != subscription.generation => break,
                        Ok(()) => continue,
                        Err(_) => return,
                    },
                    next = subscription.stream.next() => next,
                };
                match next {
                    Some(Ok(delivery)) => {
                        let delivery = subscription.wrap(&self, delivery);
                        trace!(delivery_tag = delivery.delivery_tag, "forwarding delivery");
                        tokio::select! {
                            biased;
                            _ = self.0.closer.cancelled() => return,
                            sent = sender.send_async(delivery) => if sent.is_err() {
                                return;
                            },
                        }
                    }
                    Some(Err(error)) => {
                        debug!(%error, %queue, "consumer failed");
                        break;
                    }
                    None => break,
                }
            }

            info!(%queue, "delivery stream ended, resubscribing");
            subscription = loop {
                tokio::select! {
                    biased;
                    _ = self.0.closer.cancelled() => return,
                    _ = tokio::time::sleep(self.0.options.reconnect_delay) => {}
                }
                while reopened.try_recv().is_ok() {}
                match self
                    .subscribe(&queue, &consumer_tag, options, arguments.clone())
                    .await
                {
                    Ok(subscription) => break subscription,
                    Err(error) => debug!(%error, %queue, "resubscribe attempt failed"),
                }
            };
        }
    }
}

impl Subscription {
    fn wrap(&self, channel: &Channel, delivery: RawDelivery) -> Delivery {
        let acker = Acker::new(
            channel.clone(),
            self.raw.clone(),
            self.generation,
            delivery.delivery_tag,
        );
        Delivery::new(delivery, acker)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("listeners", &self.0.listeners.len())
            .field("options", &self.0.options)
            .finish()
    }
}
