use crate::{
    listeners::ReconnectListener,
    options::PublisherOptions,
    transport::Publishing,
    Channel, Confirmation, Error, Lifecycle, Message, Result, Session,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Sends messages through a [`Session`] and reports the broker's confirmation of each one.
///
/// Confirm mode is enabled on creation and enabled again every time the session's channel is
/// reopened. When the broker refuses confirm mode the publisher still works, but every
/// publish then reports [`Confirmation::NotRequested`].
///
/// A publisher keeps a single confirmation slot: concurrent publishes on one instance are
/// serialized, each waits for its own confirmation before the next one is sent.
///
/// [`Session`]: ./struct.Session.html
/// [`Confirmation::NotRequested`]: ./enum.Confirmation.html#variant.NotRequested
#[derive(Clone)]
pub struct Publisher(Arc<Inner>);

struct Inner {
    session: Session,
    options: PublisherOptions,
    confirmations: Mutex<flume::Receiver<Confirmation>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl Publisher {
    pub async fn new(session: Session, options: PublisherOptions, lifecycle: &Lifecycle) -> Self {
        // Registered before arming so a recovery in between still triggers a re-arm.
        let listener = session.channel().register_reconnect_listener();
        let (_, disarmed) = flume::unbounded();
        let publisher = Self(Arc::new(Inner {
            session,
            options,
            confirmations: Mutex::new(disarmed),
            in_flight: tokio::sync::Mutex::new(()),
        }));
        publisher.arm().await;
        let signal = publisher.channel().closer_signal();
        lifecycle.spawn("publisher", publisher.clone().watch(listener, signal));
        publisher
    }

    pub fn session(&self) -> &Session {
        &self.0.session
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.0.options
    }

    /// Publishes `message` as persistent and waits for the broker to confirm it.
    ///
    /// Fails right away if the connection or the channel is currently down.
    pub async fn publish(&self, message: &Message) -> Result<Confirmation> {
        self.guard()?;
        let _in_flight = self.0.in_flight.lock().await;
        // Recheck, the channel may have gone down while we waited our turn.
        self.guard()?;

        let confirmations = self.0.confirmations.lock().clone();
        // Leftovers belong to publishes that already gave up on them.
        while confirmations.try_recv().is_ok() {}

        let options = &self.0.options;
        self.channel()
            .publish(Publishing {
                exchange: &options.exchange,
                routing_key: &options.routing_key,
                options: options.basic_publish_options(),
                persistent: true,
                headers: message.headers(),
                body: message.body(),
            })
            .await
            .map_err(|error| Error::Publish(Box::new(error)))?;

        // A disconnected receiver means confirms are off or the channel died with the publish.
        let confirmation = confirmations
            .recv_async()
            .await
            .unwrap_or(Confirmation::NotRequested);
        trace!(?confirmation, "publish settled");
        Ok(confirmation)
    }

    fn channel(&self) -> &Channel {
        self.0.session.channel()
    }

    fn guard(&self) -> Result<()> {
        if self.0.session.connection().is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if self.channel().is_closed() {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    /// Puts the current channel in confirm mode and routes its confirmations to us.
    async fn arm(&self) {
        if !self.0.options.confirm {
            self.disarm();
            return;
        }
        if let Err(error) = self.channel().confirm_select().await {
            warn!(%error, "publisher confirms not supported, publishing unconfirmed");
            self.disarm();
            return;
        }
        let (sender, receiver) = flume::unbounded();
        if let Err(error) = self.channel().notify_confirmations(sender) {
            warn!(%error, "could not track publisher confirms");
            self.disarm();
            return;
        }
        *self.0.confirmations.lock() = receiver;
        debug!("publisher confirms armed");
    }

    fn disarm(&self) {
        let (_, disarmed) = flume::unbounded();
        *self.0.confirmations.lock() = disarmed;
    }

    async fn watch(self, listener: ReconnectListener, signal: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                notified = listener.recv_async() => {
                    if notified.is_err() {
                        break;
                    }
                    trace!("channel reopened, re-arming publisher confirms");
                    self.arm().await;
                }
            }
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("session", &self.0.session)
            .field("options", &self.0.options)
            .finish()
    }
}
