use crate::{
    message::Delivery, options::SubscriberOptions, Channel, Error, Lifecycle, Message, Result,
    Session,
};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receives messages from a queue through a [`Session`].
///
/// Deliveries are relayed as [`Message`]s into a buffered output channel that survives
/// reconnections: the session's channel resubscribes on its own and the relay keeps going
/// until the shared shutdown signal fires or the subscriber is closed.
///
/// [`Session`]: ./struct.Session.html
/// [`Message`]: ./struct.Message.html
#[derive(Clone)]
pub struct Subscriber(Arc<Inner>);

struct Inner {
    session: Session,
    options: SubscriberOptions,
    lifecycle: Lifecycle,
    output: Mutex<Option<flume::Sender<Message>>>,
    messages: flume::Receiver<Message>,
}

impl Subscriber {
    pub fn new(session: Session, options: SubscriberOptions, lifecycle: &Lifecycle) -> Self {
        let (output, messages) = flume::bounded(options.buffer);
        Self(Arc::new(Inner {
            session,
            options,
            lifecycle: lifecycle.clone(),
            output: Mutex::new(Some(output)),
            messages,
        }))
    }

    pub fn session(&self) -> &Session {
        &self.0.session
    }

    /// The channel deliveries currently come from, to settle a message by its tag once its
    /// own acker went stale.
    pub fn channel(&self) -> &Channel {
        self.0.session.channel()
    }

    pub fn options(&self) -> &SubscriberOptions {
        &self.0.options
    }

    /// Starts consuming and returns the message stream along with the shutdown signal that
    /// ends it.
    pub async fn consume(&self) -> Result<(flume::Receiver<Message>, CancellationToken)> {
        let output = match self.0.output.lock().as_ref() {
            Some(output) => output.downgrade(),
            None => return Err(Error::SubscriberClosed),
        };
        let options = &self.0.options;
        let deliveries = self
            .channel()
            .consume(
                &options.queue,
                &options.consumer_tag,
                options.basic_consume_options(),
                options.arguments.clone(),
            )
            .await?;
        let signal = self.0.lifecycle.signal();
        self.0.lifecycle.spawn(
            "subscriber",
            Self::forward(deliveries, output, signal.clone()),
        );
        Ok((self.0.messages.clone(), signal))
    }

    /// Closes the output channel. Messages already buffered can still be received.
    pub fn close(&self) {
        if self.0.output.lock().take().is_some() {
            debug!(queue = %self.0.options.queue, "subscriber closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.output.lock().is_none()
    }

    async fn forward(
        deliveries: flume::Receiver<Delivery>,
        output: flume::WeakSender<Message>,
        signal: CancellationToken,
    ) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                delivery = deliveries.recv_async() => match delivery {
                    Ok(delivery) => delivery,
                    Err(_) => break,
                },
            };
            let output = match output.upgrade() {
                Some(output) => output,
                None => break,
            };
            trace!(delivery_tag = delivery.delivery_tag, "relaying message");
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                sent = output.send_async(Message::from(delivery)) => if sent.is_err() {
                    break;
                },
            }
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("session", &self.0.session)
            .field("options", &self.0.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}
