use crate::{
    options::{BusProperties, PublisherOptions, SubscriberOptions},
    transport::Dialer,
    Connection, Error, LapinDialer, Lifecycle, Publisher, Result, Session, State, Subscriber,
};
use parking_lot::RwLock;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Creates publishers and subscribers and owns their shutdown.
///
/// The publish side and the subscribe side each get their own [`Connection`], dialed the
/// first time it is needed and shared by everything created on that side afterwards. A side
/// whose connection was closed for good is dialed again on its next use. Every background loop
/// spawned underneath shares the bus's [`Lifecycle`].
///
/// ```rust,no_run
/// use lapin_bus::{options::*, Bus, Message};
/// use std::time::Duration;
///
/// # async fn run() -> lapin_bus::Result<()> {
/// let bus = Bus::new(BusProperties::from_env());
/// let publisher = bus
///     .new_publisher(PublisherOptions::default().with_exchange("events"))
///     .await?;
/// let confirmation = publisher.publish(&Message::new("hello")).await?;
/// assert!(confirmation.is_ack());
///
/// let subscriber = bus
///     .new_subscriber(SubscriberOptions::default().with_queue("events"))
///     .await?;
/// let (messages, _signal) = subscriber.consume().await?;
/// if let Ok(message) = messages.recv_async().await {
///     message.ack(false).await?;
/// }
///
/// bus.shutdown(Duration::from_secs(5)).await
/// # }
/// ```
///
/// [`Connection`]: ./struct.Connection.html
/// [`Lifecycle`]: ./struct.Lifecycle.html
pub struct Bus {
    properties: BusProperties,
    dialer: Arc<dyn Dialer>,
    lifecycle: Lifecycle,
    publishing: Side,
    subscribing: Side,
}

/// One lazily dialed connection, shared by everything on one side of the bus.
struct Side {
    name: &'static str,
    dialing: tokio::sync::Mutex<()>,
    connection: RwLock<Option<Connection>>,
}

impl Bus {
    pub fn new(properties: BusProperties) -> Self {
        Self::with_dialer(properties, Arc::new(LapinDialer::default()))
    }

    pub fn with_dialer(properties: BusProperties, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            properties,
            dialer,
            lifecycle: Lifecycle::new(),
            publishing: Side::new("publish"),
            subscribing: Side::new("subscribe"),
        }
    }

    pub fn properties(&self) -> &BusProperties {
        &self.properties
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub async fn new_publisher(&self, options: PublisherOptions) -> Result<Publisher> {
        let session = self.session(&self.publishing).await?;
        Ok(Publisher::new(session, options, &self.lifecycle).await)
    }

    pub async fn new_subscriber(&self, options: SubscriberOptions) -> Result<Subscriber> {
        let session = self.session(&self.subscribing).await?;
        Ok(Subscriber::new(session, options, &self.lifecycle))
    }

    /// State of the publish-side connection, `None` until the first publisher exists.
    pub fn publisher_state(&self) -> Option<State> {
        self.publishing.state()
    }

    /// State of the subscribe-side connection, `None` until the first subscriber exists.
    pub fn subscriber_state(&self) -> Option<State> {
        self.subscribing.state()
    }

    /// Fires the shutdown signal for every loop spawned by this bus. Idempotent.
    pub fn close(&self) {
        if !self.lifecycle.is_shutdown() {
            info!("closing bus");
        }
        self.lifecycle.shutdown();
    }

    /// Resolves once every background loop has exited.
    pub async fn wait(&self) {
        self.lifecycle.wait().await;
    }

    /// Closes the bus and waits for its loops, giving up with [`Error::ShutdownTimeout`] after
    /// `deadline`. Loops still running at that point are left to finish on their own.
    ///
    /// [`Error::ShutdownTimeout`]: ./enum.Error.html#variant.ShutdownTimeout
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.close();
        let lifecycle = self.lifecycle.clone();
        let drained = tokio::spawn(async move { lifecycle.wait().await });
        match tokio::time::timeout(deadline, drained).await {
            Ok(_) => {
                debug!("bus drained");
                Ok(())
            }
            Err(_) => {
                warn!(
                    running = self.lifecycle.running(),
                    ?deadline,
                    "bus did not drain in time"
                );
                Err(Error::ShutdownTimeout)
            }
        }
    }

    async fn session(&self, side: &Side) -> Result<Session> {
        if self.lifecycle.is_shutdown() {
            return Err(Error::ConnectionClosed);
        }
        let connection = self.connection(side).await?;
        Session::open(connection, self.properties.channel, &self.lifecycle).await
    }

    async fn connection(&self, side: &Side) -> Result<Connection> {
        if let Some(connection) = side.usable() {
            return Ok(connection);
        }
        let _dialing = side.dialing.lock().await;
        // Someone else may have dialed while we waited.
        if let Some(connection) = side.usable() {
            return Ok(connection);
        }
        debug!(side = side.name, "dialing");
        let connection = Connection::open(
            &self.properties.uri,
            self.properties.connection,
            self.dialer.clone(),
            &self.lifecycle,
        )
        .await?;
        *side.connection.write() = Some(connection.clone());
        Ok(connection)
    }
}

impl Side {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            dialing: tokio::sync::Mutex::new(()),
            connection: RwLock::new(None),
        }
    }

    fn state(&self) -> Option<State> {
        self.connection.read().as_ref().map(Connection::state)
    }

    /// The cached connection, unless it was closed for good.
    fn usable(&self) -> Option<Connection> {
        self.connection
            .read()
            .as_ref()
            .filter(|connection| connection.state() != State::Terminated)
            .cloned()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("uri", &self.properties.uri)
            .field("publisher_state", &self.publisher_state())
            .field("subscriber_state", &self.subscriber_state())
            .field("running", &self.lifecycle.running())
            .finish()
    }
}
