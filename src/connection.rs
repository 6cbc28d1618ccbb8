use crate::{
    listeners::{Listeners, ReconnectListener},
    options::ConnectionOptions,
    status::{State, Status},
    transport::{Dialer, RawChannel, RawConnection},
    Error, Lifecycle, Result,
};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A connection to the broker that keeps itself alive.
///
/// Opening dials once and fails hard if that first dial fails. Afterwards a background loop
/// watches the transport: when it dies unexpectedly the connection is marked closed and the
/// broker is re-dialed every [`ConnectionOptions::reconnect_delay`] until it answers again.
/// Intermediate dial failures are only logged.
///
/// Closing the connection, or firing the shutdown signal of its [`Lifecycle`], is terminal.
///
/// [`ConnectionOptions::reconnect_delay`]: ./options/struct.ConnectionOptions.html#structfield.reconnect_delay
/// [`Lifecycle`]: ./struct.Lifecycle.html
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

struct Inner {
    uri: String,
    options: ConnectionOptions,
    dialer: Arc<dyn Dialer>,
    raw: RwLock<Arc<dyn RawConnection>>,
    status: Status,
    losses: Listeners,
    closer: CancellationToken,
}

impl Connection {
    pub async fn open(
        uri: &str,
        options: ConnectionOptions,
        dialer: Arc<dyn Dialer>,
        lifecycle: &Lifecycle,
    ) -> Result<Self> {
        let raw = dialer
            .dial(uri)
            .await
            .map_err(|error| Error::Dial(Box::new(error)))?;
        let status = Status::default();
        status.set_state(State::Open);
        let connection = Self(Arc::new(Inner {
            uri: uri.to_owned(),
            options,
            dialer,
            raw: RwLock::new(raw),
            status,
            losses: Listeners::default(),
            closer: lifecycle.child_signal(),
        }));
        info!("connection established");
        lifecycle.spawn("connection", connection.clone().run());
        Ok(connection)
    }

    /// Whether the connection is currently unusable. Never blocks.
    pub fn is_closed(&self) -> bool {
        !self.0.status.open()
    }

    pub fn state(&self) -> State {
        self.0.status.state()
    }

    /// Closes the transport and stops the reconnection loop for good.
    ///
    /// Only the first call does anything and reports the transport's close error.
    pub async fn close(&self) -> Result<()> {
        self.terminate().await
    }

    pub(crate) async fn open_channel(&self) -> Result<Arc<dyn RawChannel>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let raw = self.raw();
        raw.open_channel().await
    }

    /// Gets notified each time the transport is lost unexpectedly.
    ///
    /// Channels opened on a dead transport are not always told about it by the client, so
    /// they watch this as well.
    pub(crate) fn register_loss_listener(&self) -> ReconnectListener {
        self.0.losses.register()
    }

    /// Fires when this connection is closed for good, children of it follow.
    pub(crate) fn closer(&self) -> &CancellationToken {
        &self.0.closer
    }

    fn raw(&self) -> Arc<dyn RawConnection> {
        self.0.raw.read().clone()
    }

    async fn terminate(&self) -> Result<()> {
        if !self.0.status.terminate() {
            return Ok(());
        }
        self.0.closer.cancel();
        info!("connection closed");
        self.raw().close().await
    }

    async fn run(self) {
        loop {
            let notice = self.raw().close_notice();
            tokio::select! {
                biased;
                _ = self.0.closer.cancelled() => break,
                reason = notice.recv_async() => match reason {
                    Ok(error) => {
                        if !self.0.status.set_state(State::Closed) {
                            break;
                        }
                        let listeners = self.0.losses.notify_all();
                        warn!(%error, listeners, "connection lost, reconnecting");
                        if !self.redial().await {
                            break;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        if let Err(error) = self.terminate().await {
            debug!(%error, "error while closing connection");
        }
    }

    /// Dials until it works. Returns false when told to stop first.
    async fn redial(&self) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.0.closer.cancelled() => return false,
                _ = tokio::time::sleep(self.0.options.reconnect_delay) => {}
            }
            self.0.status.set_state(State::Connecting);
            let dialed = tokio::select! {
                biased;
                _ = self.0.closer.cancelled() => return false,
                dialed = self.0.dialer.dial(&self.0.uri) => dialed,
            };
            match dialed {
                Ok(raw) => {
                    *self.0.raw.write() = raw.clone();
                    if !self.0.status.set_state(State::Open) {
                        // Closed while dialing, the fresh transport is ours to close.
                        let _ = raw.close().await;
                        return false;
                    }
                    info!("connection re-established");
                    return true;
                }
                Err(error) => {
                    self.0.status.set_state(State::Closed);
                    debug!(%error, "reconnection attempt failed");
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("options", &self.0.options)
            .finish()
    }
}
