use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Receiving end of a reconnection (or connection loss) notification.
///
/// Notifications coalesce: a listener that has not caught up with the previous recovery
/// only sees one pending notification.
pub type ReconnectListener = flume::Receiver<()>;

/// Fan-out registry from a [`Channel`] to whoever needs to know it was reopened, and from a
/// [`Connection`] to the channels that must learn it was lost.
///
/// Registration is guarded, so listeners may be added while the reconnection loop runs.
///
/// [`Channel`]: ./struct.Channel.html
/// [`Connection`]: ./struct.Connection.html
#[derive(Clone, Default)]
pub(crate) struct Listeners(Arc<Mutex<Vec<flume::Sender<()>>>>);

impl Listeners {
    pub(crate) fn register(&self) -> ReconnectListener {
        let (sender, receiver) = flume::bounded(1);
        self.0.lock().push(sender);
        receiver
    }

    /// Notifies every live listener and forgets the ones that went away.
    pub(crate) fn notify_all(&self) -> usize {
        let mut inner = self.0.lock();
        inner.retain(|sender| {
            // Full means a notification is already pending, which is as good as a new one.
            !matches!(sender.try_send(()), Err(flume::TrySendError::Disconnected(())))
        });
        inner.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Listeners");
        if let Some(inner) = self.0.try_lock() {
            debug.field("count", &inner.len());
        }
        debug.finish()
    }
}
