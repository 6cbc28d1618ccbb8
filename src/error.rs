use crate::types::DeliveryTag;
use std::{error, fmt, io, sync::Arc};

/// A std Result with a lapin_bus::Error error type
pub type Result<T> = std::result::Result<T, Error>;

/// The type of error that can be returned in this crate.
///
/// Construction-time failures (the first dial, the first channel open, the first consume)
/// are returned to the caller. Once running, recovery failures are logged and retried
/// internally and never show up here.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An operation was attempted while the connection is not open.
    ConnectionClosed,
    /// An operation was attempted while the channel is not open.
    ChannelClosed,
    /// The message was not received from the broker, there is nothing to acknowledge.
    NoDelivery,
    /// The channel that delivered this message has since been replaced by a reconnection.
    /// Use the current channel and the delivery tag instead.
    StaleDelivery(DeliveryTag),
    /// The subscriber was closed, it won't hand out messages anymore.
    SubscriberClosed,
    /// `Bus::shutdown` gave up waiting for the background loops.
    ShutdownTimeout,

    Dial(Box<Error>),
    OpenChannel(Box<Error>),
    Consume(Box<Error>),
    Publish(Box<Error>),
    Close {
        connection: Option<Box<Error>>,
        channel: Option<Box<Error>>,
    },

    IOError(Arc<io::Error>),
    ProtocolError(lapin::Error),
}

impl Error {
    pub fn is_io_error(&self) -> bool {
        match self {
            Error::IOError(_) | Error::ProtocolError(lapin::Error::IOError(_)) => true,
            Error::Dial(e) | Error::OpenChannel(e) | Error::Consume(e) | Error::Publish(e) => {
                e.is_io_error()
            }
            _ => false,
        }
    }

    /// Whether this error comes from the guard rejecting work on a closed resource.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::ChannelClosed | Error::SubscriberClosed => true,
            Error::Dial(e) | Error::OpenChannel(e) | Error::Consume(e) | Error::Publish(e) => {
                e.is_closed()
            }
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ShutdownTimeout)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectionClosed => write!(f, "connection is closed"),
            Error::ChannelClosed => write!(f, "channel is closed"),
            Error::NoDelivery => write!(f, "message has no delivery to acknowledge"),
            Error::StaleDelivery(tag) => write!(
                f,
                "delivery {} belongs to a channel that no longer exists",
                tag
            ),
            Error::SubscriberClosed => write!(f, "subscriber is closed"),
            Error::ShutdownTimeout => write!(f, "closed by timeout"),

            Error::Dial(e) => write!(f, "could not dial the broker: {}", e),
            Error::OpenChannel(e) => write!(f, "could not open channel: {}", e),
            Error::Consume(e) => write!(f, "could not consume: {}", e),
            Error::Publish(e) => write!(f, "could not publish: {}", e),
            Error::Close {
                connection,
                channel,
            } => {
                let describe = |e: &Option<Box<Error>>| match e {
                    Some(e) => e.to_string(),
                    None => "ok".to_string(),
                };
                write!(f, "({}|{})", describe(connection), describe(channel))
            }

            Error::IOError(e) => write!(f, "IO error: {}", e),
            Error::ProtocolError(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Dial(e) | Error::OpenChannel(e) | Error::Consume(e) | Error::Publish(e) => {
                Some(&**e)
            }
            Error::Close {
                connection: Some(e),
                ..
            } => Some(&**e),
            Error::Close {
                channel: Some(e), ..
            } => Some(&**e),
            Error::IOError(e) => Some(&**e),
            Error::ProtocolError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        Error::IOError(Arc::new(other))
    }
}

impl From<lapin::Error> for Error {
    fn from(other: lapin::Error) -> Self {
        Error::ProtocolError(other)
    }
}
