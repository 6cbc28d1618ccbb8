use crate::{options::ChannelOptions, Channel, Connection, Error, Lifecycle, Result};
use tracing::debug;

/// A [`Connection`] paired with one [`Channel`] opened on it.
///
/// [`Connection`]: ./struct.Connection.html
/// [`Channel`]: ./struct.Channel.html
#[derive(Clone, Debug)]
pub struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    pub async fn open(
        connection: Connection,
        options: ChannelOptions,
        lifecycle: &Lifecycle,
    ) -> Result<Self> {
        let channel = Channel::open(&connection, options, lifecycle).await?;
        Ok(Self {
            connection,
            channel,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// True only when both the connection and the channel are down.
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed() && self.channel.is_closed()
    }

    /// Closes the channel, then the connection, reporting both outcomes together.
    pub async fn close(&self) -> Result<()> {
        let channel = self.channel.close().await.err();
        let connection = self.connection.close().await.err();
        if channel.is_none() && connection.is_none() {
            debug!("session closed");
            return Ok(());
        }
        Err(Error::Close {
            connection: connection.map(Box::new),
            channel: channel.map(Box::new),
        })
    }
}
