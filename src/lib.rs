#![warn(rust_2018_idioms)]

//! lapin-bus
//!
//! A self-healing publish/subscribe layer on top of [lapin], targeting especially RabbitMQ.
//!
//! The main access point is the [`Bus`]. It lazily dials one [`Connection`] for publishing and
//! one for subscribing, and every [`Publisher`] or [`Subscriber`] it creates gets its own
//! [`Session`], a connection paired with a [`Channel`]. Connections and channels reopen
//! themselves at a fixed interval when the network or the broker drops them, publishers
//! re-enable confirm mode afterwards and subscribers resume consuming. Everything stops when
//! the bus is closed.
//!
//! ## Feature switches
//!
//! * `native-tls`: enable amqps support through native-tls (preferred over rustls when set)
//! * `openssl`: enable amqps support through openssl (preferred over rustls when set)
//! * `rustls` (*default*): enable amqps support through rustls (uses rustls-native-certs by default)
//! * `rustls-native-certs`: same as rustls, be ensure we'll still use rustls-native-certs even if the default for rustls changes
//! * `rustls-webpki-roots-certs`: same as rustls but using webkit-roots instead of rustls-native-certs
//!
//! ## Example
//!
//! ```rust,no_run
//! use lapin_bus::{options::*, Bus, Message, Result};
//! use std::time::Duration;
//! use tracing::info;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     if std::env::var("RUST_LOG").is_err() {
//!         std::env::set_var("RUST_LOG", "info");
//!     }
//!
//!     tracing_subscriber::fmt::init();
//!
//!     let bus = Bus::new(BusProperties::from_env());
//!     let subscriber = bus
//!         .new_subscriber(SubscriberOptions::default().with_queue("hello"))
//!         .await?;
//!     let (messages, signal) = subscriber.consume().await?;
//!     tokio::spawn(async move {
//!         info!("will consume");
//!         while let Ok(message) = messages.recv_async().await {
//!             message.ack(false).await.expect("ack");
//!         }
//!         info!(shutdown = signal.is_cancelled(), "done consuming");
//!     });
//!
//!     let publisher = bus
//!         .new_publisher(PublisherOptions::default().with_routing_key("hello"))
//!         .await?;
//!     for _ in 0..10 {
//!         let confirmation = publisher.publish(&Message::new("Hello world!")).await?;
//!         info!(?confirmation, "published");
//!     }
//!
//!     bus.shutdown(Duration::from_secs(5)).await
//! }
//! ```
//!
//! [lapin]: https://docs.rs/lapin
//! [`Bus`]: ./struct.Bus.html
//! [`Connection`]: ./struct.Connection.html
//! [`Publisher`]: ./struct.Publisher.html
//! [`Subscriber`]: ./struct.Subscriber.html
//! [`Session`]: ./struct.Session.html
//! [`Channel`]: ./struct.Channel.html

pub use lapin::types;

pub use acker::Acker;
pub use bus::Bus;
pub use channel::Channel;
pub use confirmation::Confirmation;
pub use connection::Connection;
pub use error::{Error, Result};
pub use lapin_transport::LapinDialer;
pub use lifecycle::Lifecycle;
pub use listeners::ReconnectListener;
pub use message::{Delivery, Message};
pub use publisher::Publisher;
pub use session::Session;
pub use status::State;
pub use subscriber::Subscriber;

pub mod options;
pub mod transport;

mod acker;
mod bus;
mod channel;
mod confirmation;
mod connection;
mod error;
mod lapin_transport;
mod lifecycle;
mod listeners;
mod message;
mod publisher;
mod session;
mod status;
mod subscriber;

#[cfg(test)]
mod memory;
