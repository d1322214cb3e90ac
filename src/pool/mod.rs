//! Pools RabbitMq connections and channels.
//!
//! This module provides three key guarantees:
//! - A fixed number of connections is kept open: broken ones are replaced, under the same
//!   identity, before anybody can lease them.
//! - Ackable channels are opened upfront and cached, so publishers waiting for confirmations do
//!   not pay for a channel setup on every message.
//! - Leasing never fails because of the network: it waits (and retries) until the broker is
//!   back, unless you ask it to give up.
//!
//! ```rust,no_run
//! use warren::amqp::configuration::PoolSettings;
//! use warren::pool::ConnectionPool;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and pool sizing.
//!     let settings = PoolSettings::default();
//!     let pool = ConnectionPool::from_config(&settings).await?;
//!
//!     // get a cached channel with publisher confirms enabled.
//!     let channel = pool.get_channel(true).await?;
//!     channel.publish("", "hello", b"Hello world!").await?;
//!     pool.return_channel(channel, false).await;
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
mod flags;
#[allow(clippy::module_inception)]
mod pool;
mod queue;

pub use channel::{ChannelHost, ChannelOf, ErrorMessage, TRANSIENT_CHANNEL_ID};
pub use connection::ConnectionHost;
pub use error::Error;
pub use pool::{ConnectionPool, ConnectionPoolBuilder, PoolOptions};
