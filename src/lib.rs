//! `warren` keeps a fixed set of RabbitMq connections, and a cache of channels on top of them,
//! healthy for as long as your application runs. It is built on top of [`lapin`].
//!
//! [`ConnectionPool`](crate::pool::ConnectionPool) is the best starting point to learn more about
//! what `warren` provides and how to leverage it.
//!
//! The pool talks to the broker through the traits in [`transport`]: they are implemented for
//! [`lapin`] out of the box, and can be implemented for any other client.

pub mod amqp;
pub mod pool;
pub mod transport;
