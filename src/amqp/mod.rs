//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
mod factory;
mod tls;
mod transport;

pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};
