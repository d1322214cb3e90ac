/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid connection pool configuration: {0}")]
    Configuration(String),
    #[error("The connection pool could not reach its target capacity")]
    Initialization(#[source] anyhow::Error),
    #[error("Failed to connect to the RabbitMq broker")]
    Dial(#[source] anyhow::Error),
    #[error("Can't open a channel - the connection is already closed")]
    ConnectionClosed,
    #[error("Failed to open a channel on the RabbitMq broker")]
    Channel(#[source] anyhow::Error),
    #[error("Failed to publish a message on the RabbitMq broker")]
    Publish(#[source] anyhow::Error),
    #[error("The connection pool is shutting down")]
    ShuttingDown,
    #[error("Gave up waiting for a pooled resource")]
    Cancelled,
}
