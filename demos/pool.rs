use std::time::Duration;

use warren::amqp::configuration::PoolSettings;
use warren::pool::ConnectionPool;
use warren::transport::Confirmation;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image,
    // with a smaller pool than the defaults.
    let settings = PoolSettings {
        connection_name: "warren-demo".into(),
        max_connection_count: 2,
        max_cache_channel_count: 4,
        ..PoolSettings::default()
    };

    // A connection maps to an open TCP socket, while channels are "logical" connections sharing
    // it. Channels are cheaper than connections, therefore we keep more of those around.
    //
    // Building the pool opens every connection and every cached channel upfront: it fails if
    // the broker cannot be reached.
    let pool = ConnectionPool::from_config(&settings).await?;

    // Cached channels have publisher confirms enabled. Publishing to the default exchange
    // always succeeds, even if nobody is listening on the routing key.
    let channel = pool.get_channel(true).await?;
    channel.publish("", "hello", b"Hello world!").await?;
    assert_eq!(channel.try_next_confirmation(), Some(Confirmation::Ack));

    // Publishing to an exchange that does not exist makes the broker close the channel.
    if let Err(e) = channel.publish("missing-exchange", "hello", b"Hello?").await {
        println!("Publishing failed: {e}");
    }
    if let Some(error) = channel.try_next_error() {
        println!("{error}");
    }

    // Flag it as erred: the pool closes it and caches a fresh channel with the same identity.
    pool.return_channel(channel, true).await;

    // Waiting for a resource can be bounded by any future.
    let connection = pool
        .get_connection_until(tokio::time::sleep(Duration::from_secs(1)))
        .await?;
    println!("Leased {}", connection.connection_name());
    pool.return_connection(connection, false).await;

    pool.shutdown().await;
    Ok(())
}
