use std::sync::Arc;

use fake::{Fake, Faker};
use warren::pool::{ChannelHost, ConnectionHost, Error, ErrorMessage};
use warren::transport::{Confirmation, TransportChannel};

use crate::helpers::{FakeBroker, NACKED_ROUTING_KEY};

async fn connected_host(broker: &FakeBroker) -> ConnectionHost<FakeBroker> {
    ConnectionHost::new(Arc::new(broker.clone()), "payments-3".into(), 3)
        .await
        .unwrap()
}

#[tokio::test]
async fn ackable_channels_buffer_broker_confirmations() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    let channel = ChannelHost::new(&host, 7, true).await.unwrap();
    let payload: String = Faker.fake();

    // Act
    channel.publish("", "payments", payload.as_bytes()).await.unwrap();
    channel
        .publish("", NACKED_ROUTING_KEY, payload.as_bytes())
        .await
        .unwrap();

    // Assert
    assert!(channel.channel().is_confirming());
    assert_eq!(channel.try_next_confirmation(), Some(Confirmation::Ack));
    assert_eq!(channel.try_next_confirmation(), Some(Confirmation::Nack));
    assert_eq!(channel.try_next_confirmation(), None);
}

#[tokio::test]
async fn non_ackable_channels_do_not_track_confirmations() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    let channel = ChannelHost::new(&host, 7, false).await.unwrap();

    // Act
    channel.publish("", "payments", b"{}").await.unwrap();

    // Assert
    assert!(!channel.is_ackable());
    assert!(!channel.channel().is_confirming());
    assert_eq!(channel.channel().published(), 1);
    assert_eq!(channel.try_next_confirmation(), None);
}

#[tokio::test]
async fn channels_remember_their_connection() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;

    // Act
    let channel = ChannelHost::new(&host, 7, true).await.unwrap();

    // Assert
    assert_eq!(channel.id(), 7);
    assert_eq!(channel.connection_id(), 3);
    assert!(channel.is_managed(8));
    assert!(!channel.is_managed(7));
}

#[tokio::test]
async fn a_channel_cannot_be_opened_on_a_closed_connection() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    broker.connection("payments-3").drop_out_of_band();

    // Act
    let outcome = ChannelHost::new(&host, 7, false).await;

    // Assert
    assert!(matches!(outcome, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn a_channel_refusing_confirmations_is_closed() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    broker.refuse_confirms(true);

    // Act
    let outcome = ChannelHost::new(&host, 7, true).await;

    // Assert
    assert!(matches!(outcome, Err(Error::Channel(_))));
    let channels = broker.connection("payments-3").channels();
    assert_eq!(channels.len(), 1);
    assert!(channels[0].is_closed());
}

#[tokio::test]
async fn close_events_are_reported_with_their_identities() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    let channel = ChannelHost::new(&host, 7, true).await.unwrap();
    assert_eq!(channel.try_next_error(), None);

    // Act
    channel
        .channel()
        .close_by_broker(404, "NOT_FOUND - no exchange 'payments'");

    // Assert
    let error = channel.try_next_error().expect("No error was reported");
    assert_eq!(
        error,
        ErrorMessage {
            channel_id: 7,
            connection_id: 3,
            code: 404,
            reason: "NOT_FOUND - no exchange 'payments'".into(),
            server: true,
            recover: true,
        }
    );
    assert_eq!(channel.try_next_error(), None);
    assert!(channel.is_closed());
}

#[tokio::test]
async fn publishing_on_a_closed_channel_fails() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    let channel = ChannelHost::new(&host, 7, true).await.unwrap();
    channel.close().await;

    // Act
    let outcome = channel.publish("", "payments", b"{}").await;

    // Assert
    assert!(matches!(outcome, Err(Error::Publish(_))));
    assert_eq!(channel.try_next_confirmation(), None);
}

#[tokio::test]
async fn errors_drains_every_pending_error() {
    // Arrange
    let broker = FakeBroker::default();
    let host = connected_host(&broker).await;
    let channel = ChannelHost::new(&host, 7, false).await.unwrap();
    channel
        .channel()
        .close_by_broker(406, "PRECONDITION_FAILED - unknown delivery tag");

    // Act
    let errors = channel.errors();

    // Assert
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, 406);
    assert!(errors[0].recover);
    assert!(channel.errors().is_empty());
}
