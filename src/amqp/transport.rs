//! Implements the [`transport`](crate::transport) traits for [`lapin`]'s connections and channels.
use std::time::Duration;

use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation as LapinConfirmation,
    BasicProperties,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::transport::{
    Blocking, BrokerError, Confirmation, TransportChannel, TransportConnection,
};

/// How often the connection status is sampled for flow-control transitions.
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// AMQP `reply-success`.
const REPLY_SUCCESS: u16 = 200;

impl From<&lapin::Error> for BrokerError {
    fn from(err: &lapin::Error) -> Self {
        match err {
            lapin::Error::ProtocolError(amqp_error) => BrokerError::from_reply_code(
                amqp_error.get_id(),
                amqp_error.get_message().as_str(),
                true,
            ),
            other => BrokerError {
                code: 0,
                reason: other.to_string(),
                server: false,
                recover: false,
            },
        }
    }
}

#[async_trait::async_trait]
impl TransportConnection for lapin::Connection {
    type Channel = lapin::Channel;

    fn is_closed(&self) -> bool {
        !self.status().connected()
    }

    fn notify_error(&self, sender: mpsc::Sender<BrokerError>) {
        self.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            // A full buffer already tells the pool the connection is unhealthy.
            let _ = sender.try_send(BrokerError::from(&e));
        });
    }

    fn notify_blocked(&self, sender: mpsc::Sender<Blocking>) {
        // lapin tracks `connection.blocked` as a status flag rather than an event stream:
        // turn its transitions into events until the connection or the subscriber goes away.
        let status = self.status().clone();
        tokio::spawn(async move {
            let mut blocked = false;
            let mut interval = tokio::time::interval(BLOCKED_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if sender.is_closed() || !status.connected() {
                    break;
                }
                if status.blocked() != blocked {
                    blocked = !blocked;
                    let _ = sender.try_send(Blocking { active: blocked });
                }
            }
        });
    }

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(self.create_channel().await?)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Connection::close(self, REPLY_SUCCESS, "closed by the pool").await?)
    }
}

#[async_trait::async_trait]
impl TransportChannel for lapin::Channel {
    fn is_closed(&self) -> bool {
        !self.status().connected()
    }

    fn notify_close(&self, sender: mpsc::Sender<BrokerError>) {
        self.on_error(move |e| {
            let _ = sender.try_send(BrokerError::from(&e));
        });
    }

    async fn confirm_select(&self) -> Result<(), anyhow::Error> {
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
        lapin::Channel::confirm_select(self, ConfirmSelectOptions { nowait: false }).await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<Confirmation, anyhow::Error> {
        let confirmation = self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(match confirmation {
            LapinConfirmation::Ack(_) => Confirmation::Ack,
            LapinConfirmation::Nack(_) => Confirmation::Nack,
            LapinConfirmation::NotRequested => Confirmation::NotRequested,
        })
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        Ok(lapin::Channel::close(self, REPLY_SUCCESS, "closed by the pool").await?)
    }
}
