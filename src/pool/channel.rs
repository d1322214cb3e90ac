//! [`ChannelHost`] owns a single channel multiplexed over a pooled connection.
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::warn;

use super::connection::ConnectionHost;
use super::Error;
use crate::transport::{BrokerError, Confirmation, Transport, TransportChannel, TransportConnection};

/// Identity shared by every channel that does not belong to the pool's cache.
pub const TRANSIENT_CHANNEL_ID: u64 = u64::MAX;

const ERROR_BUFFER: usize = 10;
const CONFIRMATION_BUFFER: usize = 100;

/// The channel type opened by the connections of a [`Transport`].
pub type ChannelOf<T> = <<T as Transport>::Connection as TransportConnection>::Channel;

/// A channel, the connection it was opened on and the notifications it received.
pub struct ChannelHost<T: Transport> {
    id: u64,
    connection_id: u64,
    ackable: bool,
    channel: ChannelOf<T>,
    close_events: Mutex<mpsc::Receiver<BrokerError>>,
    error_messages: Buffered<ErrorMessage>,
    confirmations: Option<Buffered<Confirmation>>,
    pub(crate) generation: u64,
}

/// A channel close event, enriched with the identities involved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    pub channel_id: u64,
    pub connection_id: u64,
    pub code: u16,
    pub reason: String,
    pub server: bool,
    pub recover: bool,
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "channel {} on connection {} closed: ({}) {}",
            self.channel_id, self.connection_id, self.code, self.reason
        )
    }
}

impl<T: Transport> ChannelHost<T> {
    /// Open a channel on the connection held by `connection_host`.
    ///
    /// If `ackable` is set the channel is put in publisher confirmation mode, and the whole
    /// construction fails if the broker refuses it.
    #[tracing::instrument(
        name = "channel_host_open",
        skip(connection_host),
        fields(connection_id = connection_host.connection_id())
    )]
    pub async fn new(
        connection_host: &ConnectionHost<T>,
        id: u64,
        ackable: bool,
    ) -> Result<Self, Error> {
        let connection = connection_host
            .connection()
            .filter(|connection| !connection.is_closed())
            .ok_or(Error::ConnectionClosed)?;

        let channel = connection.open_channel().await.map_err(Error::Channel)?;
        let (close_sender, close_events) = mpsc::channel(1);
        channel.notify_close(close_sender);

        if ackable {
            if let Err(e) = channel.confirm_select().await {
                let _ = channel.close().await;
                return Err(Error::Channel(e));
            }
        }

        Ok(Self {
            id,
            connection_id: connection_host.connection_id(),
            ackable,
            channel,
            close_events: Mutex::new(close_events),
            error_messages: Buffered::new(ERROR_BUFFER),
            confirmations: ackable.then(|| Buffered::new(CONFIRMATION_BUFFER)),
            generation: connection_host.generation,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity of the connection the channel was opened on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// `true` if publisher confirmations are enabled on this channel.
    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    /// `true` if the channel's identity is reserved for a cache of `cache_capacity` channels.
    pub fn is_managed(&self, cache_capacity: usize) -> bool {
        self.id < cache_capacity as u64
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Access the underlying channel.
    pub fn channel(&self) -> &ChannelOf<T> {
        &self.channel
    }

    /// The next error reported on this channel, if any.
    ///
    /// Pending close events are only translated into [`ErrorMessage`]s when this is called.
    pub fn try_next_error(&self) -> Option<ErrorMessage> {
        let event = lock(&self.close_events).try_recv();
        if let Ok(event) = event {
            self.error_messages.push(ErrorMessage {
                channel_id: self.id,
                connection_id: self.connection_id,
                code: event.code,
                reason: event.reason,
                server: event.server,
                recover: event.recover,
            });
        }
        self.error_messages.try_next()
    }

    /// Every error reported on this channel since the last check, oldest first.
    pub fn errors(&self) -> Vec<ErrorMessage> {
        std::iter::from_fn(|| self.try_next_error()).collect()
    }

    /// Publish `payload`.
    ///
    /// On an ackable channel the broker confirmation is buffered, see
    /// [`ChannelHost::try_next_confirmation`].
    #[tracing::instrument(level = "debug", skip(self, payload), fields(channel_id = self.id))]
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), Error> {
        let confirmation = self
            .channel
            .publish(exchange, routing_key, payload)
            .await
            .map_err(Error::Publish)?;
        if let Some(confirmations) = &self.confirmations {
            confirmations.push(confirmation);
        }
        Ok(())
    }

    /// The oldest unread publisher confirmation. Always `None` for channels that are not ackable.
    pub fn try_next_confirmation(&self) -> Option<Confirmation> {
        self.confirmations.as_ref()?.try_next()
    }

    /// Close the channel. Failures are logged and otherwise ignored.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close().await {
            warn!(
                channel_id = self.id,
                connection_id = self.connection_id,
                error = ?e,
                "Failed to close RabbitMQ channel"
            );
        }
    }
}

/// A bounded buffer that drops new items when full.
struct Buffered<M> {
    sender: mpsc::Sender<M>,
    receiver: Mutex<mpsc::Receiver<M>>,
}

impl<M> Buffered<M> {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    fn push(&self, item: M) {
        if self.sender.try_send(item).is_err() {
            warn!("Channel notification buffer is full, dropping notification");
        }
    }

    fn try_next(&self) -> Option<M> {
        lock(&self.receiver).try_recv().ok()
    }
}

fn lock<M>(receiver: &Mutex<mpsc::Receiver<M>>) -> MutexGuard<'_, mpsc::Receiver<M>> {
    receiver.lock().unwrap_or_else(PoisonError::into_inner)
}
