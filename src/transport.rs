//! The interface between the pool and the AMQP client that actually speaks to the broker.
//!
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory) implements [`Transport`] on top of
//! [`lapin`], but the pool itself only relies on these traits: anything able to dial a
//! connection, open channels on it and report broker-pushed notifications can be pooled.
//!
//! Notifications are push-style: the pool hands a bounded [`mpsc::Sender`] to the connection
//! (or channel) and samples the matching receiver without blocking.
//! Implementations must never block on a full sender - drop the event instead.
use tokio::sync::mpsc;

/// Opens connections to a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by [`Transport::dial`].
    type Connection: TransportConnection;

    /// Establish a new connection, advertising `connection_name` to the broker.
    ///
    /// Implementations are expected to honour their own dial timeout.
    async fn dial(&self, connection_name: &str) -> Result<Self::Connection, anyhow::Error>;
}

/// A single connection to the broker, able to multiplex channels.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    /// The channel type opened on this connection.
    type Channel: TransportChannel;

    /// `true` once the connection can no longer be used.
    fn is_closed(&self) -> bool;

    /// Route connection-level errors into `sender`.
    fn notify_error(&self, sender: mpsc::Sender<BrokerError>);

    /// Route flow-control (`connection.blocked`/`connection.unblocked`) events into `sender`.
    fn notify_blocked(&self, sender: mpsc::Sender<Blocking>);

    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// Close the connection.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A channel multiplexed over a [`TransportConnection`].
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// `true` once the channel can no longer be used.
    fn is_closed(&self) -> bool;

    /// Route channel close events into `sender`.
    fn notify_close(&self, sender: mpsc::Sender<BrokerError>);

    /// Put the channel in publisher confirmation mode.
    async fn confirm_select(&self) -> Result<(), anyhow::Error>;

    /// Publish `payload` and wait for the broker outcome.
    ///
    /// Channels without confirmation mode resolve to [`Confirmation::NotRequested`].
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<Confirmation, anyhow::Error>;

    /// Close the channel.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// An error pushed by the broker (or detected by the client) on a connection or a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerError {
    /// AMQP reply code, `0` if the error did not originate from the protocol.
    pub code: u16,
    pub reason: String,
    /// `true` if the broker initiated the close.
    pub server: bool,
    /// `true` for soft errors: retrying later, or with different parameters, may succeed.
    pub recover: bool,
}

impl BrokerError {
    /// Build an error from an AMQP reply code, deriving `recover` from the code class.
    pub fn from_reply_code(code: u16, reason: impl Into<String>, server: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            server,
            // Soft errors only close the channel, everything else takes the connection down.
            recover: matches!(code, 311 | 312 | 313 | 403 | 404 | 405 | 406),
        }
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) {}", self.code, self.reason)
    }
}

/// A flow-control notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Blocking {
    /// `true` while the broker is blocking publishers, `false` once it lifts the block.
    pub active: bool,
}

/// The broker outcome for a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// The channel is not in confirmation mode.
    NotRequested,
}
