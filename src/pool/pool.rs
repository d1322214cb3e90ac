//! [`ConnectionPool`] leases connections and channels, and replaces the broken ones.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::channel::{ChannelHost, TRANSIENT_CHANNEL_ID};
use super::connection::ConnectionHost;
use super::flags::ConnectionFlags;
use super::queue::LeaseQueue;
use super::Error;
use crate::amqp::configuration::PoolSettings;
use crate::amqp::ConnectionFactory;
use crate::transport::Transport;

/// Sizing and retry behaviour of a [`ConnectionPool`].
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Prefix of the name advertised by each connection, suffixed with the connection identity.
    pub connection_name: String,
    /// Number of connections kept by the pool.
    pub max_connection_count: usize,
    /// Number of ackable channels kept in the cache. `0` disables caching.
    pub max_cache_channel_count: usize,
    /// Back-off between attempts when the broker is misbehaving.
    pub sleep_on_error_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connection_name: "warren".into(),
            max_connection_count: 5,
            max_cache_channel_count: 25,
            sleep_on_error_interval: Duration::from_millis(250),
        }
    }
}

impl From<&PoolSettings> for PoolOptions {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            connection_name: settings.connection_name.clone(),
            max_connection_count: settings.max_connection_count,
            max_cache_channel_count: settings.max_cache_channel_count,
            sleep_on_error_interval: settings.sleep_on_error_interval(),
        }
    }
}

/// A fixed-size pool of broker connections, plus a cache of ready-to-use ackable channels.
///
/// # Leasing
///
/// [`ConnectionPool::get_connection`] and [`ConnectionPool::get_channel`] hand out exclusive
/// ownership of a pooled resource: give it back with [`ConnectionPool::return_connection`]
/// and [`ConnectionPool::return_channel`], in any order and from any task.
/// Both wait while every resource is leased.
///
/// # Fault tolerance
///
/// A connection that reported an error, got closed or was flagged is never handed out: it is
/// replaced with a new connection carrying the same identity first.
/// Replacements and channel creations retry forever, pausing
/// [`PoolOptions::sleep_on_error_interval`] between attempts. Use the `_until` variants to
/// give up once a future of your choice completes (e.g. `tokio::time::sleep`).
///
/// `ConnectionPool` is cheap to clone: clones share the same connections.
pub struct ConnectionPool<T: Transport = ConnectionFactory> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T: Transport> {
    transport: Arc<T>,
    options: PoolOptions,
    connections: LeaseQueue<ConnectionHost<T>>,
    channels: LeaseQueue<ChannelHost<T>>,
    next_connection_id: AtomicU64,
    flags: ConnectionFlags,
    /// Serialises initialisation and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    /// Bumped by every shutdown: hosts from an older generation are never pooled again.
    generation: AtomicU64,
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionPool<ConnectionFactory> {
    /// Build a pool connected to the broker described by `settings`.
    ///
    /// Fails if the settings are invalid or if any connection or cached channel cannot be
    /// opened.
    pub async fn from_config(settings: &PoolSettings) -> Result<Self, Error> {
        let connection_factory = ConnectionFactory::new_from_config(settings)?;
        Self::builder(connection_factory)
            .options(settings.into())
            .build()
            .await
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Start building a [`ConnectionPool`] on top of `transport`.
    pub fn builder(transport: T) -> ConnectionPoolBuilder<T> {
        ConnectionPoolBuilder::new(transport)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Open every connection and fill the channel cache.
    ///
    /// It is a no-op on an initialized pool. After [`ConnectionPool::shutdown`] it brings the
    /// pool back to full capacity.
    /// Fails fast: if any connection or channel cannot be opened, everything opened so far is
    /// closed and the pool stays empty.
    #[tracing::instrument(name = "connection_pool_initialize", skip(self))]
    pub async fn initialize(&self) -> Result<(), Error> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        // Leases that slipped back in after a shutdown.
        self.close_pooled().await;

        if let Err(e) = self.populate().await {
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            self.close_pooled().await;
            self.inner.next_connection_id.store(0, Ordering::Release);
            return Err(Error::Initialization(e.into()));
        }

        self.inner.initialized.store(true, Ordering::Release);
        info!(
            connections = self.connection_count(),
            cached_channels = self.cached_channel_count(),
            "Connection pool initialized"
        );
        Ok(())
    }

    async fn populate(&self) -> Result<(), Error> {
        let generation = self.inner.generation.load(Ordering::Acquire);
        self.inner.next_connection_id.store(0, Ordering::Release);

        for _ in 0..self.inner.options.max_connection_count {
            let connection_id = self.inner.next_connection_id.fetch_add(1, Ordering::AcqRel);
            let host = self.open_connection(connection_id, generation).await?;
            if let Err(host) = self.inner.connections.push(host) {
                host.close().await;
            }
        }

        for channel_id in 0..self.cache_capacity() as u64 {
            // A single attempt per channel: connections were just opened, a failure here means
            // the broker is not usable.
            let host = self.inner.connections.pop().await;
            let channel = ChannelHost::new(&host, channel_id, true).await;
            self.return_connection(host, false).await;
            if let Err(channel) = self.inner.channels.push(channel?) {
                channel.close().await;
            }
        }
        Ok(())
    }

    /// Lease a healthy connection, waiting as long as it takes.
    ///
    /// Fails only if the pool is shutting down.
    pub async fn get_connection(&self) -> Result<ConnectionHost<T>, Error> {
        self.get_connection_until(std::future::pending()).await
    }

    /// Lease a healthy connection, giving up with [`Error::Cancelled`] once `cancel` completes.
    ///
    /// Giving up never costs the pool a connection.
    pub async fn get_connection_until<F>(&self, cancel: F) -> Result<ConnectionHost<T>, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        self.lease_connection(&mut cancel).await
    }

    #[tracing::instrument(name = "connection_pool_get_connection", skip_all)]
    async fn lease_connection<F>(
        &self,
        cancel: &mut Pin<&mut F>,
    ) -> Result<ConnectionHost<T>, Error>
    where
        F: Future<Output = ()>,
    {
        let host = loop {
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }

            let host = tokio::select! {
                biased;
                _ = cancel.as_mut() => return Err(Error::Cancelled),
                host = self.inner.connections.pop() => host,
            };

            if !self.is_current(host.generation) {
                host.close().await;
                continue;
            }

            if !host.is_blocked() {
                break host;
            }

            debug!(
                connection_id = host.connection_id(),
                "Connection is blocked by the broker, backing off"
            );
            let resumed = self.back_off(cancel).await;
            self.return_connection(host, false).await;
            if !resumed {
                return Err(Error::Cancelled);
            }
        };

        let connection_id = host.connection_id();
        let errored = host.has_pending_error();
        let closed = host.is_closed();
        let flagged = self.is_connection_flagged(connection_id);
        if !(errored || closed || flagged) {
            return Ok(host);
        }

        warn!(
            connection_id,
            errored, closed, flagged, "Replacing unhealthy RabbitMQ connection"
        );
        self.replace_connection(host, cancel).await
    }

    /// Swap `stale` for a new connection with the same identity.
    async fn replace_connection<F>(
        &self,
        stale: ConnectionHost<T>,
        cancel: &mut Pin<&mut F>,
    ) -> Result<ConnectionHost<T>, Error>
    where
        F: Future<Output = ()>,
    {
        let connection_id = stale.connection_id();
        self.flag_connection(connection_id);

        // A half-open connection can take until the heartbeat timeout to close.
        let closed = tokio::select! {
            biased;
            _ = cancel.as_mut() => false,
            _ = stale.close() => true,
        };
        if !closed {
            self.return_connection(stale, true).await;
            return Err(Error::Cancelled);
        }

        loop {
            match self.open_connection(connection_id, stale.generation).await {
                Ok(host) => {
                    if self.is_current(stale.generation) {
                        self.unflag_connection(connection_id);
                    }
                    info!(connection_id, "Replaced unhealthy RabbitMQ connection");
                    return Ok(host);
                }
                Err(e) => {
                    warn!(
                        connection_id,
                        error = ?e,
                        "Failed to replace RabbitMQ connection, retrying"
                    );
                    if !self.back_off(cancel).await {
                        // Still flagged: the next lease picks the replacement up.
                        self.return_connection(stale, true).await;
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    async fn open_connection(
        &self,
        connection_id: u64,
        generation: u64,
    ) -> Result<ConnectionHost<T>, Error> {
        let connection_name = format!("{}-{}", self.inner.options.connection_name, connection_id);
        let mut host =
            ConnectionHost::new(Arc::clone(&self.inner.transport), connection_name, connection_id)
                .await?;
        host.generation = generation;
        Ok(host)
    }

    /// Give a leased connection back to the pool, flagging it first if `flag` is set.
    ///
    /// A flagged connection is replaced on its next lease.
    /// Connections leased before a [`ConnectionPool::shutdown`] are closed instead, and never
    /// flag the identity they had in the new pool.
    #[tracing::instrument(
        name = "connection_pool_return_connection",
        skip(self, host),
        fields(connection_id = host.connection_id())
    )]
    pub async fn return_connection(&self, host: ConnectionHost<T>, flag: bool) {
        if !self.is_current(host.generation) {
            debug!("Closing a connection leased before the pool was shut down");
            host.close().await;
            return;
        }

        if flag {
            self.flag_connection(host.connection_id());
        }

        if let Err(host) = self.inner.connections.push(host) {
            warn!("The connection queue is full, closing the extra connection");
            host.close().await;
        }
    }

    /// Get a channel, waiting as long as it takes.
    ///
    /// Ackable channels come from the cache when caching is enabled, waiting for one to be
    /// returned if they are all leased. Every other request opens a transient channel.
    pub async fn get_channel(&self, ackable: bool) -> Result<ChannelHost<T>, Error> {
        self.get_channel_until(ackable, std::future::pending()).await
    }

    /// Like [`ConnectionPool::get_channel`], giving up with [`Error::Cancelled`] once `cancel`
    /// completes.
    #[tracing::instrument(name = "connection_pool_get_channel", skip(self, cancel))]
    pub async fn get_channel_until<F>(
        &self,
        ackable: bool,
        cancel: F,
    ) -> Result<ChannelHost<T>, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        if !ackable || self.cache_capacity() == 0 {
            return self
                .open_channel(TRANSIENT_CHANNEL_ID, ackable, &mut cancel)
                .await;
        }

        loop {
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }

            let channel = tokio::select! {
                biased;
                _ = cancel.as_mut() => return Err(Error::Cancelled),
                channel = self.inner.channels.pop() => channel,
            };

            if !self.is_current(channel.generation) {
                if !channel.is_closed() {
                    channel.close().await;
                }
                continue;
            }

            if !channel.is_closed() {
                return Ok(channel);
            }

            debug!(channel_id = channel.id(), "Cached channel is closed, replacing it");
            return match self
                .open_channel(channel.id(), channel.is_ackable(), &mut cancel)
                .await
            {
                Ok(replacement) => Ok(replacement),
                Err(e) => {
                    // Keep the slot, the next lease tries again.
                    if let Err(channel) = self.inner.channels.push(channel) {
                        warn!(
                            channel_id = channel.id(),
                            "The channel cache is full, dropping the closed channel"
                        );
                    }
                    Err(e)
                }
            };
        }
    }

    /// Give a channel back.
    ///
    /// Cached channels go back to the cache. If `erred` is set, or the channel is closed, it is
    /// closed and a replacement with the same identity takes its place in the cache.
    /// Transient channels are always closed.
    #[tracing::instrument(
        name = "connection_pool_return_channel",
        skip(self, channel),
        fields(channel_id = channel.id())
    )]
    pub async fn return_channel(&self, channel: ChannelHost<T>, erred: bool) {
        if !self.is_current(channel.generation) || !channel.is_managed(self.cache_capacity()) {
            if !channel.is_closed() {
                channel.close().await;
            }
            return;
        }

        let channel = if erred || channel.is_closed() {
            let (channel_id, ackable) = (channel.id(), channel.is_ackable());
            if !channel.is_closed() {
                channel.close().await;
            }
            let never = std::future::pending();
            tokio::pin!(never);
            match self.open_channel(channel_id, ackable, &mut never).await {
                Ok(replacement) => replacement,
                Err(e) => {
                    warn!(error = ?e, "Could not replace an erred cached channel");
                    return;
                }
            }
        } else {
            channel
        };

        if let Err(channel) = self.inner.channels.push(channel) {
            warn!("The channel cache is full, closing the extra channel");
            channel.close().await;
        }
    }

    /// Open a new channel that does not belong to the cache, waiting as long as it takes.
    ///
    /// Identities reserved for the cache are replaced by [`TRANSIENT_CHANNEL_ID`].
    pub async fn create_channel(&self, id: u64, ackable: bool) -> Result<ChannelHost<T>, Error> {
        self.create_channel_until(id, ackable, std::future::pending())
            .await
    }

    /// Like [`ConnectionPool::create_channel`], giving up with [`Error::Cancelled`] once
    /// `cancel` completes.
    pub async fn create_channel_until<F>(
        &self,
        id: u64,
        ackable: bool,
        cancel: F,
    ) -> Result<ChannelHost<T>, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let id = if id < self.cache_capacity() as u64 {
            TRANSIENT_CHANNEL_ID
        } else {
            id
        };
        self.open_channel(id, ackable, &mut cancel).await
    }

    /// Open a channel on the next healthy connection, retrying on failure.
    #[tracing::instrument(name = "connection_pool_open_channel", skip(self, cancel))]
    async fn open_channel<F>(
        &self,
        id: u64,
        ackable: bool,
        cancel: &mut Pin<&mut F>,
    ) -> Result<ChannelHost<T>, Error>
    where
        F: Future<Output = ()>,
    {
        loop {
            let host = self.lease_connection(cancel).await?;
            match ChannelHost::new(&host, id, ackable).await {
                Ok(channel) => {
                    self.return_connection(host, false).await;
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(
                        connection_id = host.connection_id(),
                        error = ?e,
                        "Failed to open a channel, flagging the connection"
                    );
                    self.return_connection(host, true).await;
                    if !self.back_off(cancel).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    /// Mark a connection as unhealthy: it is replaced the next time it is leased.
    pub fn flag_connection(&self, connection_id: u64) {
        self.inner.flags.flag(connection_id);
    }

    pub fn unflag_connection(&self, connection_id: u64) {
        self.inner.flags.unflag(connection_id);
    }

    pub fn is_connection_flagged(&self, connection_id: u64) -> bool {
        self.inner.flags.is_flagged(connection_id)
    }

    /// The number of idle connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// The number of idle cached channels.
    pub fn cached_channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Close every idle connection and cached channel and reset the pool.
    ///
    /// Leases fail with [`Error::ShuttingDown`] while the shutdown is in progress, and wait for
    /// [`ConnectionPool::initialize`] afterwards. Resources leased before the shutdown are closed
    /// when they are returned.
    #[tracing::instrument(name = "connection_pool_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.shutting_down.store(true, Ordering::Release);

        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.close_pooled().await;
        self.inner.flags.clear();
        self.inner.next_connection_id.store(0, Ordering::Release);
        self.inner.initialized.store(false, Ordering::Release);

        self.inner.shutting_down.store(false, Ordering::Release);
        info!("Connection pool shut down");
    }

    /// Drain both queues, closing whatever is still open.
    async fn close_pooled(&self) {
        let channels = self.inner.channels.drain();
        join_all(
            channels
                .iter()
                .filter(|channel| !channel.is_closed())
                .map(ChannelHost::close),
        )
        .await;

        let connections = self.inner.connections.drain();
        join_all(connections.iter().map(ConnectionHost::close)).await;
    }

    /// `false` for hosts and channels leased before the last shutdown.
    fn is_current(&self, generation: u64) -> bool {
        generation == self.inner.generation.load(Ordering::Acquire)
    }

    fn cache_capacity(&self) -> usize {
        self.inner.channels.capacity()
    }

    /// Pause for the configured interval. Returns `false` if `cancel` completed first.
    async fn back_off<F>(&self, cancel: &mut Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        let interval = self.inner.options.sleep_on_error_interval;
        tokio::select! {
            biased;
            _ = cancel.as_mut() => false,
            _ = pause(interval) => true,
        }
    }
}

async fn pause(interval: Duration) {
    if interval.is_zero() {
        // Still let other tasks run between attempts.
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(interval).await;
    }
}

/// A builder for [`ConnectionPool`].
///
/// Use [`ConnectionPool::builder`] as entrypoint.
pub struct ConnectionPoolBuilder<T: Transport> {
    transport: T,
    options: PoolOptions,
}

impl<T: Transport> ConnectionPoolBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            options: PoolOptions::default(),
        }
    }

    /// Replace all the options at once.
    #[must_use]
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Prefix of the connection names advertised to the broker.
    /// Defaults to `warren` if left unspecified.
    #[must_use]
    pub fn connection_name(mut self, connection_name: impl Into<String>) -> Self {
        self.options.connection_name = connection_name.into();
        self
    }

    /// The number of connections kept by the pool. Defaults to 5.
    #[must_use]
    pub fn max_connections(mut self, max_connection_count: usize) -> Self {
        self.options.max_connection_count = max_connection_count;
        self
    }

    /// The number of cached ackable channels. Defaults to 25, `0` disables caching.
    #[must_use]
    pub fn max_cached_channels(mut self, max_cache_channel_count: usize) -> Self {
        self.options.max_cache_channel_count = max_cache_channel_count;
        self
    }

    /// Back-off between retries. Defaults to 250 milliseconds.
    #[must_use]
    pub fn sleep_on_error(mut self, interval: Duration) -> Self {
        self.options.sleep_on_error_interval = interval;
        self
    }

    /// Open every connection and cached channel and return the pool.
    ///
    /// Returns either a pool at full capacity or an error, never a partially filled pool.
    pub async fn build(self) -> Result<ConnectionPool<T>, Error> {
        if self.options.max_connection_count == 0 {
            return Err(Error::Configuration(
                "max connection count can't be 0".into(),
            ));
        }

        let options = self.options;
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                transport: Arc::new(self.transport),
                connections: LeaseQueue::new(options.max_connection_count),
                channels: LeaseQueue::new(options.max_cache_channel_count),
                options,
                next_connection_id: AtomicU64::new(0),
                flags: ConnectionFlags::default(),
                lifecycle: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        };
        pool.initialize().await?;
        Ok(pool)
    }
}
