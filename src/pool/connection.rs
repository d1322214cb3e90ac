//! [`ConnectionHost`] owns a single broker connection and knows how to bring it back.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Error;
use crate::transport::{Blocking, BrokerError, Transport, TransportConnection};

/// Capacity of the error and flow-control buffers of every connection.
const NOTIFICATION_BUFFER: usize = 10;

/// How long [`ConnectionHost::pause_on_flow_control`] sleeps between checks while blocked.
const FLOW_CONTROL_PAUSE: Duration = Duration::from_secs(1);

/// A broker connection with a stable identity.
///
/// The physical connection behind a `ConnectionHost` can be swapped by [`ConnectionHost::connect`]
/// while the identity stays the same.
pub struct ConnectionHost<T: Transport> {
    connection_id: u64,
    connection_name: String,
    transport: Arc<T>,
    connection: ArcSwapOption<T::Connection>,
    notifications: Mutex<Notifications>,
    /// Last flow-control state reported by the broker.
    blocked: AtomicBool,
    reconnect: tokio::sync::Mutex<()>,
    /// Pool generation this host was created in.
    pub(crate) generation: u64,
}

struct Notifications {
    errors: mpsc::Receiver<BrokerError>,
    blockers: mpsc::Receiver<Blocking>,
}

impl Notifications {
    fn new() -> (Self, mpsc::Sender<BrokerError>, mpsc::Sender<Blocking>) {
        let (errors_sender, errors) = mpsc::channel(NOTIFICATION_BUFFER);
        let (blockers_sender, blockers) = mpsc::channel(NOTIFICATION_BUFFER);
        (Self { errors, blockers }, errors_sender, blockers_sender)
    }
}

impl<T: Transport> ConnectionHost<T> {
    /// Create a host named `connection_name` and connect it.
    pub async fn new(
        transport: Arc<T>,
        connection_name: String,
        connection_id: u64,
    ) -> Result<Self, Error> {
        let (notifications, _, _) = Notifications::new();
        let host = Self {
            connection_id,
            connection_name,
            transport,
            connection: ArcSwapOption::empty(),
            notifications: Mutex::new(notifications),
            blocked: AtomicBool::new(false),
            reconnect: tokio::sync::Mutex::new(()),
            generation: 0,
        };
        host.connect().await?;
        Ok(host)
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// The current physical connection, if one was ever established.
    pub fn connection(&self) -> Option<Arc<T::Connection>> {
        self.connection.load_full()
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    fn is_open(&self) -> bool {
        self.connection
            .load()
            .as_deref()
            .map_or(false, |connection| !connection.is_closed())
    }

    /// Connect, or reconnect if the current connection is closed.
    ///
    /// Concurrent callers racing on a closed connection result in a single dial: the first one
    /// to get the lock dials, the others find the fresh connection once they get it.
    /// Every new connection comes with fresh error and flow-control subscriptions.
    #[tracing::instrument(
        name = "connection_host_connect",
        skip(self),
        fields(connection_name = %self.connection_name)
    )]
    pub async fn connect(&self) -> Result<(), Error> {
        if self.is_open() {
            return Ok(());
        }

        let _reconnect = self.reconnect.lock().await;
        if self.is_open() {
            return Ok(());
        }

        let connection = self
            .transport
            .dial(&self.connection_name)
            .await
            .map_err(Error::Dial)?;

        let (notifications, errors, blockers) = Notifications::new();
        connection.notify_error(errors);
        connection.notify_blocked(blockers);
        *self.lock_notifications() = notifications;
        self.blocked.store(false, Ordering::Release);
        self.connection.store(Some(Arc::new(connection)));

        debug!(connection_id = self.connection_id, "Connected to RabbitMQ");
        Ok(())
    }

    /// Wait while the broker applies flow control to this connection.
    ///
    /// Sleeps one second at a time for as long as the broker keeps reporting the connection as
    /// blocked. Returns as soon as the block is lifted, the connection is closed or no
    /// flow-control event is pending.
    /// Reconnections wait for the pause to be over.
    pub async fn pause_on_flow_control(&self) {
        let _reconnect = self.reconnect.lock().await;

        loop {
            if self.is_closed() {
                return;
            }
            match self.next_blocking() {
                Some(Blocking { active: true }) => {
                    debug!(
                        connection_id = self.connection_id,
                        "Broker flow control is active, pausing"
                    );
                    tokio::time::sleep(FLOW_CONTROL_PAUSE).await;
                }
                _ => return,
            }
        }
    }

    /// `true` if the broker is currently blocking this (open) connection.
    pub fn is_blocked(&self) -> bool {
        while self.next_blocking().is_some() {}
        !self.is_closed() && self.blocked.load(Ordering::Acquire)
    }

    /// `true` if the broker reported a connection-level error since the last check.
    pub fn has_pending_error(&self) -> bool {
        self.lock_notifications().errors.try_recv().is_ok()
    }

    /// Close the physical connection, if still open. Failures are logged and otherwise ignored.
    pub async fn close(&self) {
        let Some(connection) = self.connection().filter(|c| !c.is_closed()) else {
            return;
        };
        if let Err(e) = connection.close().await {
            warn!(
                connection_id = self.connection_id,
                error = ?e,
                "Failed to close RabbitMQ connection"
            );
        }
    }

    fn next_blocking(&self) -> Option<Blocking> {
        let event = self.lock_notifications().blockers.try_recv().ok()?;
        self.blocked.store(event.active, Ordering::Release);
        Some(event)
    }

    fn lock_notifications(&self) -> MutexGuard<'_, Notifications> {
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
