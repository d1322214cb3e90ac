use crate::amqp::configuration::PoolSettings;
use crate::amqp::tls::Tls;
use crate::pool::Error;
use crate::transport::Transport;
use lapin::{
    tcp::AMQPUriTcpExt,
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// Fails if the settings are invalid or if TLS is enabled and the certificate material
    /// cannot be loaded.
    pub fn new_from_config(settings: &PoolSettings) -> Result<Self, Error> {
        settings.validate()?;
        let tls = settings
            .enabled_tls()
            .map(Tls::from_settings)
            .transpose()
            .map_err(|e| Error::Configuration(format!("{e:#}")))?;
        Ok(Self {
            uri: settings.amqp_uri()?,
            connection_timeout: settings.connection_timeout(),
            tls: tls.map(Arc::new),
        })
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(
        &self,
        connection_name: &str,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let properties = ConnectionProperties::default()
            .with_connection_name(connection_name.to_owned().into())
            .with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("Timed out while trying to connect to RabbitMQ."))??;
        Ok(connection)
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform the TLS handshake, expecting the configured server name
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = lapin::Connection;

    async fn dial(&self, connection_name: &str) -> Result<lapin::Connection, anyhow::Error> {
        self.new_connection(connection_name).await
    }
}
