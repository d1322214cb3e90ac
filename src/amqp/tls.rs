//! Builds the TLS connector used for `amqps` connections.
use anyhow::Context;
use lapin::tcp::NativeTlsConnector;
use native_tls::{Certificate, Identity};

use super::configuration::TlsSettings;

/// A ready-to-use TLS client configuration.
#[derive(Clone)]
pub(crate) struct Tls {
    pub(crate) connector: NativeTlsConnector,
    pub(crate) domain_name: String,
}

impl Tls {
    /// Load the client identity and the optional CA bundle from disk.
    pub(crate) fn from_settings(settings: &TlsSettings) -> Result<Self, anyhow::Error> {
        let pem = std::fs::read(&settings.pem_cert_location).with_context(|| {
            format!(
                "Failed to read the client certificate at {}",
                settings.pem_cert_location.display()
            )
        })?;
        // The same PEM file carries both the certificate chain and the private key.
        let identity = Identity::from_pkcs8(&pem, &pem)
            .context("Failed to decode the client certificate and key for RabbitMQ TLS.")?;

        let mut builder = NativeTlsConnector::builder();
        builder.identity(identity);
        if let Some(bundle) = &settings.local_cert_location {
            for certificate in read_ca_bundle(bundle)? {
                builder.add_root_certificate(certificate);
            }
        }

        let connector = builder.build().context("TLS configuration failed")?;
        Ok(Self {
            connector,
            domain_name: settings.cert_server_name.clone(),
        })
    }
}

fn read_ca_bundle(path: &std::path::Path) -> Result<Vec<Certificate>, anyhow::Error> {
    let bundle = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read the CA bundle at {}", path.display()))?;
    split_pem_certificates(&bundle)
        .into_iter()
        .map(|pem| {
            Certificate::from_pem(pem.as_bytes())
                .context("Failed to decode PEM certificate chain for RabbitMQ TLS.")
        })
        .collect()
}

/// `Certificate::from_pem` only decodes the first certificate of a chain.
fn split_pem_certificates(bundle: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    bundle
        .split_inclusive(END)
        .filter(|block| block.contains("-----BEGIN CERTIFICATE-----"))
        .map(|block| block.trim_start().to_owned())
        .collect()
}
