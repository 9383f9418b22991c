//! Contains available options to configure the [WebhookServer][crate::WebhookServer].
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::constants::{
    DEFAULT_CERTIFICATE_RELOAD_INTERVAL, DEFAULT_SOCKET_ADDRESS, DEFAULT_TLS_CERT_PATH,
    DEFAULT_TLS_KEY_PATH,
};

/// Specifies available webhook server options.
///
/// The [`Default`] implementation binds to `0.0.0.0:9651` and reads the
/// certificate from `/certs/tls.crt` and `/certs/tls.key`.
///
/// ```
/// use deckhouse_webhook::WebhookOptions;
///
/// let options = WebhookOptions::builder()
///     .bind_address([127, 0, 0, 1], 12345)
///     .tls_paths("/tmp/tls.crt", "/tmp/tls.key")
///     .build();
/// assert_eq!(options.socket_addr.port(), 12345);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookOptions {
    /// The HTTPS socket address the [`TcpListener`][tokio::net::TcpListener] binds to.
    pub socket_addr: SocketAddr,

    /// PEM encoded certificate chain served to clients.
    pub tls_cert_path: PathBuf,

    /// PEM encoded private key of the first certificate in the chain.
    pub tls_key_path: PathBuf,

    /// How often certificate and key are re-read from disk.
    pub certificate_reload_interval: Duration,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl WebhookOptions {
    pub fn builder() -> WebhookOptionsBuilder {
        WebhookOptionsBuilder::default()
    }
}

/// Selectively customizes [`WebhookOptions`], falling back to the defaults
/// for everything not set.
#[derive(Debug, Default)]
pub struct WebhookOptionsBuilder {
    socket_addr: Option<SocketAddr>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    certificate_reload_interval: Option<Duration>,
}

impl WebhookOptionsBuilder {
    pub fn bind_address(mut self, bind_ip: impl Into<IpAddr>, bind_port: u16) -> Self {
        self.socket_addr = Some(SocketAddr::new(bind_ip.into(), bind_port));
        self
    }

    pub fn bind_ip(mut self, bind_ip: impl Into<IpAddr>) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_ip(bind_ip.into());
        self
    }

    pub fn bind_port(mut self, bind_port: u16) -> Self {
        let addr = self.socket_addr.get_or_insert(DEFAULT_SOCKET_ADDRESS);
        addr.set_port(bind_port);
        self
    }

    pub fn tls_paths(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.tls_cert_path = Some(cert_path.into());
        self.tls_key_path = Some(key_path.into());
        self
    }

    pub fn certificate_reload_interval(mut self, interval: Duration) -> Self {
        self.certificate_reload_interval = Some(interval);
        self
    }

    pub fn build(self) -> WebhookOptions {
        WebhookOptions {
            socket_addr: self.socket_addr.unwrap_or(DEFAULT_SOCKET_ADDRESS),
            tls_cert_path: self
                .tls_cert_path
                .unwrap_or_else(|| DEFAULT_TLS_CERT_PATH.into()),
            tls_key_path: self
                .tls_key_path
                .unwrap_or_else(|| DEFAULT_TLS_KEY_PATH.into()),
            certificate_reload_interval: self
                .certificate_reload_interval
                .unwrap_or(DEFAULT_CERTIFICATE_RELOAD_INTERVAL),
        }
    }
}
